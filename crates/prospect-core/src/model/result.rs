use serde::{Deserialize, Serialize};

pub const COMPANY_URL: &str = "company_url";
pub const DESCRIPTION: &str = "description";
pub const MANUFACTURING_LOCATION: &str = "manufacturing_location";

/// The fixed output shape shared by every enrichment result of a run.
///
/// Headcount columns are derived from the configured reporting periods,
/// e.g. period `"2024"` becomes column `employees_2024`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSchema {
    periods: Vec<String>,
}

impl Default for OutputSchema {
    fn default() -> Self {
        Self::new(["2024", "2023", "2022"])
    }
}

impl OutputSchema {
    #[must_use]
    pub fn new<I, S>(periods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = Vec::new();
        for period in periods {
            let period = period.into();
            if !seen.contains(&period) {
                seen.push(period);
            }
        }
        Self { periods: seen }
    }

    /// Reporting periods, in column order.
    #[must_use]
    pub fn periods(&self) -> &[String] {
        &self.periods
    }

    #[must_use]
    pub fn headcount_column(period: &str) -> String {
        format!("employees_{period}")
    }

    /// Output column names, in the order values are written.
    #[must_use]
    pub fn columns(&self) -> Vec<String> {
        let mut columns = vec![COMPANY_URL.to_string(), DESCRIPTION.to_string()];
        columns.extend(self.periods.iter().map(|p| Self::headcount_column(p)));
        columns.push(MANUFACTURING_LOCATION.to_string());
        columns
    }

    /// A result with every output column present and empty.
    #[must_use]
    pub fn empty_result(&self) -> EnrichmentResult {
        EnrichmentResult {
            company_url: String::new(),
            description: String::new(),
            headcount: self
                .periods
                .iter()
                .map(|p| (p.clone(), String::new()))
                .collect(),
            manufacturing_location: String::new(),
        }
    }
}

/// The enrichment output for exactly one input row.
///
/// Missing values are empty strings, never missing keys: the headcount
/// cells are fixed by the [`OutputSchema`] the result was created from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichmentResult {
    pub company_url: String,
    pub description: String,
    headcount: Vec<(String, String)>,
    pub manufacturing_location: String,
}

impl EnrichmentResult {
    /// Headcount for a period, `None` if the period is not part of the schema.
    #[must_use]
    pub fn headcount(&self, period: &str) -> Option<&str> {
        self.headcount
            .iter()
            .find(|(p, _)| p == period)
            .map(|(_, v)| v.as_str())
    }

    /// Set the headcount for a known period.
    ///
    /// Returns `false` and leaves the result untouched for periods outside
    /// the schema.
    pub fn set_headcount(&mut self, period: &str, value: impl Into<String>) -> bool {
        match self.headcount.iter_mut().find(|(p, _)| p == period) {
            Some((_, slot)) => {
                *slot = value.into();
                true
            }
            None => false,
        }
    }

    /// Values in [`OutputSchema::columns`] order.
    #[must_use]
    pub fn values(&self) -> Vec<String> {
        let mut values = vec![self.company_url.clone(), self.description.clone()];
        values.extend(self.headcount.iter().map(|(_, v)| v.clone()));
        values.push(self.manufacturing_location.clone());
        values
    }

    /// Number of non-empty output cells.
    #[must_use]
    pub fn filled_fields(&self) -> usize {
        self.values().iter().filter(|v| !v.is_empty()).count()
    }
}
