use std::sync::Arc;

use crate::error::{Error, Result};

/// Names of the columns that identify an entity and give it a display name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityColumns {
    pub id: String,
    pub name: String,
}

impl Default for EntityColumns {
    fn default() -> Self {
        Self {
            id: "CompanyNumber".to_string(),
            name: "CompanyName".to_string(),
        }
    }
}

impl EntityColumns {
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }

    /// Return the required columns missing from `header`.
    pub fn missing_from(&self, header: &[String]) -> Vec<String> {
        [&self.id, &self.name]
            .into_iter()
            .filter(|required| !header.iter().any(|c| c == *required))
            .cloned()
            .collect()
    }
}

/// One row of the input table.
///
/// Rows are immutable once read and are identified by their position in
/// the input sequence. All rows of a table share the same column list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputRow {
    offset: usize,
    columns: Arc<[String]>,
    values: Vec<String>,
}

impl InputRow {
    /// Build a row, checking that it has one value per column.
    pub fn new(offset: usize, columns: Arc<[String]>, values: Vec<String>) -> Result<Self> {
        if columns.len() != values.len() {
            return Err(Error::RowShape {
                offset,
                expected: columns.len(),
                found: values.len(),
            });
        }
        Ok(Self {
            offset,
            columns,
            values,
        })
    }

    /// Position of this row in the input sequence.
    #[must_use]
    pub const fn offset(&self) -> usize {
        self.offset
    }

    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    #[must_use]
    pub fn values(&self) -> &[String] {
        &self.values
    }

    /// Look up a value by column name.
    #[must_use]
    pub fn get(&self, column: &str) -> Option<&str> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|i| self.values[i].as_str())
    }

    /// The entity identifier, trimmed. Empty when the column is absent.
    #[must_use]
    pub fn entity_id(&self, keys: &EntityColumns) -> &str {
        self.get(&keys.id).map(str::trim).unwrap_or_default()
    }

    /// The display name, trimmed. Empty when the column is absent.
    #[must_use]
    pub fn display_name(&self, keys: &EntityColumns) -> &str {
        self.get(&keys.name).map(str::trim).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn columns() -> Arc<[String]> {
        vec!["CompanyName".to_string(), "CompanyNumber".to_string()].into()
    }

    #[test]
    fn test_row_lookup_by_column() {
        let row = InputRow::new(
            3,
            columns(),
            vec!["Acme Widgets Ltd".to_string(), " 01234567 ".to_string()],
        )
        .unwrap();
        let keys = EntityColumns::default();

        assert_eq!(row.offset(), 3);
        assert_eq!(row.get("CompanyName"), Some("Acme Widgets Ltd"));
        assert_eq!(row.entity_id(&keys), "01234567");
        assert_eq!(row.display_name(&keys), "Acme Widgets Ltd");
        assert_eq!(row.get("Missing"), None);
    }

    #[test]
    fn test_row_rejects_mismatched_width() {
        let result = InputRow::new(0, columns(), vec!["only one".to_string()]);
        assert!(matches!(
            result,
            Err(Error::RowShape {
                offset: 0,
                expected: 2,
                found: 1
            })
        ));
    }

    #[test]
    fn test_missing_entity_columns() {
        let keys = EntityColumns::default();
        let header = vec!["CompanyName".to_string(), "Status".to_string()];
        assert_eq!(keys.missing_from(&header), vec!["CompanyNumber".to_string()]);
        assert!(keys.missing_from(&columns()).is_empty());
    }
}
