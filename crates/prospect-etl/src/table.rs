//! CSV input tables.

use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use prospect_core::model::{EntityColumns, InputRow};

use crate::error::{EnrichError, EnrichResult};

/// A whole input table, read eagerly.
#[derive(Debug, Clone)]
pub struct InputTable {
    columns: Arc<[String]>,
    rows: Vec<InputRow>,
}

/// Fill statistics for one column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnProfile {
    pub name: String,
    pub non_empty: usize,
}

impl InputTable {
    pub fn read(path: impl AsRef<Path>) -> EnrichResult<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).map_err(|e| {
            EnrichError::InvalidInput(format!("cannot open {}: {e}", path.display()))
        })?;
        Self::from_reader(file)
    }

    /// Read CSV with a header row. Every record must have one field per
    /// header column.
    pub fn from_reader<R: Read>(reader: R) -> EnrichResult<Self> {
        let mut reader = csv::ReaderBuilder::new().from_reader(reader);
        let columns: Arc<[String]> = reader
            .headers()
            .map_err(prospect_core::Error::from)?
            .iter()
            .map(|h| h.trim_start_matches('\u{feff}').trim().to_string())
            .collect::<Vec<_>>()
            .into();

        let mut rows = Vec::new();
        for (offset, record) in reader.records().enumerate() {
            let record = record.map_err(prospect_core::Error::from)?;
            let values = record.iter().map(str::to_string).collect();
            rows.push(InputRow::new(offset, Arc::clone(&columns), values)?);
        }
        Ok(Self { columns, rows })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[InputRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Fail unless the id and name columns are present.
    pub fn require(&self, keys: &EntityColumns) -> EnrichResult<()> {
        let missing = keys.missing_from(&self.columns);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(EnrichError::InvalidInput(format!(
                "missing required columns: {}",
                missing.join(", ")
            )))
        }
    }

    /// Non-empty value counts per column, in column order.
    pub fn profile(&self) -> Vec<ColumnProfile> {
        self.columns
            .iter()
            .enumerate()
            .map(|(i, name)| ColumnProfile {
                name: name.clone(),
                non_empty: self
                    .rows
                    .iter()
                    .filter(|row| !row.values()[i].trim().is_empty())
                    .count(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\u{feff}CompanyNumber,CompanyName,Town\n\
                          01234567,Acme Widgets Ltd,Leeds\n\
                          07654321,\"Bolt, Nut & Co\",\n";

    #[test]
    fn test_read_rows_with_offsets() {
        let table = InputTable::from_reader(SAMPLE.as_bytes()).unwrap();
        assert_eq!(table.columns(), &["CompanyNumber", "CompanyName", "Town"]);
        assert_eq!(table.len(), 2);
        assert_eq!(table.rows()[1].offset(), 1);
        assert_eq!(table.rows()[1].get("CompanyName"), Some("Bolt, Nut & Co"));
        table.require(&EntityColumns::default()).unwrap();
    }

    #[test]
    fn test_profile_counts_non_empty() {
        let table = InputTable::from_reader(SAMPLE.as_bytes()).unwrap();
        let town = &table.profile()[2];
        assert_eq!(town.name, "Town");
        assert_eq!(town.non_empty, 1);
    }

    #[test]
    fn test_missing_columns_reported() {
        let table = InputTable::from_reader("Name,Town\nAcme,Leeds\n".as_bytes()).unwrap();
        let err = table.require(&EntityColumns::default()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid input: missing required columns: CompanyNumber, CompanyName"
        );
    }

    #[test]
    fn test_ragged_record_is_rejected() {
        let result = InputTable::from_reader("a,b\n1,2\n3\n".as_bytes());
        assert!(result.is_err());
    }
}
