//! Site-local numeric table
//!
//! Loads a CSV file with a header row. A column is kept when every present
//! value parses as a number; `?` and empty cells count as missing. Columns with
//! any other text are skipped with a warning.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, warn};

/// One numeric column
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Column {
    pub values: Vec<f64>,
    pub missing: u64,
}

/// Numeric columns of a site's table
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    rows: u64,
    columns: BTreeMap<String, Column>,
}

fn is_missing(cell: &str) -> bool {
    cell.is_empty() || cell == "?"
}

fn clean(cell: &str) -> &str {
    cell.trim().trim_matches('"').trim()
}

impl Dataset {
    /// Build from already-parsed columns
    pub fn from_columns(rows: u64, columns: BTreeMap<String, Column>) -> Self {
        Self { rows, columns }
    }

    /// Load a CSV file
    pub fn from_csv_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read data file: {}", path.display()))?;
        let dataset = Self::parse_csv(&text)
            .with_context(|| format!("Failed to parse data file: {}", path.display()))?;
        debug!(
            path = %path.display(),
            rows = dataset.rows,
            features = dataset.columns.len(),
            "dataset loaded"
        );
        Ok(dataset)
    }

    /// Parse CSV text
    pub fn parse_csv(text: &str) -> Result<Self> {
        let mut lines = text.lines().filter(|l| !l.trim().is_empty());
        let header = lines.next().context("CSV has no header row")?;
        let names: Vec<String> = header.split(',').map(|h| clean(h).to_string()).collect();
        if let Some(dup) = names
            .iter()
            .enumerate()
            .find(|(i, n)| names[..*i].contains(*n))
            .map(|(_, n)| n)
        {
            anyhow::bail!("Duplicate column name '{}'", dup);
        }

        let mut columns: Vec<Option<Column>> = vec![Some(Column::default()); names.len()];
        let mut rows = 0u64;
        for (line_no, line) in lines.enumerate() {
            let cells: Vec<&str> = line.split(',').map(clean).collect();
            if cells.len() != names.len() {
                anyhow::bail!(
                    "Row {} has {} fields, expected {}",
                    line_no + 2,
                    cells.len(),
                    names.len()
                );
            }
            rows += 1;
            for (idx, cell) in cells.iter().enumerate() {
                let Some(column) = columns[idx].as_mut() else {
                    continue;
                };
                if is_missing(cell) {
                    column.missing += 1;
                    continue;
                }
                match cell.parse::<f64>() {
                    Ok(v) => column.values.push(v),
                    Err(_) => {
                        warn!(column = %names[idx], value = %cell, "non-numeric column skipped");
                        columns[idx] = None;
                    }
                }
            }
        }

        let columns = names
            .into_iter()
            .zip(columns)
            .filter_map(|(name, col)| col.map(|c| (name, c)))
            .collect();
        Ok(Self { rows, columns })
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn feature_names(&self) -> Vec<String> {
        self.columns.keys().cloned().collect()
    }

    pub fn column(&self, feature: &str) -> Option<&Column> {
        self.columns.get(feature)
    }

    pub fn columns(&self) -> &BTreeMap<String, Column> {
        &self.columns
    }

    /// Copy of every column's values, the starting working set of the median protocol
    pub fn value_map(&self) -> BTreeMap<String, Vec<f64>> {
        self.columns
            .iter()
            .map(|(name, col)| (name.clone(), col.values.clone()))
            .collect()
    }

    /// Write the table as CSV (missing cells as `?`)
    ///
    /// Columns are written value-by-value; a column with missing cells places
    /// them after its values.
    pub fn to_csv(&self) -> String {
        let names: Vec<&String> = self.columns.keys().collect();
        let mut out = names
            .iter()
            .map(|n| n.as_str())
            .collect::<Vec<_>>()
            .join(",");
        out.push('\n');
        for row in 0..self.rows as usize {
            let cells: Vec<String> = names
                .iter()
                .map(|n| match self.columns[*n].values.get(row) {
                    Some(v) => v.to_string(),
                    None => "?".to_string(),
                })
                .collect();
            out.push_str(&cells.join(","));
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_missing_and_numeric() {
        let ds = Dataset::parse_csv("age,income\n30,?\n,1000\n40,2000.5\n").unwrap();
        assert_eq!(ds.rows(), 3);
        let age = ds.column("age").unwrap();
        assert_eq!(age.values, vec![30.0, 40.0]);
        assert_eq!(age.missing, 1);
        let income = ds.column("income").unwrap();
        assert_eq!(income.values, vec![1000.0, 2000.5]);
        assert_eq!(income.missing, 1);
    }

    #[test]
    fn test_non_numeric_column_skipped() {
        let ds = Dataset::parse_csv("name,score\nalice,1\nbob,2\n").unwrap();
        assert_eq!(ds.feature_names(), vec!["score".to_string()]);
    }

    #[test]
    fn test_ragged_row_rejected() {
        assert!(Dataset::parse_csv("a,b\n1,2\n3\n").is_err());
        assert!(Dataset::parse_csv("").is_err());
        assert!(Dataset::parse_csv("a,a\n1,2\n").is_err());
    }

    #[test]
    fn test_csv_round_trip_through_file() {
        let ds = Dataset::parse_csv("x,y\n1,?\n2,3\n").unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(ds.to_csv().as_bytes()).unwrap();

        let loaded = Dataset::from_csv_path(file.path()).unwrap();
        assert_eq!(loaded.rows(), 2);
        assert_eq!(loaded.column("x").unwrap().values, vec![1.0, 2.0]);
        assert_eq!(loaded.column("y").unwrap().values, vec![3.0]);
        assert_eq!(loaded.column("y").unwrap().missing, 1);
    }
}
