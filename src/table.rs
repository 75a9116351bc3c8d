use std::path::Path;

use anyhow::{Context, Result};

/// In-memory CSV table. Cells are kept as the raw strings read from disk so
/// columns the pipeline never touches are written back unchanged.
///
/// A row's identity is its position in `rows`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(headers: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        Table { headers, rows }
    }

    pub fn read_csv(path: &Path) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_path(path)
            .with_context(|| format!("Failed to open {:?}", path))?;

        let headers = reader
            .headers()
            .with_context(|| format!("Failed to read header of {:?}", path))?
            .iter()
            .map(str::to_string)
            .collect::<Vec<_>>();

        let mut rows = Vec::new();
        for (i, record) in reader.records().enumerate() {
            let record = record.with_context(|| format!("Bad record {} in {:?}", i, path))?;
            rows.push(record.iter().map(str::to_string).collect());
        }
        Ok(Table::new(headers, rows))
    }

    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("Failed to create {:?}", path))?;
        writer.write_record(&self.headers)?;
        for row in &self.rows {
            writer.write_record(row)?;
        }
        writer
            .flush()
            .with_context(|| format!("Failed to flush {:?}", path))?;
        Ok(())
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn column(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    /// Return the index of `name`, appending an empty column if missing.
    pub fn ensure_column(&mut self, name: &str) -> usize {
        if let Some(idx) = self.column(name) {
            return idx;
        }
        self.headers.push(name.to_string());
        for row in &mut self.rows {
            row.push(String::new());
        }
        self.headers.len() - 1
    }

    pub fn cell(&self, row: usize, col: usize) -> Option<&str> {
        self.rows.get(row)?.get(col).map(String::as_str)
    }

    pub fn set_cell(&mut self, row: usize, col: usize, value: String) -> bool {
        match self.rows.get_mut(row).and_then(|r| r.get_mut(col)) {
            Some(cell) => {
                *cell = value;
                true
            }
            None => false,
        }
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preserves_quoted_cells() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("products.csv");
        std::fs::write(
            &path,
            "ID,Name,Price\n1,\"Mug, large\",$19.99\n2,\"Say \"\"hi\"\"\",\n",
        )
        .unwrap();

        let table = Table::read_csv(&path).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.cell(0, 1), Some("Mug, large"));
        assert_eq!(table.cell(1, 1), Some("Say \"hi\""));
        assert_eq!(table.cell(1, 2), Some(""));

        let out = dir.path().join("out.csv");
        table.write_csv(&out).unwrap();
        assert_eq!(Table::read_csv(&out).unwrap(), table);
    }

    #[test]
    fn ensure_column_appends_once() {
        let mut table = Table::new(
            vec!["Price".into()],
            vec![vec!["$1".into()], vec!["$2".into()]],
        );
        let idx = table.ensure_column("inferred_price");
        assert_eq!(idx, 1);
        assert_eq!(table.ensure_column("inferred_price"), 1);
        assert_eq!(table.headers().len(), 2);
        assert!(table.rows().iter().all(|r| r.len() == 2));
    }

    #[test]
    fn set_cell_out_of_range() {
        let mut table = Table::new(vec!["a".into()], vec![vec!["x".into()]]);
        assert!(!table.set_cell(3, 0, "y".into()));
        assert!(table.set_cell(0, 0, "y".into()));
        assert_eq!(table.cell(0, 0), Some("y"));
    }
}
