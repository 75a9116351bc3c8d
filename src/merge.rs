use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Result};
use tracing::warn;

use crate::enrich::{EnrichedValue, EnrichmentResult};
use crate::table::Table;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowStatus {
    Pending,
    Ok,
    Fallback,
    Skipped,
}

impl RowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowStatus::Pending => "pending",
            RowStatus::Ok => "ok",
            RowStatus::Fallback => "fallback",
            RowStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for RowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RowStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" | "" => Ok(RowStatus::Pending),
            "ok" => Ok(RowStatus::Ok),
            "fallback" => Ok(RowStatus::Fallback),
            "skipped" => Ok(RowStatus::Skipped),
            other => bail!("unknown row status {:?}", other),
        }
    }
}

/// The row set being enriched: original columns untouched, enrichment
/// columns and a status column appended. Owned by the merge loop.
#[derive(Debug, Clone)]
pub struct ResultTable {
    table: Table,
    value_cols: Vec<usize>,
    status_col: usize,
    statuses: Vec<RowStatus>,
}

impl ResultTable {
    /// Add the output columns for `T` plus `status_column`, seeding every row
    /// with `seed(row_index)` and status `pending`.
    pub fn prepare<T, F>(mut table: Table, status_column: &str, seed: F) -> Self
    where
        T: EnrichedValue,
        F: Fn(usize) -> T,
    {
        let value_cols: Vec<usize> = T::columns()
            .iter()
            .map(|c| table.ensure_column(c))
            .collect();
        let status_col = table.ensure_column(status_column);

        let n = table.len();
        let mut rt = ResultTable {
            table,
            value_cols,
            status_col,
            statuses: vec![RowStatus::Pending; n],
        };
        for i in 0..n {
            rt.write(i, &seed(i), RowStatus::Pending);
        }
        rt
    }

    /// Merge one completed task into its row. Re-applying an index
    /// overwrites the earlier result.
    pub fn apply<T: EnrichedValue>(&mut self, index: usize, result: &EnrichmentResult<T>) {
        if index >= self.statuses.len() {
            warn!(index, rows = self.statuses.len(), "result for unknown row dropped");
            return;
        }
        let status = if result.is_success() {
            RowStatus::Ok
        } else {
            RowStatus::Fallback
        };
        self.write(index, result.value(), status);
    }

    pub fn mark_skipped<T: EnrichedValue>(&mut self, index: usize, value: &T) {
        if index < self.statuses.len() {
            self.write(index, value, RowStatus::Skipped);
        }
    }

    /// Copy a row's enrichment cells and status from an earlier checkpoint.
    pub fn restore(&mut self, index: usize, cells: Vec<String>, status: RowStatus) {
        if index >= self.statuses.len() {
            return;
        }
        for (&col, cell) in self.value_cols.iter().zip(cells) {
            self.table.set_cell(index, col, cell);
        }
        self.table
            .set_cell(index, self.status_col, status.to_string());
        self.statuses[index] = status;
    }

    fn write<T: EnrichedValue>(&mut self, index: usize, value: &T, status: RowStatus) {
        for (&col, cell) in self.value_cols.iter().zip(value.to_cells()) {
            self.table.set_cell(index, col, cell);
        }
        self.table
            .set_cell(index, self.status_col, status.to_string());
        self.statuses[index] = status;
    }

    pub fn status(&self, index: usize) -> Option<RowStatus> {
        self.statuses.get(index).copied()
    }

    pub fn count(&self, status: RowStatus) -> usize {
        self.statuses.iter().filter(|s| **s == status).count()
    }

    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    /// Point-in-time copy for the checkpoint writer.
    pub fn snapshot(&self) -> Table {
        self.table.clone()
    }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrich::price::Price;

    fn products() -> Table {
        Table::new(
            vec!["ID".into(), "Price".into()],
            vec![
                vec!["a".into(), "$19.99".into()],
                vec!["b".into(), "not a price".into()],
                vec!["c".into(), "€5".into()],
            ],
        )
    }

    #[test]
    fn prepare_seeds_pending_rows() {
        let rt = ResultTable::prepare(products(), "price_status", |_| Price::unknown());
        assert_eq!(
            rt.table().headers(),
            &["ID", "Price", "inferred_price", "inferred_currency", "price_status"]
        );
        assert_eq!(rt.count(RowStatus::Pending), 3);
        assert_eq!(rt.table().cell(1, 3), Some("unknown"));
        assert_eq!(rt.table().cell(1, 4), Some("pending"));
    }

    #[test]
    fn apply_touches_only_enrichment_columns() {
        let mut rt = ResultTable::prepare(products(), "price_status", |_| Price::unknown());
        rt.apply(2, &EnrichmentResult::Success(Price::new(5.0, "EUR")));
        rt.apply(1, &EnrichmentResult::Failure(Price::unknown()));

        let t = rt.table();
        assert_eq!(&t.rows()[2][..2], &["c".to_string(), "€5".to_string()]);
        assert_eq!(&t.rows()[2][2..], &["5.0", "EUR", "ok"]);
        assert_eq!(&t.rows()[1][2..], &["-1.0", "unknown", "fallback"]);
        assert_eq!(rt.status(0), Some(RowStatus::Pending));
    }

    #[test]
    fn last_write_wins_and_unknown_rows_ignored() {
        let mut rt = ResultTable::prepare(products(), "price_status", |_| Price::unknown());
        rt.apply(0, &EnrichmentResult::Failure(Price::unknown()));
        rt.apply(0, &EnrichmentResult::Success(Price::new(19.99, "USD")));
        rt.apply(99, &EnrichmentResult::Success(Price::new(1.0, "USD")));
        assert_eq!(rt.status(0), Some(RowStatus::Ok));
        assert_eq!(rt.table().cell(0, 2), Some("19.99"));
        assert_eq!(rt.len(), 3);
    }

    #[test]
    fn snapshot_is_detached() {
        let mut rt = ResultTable::prepare(products(), "price_status", |_| Price::unknown());
        let snap = rt.snapshot();
        rt.apply(0, &EnrichmentResult::Success(Price::new(19.99, "USD")));
        assert_eq!(snap.cell(0, 4), Some("pending"));
    }

    #[test]
    fn status_parsing() {
        assert_eq!("".parse::<RowStatus>().unwrap(), RowStatus::Pending);
        assert_eq!("skipped".parse::<RowStatus>().unwrap(), RowStatus::Skipped);
        assert!("done".parse::<RowStatus>().is_err());
    }
}
