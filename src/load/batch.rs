use super::decode::Value;
use super::table::TableSpec;

/// Ordered rows for one table, bounded by a row count and an approximate
/// byte budget. Transient; never persisted.
#[derive(Debug, Clone)]
pub struct RowBatch {
    pub table: &'static TableSpec,
    pub rows: Vec<Vec<Value>>,
    /// Record number (1-based, within the source file) of the first row.
    pub first_record: u64,
    bytes: usize,
    max_rows: usize,
    max_bytes: usize,
}

impl RowBatch {
    #[must_use]
    pub fn new(table: &'static TableSpec, max_rows: usize, max_bytes: usize) -> Self {
        Self {
            table,
            rows: Vec::with_capacity(max_rows.min(4096)),
            first_record: 0,
            bytes: 0,
            max_rows: max_rows.max(1),
            max_bytes,
        }
    }

    /// Appends a row read at `record` (1-based).
    pub fn push(&mut self, row: Vec<Value>, record: u64) {
        if self.rows.is_empty() {
            self.first_record = record;
        }
        self.bytes += row.iter().map(Value::approx_size).sum::<usize>();
        self.rows.push(row);
    }

    /// True once either bound is reached.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.rows.len() >= self.max_rows || self.bytes >= self.max_bytes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Approximate decoded size of the rows held.
    #[must_use]
    pub fn approx_bytes(&self) -> usize {
        self.bytes
    }

    /// Hands the current rows out and starts an empty batch with the same
    /// bounds.
    pub fn take(&mut self) -> Self {
        let next = Self::new(self.table, self.max_rows, self.max_bytes);
        std::mem::replace(self, next)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::load::table::table_spec;

    fn row(text: &str) -> Vec<Value> {
        vec![Value::Integer(1), Value::Text(text.to_string())]
    }

    #[test]
    fn test_batch_fills_by_row_count() {
        let mut batch = RowBatch::new(table_spec("pais").unwrap(), 2, 1 << 20);
        batch.push(row("BRASIL"), 1);
        assert!(!batch.is_full());
        batch.push(row("ARGENTINA"), 2);
        assert!(batch.is_full());
        assert_eq!(batch.first_record, 1);
    }

    #[test]
    fn test_batch_fills_by_bytes() {
        let mut batch = RowBatch::new(table_spec("pais").unwrap(), 1000, 20);
        batch.push(row(&"X".repeat(30)), 7);
        assert!(batch.is_full());
        assert_eq!(batch.approx_bytes(), 38);
    }

    #[test]
    fn test_take_resets_batch() {
        let mut batch = RowBatch::new(table_spec("pais").unwrap(), 10, 1 << 20);
        batch.push(row("A"), 3);
        batch.push(row("B"), 4);
        let full = batch.take();
        assert_eq!(full.len(), 2);
        assert_eq!(full.first_record, 3);
        assert!(batch.is_empty());
        assert_eq!(batch.approx_bytes(), 0);
        batch.push(row("C"), 5);
        assert_eq!(batch.first_record, 5);
    }
}
