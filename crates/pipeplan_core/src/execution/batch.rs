use pipeplan_error::{Result, internal};

use super::scalar::Row;

/// A fixed capacity batch of rows.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    rows: Vec<Row>,
    capacity: usize,
}

impl Batch {
    /// Create an empty batch that holds at most `capacity` rows.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Batch {
            rows: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Create a batch from rows. Errors if there are more rows than the
    /// capacity.
    pub fn try_from_rows(rows: Vec<Row>, capacity: usize) -> Result<Self> {
        let capacity = capacity.max(1);
        if rows.len() > capacity {
            return Err(internal!(
                "batch with {} rows exceeds capacity {capacity}",
                rows.len()
            ));
        }
        Ok(Batch { rows, capacity })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.rows.len() >= self.capacity
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.rows.len()
    }

    pub fn push(&mut self, row: Row) -> Result<()> {
        if self.is_full() {
            return Err(internal!("push to full batch (capacity {})", self.capacity));
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }
}

/// Split rows into batches of at most `capacity` rows.
pub fn into_batches(rows: Vec<Row>, capacity: usize) -> impl Iterator<Item = Batch> {
    let capacity = capacity.max(1);
    let mut rows = rows.into_iter().peekable();
    std::iter::from_fn(move || {
        rows.peek()?;
        let chunk: Vec<Row> = rows.by_ref().take(capacity).collect();
        Some(Batch {
            rows: chunk,
            capacity,
        })
    })
}
