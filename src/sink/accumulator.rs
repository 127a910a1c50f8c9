//! Row buffering up to the configured batch size

use super::mapper::SinkRow;
use std::num::NonZeroUsize;

/// An ordered group of rows written in one transaction. Never empty.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    rows: Vec<SinkRow>,
}

impl Batch {
    pub fn rows(&self) -> &[SinkRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Buffers mapped rows until a full batch is available.
///
/// Owned by a single handler invocation, so no locking.
#[derive(Debug)]
pub struct BatchAccumulator {
    rows: Vec<SinkRow>,
    batch_size: NonZeroUsize,
}

impl BatchAccumulator {
    pub fn new(batch_size: NonZeroUsize) -> Self {
        Self {
            rows: Vec::with_capacity(batch_size.get()),
            batch_size,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size.get()
    }

    pub fn add(&mut self, row: SinkRow) {
        self.rows.push(row);
    }

    pub fn is_full(&self) -> bool {
        self.rows.len() >= self.batch_size.get()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Hand over the buffered rows and start a fresh buffer.
    ///
    /// Returns `None` when nothing is buffered, so a [`Batch`] is never empty.
    pub fn drain(&mut self) -> Option<Batch> {
        if self.rows.is_empty() {
            return None;
        }

        let rows = std::mem::replace(&mut self.rows, Vec::with_capacity(self.batch_size.get()));
        Some(Batch { rows })
    }

    /// Drop buffered rows without writing them
    pub fn clear(&mut self) {
        self.rows.clear();
    }
}
