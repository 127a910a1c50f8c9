//! All-or-nothing batch writes

use super::accumulator::Batch;
use super::destination::{ConflictPolicy, Destination};
use crate::core::errors::SinkResult;
use tracing::{debug, error, info, warn};

/// Writes one batch as one transaction.
///
/// Either every row of the batch is committed or none is. Failures are
/// rolled back and returned unchanged; retrying is the caller's decision.
#[derive(Debug, Clone)]
pub struct TransactionalBatchWriter {
    table: String,
    on_conflict: ConflictPolicy,
}

impl TransactionalBatchWriter {
    pub fn new<S: Into<String>>(table: S, on_conflict: ConflictPolicy) -> Self {
        Self {
            table: table.into(),
            on_conflict,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Insert and commit `batch`, returning the number of rows the store
    /// accepted. Rows skipped as already present are not counted.
    pub fn write<D: Destination + ?Sized>(
        &self,
        destination: &mut D,
        batch: &Batch,
    ) -> SinkResult<usize> {
        debug!(
            "Writing batch of {} rows to {} ({})",
            batch.len(),
            self.table,
            destination.kind()
        );

        let outcome = destination
            .insert_batch(&self.table, batch.rows(), self.on_conflict)
            .and_then(|accepted| destination.commit().map(|_| accepted));

        match outcome {
            Ok(accepted) => {
                let accepted = usize::try_from(accepted).unwrap_or(batch.len()).min(batch.len());
                let skipped = batch.len() - accepted;
                if skipped > 0 {
                    info!(
                        "Successfully stored {} records ({} already present)",
                        accepted, skipped
                    );
                } else {
                    info!("Successfully stored {} records", accepted);
                }
                Ok(accepted)
            }
            Err(e) => {
                error!("Error processing batch: {}", e);
                if let Err(rollback_err) = destination.rollback() {
                    warn!("Rollback failed: {}", rollback_err);
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::accumulator::BatchAccumulator;
    use crate::sink::mapper::SinkRow;
    use crate::sink::memory::MemoryStore;
    use crate::sink::provisioner::TableProvisioner;
    use std::num::NonZeroUsize;
    use uuid::Uuid;

    fn batch_of(n: usize) -> Batch {
        let mut acc = BatchAccumulator::new(NonZeroUsize::new(n).unwrap());
        for i in 0..n {
            acc.add(SinkRow {
                id: Uuid::new_v4(),
                destination: "S.T".to_string(),
                key: Some(format!("{{\"id\":{}}}", i)),
                value: None,
                recorded_at: None,
            });
        }
        acc.drain().unwrap()
    }

    fn provisioned_store() -> MemoryStore {
        let store = MemoryStore::new();
        let mut destination = store.connect();
        TableProvisioner::new("raw_events")
            .ensure_table(&mut destination)
            .unwrap();
        store
    }

    #[test]
    fn test_write_commits_whole_batch() {
        let store = provisioned_store();
        let mut destination = store.connect();
        let writer = TransactionalBatchWriter::new("raw_events", ConflictPolicy::Fail);

        let committed = writer.write(&mut destination, &batch_of(10)).unwrap();

        assert_eq!(committed, 10);
        assert_eq!(store.row_count("raw_events"), 10);
        assert!(
            store
                .rows("raw_events")
                .iter()
                .all(|row| row.recorded_at.is_some())
        );
    }

    #[test]
    fn test_failed_insert_leaves_no_rows() {
        let store = provisioned_store();
        let mut destination = store.connect();
        let writer = TransactionalBatchWriter::new("raw_events", ConflictPolicy::Fail);

        writer.write(&mut destination, &batch_of(5)).unwrap();
        let before = store.row_count("raw_events");

        store.fail_insert_on_call(2);
        let err = writer.write(&mut destination, &batch_of(10)).unwrap_err();

        assert!(err.is_batch_abort());
        assert_eq!(store.row_count("raw_events"), before);
    }

    #[test]
    fn test_failed_commit_leaves_no_rows() {
        let store = provisioned_store();
        let mut destination = store.connect();
        let writer = TransactionalBatchWriter::new("raw_events", ConflictPolicy::Fail);

        store.fail_next_commit();
        assert!(writer.write(&mut destination, &batch_of(4)).is_err());
        assert_eq!(store.row_count("raw_events"), 0);

        // The session stays usable for the next batch
        assert_eq!(writer.write(&mut destination, &batch_of(4)).unwrap(), 4);
        assert_eq!(store.row_count("raw_events"), 4);
    }

    #[test]
    fn test_duplicate_ids_fail_or_skip_by_policy() {
        let store = provisioned_store();
        let mut destination = store.connect();
        let batch = batch_of(3);

        let strict = TransactionalBatchWriter::new("raw_events", ConflictPolicy::Fail);
        strict.write(&mut destination, &batch).unwrap();
        assert!(strict.write(&mut destination, &batch).is_err());
        assert_eq!(store.row_count("raw_events"), 3);

        let lenient = TransactionalBatchWriter::new("raw_events", ConflictPolicy::Skip);
        assert_eq!(lenient.write(&mut destination, &batch).unwrap(), 0);
        assert_eq!(store.row_count("raw_events"), 3);

        // Only the new rows of a partly known batch are counted
        let mut acc = BatchAccumulator::new(NonZeroUsize::new(5).unwrap());
        for row in batch.rows().iter().chain(batch_of(2).rows()) {
            acc.add(row.clone());
        }
        let mixed = acc.drain().unwrap();
        assert_eq!(lenient.write(&mut destination, &mixed).unwrap(), 2);
        assert_eq!(store.row_count("raw_events"), 5);
    }
}
