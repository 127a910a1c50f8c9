//! Capability interface every destination store implements
//!
//! One implementation per concrete store. The provisioner, writer and
//! handler are written once against this trait.

use super::mapper::SinkRow;
use crate::core::errors::SinkResult;

/// What to do when an inserted row's id already exists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Fail the statement, which aborts the batch
    Fail,
    /// Keep the existing row and skip the new one
    Skip,
}

/// An open session on a destination store.
///
/// Statements run inside an implicit transaction that starts with the first
/// statement after the previous `commit`/`rollback`. Implementations hold
/// exactly one session and never reconnect on their own.
pub trait Destination {
    /// Short name of the store, used in logs
    fn kind(&self) -> &'static str;

    /// Conditional "create if absent" DDL for the event table
    fn create_table_statement(&self, table: &str) -> String;

    /// Execute a DDL statement inside the current transaction
    fn execute_ddl(&mut self, statement: &str) -> SinkResult<()>;

    /// Insert all rows inside the current transaction, returning how many
    /// rows the store accepted
    fn insert_batch(
        &mut self,
        table: &str,
        rows: &[SinkRow],
        on_conflict: ConflictPolicy,
    ) -> SinkResult<u64>;

    fn commit(&mut self) -> SinkResult<()>;

    fn rollback(&mut self) -> SinkResult<()>;

    /// Release the session. Calling it again is a no-op.
    fn close(&mut self) -> SinkResult<()>;

    fn is_closed(&self) -> bool;
}

impl<D: Destination + ?Sized> Destination for Box<D> {
    fn kind(&self) -> &'static str {
        (**self).kind()
    }

    fn create_table_statement(&self, table: &str) -> String {
        (**self).create_table_statement(table)
    }

    fn execute_ddl(&mut self, statement: &str) -> SinkResult<()> {
        (**self).execute_ddl(statement)
    }

    fn insert_batch(
        &mut self,
        table: &str,
        rows: &[SinkRow],
        on_conflict: ConflictPolicy,
    ) -> SinkResult<u64> {
        (**self).insert_batch(table, rows, on_conflict)
    }

    fn commit(&mut self) -> SinkResult<()> {
        (**self).commit()
    }

    fn rollback(&mut self) -> SinkResult<()> {
        (**self).rollback()
    }

    fn close(&mut self) -> SinkResult<()> {
        (**self).close()
    }

    fn is_closed(&self) -> bool {
        (**self).is_closed()
    }
}
