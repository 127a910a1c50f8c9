//! In-process destination store
//!
//! Behaves like a transactional table store: staged rows stay invisible
//! until commit, rollback discards them, and ids act as a primary key.
//! Several connections can share one [`MemoryStore`]. Failure injection
//! hooks make rollback paths reproducible.

use super::destination::{ConflictPolicy, Destination};
use super::mapper::SinkRow;
use crate::core::errors::{SinkError, SinkResult};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;
use uuid::Uuid;

const CREATE_TABLE_PREFIX: &str = "CREATE TABLE IF NOT EXISTS ";

#[derive(Debug, Default)]
struct Table {
    rows: Vec<SinkRow>,
    ids: HashSet<Uuid>,
}

#[derive(Debug, Default)]
struct StoreState {
    tables: HashMap<String, Table>,
    ddl_executions: usize,
    tables_created: usize,
    insert_sizes: Vec<usize>,
    fail_insert_on_call: Option<usize>,
    fail_next_commit: bool,
    fail_next_ddl: bool,
}

/// Shared handle on one in-memory store
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<StoreState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new session on this store
    pub fn connect(&self) -> MemoryDestination {
        MemoryDestination {
            store: self.clone(),
            staged: Vec::new(),
            staged_ids: HashSet::new(),
            closed: false,
        }
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn table_exists(&self, table: &str) -> bool {
        self.state().tables.contains_key(table)
    }

    /// How many times a table was actually created
    pub fn tables_created(&self) -> usize {
        self.state().tables_created
    }

    /// How many DDL statements were executed, including no-op ones
    pub fn ddl_executions(&self) -> usize {
        self.state().ddl_executions
    }

    /// Committed rows in `table`
    pub fn row_count(&self, table: &str) -> usize {
        self.state().tables.get(table).map_or(0, |t| t.rows.len())
    }

    /// Snapshot of the committed rows in `table`
    pub fn rows(&self, table: &str) -> Vec<SinkRow> {
        self.state()
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    /// Number of rows passed to each insert call, in call order
    pub fn insert_sizes(&self) -> Vec<usize> {
        self.state().insert_sizes.clone()
    }

    /// Make the `call`-th insert over the store's lifetime (1-based) fail
    /// after staging half of its rows
    pub fn fail_insert_on_call(&self, call: usize) {
        self.state().fail_insert_on_call = Some(call);
    }

    pub fn fail_next_commit(&self) {
        self.state().fail_next_commit = true;
    }

    pub fn fail_next_ddl(&self) {
        self.state().fail_next_ddl = true;
    }
}

/// One session on a [`MemoryStore`]
#[derive(Debug)]
pub struct MemoryDestination {
    store: MemoryStore,
    staged: Vec<(String, SinkRow)>,
    staged_ids: HashSet<(String, Uuid)>,
    closed: bool,
}

impl MemoryDestination {
    fn discard_staged(&mut self) {
        self.staged.clear();
        self.staged_ids.clear();
    }

    fn ensure_open(&self) -> SinkResult<()> {
        if self.closed {
            return Err(SinkError::connection("Memory session is closed"));
        }
        Ok(())
    }
}

impl Destination for MemoryDestination {
    fn kind(&self) -> &'static str {
        "memory"
    }

    fn create_table_statement(&self, table: &str) -> String {
        format!("{}{}", CREATE_TABLE_PREFIX, table)
    }

    fn execute_ddl(&mut self, statement: &str) -> SinkResult<()> {
        self.ensure_open()?;
        let mut state = self.store.state();
        state.ddl_executions += 1;

        if state.fail_next_ddl {
            state.fail_next_ddl = false;
            return Err(SinkError::schema("Injected DDL failure"));
        }

        let table = statement
            .strip_prefix(CREATE_TABLE_PREFIX)
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| SinkError::schema(format!("Unsupported DDL: {}", statement)))?;

        if !state.tables.contains_key(table) {
            state.tables.insert(table.to_string(), Table::default());
            state.tables_created += 1;
            debug!("Created memory table {}", table);
        }

        Ok(())
    }

    fn insert_batch(
        &mut self,
        table: &str,
        rows: &[SinkRow],
        on_conflict: ConflictPolicy,
    ) -> SinkResult<u64> {
        self.ensure_open()?;
        let mut state = self.store.state();
        state.insert_sizes.push(rows.len());
        let call = state.insert_sizes.len();
        let fail_at = (state.fail_insert_on_call == Some(call)).then_some(rows.len() / 2);

        let existing = state
            .tables
            .get(table)
            .ok_or_else(|| SinkError::write(format!("relation \"{}\" does not exist", table)))?;

        let mut accepted = 0;
        for (index, row) in rows.iter().enumerate() {
            if fail_at == Some(index) {
                return Err(SinkError::write(format!(
                    "Injected insert failure on call {}",
                    call
                )));
            }

            let duplicate = existing.ids.contains(&row.id)
                || self.staged_ids.contains(&(table.to_string(), row.id));

            if duplicate {
                match on_conflict {
                    ConflictPolicy::Skip => continue,
                    ConflictPolicy::Fail => {
                        return Err(SinkError::write(format!(
                            "duplicate key value violates unique constraint: id={}",
                            row.id
                        )));
                    }
                }
            }

            self.staged_ids.insert((table.to_string(), row.id));
            self.staged.push((table.to_string(), row.clone()));
            accepted += 1;
        }

        Ok(accepted)
    }

    fn commit(&mut self) -> SinkResult<()> {
        self.ensure_open()?;
        let mut state = self.store.state();

        if state.fail_next_commit {
            state.fail_next_commit = false;
            return Err(SinkError::write("Injected commit failure"));
        }

        let recorded_at = Utc::now();
        for (table, mut row) in self.staged.drain(..) {
            row.recorded_at = Some(recorded_at);
            let table = state.tables.entry(table).or_default();
            table.ids.insert(row.id);
            table.rows.push(row);
        }
        self.staged_ids.clear();

        Ok(())
    }

    fn rollback(&mut self) -> SinkResult<()> {
        self.discard_staged();
        Ok(())
    }

    fn close(&mut self) -> SinkResult<()> {
        self.discard_staged();
        self.closed = true;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> SinkRow {
        SinkRow {
            id: Uuid::new_v4(),
            destination: "S.T".to_string(),
            key: None,
            value: Some("{}".to_string()),
            recorded_at: None,
        }
    }

    #[test]
    fn test_staged_rows_invisible_until_commit() {
        let store = MemoryStore::new();
        let mut session = store.connect();
        session
            .execute_ddl(&session.create_table_statement("raw_events"))
            .unwrap();

        session
            .insert_batch("raw_events", &[row(), row()], ConflictPolicy::Fail)
            .unwrap();
        assert_eq!(store.row_count("raw_events"), 0);

        session.commit().unwrap();
        assert_eq!(store.row_count("raw_events"), 2);
    }

    #[test]
    fn test_rollback_discards_staged_rows() {
        let store = MemoryStore::new();
        let mut session = store.connect();
        session
            .execute_ddl(&session.create_table_statement("raw_events"))
            .unwrap();

        session
            .insert_batch("raw_events", &[row()], ConflictPolicy::Fail)
            .unwrap();
        session.rollback().unwrap();
        session.commit().unwrap();

        assert_eq!(store.row_count("raw_events"), 0);
    }

    #[test]
    fn test_duplicate_ids_detected_across_commits() {
        let store = MemoryStore::new();
        let mut session = store.connect();
        session
            .execute_ddl(&session.create_table_statement("raw_events"))
            .unwrap();

        let rows: Vec<SinkRow> = (0..2000).map(|_| row()).collect();
        session
            .insert_batch("raw_events", &rows, ConflictPolicy::Fail)
            .unwrap();
        session.commit().unwrap();

        let again = [rows[1500].clone(), row()];
        assert!(
            session
                .insert_batch("raw_events", &again, ConflictPolicy::Fail)
                .is_err()
        );
        session.rollback().unwrap();

        assert_eq!(
            session
                .insert_batch("raw_events", &again, ConflictPolicy::Skip)
                .unwrap(),
            1
        );
        session.commit().unwrap();
        assert_eq!(store.row_count("raw_events"), 2001);
    }

    #[test]
    fn test_insert_into_missing_table_fails() {
        let store = MemoryStore::new();
        let mut session = store.connect();
        let err = session
            .insert_batch("raw_events", &[row()], ConflictPolicy::Fail)
            .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_closed_session_reports_connection_error() {
        let store = MemoryStore::new();
        let mut session = store.connect();
        session.close().unwrap();
        session.close().unwrap();

        assert!(session.is_closed());
        let err = session.commit().unwrap_err();
        assert_eq!(err.kind(), "connection");
    }
}
