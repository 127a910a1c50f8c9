//! PostgreSQL destination over libpq
//!
//! The session runs in explicit transactions: `BEGIN` is sent lazily before
//! the first statement after a commit or rollback. Multi-row inserts are
//! parameterized and split so no statement exceeds the protocol's parameter
//! limit; all chunks of a batch share one transaction.

use super::destination::{ConflictPolicy, Destination};
use super::mapper::SinkRow;
use crate::core::config::PostgresConfig;
use crate::core::errors::{SinkError, SinkResult};
use crate::utils::connection::{PGConnection, PGResult};
use tracing::{debug, info, warn};

const COLUMNS_PER_ROW: usize = 4;
// The bind message carries the parameter count as an int16
const MAX_PARAMETERS: usize = 65_535;
pub const MAX_ROWS_PER_STATEMENT: usize = MAX_PARAMETERS / COLUMNS_PER_ROW;

// unique_violation and duplicate_table, raised when two sessions race on
// CREATE TABLE IF NOT EXISTS
const CONCURRENT_CREATE_STATES: [&str; 2] = ["23505", "42P07"];

/// PostgreSQL destination holding one libpq session
pub struct PostgresDestination {
    connection: Option<PGConnection>,
    in_transaction: bool,
}

impl PostgresDestination {
    /// Connect and prepare the session
    pub fn open(config: &PostgresConfig) -> SinkResult<Self> {
        info!("Connecting to destination: {}", config.redacted_conninfo());
        let connection = PGConnection::connect(&config.conninfo())?;
        info!("Successfully connected to destination server");

        if let Some(timeout_ms) = config.statement_timeout_ms {
            let result = connection.exec(&format!("SET statement_timeout = {}", timeout_ms))?;
            if !result.is_ok() {
                return Err(SinkError::connection(format!(
                    "Failed to set statement_timeout: {}",
                    result.error_message()
                )));
            }
            debug!("statement_timeout set to {}ms", timeout_ms);
        }

        Ok(Self {
            connection: Some(connection),
            in_transaction: false,
        })
    }

    fn connection(&self) -> SinkResult<&PGConnection> {
        let connection = self
            .connection
            .as_ref()
            .ok_or_else(|| SinkError::connection("Destination connection is closed"))?;

        if !connection.is_alive() {
            return Err(SinkError::connection(format!(
                "Destination connection lost: {}",
                connection.error_message()
            )));
        }

        Ok(connection)
    }

    fn begin_if_needed(&mut self) -> SinkResult<()> {
        if self.in_transaction {
            return Ok(());
        }

        let result = self.connection()?.exec("BEGIN")?;
        if !result.is_ok() {
            return Err(self.failure("BEGIN failed", &result, SinkError::write));
        }

        self.in_transaction = true;
        Ok(())
    }

    /// Build an error for a failed result, promoting it to a connection error
    /// when the session died underneath the statement
    fn failure(
        &self,
        context: &str,
        result: &PGResult,
        kind: fn(String) -> SinkError,
    ) -> SinkError {
        let sql_state = result.sql_state().unwrap_or_default();
        let message = format!("{} [{}]: {}", context, sql_state, result.error_message());

        match self.connection.as_ref() {
            Some(connection) if !connection.is_alive() => SinkError::connection(message),
            _ => kind(message),
        }
    }
}

/// Quote an identifier for use in SQL text
fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// DDL for the event table
pub fn render_create_table(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\
         id UUID PRIMARY KEY, \
         destination TEXT NOT NULL, \
         key TEXT, \
         value TEXT, \
         recorded_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP)",
        quote_identifier(table)
    )
}

/// Multi-row insert with numbered placeholders for `row_count` rows
pub fn render_insert(table: &str, row_count: usize, on_conflict: ConflictPolicy) -> String {
    let values = (0..row_count)
        .map(|row| {
            let base = row * COLUMNS_PER_ROW;
            format!("(${}, ${}, ${}, ${})", base + 1, base + 2, base + 3, base + 4)
        })
        .collect::<Vec<_>>()
        .join(", ");

    let mut sql = format!(
        "INSERT INTO {} (id, destination, key, value) VALUES {}",
        quote_identifier(table),
        values
    );

    if on_conflict == ConflictPolicy::Skip {
        sql.push_str(" ON CONFLICT (id) DO NOTHING");
    }

    sql
}

impl Destination for PostgresDestination {
    fn kind(&self) -> &'static str {
        "postgres"
    }

    fn create_table_statement(&self, table: &str) -> String {
        render_create_table(table)
    }

    fn execute_ddl(&mut self, statement: &str) -> SinkResult<()> {
        self.begin_if_needed()?;
        let result = self.connection()?.exec(statement)?;

        if result.is_ok() {
            return Ok(());
        }

        let concurrent_create = result
            .sql_state()
            .is_some_and(|state| CONCURRENT_CREATE_STATES.contains(&state.as_str()));

        if concurrent_create {
            info!("Table was created concurrently by another session");
            self.rollback()?;
            return Ok(());
        }

        Err(self.failure("DDL failed", &result, SinkError::schema))
    }

    fn insert_batch(
        &mut self,
        table: &str,
        rows: &[SinkRow],
        on_conflict: ConflictPolicy,
    ) -> SinkResult<u64> {
        self.begin_if_needed()?;

        let mut accepted = 0;
        for chunk in rows.chunks(MAX_ROWS_PER_STATEMENT) {
            let ids: Vec<String> = chunk.iter().map(|row| row.id.to_string()).collect();
            let params: Vec<Option<&str>> = chunk
                .iter()
                .zip(&ids)
                .flat_map(|(row, id)| {
                    [
                        Some(id.as_str()),
                        Some(row.destination.as_str()),
                        row.key.as_deref(),
                        row.value.as_deref(),
                    ]
                })
                .collect();

            let sql = render_insert(table, chunk.len(), on_conflict);
            let result = self.connection()?.exec_params(&sql, &params)?;
            if !result.is_ok() {
                return Err(self.failure("Batch insert failed", &result, SinkError::write));
            }
            accepted += result.affected_rows();
        }

        Ok(accepted)
    }

    fn commit(&mut self) -> SinkResult<()> {
        if !self.in_transaction {
            return Ok(());
        }

        let result = self.connection()?.exec("COMMIT")?;
        self.in_transaction = false;

        if !result.is_ok() {
            return Err(self.failure("COMMIT failed", &result, SinkError::write));
        }

        // COMMIT of an aborted transaction succeeds with a ROLLBACK tag
        if result.command_status() == "ROLLBACK" {
            return Err(SinkError::write("Transaction was rolled back by the server"));
        }

        Ok(())
    }

    fn rollback(&mut self) -> SinkResult<()> {
        if !self.in_transaction {
            return Ok(());
        }
        self.in_transaction = false;

        let result = self.connection()?.exec("ROLLBACK")?;
        if !result.is_ok() {
            return Err(self.failure("ROLLBACK failed", &result, SinkError::write));
        }

        Ok(())
    }

    fn close(&mut self) -> SinkResult<()> {
        if self.connection.is_none() {
            return Ok(());
        }

        if self.in_transaction {
            if let Err(e) = self.rollback() {
                warn!("Rollback on close failed: {}", e);
            }
        }

        // Dropping the connection calls PQfinish
        self.connection = None;
        info!("Destination connection closed");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.connection.is_none()
    }
}

impl Drop for PostgresDestination {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to close destination connection: {}", e);
        }
    }
}
