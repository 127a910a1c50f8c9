//! SQL Server destination over TDS
//!
//! tiberius is async-only, so the session keeps a handle to the tokio runtime
//! and drives each statement to completion with `block_on`. It must be used
//! from a blocking thread (`spawn_blocking`), never from inside a task.
//!
//! `XACT_ABORT` is switched on so any failed statement dooms the open
//! transaction, matching the all-or-nothing batch semantics of the
//! PostgreSQL session.

use super::destination::{ConflictPolicy, Destination};
use super::mapper::SinkRow;
use crate::core::config::MssqlConfig;
use crate::core::errors::{SinkError, SinkResult};
use std::borrow::Cow;
use std::time::Duration;
use tiberius::error::Error as TdsError;
use tiberius::{AuthMethod, Client, ColumnData, Config, ToSql};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

type MssqlClient = Client<Compat<TcpStream>>;

const COLUMNS_PER_ROW: usize = 4;
// A request carries at most 2100 parameters
const MAX_PARAMETERS: usize = 2_100;
pub const MAX_ROWS_PER_STATEMENT: usize = 500;

// "There is already an object named ... in the database", raised when two
// sessions race past the OBJECT_ID check
const OBJECT_EXISTS: u32 = 2714;

/// One bound value of an insert
enum Param<'a> {
    Id(Uuid),
    Text(Option<&'a str>),
}

impl ToSql for Param<'_> {
    fn to_sql(&self) -> ColumnData<'_> {
        match self {
            Param::Id(id) => ColumnData::Guid(Some(*id)),
            Param::Text(text) => ColumnData::String(text.map(Cow::Borrowed)),
        }
    }
}

/// SQL Server destination holding one TDS session
pub struct MssqlDestination {
    client: Option<MssqlClient>,
    runtime: Handle,
    in_transaction: bool,
    broken: bool,
}

impl MssqlDestination {
    /// Connect, authenticate and prepare the session
    pub fn open(config: &MssqlConfig, runtime: Handle) -> SinkResult<Self> {
        info!("Connecting to destination: {}", config.describe());

        let mut tds = Config::new();
        tds.host(&config.host);
        tds.port(config.port);
        tds.database(&config.database);
        tds.authentication(AuthMethod::sql_server(
            &config.user,
            config.password.as_deref().unwrap_or_default(),
        ));
        if config.trust_server_certificate {
            tds.trust_cert();
        }

        let connect = async {
            let tcp = TcpStream::connect(tds.get_addr())
                .await
                .map_err(|e| SinkError::connection(format!("Failed to connect: {}", e)))?;
            tcp.set_nodelay(true).ok();

            Client::connect(tds, tcp.compat_write())
                .await
                .map_err(|e| SinkError::connection(format!("Failed to authenticate: {}", e)))
        };

        let client = runtime.block_on(async {
            match config.connect_timeout_secs {
                Some(secs) => tokio::time::timeout(Duration::from_secs(secs), connect)
                    .await
                    .map_err(|_| {
                        SinkError::connection(format!("Connection timed out after {}s", secs))
                    })?,
                None => connect.await,
            }
        })?;
        info!("Successfully connected to destination server");

        let mut destination = Self {
            client: Some(client),
            runtime,
            in_transaction: false,
            broken: false,
        };

        if let Err(e) = destination.execute("SET XACT_ABORT ON", &[])? {
            return Err(destination.failure("Failed to set XACT_ABORT", e, SinkError::connection));
        }
        debug!("XACT_ABORT enabled");

        Ok(destination)
    }

    /// Run one statement. The outer error is the session being unusable, the
    /// inner one is whatever the server or the transport reported.
    fn execute(&mut self, sql: &str, params: &[&dyn ToSql]) -> SinkResult<Result<u64, TdsError>> {
        if self.broken {
            return Err(SinkError::connection("Destination connection lost"));
        }
        let client = self
            .client
            .as_mut()
            .ok_or_else(|| SinkError::connection("Destination connection is closed"))?;

        let result = self
            .runtime
            .block_on(async { client.execute(sql, params).await.map(|done| done.total()) });

        if let Err(TdsError::Io { .. }) = &result {
            self.broken = true;
        }

        Ok(result)
    }

    /// Build an error for a failed statement, promoting it to a connection
    /// error when the transport died underneath it
    fn failure(&self, context: &str, error: TdsError, kind: fn(String) -> SinkError) -> SinkError {
        let message = format!("{}: {}", context, error);
        if self.broken {
            SinkError::connection(message)
        } else {
            kind(message)
        }
    }

    fn begin_if_needed(&mut self) -> SinkResult<()> {
        if self.in_transaction {
            return Ok(());
        }

        if let Err(e) = self.execute("BEGIN TRANSACTION", &[])? {
            return Err(self.failure("BEGIN TRANSACTION failed", e, SinkError::write));
        }

        self.in_transaction = true;
        Ok(())
    }
}

/// Bracket-quote an identifier
fn quote_identifier(name: &str) -> String {
    format!("[{}]", name.replace(']', "]]"))
}

/// DDL for the event table
pub fn render_create_table(table: &str) -> String {
    let quoted = quote_identifier(table);
    format!(
        "IF OBJECT_ID(N'{}', N'U') IS NULL \
         CREATE TABLE {} (\
         id UNIQUEIDENTIFIER PRIMARY KEY, \
         destination NVARCHAR(255) NOT NULL, \
         [key] NVARCHAR(MAX), \
         [value] NVARCHAR(MAX), \
         recorded_at DATETIME2 NOT NULL DEFAULT SYSUTCDATETIME())",
        quoted.replace('\'', "''"),
        quoted
    )
}

/// Multi-row insert with `@Pn` placeholders for `row_count` rows
pub fn render_insert(table: &str, row_count: usize, on_conflict: ConflictPolicy) -> String {
    let values = (0..row_count)
        .map(|row| {
            let base = row * COLUMNS_PER_ROW;
            format!("(@P{}, @P{}, @P{}, @P{})", base + 1, base + 2, base + 3, base + 4)
        })
        .collect::<Vec<_>>()
        .join(", ");
    let table = quote_identifier(table);

    match on_conflict {
        ConflictPolicy::Fail => format!(
            "INSERT INTO {} (id, destination, [key], [value]) VALUES {}",
            table, values
        ),
        // No ON CONFLICT in T-SQL; filter ids that already exist
        ConflictPolicy::Skip => format!(
            "INSERT INTO {0} (id, destination, [key], [value]) \
             SELECT v.id, v.destination, v.[key], v.[value] \
             FROM (VALUES {1}) AS v (id, destination, [key], [value]) \
             WHERE NOT EXISTS (SELECT 1 FROM {0} AS e WHERE e.id = v.id)",
            table, values
        ),
    }
}

impl Destination for MssqlDestination {
    fn kind(&self) -> &'static str {
        "mssql"
    }

    fn create_table_statement(&self, table: &str) -> String {
        render_create_table(table)
    }

    fn execute_ddl(&mut self, statement: &str) -> SinkResult<()> {
        self.begin_if_needed()?;

        match self.execute(statement, &[])? {
            Ok(_) => Ok(()),
            Err(TdsError::Server(token)) if token.code() == OBJECT_EXISTS => {
                info!("Table was created concurrently by another session");
                self.rollback()?;
                Ok(())
            }
            Err(e) => Err(self.failure("DDL failed", e, SinkError::schema)),
        }
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
            let params: Vec<Param<'_>> = chunk
                .iter()
                .flat_map(|row| {
                    [
                        Param::Id(row.id),
                        Param::Text(Some(row.destination.as_str())),
                        Param::Text(row.key.as_deref()),
                        Param::Text(row.value.as_deref()),
                    ]
                })
                .collect();
            let refs: Vec<&dyn ToSql> = params.iter().map(|p| p as &dyn ToSql).collect();

            let sql = render_insert(table, chunk.len(), on_conflict);
            match self.execute(&sql, &refs)? {
                Ok(total) => accepted += total,
                Err(e) => return Err(self.failure("Batch insert failed", e, SinkError::write)),
            }
        }

        Ok(accepted)
    }

    fn commit(&mut self) -> SinkResult<()> {
        if !self.in_transaction {
            return Ok(());
        }
        self.in_transaction = false;

        // Fails with 3902 when XACT_ABORT already rolled the transaction back
        if let Err(e) = self.execute("COMMIT TRANSACTION", &[])? {
            return Err(self.failure("COMMIT failed", e, SinkError::write));
        }

        Ok(())
    }

    fn rollback(&mut self) -> SinkResult<()> {
        if !self.in_transaction {
            return Ok(());
        }
        self.in_transaction = false;

        if let Err(e) = self.execute("IF @@TRANCOUNT > 0 ROLLBACK TRANSACTION", &[])? {
            return Err(self.failure("ROLLBACK failed", e, SinkError::write));
        }

        Ok(())
    }

    fn close(&mut self) -> SinkResult<()> {
        if self.client.is_none() {
            return Ok(());
        }

        if self.in_transaction && !self.broken {
            if let Err(e) = self.rollback() {
                warn!("Rollback on close failed: {}", e);
            }
        }

        if let Some(client) = self.client.take() {
            if let Err(e) = self.runtime.block_on(client.close()) {
                warn!("Error while closing destination session: {}", e);
            }
        }
        info!("Destination connection closed");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.client.is_none()
    }
}

impl Drop for MssqlDestination {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to close destination connection: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_table_statement() {
        let ddl = render_create_table("raw_events");
        assert!(ddl.starts_with(
            "IF OBJECT_ID(N'[raw_events]', N'U') IS NULL CREATE TABLE [raw_events] ("
        ));
        assert!(ddl.contains("id UNIQUEIDENTIFIER PRIMARY KEY"));
        assert!(ddl.contains("[key] NVARCHAR(MAX), [value] NVARCHAR(MAX)"));
        assert!(ddl.ends_with("recorded_at DATETIME2 NOT NULL DEFAULT SYSUTCDATETIME())"));
    }

    #[test]
    fn test_create_table_escapes_name_in_object_lookup() {
        let ddl = render_create_table("o'brien");
        assert!(ddl.starts_with("IF OBJECT_ID(N'[o''brien]', N'U') IS NULL CREATE TABLE [o'brien]"));
    }

    #[test]
    fn test_insert_placeholders() {
        let sql = render_insert("raw_events", 2, ConflictPolicy::Fail);
        assert_eq!(
            sql,
            "INSERT INTO [raw_events] (id, destination, [key], [value]) VALUES (@P1, @P2, @P3, @P4), (@P5, @P6, @P7, @P8)"
        );
    }

    #[test]
    fn test_insert_skip_filters_existing_ids() {
        let sql = render_insert("raw_events", 1, ConflictPolicy::Skip);
        assert!(sql.contains("FROM (VALUES (@P1, @P2, @P3, @P4)) AS v (id, destination, [key], [value])"));
        assert!(sql.ends_with("WHERE NOT EXISTS (SELECT 1 FROM [raw_events] AS e WHERE e.id = v.id)"));
    }

    #[test]
    fn test_statement_parameter_limit() {
        assert!(MAX_ROWS_PER_STATEMENT * COLUMNS_PER_ROW <= MAX_PARAMETERS);

        let sql = render_insert("raw_events", MAX_ROWS_PER_STATEMENT, ConflictPolicy::Fail);
        assert!(sql.ends_with("@P1997, @P1998, @P1999, @P2000)"));
    }

    #[test]
    fn test_quote_identifier_escapes_brackets() {
        assert_eq!(quote_identifier("odd]name"), "[odd]]name]");
    }

    #[test]
    fn test_text_params_bind_null() {
        assert!(matches!(Param::Text(None).to_sql(), ColumnData::String(None)));
        let id = Uuid::new_v4();
        assert!(matches!(Param::Id(id).to_sql(), ColumnData::Guid(Some(g)) if g == id));
    }
}
