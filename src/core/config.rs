//! Configuration management for the change-event sink
//!
//! This module handles loading configuration from environment variables.
//! It provides a centralized way to manage all sink settings
//! with proper validation and default values.

use super::{SinkError, SinkResult};
use std::env;
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_BATCH_SIZE: usize = 1000;
pub const DEFAULT_TABLE_NAME: &str = "raw_events";

// PostgreSQL identifier length limit
const MAX_IDENTIFIER_LEN: usize = 63;

/// Which destination adapter the sink writes through
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DestinationKind {
    Postgres,
    Mssql,
    Stdout,
    Memory,
}

impl fmt::Display for DestinationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DestinationKind::Postgres => write!(f, "postgres"),
            DestinationKind::Mssql => write!(f, "mssql"),
            DestinationKind::Stdout => write!(f, "stdout"),
            DestinationKind::Memory => write!(f, "memory"),
        }
    }
}

impl FromStr for DestinationKind {
    type Err = SinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(DestinationKind::Postgres),
            "mssql" | "sqlserver" => Ok(DestinationKind::Mssql),
            "stdout" => Ok(DestinationKind::Stdout),
            "memory" => Ok(DestinationKind::Memory),
            other => Err(SinkError::config(format!(
                "SINK_DESTINATION must be one of: 'postgres', 'mssql', 'stdout', or 'memory' (got '{}')",
                other
            ))),
        }
    }
}

/// How row identities are generated
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum IdentityMode {
    /// Fresh random UUID per mapped event
    #[default]
    Random,
    /// Name-based UUID derived from the event's destination and upstream
    /// offset, so a redelivered change maps to the id it had before
    Deterministic,
}

impl FromStr for IdentityMode {
    type Err = SinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "random" => Ok(IdentityMode::Random),
            "deterministic" => Ok(IdentityMode::Deterministic),
            other => Err(SinkError::config(format!(
                "SINK_IDENTITY_MODE must be 'random' or 'deterministic' (got '{}')",
                other
            ))),
        }
    }
}

/// Connection settings for the PostgreSQL destination
#[derive(Clone)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub database: String,
    pub connect_timeout_secs: Option<u64>,
    pub statement_timeout_ms: Option<u64>,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: "postgres".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: None,
            database: "postgres".to_string(),
            connect_timeout_secs: None,
            statement_timeout_ms: None,
        }
    }
}

impl fmt::Debug for PostgresConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("database", &self.database)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("statement_timeout_ms", &self.statement_timeout_ms)
            .finish()
    }
}

impl PostgresConfig {
    /// Render a libpq key/value connection string
    pub fn conninfo(&self) -> String {
        self.render_conninfo(false)
    }

    /// Same as [`conninfo`](Self::conninfo) with the password masked, for logging
    pub fn redacted_conninfo(&self) -> String {
        self.render_conninfo(true)
    }

    fn render_conninfo(&self, redact: bool) -> String {
        let mut parts = vec![
            format!("host={}", quote_conninfo_value(&self.host)),
            format!("port={}", self.port),
            format!("user={}", quote_conninfo_value(&self.user)),
            format!("dbname={}", quote_conninfo_value(&self.database)),
        ];

        if let Some(password) = &self.password {
            if redact {
                parts.push("password=***".to_string());
            } else {
                parts.push(format!("password={}", quote_conninfo_value(password)));
            }
        }

        if let Some(secs) = self.connect_timeout_secs {
            parts.push(format!("connect_timeout={}", secs));
        }

        parts.join(" ")
    }
}

/// Quote a conninfo value so spaces, quotes and backslashes survive libpq parsing
fn quote_conninfo_value(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{}'", escaped)
}

/// Connection settings for the SQL Server destination
#[derive(Clone)]
pub struct MssqlConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub database: String,
    pub trust_server_certificate: bool,
    pub connect_timeout_secs: Option<u64>,
}

impl Default for MssqlConfig {
    fn default() -> Self {
        Self {
            host: "mssql".to_string(),
            port: 1433,
            user: "SA".to_string(),
            password: None,
            database: "raw_db".to_string(),
            trust_server_certificate: true,
            connect_timeout_secs: None,
        }
    }
}

impl fmt::Debug for MssqlConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MssqlConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("database", &self.database)
            .field("trust_server_certificate", &self.trust_server_certificate)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .finish()
    }
}

impl MssqlConfig {
    /// `host:port/database as user`, for logging
    pub fn describe(&self) -> String {
        format!("{}:{}/{} as {}", self.host, self.port, self.database, self.user)
    }
}

/// Configuration for one sink handler
#[derive(Debug, Clone)]
pub struct SinkConfig {
    pub destination: DestinationKind,
    pub postgres: PostgresConfig,
    pub mssql: MssqlConfig,
    pub batch_size: usize,
    pub table_name: String,
    pub identity_mode: IdentityMode,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            destination: DestinationKind::Postgres,
            postgres: PostgresConfig::default(),
            mssql: MssqlConfig::default(),
            batch_size: DEFAULT_BATCH_SIZE,
            table_name: DEFAULT_TABLE_NAME.to_string(),
            identity_mode: IdentityMode::Random,
        }
    }
}

impl SinkConfig {
    /// Load configuration from environment variables
    ///
    /// # Environment Variables
    ///
    /// Optional (with defaults):
    /// - `SINK_DESTINATION`: "postgres", "mssql", "stdout" or "memory" (default: "postgres")
    /// - `POSTGRESQL_HOST` (default: "postgres"), `POSTGRESQL_PORT` (default: 5432)
    /// - `POSTGRESQL_USER` (default: "postgres"), `POSTGRESQL_DB` (default: "postgres")
    /// - `POSTGRESQL_INSERT_BATCH_SIZE`: rows per transaction (default: 1000)
    /// - `MSSQL_HOST` (default: "mssql"), `MSSQL_PORT` (default: 1433)
    /// - `MSSQL_USER` (default: "SA"), `MSSQL_DB` (default: "raw_db")
    /// - `MSSQL_TRUST_SERVER_CERTIFICATE` (default: true)
    /// - `MSSQL_INSERT_BATCH_SIZE`: rows per transaction for the "mssql"
    ///   destination (default: 1000)
    /// - `SINK_TABLE_NAME`: destination table (default: "raw_events")
    /// - `SINK_IDENTITY_MODE`: "random" or "deterministic" (default: "random")
    ///
    /// Optional (no default):
    /// - `POSTGRESQL_PASSWORD`
    /// - `POSTGRESQL_CONNECT_TIMEOUT_SECS`
    /// - `POSTGRESQL_STATEMENT_TIMEOUT_MS`
    /// - `MSSQL_PASSWORD`, `MSSQL_CONNECT_TIMEOUT_SECS`
    pub fn from_env() -> SinkResult<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup. `from_env` is this
    /// with the process environment plugged in.
    pub fn from_lookup<F>(lookup: F) -> SinkResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let pg_defaults = PostgresConfig::default();
        let mssql_defaults = MssqlConfig::default();

        let destination = match lookup("SINK_DESTINATION") {
            Some(value) => value.parse()?,
            None => defaults.destination,
        };

        let identity_mode = match lookup("SINK_IDENTITY_MODE") {
            Some(value) => value.parse()?,
            None => defaults.identity_mode,
        };

        let postgres = PostgresConfig {
            host: lookup("POSTGRESQL_HOST").unwrap_or(pg_defaults.host),
            port: parse_var(&lookup, "POSTGRESQL_PORT")?.unwrap_or(pg_defaults.port),
            user: lookup("POSTGRESQL_USER").unwrap_or(pg_defaults.user),
            password: lookup("POSTGRESQL_PASSWORD"),
            database: lookup("POSTGRESQL_DB").unwrap_or(pg_defaults.database),
            connect_timeout_secs: parse_var(&lookup, "POSTGRESQL_CONNECT_TIMEOUT_SECS")?,
            statement_timeout_ms: parse_var(&lookup, "POSTGRESQL_STATEMENT_TIMEOUT_MS")?,
        };

        let mssql = MssqlConfig {
            host: lookup("MSSQL_HOST").unwrap_or(mssql_defaults.host),
            port: parse_var(&lookup, "MSSQL_PORT")?.unwrap_or(mssql_defaults.port),
            user: lookup("MSSQL_USER").unwrap_or(mssql_defaults.user),
            password: lookup("MSSQL_PASSWORD"),
            database: lookup("MSSQL_DB").unwrap_or(mssql_defaults.database),
            trust_server_certificate: parse_var(&lookup, "MSSQL_TRUST_SERVER_CERTIFICATE")?
                .unwrap_or(mssql_defaults.trust_server_certificate),
            connect_timeout_secs: parse_var(&lookup, "MSSQL_CONNECT_TIMEOUT_SECS")?,
        };

        let batch_size_var = match destination {
            DestinationKind::Mssql => "MSSQL_INSERT_BATCH_SIZE",
            _ => "POSTGRESQL_INSERT_BATCH_SIZE",
        };

        let config = Self {
            destination,
            postgres,
            mssql,
            batch_size: parse_var(&lookup, batch_size_var)?.unwrap_or(defaults.batch_size),
            table_name: lookup("SINK_TABLE_NAME").unwrap_or(defaults.table_name),
            identity_mode,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn with_destination(mut self, destination: DestinationKind) -> Self {
        self.destination = destination;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_table_name<S: Into<String>>(mut self, table_name: S) -> Self {
        self.table_name = table_name.into();
        self
    }

    pub fn with_identity_mode(mut self, identity_mode: IdentityMode) -> Self {
        self.identity_mode = identity_mode;
        self
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> SinkResult<()> {
        if self.batch_size == 0 {
            return Err(SinkError::config("Insert batch size must be greater than zero"));
        }

        if !is_valid_identifier(&self.table_name) {
            return Err(SinkError::config(format!(
                "Table name '{}' must be 1-{} alphanumeric/underscore characters and not start with a digit",
                self.table_name, MAX_IDENTIFIER_LEN
            )));
        }

        if self.destination == DestinationKind::Postgres {
            if self.postgres.host.trim().is_empty() {
                return Err(SinkError::config("POSTGRESQL_HOST cannot be empty"));
            }
            if self.postgres.user.trim().is_empty() {
                return Err(SinkError::config("POSTGRESQL_USER cannot be empty"));
            }
            if self.postgres.database.trim().is_empty() {
                return Err(SinkError::config("POSTGRESQL_DB cannot be empty"));
            }
        }

        if self.destination == DestinationKind::Mssql {
            if self.mssql.host.trim().is_empty() {
                return Err(SinkError::config("MSSQL_HOST cannot be empty"));
            }
            if self.mssql.user.trim().is_empty() {
                return Err(SinkError::config("MSSQL_USER cannot be empty"));
            }
            if self.mssql.database.trim().is_empty() {
                return Err(SinkError::config("MSSQL_DB cannot be empty"));
            }
        }

        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> SinkResult<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| SinkError::config(format!("Invalid value for {}: {}", key, e))),
        None => Ok(None),
    }
}

/// Check a table name against PostgreSQL's unquoted identifier rules
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }

    name.len() <= MAX_IDENTIFIER_LEN && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
