//! Error types for the change-event sink
//! Provides structured error handling using thiserror for better error reporting

use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Main error type for the sink
#[derive(Error, Debug)]
pub enum SinkError {
    /// The destination session could not be established or was lost
    #[error("Destination connection error: {message}")]
    Connection {
        message: String,
        source: Option<BoxError>,
    },

    /// Table provisioning failed
    #[error("Schema provisioning error: {message}")]
    Schema {
        message: String,
        source: Option<BoxError>,
    },

    /// A batch insert or commit failed; the batch was rolled back
    #[error("Batch write error: {message}")]
    Write {
        message: String,
        source: Option<BoxError>,
    },

    /// A change event could not be turned into a row
    #[error("Event mapping error: {message}")]
    Mapping { message: String },

    /// Configuration related errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("IO error")]
    Io(#[from] std::io::Error),

    #[error("JSON decoding error")]
    Json(#[from] serde_json::Error),

    /// C string conversion errors
    #[error("C string conversion error")]
    CStringConversion(#[from] std::ffi::NulError),

    /// Task execution errors for async operations
    #[error("Task execution error")]
    TaskExecution(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for convenience
pub type SinkResult<T> = std::result::Result<T, SinkError>;

impl SinkError {
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    pub fn schema<S: Into<String>>(message: S) -> Self {
        Self::Schema {
            message: message.into(),
            source: None,
        }
    }

    /// Create a schema error wrapping the underlying failure
    pub fn schema_with_source<S, E>(message: S, source: E) -> Self
    where
        S: Into<String>,
        E: Into<BoxError>,
    {
        Self::Schema {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn write<S: Into<String>>(message: S) -> Self {
        Self::Write {
            message: message.into(),
            source: None,
        }
    }

    pub fn mapping<S: Into<String>>(message: S) -> Self {
        Self::Mapping {
            message: message.into(),
        }
    }

    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Short label used in log lines
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "connection",
            Self::Schema { .. } => "schema",
            Self::Write { .. } => "write",
            Self::Mapping { .. } => "mapping",
            Self::Configuration { .. } => "configuration",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
            Self::CStringConversion(_) => "cstring",
            Self::TaskExecution(_) => "task",
            Self::Other(_) => "other",
        }
    }

    /// True for failures that abort the batch in flight without taking the
    /// session down. A mapping failure counts as a write failure.
    pub fn is_batch_abort(&self) -> bool {
        matches!(self, Self::Write { .. } | Self::Mapping { .. })
    }

    /// True when the handler cannot keep going on its current session.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::Schema { .. } | Self::Configuration { .. }
        )
    }
}
