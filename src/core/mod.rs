//! Core module containing configuration and error handling
//!
//! This module provides the basic building blocks shared by every sink
//! component.

pub mod config;
pub mod errors;

// Re-export for convenience
pub use config::{DestinationKind, IdentityMode, MssqlConfig, PostgresConfig, SinkConfig};
pub use errors::{SinkError, SinkResult};
