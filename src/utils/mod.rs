//! Utility modules for the sink
//!
//! - PostgreSQL connection handling

pub mod connection;

pub use connection::{PGConnection, PGResult};
