//! cdc2sql - batched, transactional sink for change-data-capture events
//!
//! Change events delivered by a capture engine are mapped to rows of a fixed
//! event table and committed in batches, one transaction per batch.

pub mod core;
pub mod events;
pub mod runner;
pub mod sink;
pub mod tracing_context;
pub mod utils;

pub use crate::core::{DestinationKind, IdentityMode, PostgresConfig, SinkConfig, SinkError, SinkResult};
pub use crate::events::{ChangeEvent, Payload};
pub use crate::sink::{Destination, HandlerState, SinkHandler};
