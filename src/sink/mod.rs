//! Batched, transactional writing of change events into a destination table
//!
//! A [`SinkHandler`] owns one [`Destination`] session. Each delivery of change
//! events is mapped to rows, cut into batches of the configured size, and
//! every batch is committed in its own transaction.

pub mod accumulator;
pub mod destination;
pub mod handler;
pub mod mapper;
pub mod memory;
pub mod metrics;
pub mod mssql;
pub mod postgres;
pub mod provisioner;
pub mod stdout;
pub mod writer;

pub use accumulator::{Batch, BatchAccumulator};
pub use destination::{ConflictPolicy, Destination};
pub use handler::{HandlerState, SinkHandler};
pub use mapper::{EventRecordMapper, SinkRow};
pub use memory::{MemoryDestination, MemoryStore};
pub use metrics::HandlerMetrics;
pub use mssql::MssqlDestination;
pub use postgres::PostgresDestination;
pub use provisioner::TableProvisioner;
pub use stdout::StdoutDestination;
pub use writer::TransactionalBatchWriter;

use crate::core::config::{DestinationKind, SinkConfig};
use crate::core::errors::{SinkError, SinkResult};
use tracing::info;

/// Open a session on the destination named by the configuration
pub fn open_destination(config: &SinkConfig) -> SinkResult<Box<dyn Destination>> {
    info!("Opening {} destination", config.destination);

    let destination: Box<dyn Destination> = match config.destination {
        DestinationKind::Postgres => Box::new(PostgresDestination::open(&config.postgres)?),
        DestinationKind::Mssql => {
            let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
                SinkError::connection(format!("SQL Server destination needs a tokio runtime: {}", e))
            })?;
            Box::new(MssqlDestination::open(&config.mssql, runtime)?)
        }
        DestinationKind::Stdout => Box::new(StdoutDestination::new()),
        // A private store that lives as long as the session
        DestinationKind::Memory => Box::new(MemoryStore::new().connect()),
    };

    Ok(destination)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_destination_by_kind() {
        let config = SinkConfig::default().with_destination(DestinationKind::Memory);
        let destination = open_destination(&config).unwrap();
        assert_eq!(destination.kind(), "memory");
        assert!(!destination.is_closed());

        let config = SinkConfig::default().with_destination(DestinationKind::Stdout);
        let destination = open_destination(&config).unwrap();
        assert_eq!(destination.kind(), "stdout");
    }

    #[test]
    fn test_open_mssql_outside_runtime_fails() {
        let config = SinkConfig::default().with_destination(DestinationKind::Mssql);
        let err = open_destination(&config).err().unwrap();
        assert_eq!(err.kind(), "connection");
        assert!(err.to_string().contains("Destination connection error"));
    }
}
