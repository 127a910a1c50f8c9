//! Idempotent creation of the event table

use super::destination::Destination;
use crate::core::errors::{SinkError, SinkResult};
use tracing::{debug, info, warn};

/// Makes sure the event table exists before the first write.
///
/// One provisioner belongs to one connection; the DDL is issued at most
/// once over that connection's lifetime.
#[derive(Debug)]
pub struct TableProvisioner {
    table: String,
    provisioned: bool,
}

impl TableProvisioner {
    pub fn new<S: Into<String>>(table: S) -> Self {
        Self {
            table: table.into(),
            provisioned: false,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn is_provisioned(&self) -> bool {
        self.provisioned
    }

    /// Run the conditional create and commit it. Concurrent provisioners on
    /// other connections rely on the store's own "if not exists" semantics.
    pub fn ensure_table<D: Destination + ?Sized>(&mut self, destination: &mut D) -> SinkResult<()> {
        if self.provisioned {
            debug!("Table {} already provisioned on this connection", self.table);
            return Ok(());
        }

        let statement = destination.create_table_statement(&self.table);
        debug!("Provisioning table {} on {}", self.table, destination.kind());

        let outcome = destination
            .execute_ddl(&statement)
            .and_then(|_| destination.commit());

        if let Err(e) = outcome {
            if let Err(rollback_err) = destination.rollback() {
                warn!("Rollback after failed provisioning also failed: {}", rollback_err);
            }
            return Err(match e {
                e @ (SinkError::Schema { .. } | SinkError::Connection { .. }) => e,
                other => SinkError::schema_with_source(
                    format!("Failed to provision table {}", self.table),
                    other,
                ),
            });
        }

        self.provisioned = true;
        info!("Table {} is ready", self.table);
        Ok(())
    }
}
