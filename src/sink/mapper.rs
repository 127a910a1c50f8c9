//! Mapping from change events to destination rows

use crate::core::config::IdentityMode;
use crate::core::errors::{SinkError, SinkResult};
use crate::events::ChangeEvent;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

// Namespace for name-based row identities
const ROW_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6f1d_2c3e_8a4b_4f5e_9c7d_1e2f_3a4b_5c6d);

/// The persisted form of one change event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SinkRow {
    pub id: Uuid,
    pub destination: String,
    pub key: Option<String>,
    pub value: Option<String>,
    /// Assigned by the store when the row is committed, never by the mapper
    pub recorded_at: Option<DateTime<Utc>>,
}

/// Turns change events into rows. Pure: the only input is the event.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventRecordMapper {
    identity: IdentityMode,
}

impl EventRecordMapper {
    pub fn new(identity: IdentityMode) -> Self {
        Self { identity }
    }

    pub fn identity_mode(&self) -> IdentityMode {
        self.identity
    }

    /// Map one event.
    ///
    /// Deterministic identities are derived from the destination and the
    /// upstream offset, so an event without an offset is rejected in that
    /// mode. Random identities accept every event.
    pub fn map(&self, event: &ChangeEvent) -> SinkResult<SinkRow> {
        let destination = event.destination().to_string();

        let id = match self.identity {
            IdentityMode::Random => Uuid::new_v4(),
            IdentityMode::Deterministic => {
                let offset = event.offset().ok_or_else(|| {
                    SinkError::mapping(format!(
                        "Deterministic row ids need an upstream offset, none on event for {}",
                        destination
                    ))
                })?;
                let name = json!([destination, offset]).to_string();
                Uuid::new_v5(&ROW_ID_NAMESPACE, name.as_bytes())
            }
        };

        Ok(SinkRow {
            id,
            destination,
            key: event.key().and_then(|k| k.to_column_text()),
            value: event.value().and_then(|v| v.to_column_text()),
            recorded_at: None,
        })
    }
}
