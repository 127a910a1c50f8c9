//! Change events as delivered by the upstream change-capture engine
//!
//! An event is a fixed-shape record: the logical source table it came from,
//! optional key and value payloads, and optionally the upstream offset that
//! names the change in its source log. Payloads are either text that is
//! persisted as-is, or structured JSON that is serialized on the way out.

use crate::core::errors::{SinkError, SinkResult};
use serde::Deserialize;
use serde_json::Value;

/// Key or value payload of a change event
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Text(String),
    Json(Value),
}

impl Payload {
    /// Text representation stored in the destination table.
    ///
    /// Text passes through unchanged and JSON is serialized compactly. Empty
    /// text and JSON `null` count as an absent payload.
    pub fn to_column_text(&self) -> Option<String> {
        match self {
            Payload::Text(text) if text.is_empty() => None,
            Payload::Text(text) => Some(text.clone()),
            Payload::Json(Value::Null) => None,
            Payload::Json(value) => Some(value.to_string()),
        }
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        match value {
            Value::String(text) => Payload::Text(text),
            other => Payload::Json(other),
        }
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

/// One row-level change produced by the change-capture engine
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    destination: String,
    key: Option<Payload>,
    value: Option<Payload>,
    offset: Option<String>,
}

/// Shape of one line of newline-delimited change events
#[derive(Debug, Deserialize)]
struct WireEvent {
    destination: String,
    #[serde(default)]
    key: Option<Value>,
    #[serde(default)]
    value: Option<Value>,
    #[serde(default)]
    offset: Option<Value>,
}

impl ChangeEvent {
    pub fn new<D: Into<String>>(
        destination: D,
        key: Option<Payload>,
        value: Option<Payload>,
    ) -> Self {
        Self {
            destination: destination.into(),
            key,
            value,
            offset: None,
        }
    }

    /// Attach the upstream offset (log position, sequence number) of the change
    pub fn with_offset<O: Into<String>>(mut self, offset: O) -> Self {
        self.offset = Some(offset.into());
        self
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn key(&self) -> Option<&Payload> {
        self.key.as_ref()
    }

    pub fn value(&self) -> Option<&Payload> {
        self.value.as_ref()
    }

    pub fn offset(&self) -> Option<&str> {
        self.offset.as_deref()
    }

    /// Reject events that cannot become a valid row
    pub fn validate(&self) -> SinkResult<()> {
        if self.destination.trim().is_empty() {
            return Err(SinkError::mapping("Change event has an empty destination"));
        }
        Ok(())
    }

    /// Decode one JSON object of the form
    /// `{"destination": "...", "key": ..., "value": ..., "offset": ...}`.
    ///
    /// String key/value fields are kept as text, anything else as JSON. The
    /// optional offset may be a string or an integer.
    pub fn from_json_line(line: &str) -> SinkResult<Self> {
        let wire: WireEvent = serde_json::from_str(line)?;

        let offset = match wire.offset {
            None | Some(Value::Null) => None,
            Some(Value::String(offset)) => Some(offset),
            Some(Value::Number(offset)) => Some(offset.to_string()),
            Some(other) => {
                return Err(SinkError::mapping(format!(
                    "Change event offset must be a string or a number, got {}",
                    other
                )));
            }
        };

        Ok(Self {
            destination: wire.destination,
            key: wire.key.map(Payload::from),
            value: wire.value.map(Payload::from),
            offset,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_column_text() {
        assert_eq!(
            Payload::Text("{\"id\":1}".to_string()).to_column_text(),
            Some("{\"id\":1}".to_string())
        );
        assert_eq!(
            Payload::Json(json!({"id": 1})).to_column_text(),
            Some("{\"id\":1}".to_string())
        );
        assert_eq!(Payload::Text(String::new()).to_column_text(), None);
        assert_eq!(Payload::Json(Value::Null).to_column_text(), None);
    }

    #[test]
    fn test_from_json_line() {
        let event = ChangeEvent::from_json_line(
            r#"{"destination":"dwh.C##DBZUSER.CUSTOMERS","key":{"ID":1},"value":"raw text"}"#,
        )
        .unwrap();

        assert_eq!(event.destination(), "dwh.C##DBZUSER.CUSTOMERS");
        assert_eq!(event.key(), Some(&Payload::Json(json!({"ID": 1}))));
        assert_eq!(event.value(), Some(&Payload::Text("raw text".to_string())));
        assert!(event.offset().is_none());
    }

    #[test]
    fn test_from_json_line_offsets() {
        let numeric = ChangeEvent::from_json_line(r#"{"destination":"S.T","offset":42}"#).unwrap();
        assert_eq!(numeric.offset(), Some("42"));

        let text =
            ChangeEvent::from_json_line(r#"{"destination":"S.T","offset":"scn:1001:3"}"#).unwrap();
        assert_eq!(text.offset(), Some("scn:1001:3"));

        let err =
            ChangeEvent::from_json_line(r#"{"destination":"S.T","offset":[1]}"#).unwrap_err();
        assert_eq!(err.kind(), "mapping");
    }

    #[test]
    fn test_from_json_line_missing_payloads() {
        let event = ChangeEvent::from_json_line(r#"{"destination":"S.T","value":null}"#).unwrap();
        assert!(event.key().is_none());
        assert!(event.value().is_none());

        assert!(ChangeEvent::from_json_line(r#"{"key":1}"#).is_err());
    }

    #[test]
    fn test_validate_rejects_empty_destination() {
        let event = ChangeEvent::new("  ", None, None);
        let err = event.validate().unwrap_err();
        assert_eq!(err.kind(), "mapping");

        assert!(ChangeEvent::new("S.T", None, None).validate().is_ok());
    }
}
