//! Correlation ID and tracing context management
//!
//! Every delivery handed to a sink handler gets a correlation ID so the log
//! lines of its batches can be tied back together.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use tracing::Span;

/// Global counter for generating sequential correlation IDs
static CORRELATION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A correlation ID that identifies one delivery
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a new correlation ID using timestamp and counter
    pub fn new() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        let counter = CORRELATION_COUNTER.fetch_add(1, Ordering::SeqCst);

        CorrelationId(format!("{}-{}", timestamp, counter))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Span and correlation ID for one delivery
#[derive(Debug, Clone)]
pub struct DeliveryContext {
    pub correlation_id: CorrelationId,
    pub span: Span,
}

impl DeliveryContext {
    /// Create a context for a delivery of `event_count` events
    pub fn new(event_count: usize) -> Self {
        let correlation_id = CorrelationId::new();
        let span = tracing::info_span!(
            "delivery",
            correlation_id = %correlation_id,
            events = event_count,
            component = "cdc2sql"
        );

        Self {
            correlation_id,
            span,
        }
    }

    /// Child span for one batch of this delivery
    pub fn batch_span(&self, batch_number: usize, rows: usize) -> Span {
        tracing::info_span!(
            parent: &self.span,
            "batch",
            correlation_id = %self.correlation_id,
            batch = batch_number,
            rows = rows
        )
    }

    /// Enter the span and execute a function
    pub fn with_span<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let _guard = self.span.enter();
        f()
    }
}
