//! Sink handler: the entry point the change-capture engine calls per delivery

use super::accumulator::BatchAccumulator;
use super::destination::{ConflictPolicy, Destination};
use super::mapper::EventRecordMapper;
use super::metrics::HandlerMetrics;
use super::provisioner::TableProvisioner;
use super::writer::TransactionalBatchWriter;
use crate::core::config::{IdentityMode, SinkConfig};
use crate::core::errors::{SinkError, SinkResult};
use crate::events::ChangeEvent;
use crate::tracing_context::DeliveryContext;
use std::fmt;
use std::num::NonZeroUsize;
use tracing::{debug, error, info, warn};

/// Lifecycle of a [`SinkHandler`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Uninitialized,
    Ready,
    Processing,
    Closed,
}

impl fmt::Display for HandlerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerState::Uninitialized => write!(f, "uninitialized"),
            HandlerState::Ready => write!(f, "ready"),
            HandlerState::Processing => write!(f, "processing"),
            HandlerState::Closed => write!(f, "closed"),
        }
    }
}

/// Drives mapping, batching and transactional writes for one destination
/// session.
///
/// Construction opens nothing by itself: it takes an already open session,
/// provisions the table on it and becomes [`HandlerState::Ready`]. Every
/// call to [`handle_batch`](Self::handle_batch) commits the delivery in
/// batches of at most `batch_size` rows. Failures are returned to the
/// caller unchanged after the batch in flight is rolled back; rows of
/// batches committed earlier in the same delivery stay committed.
pub struct SinkHandler<D: Destination> {
    destination: D,
    provisioner: TableProvisioner,
    mapper: EventRecordMapper,
    accumulator: BatchAccumulator,
    writer: TransactionalBatchWriter,
    state: HandlerState,
    metrics: HandlerMetrics,
}

impl SinkHandler<Box<dyn Destination>> {
    /// Open the configured destination and build a handler on it
    pub fn open(config: &SinkConfig) -> SinkResult<Self> {
        config.validate()?;
        let destination = super::open_destination(config)?;
        Self::new(destination, config)
    }
}

impl<D: Destination> SinkHandler<D> {
    /// Build a handler over an open session and provision the table.
    ///
    /// The session is closed again if anything here fails.
    pub fn new(mut destination: D, config: &SinkConfig) -> SinkResult<Self> {
        let batch_size = match config
            .validate()
            .and_then(|_| {
                NonZeroUsize::new(config.batch_size)
                    .ok_or_else(|| SinkError::config("Batch size must be greater than zero"))
            }) {
            Ok(batch_size) => batch_size,
            Err(e) => {
                if let Err(close_err) = destination.close() {
                    warn!("Failed to close destination after invalid configuration: {}", close_err);
                }
                return Err(e);
            }
        };

        let on_conflict = match config.identity_mode {
            IdentityMode::Random => ConflictPolicy::Fail,
            IdentityMode::Deterministic => ConflictPolicy::Skip,
        };

        let mut handler = Self {
            destination,
            provisioner: TableProvisioner::new(config.table_name.clone()),
            mapper: EventRecordMapper::new(config.identity_mode),
            accumulator: BatchAccumulator::new(batch_size),
            writer: TransactionalBatchWriter::new(config.table_name.clone(), on_conflict),
            state: HandlerState::Uninitialized,
            metrics: HandlerMetrics::default(),
        };

        // On failure the handler is dropped, which closes the session
        handler.provisioner.ensure_table(&mut handler.destination)?;
        handler.state = HandlerState::Ready;

        info!(
            "Sink handler ready: destination={}, table={}, batch_size={}, identity={:?}",
            handler.destination.kind(),
            handler.writer.table(),
            batch_size,
            handler.mapper.identity_mode()
        );

        Ok(handler)
    }

    /// Persist one delivery of change events
    pub fn handle_batch(&mut self, events: &[ChangeEvent]) -> SinkResult<()> {
        match self.state {
            HandlerState::Ready => {}
            HandlerState::Closed => return Err(SinkError::connection("Sink handler is closed")),
            other => {
                return Err(SinkError::connection(format!(
                    "Sink handler cannot accept a delivery while {}",
                    other
                )));
            }
        }

        self.metrics.record_delivery(events.len());
        let context = DeliveryContext::new(events.len());

        self.state = HandlerState::Processing;
        let outcome = context.with_span(|| self.process(events, &context));
        self.state = HandlerState::Ready;

        if let Err(e) = &outcome {
            self.accumulator.clear();
            self.metrics.record_failed_delivery();
            if e.is_fatal() {
                error!(
                    correlation_id = %context.correlation_id,
                    "Delivery failed, destination session is unusable ({} error): {}",
                    e.kind(),
                    e
                );
            } else {
                error!(
                    correlation_id = %context.correlation_id,
                    "Delivery failed ({} error): {}",
                    e.kind(),
                    e
                );
            }
        }

        outcome
    }

    fn process(&mut self, events: &[ChangeEvent], context: &DeliveryContext) -> SinkResult<()> {
        debug!("Handling delivery of {} events", events.len());
        let mut batches = 0;

        for event in events {
            event.validate()?;
            self.accumulator.add(self.mapper.map(event)?);

            if self.accumulator.is_full() {
                batches += 1;
                self.flush(context, batches)?;
            }
        }

        if !self.accumulator.is_empty() {
            batches += 1;
            self.flush(context, batches)?;
        }

        debug!("Delivery committed in {} batches", batches);
        Ok(())
    }

    fn flush(&mut self, context: &DeliveryContext, batch_number: usize) -> SinkResult<()> {
        let Some(batch) = self.accumulator.drain() else {
            return Ok(());
        };

        let span = context.batch_span(batch_number, batch.len());
        let _guard = span.enter();

        match self.writer.write(&mut self.destination, &batch) {
            Ok(rows) => {
                self.metrics.record_commit(rows);
                Ok(())
            }
            Err(e) => {
                self.metrics.record_rollback();
                Err(e)
            }
        }
    }

    /// Close the destination session. Calling it again is a no-op.
    pub fn close(&mut self) -> SinkResult<()> {
        if self.state == HandlerState::Closed {
            return Ok(());
        }

        self.accumulator.clear();
        self.state = HandlerState::Closed;
        self.destination.close()?;

        info!(
            "Sink handler closed: {} deliveries, {} rows committed",
            self.metrics.deliveries, self.metrics.rows_committed
        );
        Ok(())
    }

    pub fn state(&self) -> HandlerState {
        self.state
    }

    pub fn metrics(&self) -> &HandlerMetrics {
        &self.metrics
    }

    pub fn destination(&self) -> &D {
        &self.destination
    }

    pub fn batch_size(&self) -> usize {
        self.accumulator.batch_size()
    }
}

impl<D: Destination> Drop for SinkHandler<D> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to close sink handler: {}", e);
        }
    }
}
