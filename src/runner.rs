//! Feeds newline-delimited change events to a sink handler
//!
//! Stands in for the change-capture engine: events are read from any
//! buffered reader, grouped into deliveries and handed to the handler one
//! delivery at a time. The first failing delivery stops the run.

use crate::core::errors::{SinkError, SinkResult};
use crate::events::ChangeEvent;
use crate::sink::{Destination, SinkHandler};
use std::io::BufRead;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

/// Groups input lines into deliveries of at most `delivery_size` events.
///
/// Blank lines are skipped. A line that is not a valid change event ends
/// the iteration with an error naming the line.
pub struct DeliveryReader<R> {
    lines: std::io::Lines<R>,
    delivery_size: NonZeroUsize,
    line_number: usize,
    done: bool,
}

impl<R: BufRead> DeliveryReader<R> {
    pub fn new(reader: R, delivery_size: NonZeroUsize) -> Self {
        Self {
            lines: reader.lines(),
            delivery_size,
            line_number: 0,
            done: false,
        }
    }

    fn next_delivery(&mut self) -> SinkResult<Vec<ChangeEvent>> {
        let mut delivery = Vec::with_capacity(self.delivery_size.get());

        while delivery.len() < self.delivery_size.get() {
            let Some(line) = self.lines.next() else {
                self.done = true;
                break;
            };
            let line = line?;
            self.line_number += 1;

            if line.trim().is_empty() {
                continue;
            }

            let event = ChangeEvent::from_json_line(&line).map_err(|e| {
                SinkError::mapping(format!("Invalid change event on line {}: {}", self.line_number, e))
            })?;
            delivery.push(event);
        }

        Ok(delivery)
    }
}

impl<R: BufRead> Iterator for DeliveryReader<R> {
    type Item = SinkResult<Vec<ChangeEvent>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        match self.next_delivery() {
            Ok(delivery) if delivery.is_empty() => None,
            Ok(delivery) => Some(Ok(delivery)),
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// What a run did before it stopped
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub deliveries: usize,
    pub events: usize,
    pub interrupted: bool,
}

/// Hand every delivery from `reader` to `handler` until the input ends,
/// a delivery fails, or `shutdown` is raised. Closes the handler in all
/// cases.
pub fn run<D, R>(
    handler: &mut SinkHandler<D>,
    reader: R,
    delivery_size: NonZeroUsize,
    shutdown: &AtomicBool,
) -> SinkResult<RunSummary>
where
    D: Destination,
    R: BufRead,
{
    let outcome = feed(handler, DeliveryReader::new(reader, delivery_size), shutdown);

    if let Err(e) = handler.close() {
        warn!("Failed to close sink handler: {}", e);
    }

    let summary = outcome?;
    info!(
        "Run finished: {} deliveries, {} events{}",
        summary.deliveries,
        summary.events,
        if summary.interrupted { " (interrupted)" } else { "" }
    );
    Ok(summary)
}

fn feed<D, R>(
    handler: &mut SinkHandler<D>,
    mut deliveries: DeliveryReader<R>,
    shutdown: &AtomicBool,
) -> SinkResult<RunSummary>
where
    D: Destination,
    R: BufRead,
{
    let mut summary = RunSummary::default();

    loop {
        // Checked before reading so no delivery is pulled and then dropped
        if shutdown.load(Ordering::SeqCst) {
            info!("Shutdown requested, stopping before the next delivery");
            summary.interrupted = true;
            break;
        }

        let Some(delivery) = deliveries.next() else {
            break;
        };
        let delivery = delivery?;
        handler.handle_batch(&delivery)?;
        summary.deliveries += 1;
        summary.events += delivery.len();
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{DestinationKind, SinkConfig};
    use crate::sink::memory::MemoryStore;
    use crate::sink::HandlerState;
    use std::io::{Cursor, Read};

    fn input(n: usize) -> String {
        (0..n)
            .map(|i| format!("{{\"destination\":\"S.T\",\"key\":{{\"id\":{}}},\"value\":\"v{}\"}}\n", i, i))
            .collect()
    }

    fn size(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    /// Raises the shutdown flag once `threshold` bytes have been consumed
    struct RaiseAfter<'a> {
        inner: Cursor<String>,
        consumed: usize,
        threshold: usize,
        flag: &'a AtomicBool,
    }

    impl Read for RaiseAfter<'_> {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.inner.read(buf)
        }
    }

    impl BufRead for RaiseAfter<'_> {
        fn fill_buf(&mut self) -> std::io::Result<&[u8]> {
            self.inner.fill_buf()
        }

        fn consume(&mut self, amt: usize) {
            self.inner.consume(amt);
            self.consumed += amt;
            if self.consumed >= self.threshold {
                self.flag.store(true, Ordering::SeqCst);
            }
        }
    }

    fn config() -> SinkConfig {
        SinkConfig::default()
            .with_destination(DestinationKind::Memory)
            .with_batch_size(4)
    }

    #[test]
    fn test_reader_groups_deliveries() {
        let text = format!("{}\n\n{}", input(3), input(2));
        let deliveries: Vec<_> = DeliveryReader::new(Cursor::new(text), size(2))
            .collect::<SinkResult<_>>()
            .unwrap();

        let sizes: Vec<usize> = deliveries.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[test]
    fn test_reader_reports_bad_line() {
        let text = format!("{}not json\n{}", input(1), input(1));
        let mut reader = DeliveryReader::new(Cursor::new(text), size(10));

        let err = reader.next().unwrap().unwrap_err();
        assert!(err.to_string().contains("line 2"));
        assert!(reader.next().is_none());
    }

    #[test]
    fn test_run_writes_all_events_and_closes() {
        let store = MemoryStore::new();
        let mut handler = SinkHandler::new(store.connect(), &config()).unwrap();
        let shutdown = AtomicBool::new(false);

        let summary = run(&mut handler, Cursor::new(input(10)), size(3), &shutdown).unwrap();

        assert_eq!(summary.deliveries, 4);
        assert_eq!(summary.events, 10);
        assert!(!summary.interrupted);
        assert_eq!(store.row_count("raw_events"), 10);
        assert_eq!(handler.state(), HandlerState::Closed);
    }

    #[test]
    fn test_run_stops_on_shutdown() {
        let store = MemoryStore::new();
        let mut handler = SinkHandler::new(store.connect(), &config()).unwrap();
        let shutdown = AtomicBool::new(true);

        let summary = run(&mut handler, Cursor::new(input(10)), size(3), &shutdown).unwrap();

        assert!(summary.interrupted);
        assert_eq!(summary.deliveries, 0);
        assert_eq!(store.row_count("raw_events"), 0);
    }

    #[test]
    fn test_shutdown_during_read_keeps_the_delivery_in_hand() {
        let store = MemoryStore::new();
        let mut handler = SinkHandler::new(store.connect(), &config()).unwrap();
        let shutdown = AtomicBool::new(false);
        let reader = RaiseAfter {
            inner: Cursor::new(input(9)),
            consumed: 0,
            threshold: input(3).len(),
            flag: &shutdown,
        };

        let summary = run(&mut handler, reader, size(3), &shutdown).unwrap();

        assert!(summary.interrupted);
        assert_eq!(summary.deliveries, 1);
        assert_eq!(summary.events, 3);
        assert_eq!(store.row_count("raw_events"), 3);
        assert_eq!(handler.state(), HandlerState::Closed);
    }

    #[test]
    fn test_run_stops_on_failed_delivery() {
        let store = MemoryStore::new();
        let mut handler = SinkHandler::new(store.connect(), &config()).unwrap();
        let shutdown = AtomicBool::new(false);
        store.fail_next_commit();

        let err = run(&mut handler, Cursor::new(input(10)), size(3), &shutdown).unwrap_err();

        assert!(err.is_batch_abort());
        assert_eq!(store.row_count("raw_events"), 0);
        assert_eq!(store.insert_sizes(), vec![3]);
        assert_eq!(handler.state(), HandlerState::Closed);
    }
}
