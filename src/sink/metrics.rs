use std::time::SystemTime;

/// Counters kept by a sink handler over its lifetime
#[derive(Debug, Default, Clone)]
pub struct HandlerMetrics {
    /// Deliveries handed to the handler
    pub deliveries: u64,
    /// Deliveries that ended in an error
    pub failed_deliveries: u64,
    /// Change events received across all deliveries
    pub events_received: u64,
    /// Batches committed
    pub batches_committed: u64,
    /// Rows the store accepted in committed batches
    pub rows_committed: u64,
    /// Batches rolled back after a failed insert or commit
    pub batches_rolled_back: u64,
    /// Last successful commit time
    pub last_success_time: Option<SystemTime>,
    /// Last error time
    pub last_error_time: Option<SystemTime>,
}

impl HandlerMetrics {
    pub fn record_delivery(&mut self, events: usize) {
        self.deliveries += 1;
        self.events_received += events as u64;
    }

    /// Update metrics after a committed batch
    pub fn record_commit(&mut self, rows: usize) {
        self.batches_committed += 1;
        self.rows_committed += rows as u64;
        self.last_success_time = Some(SystemTime::now());
    }

    /// Update metrics after a batch was rolled back
    pub fn record_rollback(&mut self) {
        self.batches_rolled_back += 1;
    }

    /// Update metrics after a failed delivery
    pub fn record_failed_delivery(&mut self) {
        self.failed_deliveries += 1;
        self.last_error_time = Some(SystemTime::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_commit_and_failure() {
        let mut metrics = HandlerMetrics::default();
        metrics.record_delivery(1500);
        metrics.record_commit(1000);
        metrics.record_rollback();
        metrics.record_failed_delivery();

        assert_eq!(metrics.deliveries, 1);
        assert_eq!(metrics.failed_deliveries, 1);
        assert_eq!(metrics.events_received, 1500);
        assert_eq!(metrics.batches_committed, 1);
        assert_eq!(metrics.rows_committed, 1000);
        assert_eq!(metrics.batches_rolled_back, 1);
        assert!(metrics.last_success_time.is_some());
        assert!(metrics.last_error_time.is_some());
    }
}
