use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

/// Sliding-window failure counter driving the extra wait before each
/// download.
///
/// The number of live records *is* the multiplier: the download loop
/// sleeps `base_wait + base_wait * current_multiplier()` before invoking
/// the extractor. Records decay three ways: capacity (oldest dropped past
/// `max_size`), age (older than `max_age`), and success (one removed per
/// `record_success`). Only retryable failures are fed in; terminal
/// failures say nothing about the network.
pub struct FailureBackoffTracker {
    records: VecDeque<Instant>,
    max_size: usize,
    max_age: Duration,
}

impl FailureBackoffTracker {
    pub fn new(max_size: usize, max_age: Duration) -> Self {
        Self {
            records: VecDeque::with_capacity(max_size),
            max_size,
            max_age,
        }
    }

    pub fn record_failure(&mut self) {
        self.record_failure_at(Instant::now());
    }

    pub fn record_success(&mut self) {
        self.record_success_at(Instant::now());
    }

    pub fn current_multiplier(&mut self) -> usize {
        self.current_multiplier_at(Instant::now())
    }

    /// The wait the download loop applies before the next extractor call.
    pub fn wait_for(&mut self, base_wait: Duration) -> Duration {
        base_wait + base_wait * self.current_multiplier() as u32
    }

    fn record_failure_at(&mut self, now: Instant) {
        self.evict_expired(now);
        if self.records.len() == self.max_size {
            self.records.pop_front();
        }
        self.records.push_back(now);
    }

    fn record_success_at(&mut self, now: Instant) {
        self.evict_expired(now);
        self.records.pop_front();
    }

    fn current_multiplier_at(&mut self, now: Instant) -> usize {
        self.evict_expired(now);
        self.records.len()
    }

    fn evict_expired(&mut self, now: Instant) {
        while let Some(oldest) = self.records.front() {
            if now.duration_since(*oldest) > self.max_age {
                self.records.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn at(base: Instant, secs: u64) -> Instant {
        base + Duration::from_secs(secs)
    }

    #[test]
    fn test_multiplier_counts_failures() {
        let start = Instant::now();
        let mut tracker = FailureBackoffTracker::new(100, Duration::from_secs(300));

        for i in 0..5 {
            tracker.record_failure_at(at(start, i));
        }
        assert_eq!(tracker.current_multiplier_at(at(start, 10)), 5);
    }

    #[test]
    fn test_multiplier_is_bounded_by_max_size() {
        let start = Instant::now();
        let mut tracker = FailureBackoffTracker::new(3, Duration::from_secs(300));

        for i in 0..10 {
            tracker.record_failure_at(at(start, i));
        }
        assert_eq!(tracker.current_multiplier_at(at(start, 10)), 3);
    }

    #[test]
    fn test_success_removes_one_record() {
        let start = Instant::now();
        let mut tracker = FailureBackoffTracker::new(100, Duration::from_secs(300));

        tracker.record_failure_at(at(start, 0));
        tracker.record_failure_at(at(start, 1));
        tracker.record_success_at(at(start, 2));
        assert_eq!(tracker.current_multiplier_at(at(start, 3)), 1);

        // success on an empty tracker is a no-op
        tracker.record_success_at(at(start, 4));
        tracker.record_success_at(at(start, 5));
        assert_eq!(tracker.current_multiplier_at(at(start, 6)), 0);
    }

    #[test]
    fn test_failure_then_success_never_raises_multiplier() {
        let start = Instant::now();
        let mut tracker = FailureBackoffTracker::new(100, Duration::from_secs(300));

        tracker.record_failure_at(at(start, 0));
        tracker.record_failure_at(at(start, 1));
        let before = tracker.current_multiplier_at(at(start, 2));

        tracker.record_failure_at(at(start, 3));
        tracker.record_success_at(at(start, 4));
        let after = tracker.current_multiplier_at(at(start, 5));

        assert!(after <= before + 1);
        assert_eq!(after, 2);
    }

    #[test]
    fn test_records_age_out() {
        let start = Instant::now();
        let mut tracker = FailureBackoffTracker::new(100, Duration::from_secs(300));

        tracker.record_failure_at(at(start, 0));
        tracker.record_failure_at(at(start, 100));
        assert_eq!(tracker.current_multiplier_at(at(start, 200)), 2);
        // first record is now older than max_age
        assert_eq!(tracker.current_multiplier_at(at(start, 301)), 1);
        // both gone
        assert_eq!(tracker.current_multiplier_at(at(start, 500)), 0);
    }

    #[test]
    fn test_wait_scales_with_multiplier() {
        let start = Instant::now();
        let mut tracker = FailureBackoffTracker::new(100, Duration::from_secs(300));
        let base = Duration::from_secs(30);

        for i in 0..5 {
            tracker.record_failure_at(at(start, i));
        }
        // base_wait * (1 + 5)
        assert_eq!(tracker.wait_for(base), Duration::from_secs(180));
    }
}
