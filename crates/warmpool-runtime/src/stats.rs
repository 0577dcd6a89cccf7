//! Moving-average startup time and request-rate estimates for one pool.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};

/// Milliseconds since the Unix epoch.
pub fn epoch_millis() -> u64 {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0)
}

/// Format an epoch timestamp as `HH:MM:SS` (UTC).
pub fn clock_time(epoch_ms: u64) -> String {
    i64::try_from(epoch_ms)
        .ok()
        .and_then(DateTime::from_timestamp_millis)
        .map(|dt| dt.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Startup-latency and request-time histories with the estimates derived
/// from them.
///
/// Both histories start with one seed value so the estimates are defined
/// before any real data arrives.
#[derive(Debug, Clone)]
pub struct DemandTracker {
    startup_ms: VecDeque<u64>,
    request_times_ms: VecDeque<u64>,
    startup_estimate_ms: u64,
    demand_estimate_hz: f64,
}

impl DemandTracker {
    pub fn new(initial_startup_ms: u64, initial_demand_hz: f64, now_ms: u64) -> Self {
        Self {
            startup_ms: VecDeque::from([initial_startup_ms]),
            request_times_ms: VecDeque::from([now_ms]),
            startup_estimate_ms: initial_startup_ms,
            demand_estimate_hz: initial_demand_hz,
        }
    }

    pub fn record_startup(&mut self, elapsed_ms: u64) {
        self.startup_ms.push_back(elapsed_ms);
    }

    pub fn record_request(&mut self, at_ms: u64) {
        self.request_times_ms.push_back(at_ms);
    }

    /// Trim both histories to the newest `window` entries and recompute the
    /// estimates.
    pub fn update(&mut self, window: usize, now_ms: u64) {
        let window = window.max(1);
        while self.startup_ms.len() > window {
            self.startup_ms.pop_front();
        }
        while self.request_times_ms.len() > window {
            self.request_times_ms.pop_front();
        }

        if !self.startup_ms.is_empty() {
            self.startup_estimate_ms =
                self.startup_ms.iter().sum::<u64>() / self.startup_ms.len() as u64;
        }

        if let Some(&oldest) = self.request_times_ms.front() {
            let span_ms = now_ms.saturating_sub(oldest).max(1);
            self.demand_estimate_hz = 1000.0 * self.request_times_ms.len() as f64 / span_ms as f64;
        }
    }

    pub fn startup_estimate_ms(&self) -> u64 {
        self.startup_estimate_ms
    }

    /// Requests per second.
    pub fn demand_estimate_hz(&self) -> f64 {
        self.demand_estimate_hz
    }

    pub fn recent_startups_ms(&self) -> Vec<u64> {
        self.startup_ms.iter().copied().collect()
    }

    pub fn recent_requests_ms(&self) -> Vec<u64> {
        self.request_times_ms.iter().copied().collect()
    }

    /// Idle processes worth keeping: the requests expected during one
    /// maintenance interval, times `safety`, bounded to `[min, max]`.
    pub fn target_size(&self, safety: f64, interval_ms: u64, min: usize, max: usize) -> usize {
        let wanted = self.demand_estimate_hz * safety * interval_ms as f64 / 1000.0;
        let wanted = if wanted.is_finite() && wanted > 0.0 {
            wanted.ceil() as usize
        } else {
            0
        };
        wanted.max(min).min(max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_estimates_before_update() {
        let tracker = DemandTracker::new(2000, 0.001, 1_000);
        assert_eq!(tracker.startup_estimate_ms(), 2000);
        assert_eq!(tracker.demand_estimate_hz(), 0.001);
        assert_eq!(tracker.recent_requests_ms(), vec![1_000]);
    }

    #[test]
    fn startup_estimate_is_mean() {
        let mut tracker = DemandTracker::new(2000, 0.001, 0);
        tracker.record_startup(1000);
        tracker.record_startup(3000);
        tracker.update(5, 10);
        assert_eq!(tracker.startup_estimate_ms(), 2000);

        tracker.update(1, 10);
        assert_eq!(tracker.startup_estimate_ms(), 3000);
    }

    #[test]
    fn demand_is_requests_over_span() {
        let mut tracker = DemandTracker::new(2000, 0.001, 0);
        for t in [250, 500, 750, 1000] {
            tracker.record_request(t);
        }
        // Five timestamps (seed included) spanning 2000 ms.
        tracker.update(10, 2000);
        assert!((tracker.demand_estimate_hz() - 2.5).abs() < 1e-9);
    }

    #[test]
    fn trimming_drops_old_requests() {
        let mut tracker = DemandTracker::new(2000, 0.001, 0);
        for t in [9_000, 9_500] {
            tracker.record_request(t);
        }
        tracker.update(2, 10_000);
        assert_eq!(tracker.recent_requests_ms(), vec![9_000, 9_500]);
        assert!((tracker.demand_estimate_hz() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn zero_span_does_not_divide_by_zero() {
        let mut tracker = DemandTracker::new(2000, 0.001, 500);
        tracker.update(5, 500);
        assert!((tracker.demand_estimate_hz() - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn target_size_is_bounded() {
        let mut tracker = DemandTracker::new(2000, 0.001, 0);
        assert_eq!(tracker.target_size(3.0, 500, 2, 10), 2);

        for t in 1..=9 {
            tracker.record_request(t * 100);
        }
        tracker.update(10, 1000);
        // 10 Hz * 3.0 * 0.5 s = 15, capped at 10.
        assert_eq!(tracker.target_size(3.0, 500, 2, 10), 10);
        assert_eq!(tracker.target_size(3.0, 100, 2, 10), 3);
    }

    #[test]
    fn clock_time_formats_utc() {
        assert_eq!(clock_time(0), "00:00:00");
        assert_eq!(clock_time((13 * 3600 + 5 * 60 + 9) * 1000 + 999), "13:05:09");
        // 2024-03-01T23:59:59.500Z
        assert_eq!(clock_time(1_709_337_599_500), "23:59:59");
        assert_eq!(clock_time(u64::MAX), "unknown");
    }

    #[test]
    fn epoch_millis_is_recent() {
        // Later than 2024-01-01.
        assert!(epoch_millis() > 1_704_067_200_000);
    }
}
