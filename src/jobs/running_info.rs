//! Running-info: rolling throughput averages and ETA.
//!
//! Three time-windowed performance filters track entries/s, bytes/s and
//! storage-bytes/s; `estimated_rest_time` is derived from the bytes/s
//! filter and the total expected work.

use std::time::{Duration, Instant};

/// Exponential moving average over a trailing window (roughly 600s).
#[derive(Debug, Clone)]
pub struct PerformanceFilter {
    window: Duration,
    last_sample: Option<(Instant, f64)>,
    rate: f64,
}

impl PerformanceFilter {
    pub fn new(window: Duration) -> Self {
        PerformanceFilter {
            window,
            last_sample: None,
            rate: 0.0,
        }
    }

    /// Records that `amount` additional units (bytes, entries, ...) were
    /// processed at `now`, updating the smoothed rate.
    pub fn add(&mut self, now: Instant, amount: f64) {
        if let Some((last_time, _)) = self.last_sample {
            let elapsed = now.saturating_duration_since(last_time).as_secs_f64();
            if elapsed > 0.0 {
                let instantaneous = amount / elapsed;
                let alpha = (elapsed / self.window.as_secs_f64()).min(1.0);
                self.rate = self.rate + alpha * (instantaneous - self.rate);
            }
        }
        self.last_sample = Some((now, amount));
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }
}

#[derive(Debug, Clone)]
pub struct RunningInfo {
    pub error: Option<String>,
    entries_filter: PerformanceFilter,
    bytes_filter: PerformanceFilter,
    storage_bytes_filter: PerformanceFilter,
    pub total_expected_bytes: Option<u64>,
    pub processed_bytes: u64,
    pub last_executed: Option<i64>,
}

const FILTER_WINDOW: Duration = Duration::from_secs(600);

impl Default for RunningInfo {
    fn default() -> Self {
        RunningInfo {
            error: None,
            entries_filter: PerformanceFilter::new(FILTER_WINDOW),
            bytes_filter: PerformanceFilter::new(FILTER_WINDOW),
            storage_bytes_filter: PerformanceFilter::new(FILTER_WINDOW),
            total_expected_bytes: None,
            processed_bytes: 0,
            last_executed: None,
        }
    }
}

impl RunningInfo {
    pub fn record_entries(&mut self, now: Instant, count: f64) {
        self.entries_filter.add(now, count);
    }

    pub fn record_bytes(&mut self, now: Instant, bytes: u64) {
        self.processed_bytes += bytes;
        self.bytes_filter.add(now, bytes as f64);
    }

    pub fn record_storage_bytes(&mut self, now: Instant, bytes: u64) {
        self.storage_bytes_filter.add(now, bytes as f64);
    }

    pub fn entries_per_second(&self) -> f64 {
        self.entries_filter.rate()
    }

    pub fn bytes_per_second(&self) -> f64 {
        self.bytes_filter.rate()
    }

    pub fn storage_bytes_per_second(&self) -> f64 {
        self.storage_bytes_filter.rate()
    }

    /// Estimated seconds remaining, derived from the current bytes/s rate
    /// and the gap to `total_expected_bytes`. `None` when there is no
    /// estimate available (no expected total, or rate is zero).
    pub fn estimated_rest_time(&self) -> Option<Duration> {
        let total = self.total_expected_bytes?;
        if self.processed_bytes >= total {
            return Some(Duration::from_secs(0));
        }
        let rate = self.bytes_per_second();
        if rate <= 0.0 {
            return None;
        }
        let remaining = (total - self.processed_bytes) as f64;
        Some(Duration::from_secs_f64(remaining / rate))
    }

    pub fn reset(&mut self) {
        *self = RunningInfo {
            last_executed: self.last_executed,
            ..RunningInfo::default()
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_converges_toward_steady_throughput() {
        let mut filter = PerformanceFilter::new(Duration::from_secs(10));
        let start = Instant::now();
        filter.add(start, 0.0);
        for i in 1..20 {
            filter.add(start + Duration::from_secs(i), 100.0);
        }
        assert!(filter.rate() > 50.0 && filter.rate() <= 100.0);
    }

    #[test]
    fn eta_none_without_expected_total() {
        let info = RunningInfo::default();
        assert_eq!(info.estimated_rest_time(), None);
    }

    #[test]
    fn eta_zero_when_already_done() {
        let mut info = RunningInfo::default();
        info.total_expected_bytes = Some(100);
        info.processed_bytes = 100;
        assert_eq!(info.estimated_rest_time(), Some(Duration::from_secs(0)));
    }
}
