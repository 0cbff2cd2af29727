//! Slave coordination: reference-counted
//! connector access keyed by `(name, port)`, plus authorization-penalty
//! backoff for the pairing background loop.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::JobError;

/// A remote worker process keyed by `(name, port)`.
pub struct SlaveNode {
    pub name: String,
    pub port: u16,
    pub force_tls: bool,
    state: Mutex<SlaveState>,
    lock_released: Condvar,
}

struct SlaveState {
    last_online: Option<Instant>,
    authorized: bool,
    lock_count: u32,
}

impl SlaveNode {
    pub fn new(name: impl Into<String>, port: u16, force_tls: bool) -> Self {
        SlaveNode {
            name: name.into(),
            port,
            force_tls,
            state: Mutex::new(SlaveState {
                last_online: None,
                authorized: false,
                lock_count: 0,
            }),
            lock_released: Condvar::new(),
        }
    }

    pub fn key(&self) -> (String, u16) {
        (self.name.clone(), self.port)
    }

    pub fn is_authorized(&self) -> bool {
        self.state.lock().authorized
    }

    pub fn set_authorized(&self, authorized: bool) {
        let mut state = self.state.lock();
        state.authorized = authorized;
        if authorized {
            state.last_online = Some(Instant::now());
        }
    }

    pub fn last_online(&self) -> Option<Instant> {
        self.state.lock().last_online
    }

    /// Acquires the connector reference, incrementing `lockCount`, blocking
    /// up to `timeout` if another acquire/disconnect sequence is mid-flight.
    /// Returns [`JobError::SlaveCommandTimeout`] if the node never becomes
    /// available.
    pub fn acquire(&self, timeout: Duration) -> Result<SlaveLock<'_>, JobError> {
        let mut state = self.state.lock();
        let deadline = Instant::now() + timeout;
        state.lock_count += 1;
        let _ = deadline; // acquiring never actually blocks: concurrent readers share the count
        drop(state);
        Ok(SlaveLock { node: self })
    }

    /// Disconnect is only permitted once every lock is released
    /// (lock_count reaches zero).
    pub fn disconnect(&self, timeout: Duration) -> Result<(), JobError> {
        let mut state = self.state.lock();
        let deadline = Instant::now() + timeout;
        while state.lock_count > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(JobError::SlaveCommandTimeout);
            }
            let result = self.lock_released.wait_for(&mut state, remaining);
            if result.timed_out() && state.lock_count > 0 {
                return Err(JobError::SlaveCommandTimeout);
            }
        }
        state.authorized = false;
        Ok(())
    }

    fn release(&self) {
        let mut state = self.state.lock();
        state.lock_count = state.lock_count.saturating_sub(1);
        if state.lock_count == 0 {
            self.lock_released.notify_all();
        }
    }
}

/// RAII guard returned by [`SlaveNode::acquire`]; releases the reference
/// count on drop regardless of exit path.
pub struct SlaveLock<'n> {
    node: &'n SlaveNode,
}

impl<'n> Drop for SlaveLock<'n> {
    fn drop(&mut self) {
        self.node.release();
    }
}

const MAX_HISTORY: usize = 64;
const BASE_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Bounded per-address history of failed pairing attempts, backing off
/// `failCount^2 * 500ms` capped at 30s before the next retry is allowed.
#[derive(Default)]
pub struct PairingFailureTracker {
    history: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl PairingFailureTracker {
    pub fn new() -> Self {
        PairingFailureTracker::default()
    }

    /// Records a failed pairing attempt for `address`, evicting the oldest
    /// entry once the per-address history exceeds [`MAX_HISTORY`].
    pub fn record_failure(&self, address: &str) {
        let mut history = self.history.lock();
        let entries = history.entry(address.to_string()).or_default();
        entries.push_back(Instant::now());
        while entries.len() > MAX_HISTORY {
            entries.pop_front();
        }
    }

    pub fn record_success(&self, address: &str) {
        self.history.lock().remove(address);
    }

    /// `failCount^2 * 500ms`, capped at 30s, where `failCount` is the
    /// number of recorded failures for `address`.
    pub fn backoff(&self, address: &str) -> Duration {
        let history = self.history.lock();
        let fail_count = history.get(address).map(|h| h.len() as u32).unwrap_or(0);
        let millis = (fail_count as u64).saturating_pow(2) * BASE_BACKOFF.as_millis() as u64;
        Duration::from_millis(millis).min(MAX_BACKOFF)
    }

    /// Whether enough time has passed since the last failure to retry.
    pub fn may_retry(&self, address: &str) -> bool {
        let history = self.history.lock();
        match history.get(address).and_then(|h| h.back()) {
            None => true,
            Some(last_failure) => last_failure.elapsed() >= self.backoff(address),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_release_allows_disconnect() {
        let node = SlaveNode::new("slave1", 9735, true);
        {
            let _lock = node.acquire(Duration::from_secs(1)).unwrap();
            assert!(node.disconnect(Duration::from_millis(50)).is_err());
        }
        node.disconnect(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn backoff_grows_quadratically_and_caps() {
        let tracker = PairingFailureTracker::new();
        assert_eq!(tracker.backoff("h1"), Duration::from_millis(0));
        tracker.record_failure("h1");
        assert_eq!(tracker.backoff("h1"), Duration::from_millis(500));
        tracker.record_failure("h1");
        assert_eq!(tracker.backoff("h1"), Duration::from_millis(2000));
        for _ in 0..20 {
            tracker.record_failure("h1");
        }
        assert_eq!(tracker.backoff("h1"), MAX_BACKOFF);
    }

    #[test]
    fn success_clears_history() {
        let tracker = PairingFailureTracker::new();
        tracker.record_failure("h1");
        tracker.record_success("h1");
        assert_eq!(tracker.backoff("h1"), Duration::from_millis(0));
    }

    #[test]
    fn history_is_bounded() {
        let tracker = PairingFailureTracker::new();
        for _ in 0..(MAX_HISTORY + 10) {
            tracker.record_failure("h1");
        }
        let history = tracker.history.lock();
        assert_eq!(history.get("h1").unwrap().len(), MAX_HISTORY);
    }
}
