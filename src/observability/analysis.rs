//! Rolling per-key request statistics.
//!
//! # Responsibilities
//! - Count requests, successes, failures, rejects and latency per key
//! - Keep precomputed windows (`interval` seconds) rotated by the timing wheel
//! - Answer window reads with a single atomic load
//!
//! Keys are server ids in practice; the circuit breaker and the analysis
//! filter are the main consumers.

use arc_swap::ArcSwap;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::timer::{PeriodicHandle, TimingWheel};

/// Live counters for one key.
#[derive(Debug, Default)]
struct Point {
    requests: AtomicU64,
    rejects: AtomicU64,
    failures: AtomicU64,
    successes: AtomicU64,
    continuous_failures: AtomicU64,
    costs_ns: AtomicU64,
    max_ns: AtomicU64,
    min_ns: AtomicU64,
}

/// A copy of a point taken at one rotation.
#[derive(Debug, Clone, Copy, Default)]
struct Dump {
    requests: u64,
    rejects: u64,
    failures: u64,
    successes: u64,
    costs_ns: u64,
    max_ns: u64,
    min_ns: u64,
}

impl Point {
    fn dump(&self) -> Dump {
        Dump {
            requests: self.requests.load(Ordering::Relaxed),
            rejects: self.rejects.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            costs_ns: self.costs_ns.load(Ordering::Relaxed),
            // min and max cover one rotation only
            max_ns: self.max_ns.swap(0, Ordering::Relaxed),
            min_ns: self.min_ns.swap(0, Ordering::Relaxed),
        }
    }

    fn record_cost(&self, cost_ns: u64) {
        self.costs_ns.fetch_add(cost_ns, Ordering::Relaxed);
        self.max_ns.fetch_max(cost_ns, Ordering::Relaxed);

        let mut current = self.min_ns.load(Ordering::Relaxed);
        while current == 0 || cost_ns < current {
            match self.min_ns.compare_exchange_weak(
                current,
                cost_ns,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }
}

/// Statistics of one window, computed at its last rotation.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Recent {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub rejects: u64,
    pub max_ms: u64,
    pub min_ms: u64,
    pub avg_ms: u64,
    pub qps: u64,
}

impl Recent {
    /// Failure percentage, `None` without traffic.
    pub fn failure_rate(&self) -> Option<u64> {
        if self.requests == 0 {
            return None;
        }
        Some(self.failures * 100 / self.requests)
    }

    /// Success percentage, 100 without traffic.
    pub fn success_rate(&self) -> u64 {
        if self.requests == 0 {
            return 100;
        }
        self.successes * 100 / self.requests
    }
}

struct Window {
    interval: Duration,
    prev: Mutex<Option<Dump>>,
    recent: ArcSwap<Recent>,
    timer: Mutex<Option<PeriodicHandle>>,
}

impl Window {
    fn rotate(&self, point: &Point) {
        let current = point.dump();
        let prev = self.prev.lock().replace(current);
        let Some(prev) = prev else {
            return;
        };

        let requests = current.requests.saturating_sub(prev.requests);
        let successes = current.successes.saturating_sub(prev.successes);
        let failures = current.failures.saturating_sub(prev.failures);
        let rejects = current.rejects.saturating_sub(prev.rejects);
        let costs = current.costs_ns.saturating_sub(prev.costs_ns);

        let avg_ms = if requests > 0 { costs / 1_000_000 / requests } else { 0 };
        let secs = self.interval.as_secs().max(1);

        self.recent.store(Arc::new(Recent {
            requests,
            successes,
            failures,
            rejects,
            max_ms: current.max_ns / 1_000_000,
            min_ms: current.min_ns / 1_000_000,
            avg_ms,
            qps: successes.min(requests) / secs,
        }));
    }
}

struct Target {
    point: Arc<Point>,
    windows: DashMap<u64, Arc<Window>>,
}

/// Per-key counters and their sliding windows.
pub struct Analysis {
    wheel: Arc<TimingWheel>,
    targets: DashMap<u64, Arc<Target>>,
}

impl std::fmt::Debug for Analysis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Analysis")
            .field("targets", &self.targets.len())
            .finish()
    }
}

impl Analysis {
    pub fn new(wheel: Arc<TimingWheel>) -> Self {
        Self {
            wheel,
            targets: DashMap::new(),
        }
    }

    fn target(&self, key: u64) -> Arc<Target> {
        self.targets
            .entry(key)
            .or_insert_with(|| {
                Arc::new(Target {
                    point: Arc::new(Point::default()),
                    windows: DashMap::new(),
                })
            })
            .clone()
    }

    /// Register a window of `interval` for `key`. Zero intervals and
    /// repeated registrations are ignored.
    pub fn add_recent_count(&self, key: u64, interval: Duration) {
        let secs = interval.as_secs();
        if secs == 0 {
            return;
        }

        let target = self.target(key);
        let window = match target.windows.entry(secs) {
            dashmap::mapref::entry::Entry::Occupied(_) => return,
            dashmap::mapref::entry::Entry::Vacant(v) => {
                let window = Arc::new(Window {
                    interval: Duration::from_secs(secs),
                    prev: Mutex::new(None),
                    recent: ArcSwap::from_pointee(Recent::default()),
                    timer: Mutex::new(None),
                });
                v.insert(window.clone());
                window
            }
        };

        // Seed `prev` so the first rotation already yields a window.
        window.rotate(&target.point);

        let point = target.point.clone();
        let w = window.clone();
        let handle = self
            .wheel
            .schedule_periodic(Duration::from_secs(secs), move || w.rotate(&point));
        *window.timer.lock() = Some(handle);

        tracing::debug!(key, interval_secs = secs, "Analysis window added");
    }

    /// Drop every window and counter of `key`.
    pub fn remove_target(&self, key: u64) {
        if let Some((_, target)) = self.targets.remove(&key) {
            for window in target.windows.iter() {
                if let Some(timer) = window.timer.lock().take() {
                    timer.cancel();
                }
            }
            tracing::debug!(key, "Analysis target removed");
        }
    }

    pub fn request(&self, key: u64) {
        self.target(key).point.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reject(&self, key: u64) {
        self.target(key).point.rejects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn failure(&self, key: u64) {
        let target = self.target(key);
        target.point.failures.fetch_add(1, Ordering::Relaxed);
        target.point.continuous_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful response that took `cost`.
    pub fn response(&self, key: u64, cost: Duration) {
        let target = self.target(key);
        target.point.successes.fetch_add(1, Ordering::Relaxed);
        target.point.continuous_failures.store(0, Ordering::Relaxed);
        target.point.record_cost(cost.as_nanos() as u64);
    }

    pub fn continuous_failures(&self, key: u64) -> u64 {
        self.targets
            .get(&key)
            .map(|t| t.point.continuous_failures.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Window statistics as of the last rotation.
    pub fn recent(&self, key: u64, interval: Duration) -> Option<Recent> {
        let target = self.targets.get(&key)?;
        let window = target.windows.get(&interval.as_secs())?;
        let recent = **window.recent.load();
        Some(recent)
    }

    #[cfg(test)]
    pub(crate) fn rotate(&self, key: u64, interval: Duration) {
        if let Some(target) = self.targets.get(&key) {
            if let Some(window) = target.windows.get(&interval.as_secs()) {
                window.rotate(&target.point);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analysis() -> Analysis {
        // never started: rotations are driven by hand
        Analysis::new(TimingWheel::new(Duration::from_secs(1), 60, 1))
    }

    #[test]
    fn test_window_deltas() {
        let a = analysis();
        let period = Duration::from_secs(2);
        a.add_recent_count(7, period);

        for _ in 0..10 {
            a.request(7);
        }
        for _ in 0..6 {
            a.response(7, Duration::from_millis(20));
        }
        for _ in 0..4 {
            a.failure(7);
        }
        a.reject(7);
        a.rotate(7, period);

        let recent = a.recent(7, period).unwrap();
        assert_eq!(recent.requests, 10);
        assert_eq!(recent.successes, 6);
        assert_eq!(recent.failures, 4);
        assert_eq!(recent.rejects, 1);
        assert_eq!(recent.max_ms, 20);
        assert_eq!(recent.min_ms, 20);
        assert_eq!(recent.avg_ms, 12);
        assert_eq!(recent.qps, 3);
        assert_eq!(recent.failure_rate(), Some(40));
        assert_eq!(recent.success_rate(), 60);

        // next window only sees new traffic
        a.request(7);
        a.rotate(7, period);
        let recent = a.recent(7, period).unwrap();
        assert_eq!(recent.requests, 1);
        assert_eq!(recent.failures, 0);
        assert_eq!(recent.max_ms, 0);
    }

    #[test]
    fn test_rates_without_traffic() {
        let recent = Recent::default();
        assert_eq!(recent.failure_rate(), None);
        assert_eq!(recent.success_rate(), 100);
    }

    #[test]
    fn test_add_is_idempotent_and_ignores_zero() {
        let a = analysis();
        a.add_recent_count(1, Duration::from_secs(0));
        assert!(a.recent(1, Duration::from_secs(0)).is_none());

        a.add_recent_count(1, Duration::from_secs(1));
        a.request(1);
        // a second registration must not reset the window
        a.add_recent_count(1, Duration::from_secs(1));
        a.rotate(1, Duration::from_secs(1));
        assert_eq!(a.recent(1, Duration::from_secs(1)).unwrap().requests, 1);
    }

    #[test]
    fn test_continuous_failures_reset_on_success() {
        let a = analysis();
        a.failure(3);
        a.failure(3);
        assert_eq!(a.continuous_failures(3), 2);
        a.response(3, Duration::from_millis(1));
        assert_eq!(a.continuous_failures(3), 0);
    }

    #[test]
    fn test_remove_target() {
        let a = analysis();
        a.add_recent_count(9, Duration::from_secs(1));
        assert!(a.recent(9, Duration::from_secs(1)).is_some());
        a.remove_target(9);
        assert!(a.recent(9, Duration::from_secs(1)).is_none());
    }
}
