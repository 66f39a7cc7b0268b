//! Circuit breaker for server protection.
//!
//! # States
//! - Open: normal operation, requests pass through
//! - Close: server assumed broken, requests fail fast with 503
//! - Half: recovering, only `half_traffic_rate`% of requests pass
//!
//! # State Transitions
//! ```text
//! Open → Close: recent failure rate >= failure_rate_to_close
//! Close → Half: close_timeout elapsed (timing wheel)
//! Half → Open: recent success rate >= succeed_rate_to_open
//! Half → Close: a probe failed (client cancellations excluded)
//! ```
//!
//! # Design Decisions
//! - One breaker per server, orthogonal to health status
//! - Rates come from the analysis window of `rate_check_period_secs`
//! - Transitions are serialized by a per-breaker lock; reads are atomic
//! - The half-state barrier is a shuffled 0..100 table walked by a counter,
//!   so the admitted share is exact over every 100 requests

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::error::GatewayError;
use crate::model::CircuitBreakerSpec;
use crate::observability::Analysis;
use crate::timer::{TimerHandle, TimingWheel};

const RATE_BASE: u64 = 100;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Open = 0,
    Half = 1,
    Close = 2,
}

impl From<u8> for CircuitState {
    fn from(val: u8) -> Self {
        match val {
            1 => CircuitState::Half,
            2 => CircuitState::Close,
            _ => CircuitState::Open,
        }
    }
}

fn shuffled_base() -> &'static [u8] {
    static TABLE: OnceLock<Vec<u8>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table: Vec<u8> = (0..RATE_BASE as u8).collect();
        table.shuffle(&mut rand::thread_rng());
        table
    })
}

/// Admits `rate`% of calls.
#[derive(Debug, Default)]
pub struct RateBarrier {
    op: AtomicU64,
}

impl RateBarrier {
    pub fn allow(&self, rate: u32) -> bool {
        let op = self.op.fetch_add(1, Ordering::Relaxed) + 1;
        u32::from(shuffled_base()[(op % RATE_BASE) as usize]) < rate
    }
}

/// Per-server circuit state.
#[derive(Debug)]
pub struct CircuitBreaker {
    server_id: u64,
    state: AtomicU8,
    barrier: RateBarrier,
    /// Held while transitioning; also owns the pending close→half timer.
    transition: Mutex<Option<TimerHandle>>,
}

impl CircuitBreaker {
    pub fn new(server_id: u64) -> Arc<Self> {
        Arc::new(Self {
            server_id,
            state: AtomicU8::new(CircuitState::Open as u8),
            barrier: RateBarrier::default(),
            transition: Mutex::new(None),
        })
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Acquire))
    }

    fn period(spec: &CircuitBreakerSpec) -> Duration {
        Duration::from_secs(spec.rate_check_period_secs)
    }

    /// Admission check before forwarding.
    pub fn check(
        self: &Arc<Self>,
        spec: &CircuitBreakerSpec,
        analysis: &Analysis,
        wheel: &TimingWheel,
    ) -> Result<(), GatewayError> {
        match self.state() {
            CircuitState::Open => {
                let failure_rate = analysis
                    .recent(self.server_id, Self::period(spec))
                    .and_then(|r| r.failure_rate());
                match failure_rate {
                    Some(rate) if rate >= u64::from(spec.failure_rate_to_close) => {
                        self.to_close(spec, wheel);
                        Err(GatewayError::CircuitClose)
                    }
                    _ => Ok(()),
                }
            }
            CircuitState::Half => {
                if self.barrier.allow(spec.half_traffic_rate) {
                    Ok(())
                } else {
                    Err(GatewayError::CircuitHalfLimited)
                }
            }
            CircuitState::Close => Err(GatewayError::CircuitClose),
        }
    }

    /// A forward succeeded.
    pub fn on_success(&self, spec: &CircuitBreakerSpec, analysis: &Analysis) {
        if self.state() != CircuitState::Half {
            return;
        }
        let success_rate = analysis
            .recent(self.server_id, Self::period(spec))
            .map_or(100, |r| r.success_rate());
        if success_rate >= u64::from(spec.succeed_rate_to_open) {
            self.to_open();
        }
    }

    /// A forward failed.
    pub fn on_error(self: &Arc<Self>, spec: &CircuitBreakerSpec, wheel: &TimingWheel, err: Option<&GatewayError>) {
        if err.is_some_and(GatewayError::is_user_cancel) {
            return;
        }
        if self.state() == CircuitState::Half {
            self.to_close(spec, wheel);
        }
    }

    fn to_close(self: &Arc<Self>, spec: &CircuitBreakerSpec, wheel: &TimingWheel) {
        let mut timer = self.transition.lock();
        if self.state() == CircuitState::Close {
            return;
        }

        self.state.store(CircuitState::Close as u8, Ordering::Release);
        if let Some(prev) = timer.take() {
            wheel.cancel(prev);
        }

        let weak = Arc::downgrade(self);
        *timer = Some(wheel.schedule(Duration::from_millis(spec.close_timeout_ms), move || {
            if let Some(cb) = weak.upgrade() {
                cb.to_half();
            }
        }));

        tracing::warn!(server_id = self.server_id, "Circuit changed to close");
    }

    fn to_half(&self) {
        let mut timer = self.transition.lock();
        timer.take();
        if self.state() != CircuitState::Close {
            return;
        }
        self.state.store(CircuitState::Half as u8, Ordering::Release);
        tracing::warn!(server_id = self.server_id, "Circuit changed to half");
    }

    fn to_open(&self) {
        let _guard = self.transition.lock();
        if self.state() != CircuitState::Half {
            return;
        }
        self.state.store(CircuitState::Open as u8, Ordering::Release);
        tracing::info!(server_id = self.server_id, "Circuit changed to open");
    }

    /// Cancel the pending close timer. Called when the server is removed.
    pub fn stop(&self, wheel: &TimingWheel) {
        if let Some(handle) = self.transition.lock().take() {
            wheel.cancel(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> CircuitBreakerSpec {
        CircuitBreakerSpec {
            close_timeout_ms: 2_000,
            half_traffic_rate: 10,
            rate_check_period_secs: 1,
            failure_rate_to_close: 50,
            succeed_rate_to_open: 80,
        }
    }

    fn setup() -> (Arc<TimingWheel>, Analysis) {
        let wheel = TimingWheel::new(Duration::from_millis(10), 64, 1);
        let analysis = Analysis::new(wheel.clone());
        analysis.add_recent_count(1, Duration::from_secs(1));
        (wheel, analysis)
    }

    #[test]
    fn test_barrier_share_is_exact() {
        let barrier = RateBarrier::default();
        let allowed = (0..100).filter(|_| barrier.allow(30)).count();
        assert_eq!(allowed, 30);
        assert!((0..100).all(|_| RateBarrier::default().allow(100)));
    }

    #[test]
    fn test_open_stays_open_without_failures() {
        let (wheel, analysis) = setup();
        let cb = CircuitBreaker::new(1);
        for _ in 0..10 {
            analysis.request(1);
            analysis.response(1, Duration::from_millis(1));
        }
        analysis.rotate(1, Duration::from_secs(1));

        assert!(cb.check(&spec(), &analysis, &wheel).is_ok());
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_trips_once_on_failure_rate() {
        let (wheel, analysis) = setup();
        let cb = CircuitBreaker::new(1);
        for _ in 0..10 {
            analysis.request(1);
            analysis.failure(1);
        }
        analysis.rotate(1, Duration::from_secs(1));

        assert_eq!(cb.check(&spec(), &analysis, &wheel), Err(GatewayError::CircuitClose));
        assert_eq!(cb.state(), CircuitState::Close);
        assert_eq!(wheel.pending(), 2);

        // already closed: no second timer
        assert_eq!(cb.check(&spec(), &analysis, &wheel), Err(GatewayError::CircuitClose));
        assert_eq!(wheel.pending(), 2);
    }

    #[test]
    fn test_half_transitions() {
        let (wheel, analysis) = setup();
        let cb = CircuitBreaker::new(1);
        cb.to_close(&spec(), &wheel);
        cb.to_half();
        assert_eq!(cb.state(), CircuitState::Half);

        cb.on_error(&spec(), &wheel, Some(&GatewayError::UserCancel));
        assert_eq!(cb.state(), CircuitState::Half);

        cb.on_success(&spec(), &analysis);
        assert_eq!(cb.state(), CircuitState::Open);

        cb.to_close(&spec(), &wheel);
        cb.to_half();
        cb.on_error(&spec(), &wheel, None);
        assert_eq!(cb.state(), CircuitState::Close);
    }

    #[tokio::test]
    async fn test_close_timeout_moves_to_half() {
        let wheel = TimingWheel::new(Duration::from_millis(10), 64, 1);
        let shutdown = tokio::sync::broadcast::channel(1);
        let driver = wheel.start(shutdown.0.subscribe());

        let cb = CircuitBreaker::new(9);
        let mut s = spec();
        s.close_timeout_ms = 50;
        cb.to_close(&s, &wheel);
        assert_eq!(cb.state(), CircuitState::Close);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(cb.state(), CircuitState::Half);

        let _ = shutdown.0.send(());
        let _ = driver.await;
    }
}
