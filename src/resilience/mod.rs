//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Forward to a server:
//!     → circuit_breaker.rs (admit, fail fast, or half-open probe)
//!     → forward with per-node timeouts (proxy::client)
//!     → On failure: retries.rs (match strategy, pause, reselect server)
//!     → circuit_breaker.rs (post / post-error transitions)
//!
//! Store watch lost:
//!     → backoff.rs (exponential delay with jitter before re-list)
//! ```
//!
//! # Design Decisions
//! - Circuit state is per server and independent of health status
//! - Retries are opt-in per dispatch node, bounded by `max_times + 1` forwards
//! - Client cancellation never feeds the circuit breaker

pub mod backoff;
pub mod circuit_breaker;
pub mod retries;

pub use circuit_breaker::{CircuitBreaker, CircuitState, RateBarrier};
