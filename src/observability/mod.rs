//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! dispatch engine, filters, health checks
//!     → analysis.rs (per-server counters and rolling windows)
//!     → metrics.rs (Prometheus counters, histograms, gauges)
//!     → logging.rs (tracing subscriber, access log target)
//!
//! Consumers:
//!     → circuit breaker reads analysis windows
//!     → Prometheus scrapes the exporter
//! ```
//!
//! # Design Decisions
//! - Analysis windows are precomputed on rotation; reads are one atomic load
//! - Metrics go through the `metrics` facade so tests run without an exporter
//! - Access log is a plain tracing event on the `access` target

pub mod analysis;
pub mod logging;
pub mod metrics;

pub use analysis::{Analysis, Recent};
