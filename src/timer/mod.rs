//! Coarse timers.
//!
//! # Data Flow
//! ```text
//! schedule(delay, task) → hashed into a sub-wheel → slot = cursor + ticks
//! driver task (one tokio interval)
//!     → advance cursor
//!     → collect due entries of that slot in every sub-wheel
//!     → run them outside the slot locks
//! ```
//!
//! # Design Decisions
//! - Accuracy is one tick; callers needing more use tokio::time directly
//! - Tasks run on the driver and must not block; long work is spawned
//! - Periodic timers re-arm themselves and hold only a weak wheel reference

mod wheel;

pub use wheel::{PeriodicHandle, TimerHandle, TimingWheel};
