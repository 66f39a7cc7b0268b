//! Health checking subsystem.
//!
//! # Data Flow
//! ```text
//! Active health checks (active.rs):
//!     Timing wheel fires per server
//!     → GET scheme://addr/path (timeout)
//!     → 200 (+ expected body) = up, anything else = down
//!     → StatusChange sent to the dispatch table on transition
//!
//! Dispatch table:
//!     → state.rs (atomic status flip under the mutation lock)
//!     → rebuild active lists of every cluster the server is bound to
//! ```
//!
//! # Design Decisions
//! - Only the dispatch table writes status, so status and active lists move together
//! - Failing servers are probed less often (×1.5 per failure, capped)
//! - External servers and servers without a check are always up

pub mod active;
pub mod state;

pub use active::HealthChecker;
pub use state::{HealthState, StatusChange};
