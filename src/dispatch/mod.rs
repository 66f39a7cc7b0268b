//! Dispatch table subsystem.
//!
//! # Data Flow
//! ```text
//! store watcher (records) ──┐
//! health checker (status) ──┼─→ event.rs (Mutation)
//!                           │
//!                           └─→ table.rs apply()
//!                                 → lock the single mutation path
//!                                 → clone the current snapshot
//!                                 → modify the clone (router, active lists, limiters)
//!                                 → atomic swap
//!
//! Request handlers
//!     → table.snapshot() (one atomic load)
//!     → snapshot.rs (stable view for the whole request)
//! ```
//!
//! # Design Decisions
//! - Every mutation is serialized; readers never lock
//! - A snapshot is immutable: runtimes are rebuilt, never edited in place
//! - Live per-server state (health, circuit) is shared across rebuilds
//! - Side effects (health probes, analysis windows) follow the swap under the same lock

pub mod event;
pub mod snapshot;
pub mod table;

use thiserror::Error;

use crate::routing::RouteError;

pub use event::Mutation;
pub use snapshot::Snapshot;
pub use table::DispatchTable;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TableError {
    #[error("{kind} <{id}> already exists")]
    Exists { kind: &'static str, id: String },

    #[error("{kind} <{id}> not found")]
    NotFound { kind: &'static str, id: String },

    #[error("invalid {kind}: {reason}")]
    Invalid { kind: &'static str, reason: String },

    #[error("route: {0}")]
    Route(#[from] RouteError),
}

impl TableError {
    pub(crate) fn exists(kind: &'static str, id: impl ToString) -> Self {
        TableError::Exists {
            kind,
            id: id.to_string(),
        }
    }

    pub(crate) fn not_found(kind: &'static str, id: impl ToString) -> Self {
        TableError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub(crate) fn invalid(kind: &'static str, reason: String) -> Self {
        TableError::Invalid { kind, reason }
    }
}
