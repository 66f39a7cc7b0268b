//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     timer → dispatch table → store + catalog file → full sync
//!         → watch, lease, worker pools → listener
//!
//! Shutdown (shutdown.rs):
//!     Signal received → gateway stops accepting (503)
//!         → broadcast → workers, watchers, wheel, cleaner exit
//!         → drain() joins them under a deadline
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//!     SIGHUP → Republish the catalog file
//! ```
//!
//! # Design Decisions
//! - Ordered startup: catalog first, then core, then listeners
//! - Ordered shutdown: stop accept, drain, close
//! - Shutdown has timeout: stragglers are aborted after the deadline

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::{drain, Shutdown};
pub use signals::{Signal, Signals};
pub use startup::{start, Running, StartupError};
