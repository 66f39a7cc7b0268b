//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Filter chain (pre):
//!     → access_control.rs (blacklist / whitelist on the real client IP)
//!     → rate_limit.rs (per-server token bucket)
//!     → headers.rs (strip hop-by-hop, add X-Forwarded-For)
//!     → Forward
//! ```
//!
//! # Design Decisions
//! - IP lists are parsed once per API and cached by the filters
//! - Limiters are sized per live proxy and rebuilt when the proxy set changes
//! - Unparseable list entries are ignored, never fatal

pub mod access_control;
pub mod headers;
pub mod rate_limit;

pub use access_control::IpList;
pub use rate_limit::RateLimiter;
