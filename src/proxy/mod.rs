//! Request dispatch subsystem.
//!
//! # Data Flow
//! ```text
//! http/server.rs (buffered request + cancel token)
//!     → engine.rs route (snapshot, domain, API predicate)
//!     → engine.rs resolve (load balancer, split / copy routings)
//!     → copy pool (shadow forwards, fire and forget)
//!     → batches in order; nodes of a batch on the dispatch pool
//!         → filter pre → client.rs forward (retry loop) → filter post / post_err
//!     → render.rs (single passthrough, multi-node merge, templates, defaults)
//!     → client response
//! ```
//!
//! # Design Decisions
//! - Pools are fixed size with bounded queues; a full copy queue drops the copy
//! - Backend connections are pooled per server address and capped by a semaphore
//! - Cancellation is one token per request; nodes and retry sleeps watch it

pub mod client;
pub mod engine;
pub mod render;
pub mod worker;

pub use client::{BackendClient, ClientError, ClientOptions};
pub use engine::Gateway;
pub use render::{render, MultiContext, NodeResult};
pub use worker::WorkerPool;
