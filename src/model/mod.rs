//! Catalog records.
//!
//! # Data Flow
//! ```text
//! admin collaborator
//!     → store (opaque JSON values under the namespace)
//!     → store::watcher decodes into these records
//!     → dispatch::DispatchTable builds runtimes from them
//! ```
//!
//! # Design Decisions
//! - Records are plain serde structs; runtime state never lives here
//! - Every optional section defaults so minimal records decode
//! - `validate` rejects records the table cannot use

pub mod api;
pub mod cluster;
pub mod routing;
pub mod server;

use serde::{Deserialize, Serialize};

pub use api::{
    AccessControl, Api, CachePolicy, DispatchNodeSpec, HostPolicy, HttpOptions, HttpResult,
    NameValue, RenderAttr, RenderObject, RenderTemplate, RetryStrategy, Validation,
};
pub use cluster::{Bind, Cluster, LoadBalanceKind};
pub use routing::{MatchItem, Operator, Param, Predicate, Routing, RoutingStrategy, Source};
pub use server::{CircuitBreakerSpec, HealthCheck, Server};

/// Up/down status shared by APIs, routings and server health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    Down,
    Up,
}

/// Lease record a running gateway writes under `/proxy/<addr>`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ProxyInfo {
    pub addr: String,
    #[serde(default)]
    pub addr_rpc: String,
}

/// Opaque plugin record. The script engine that runs it lives outside the gateway.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Plugin {
    pub id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub content: serde_json::Value,
}

/// Ordered list of plugin ids applied to every request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct AppliedPlugins {
    pub applied: Vec<u64>,
}
