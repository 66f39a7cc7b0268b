//! HTTP API gateway.
//!
//! Requests are matched against a catalog of APIs by URL pattern and method,
//! fanned out to one or more backend clusters through a filter chain, and
//! rendered back into a single response. The catalog lives in a watchable
//! key-value store and is applied to a copy-on-write dispatch table.

// Catalog and runtime state
pub mod config;
pub mod dispatch;
pub mod model;
pub mod store;

// Request path
pub mod filter;
pub mod http;
pub mod proxy;
pub mod routing;

// Traffic management
pub mod health;
pub mod load_balancer;

// Cross-cutting concerns
pub mod error;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod resilience;
pub mod security;
pub mod timer;

pub use config::schema::ProxyConfig;
pub use error::GatewayError;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
pub use proxy::Gateway;
