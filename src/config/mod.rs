//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ProxyConfig (validated, immutable)
//!     → shared by reference with every subsystem at startup
//!
//! catalog file (TOML: clusters, servers, binds, apis, routings)
//!     → loader.rs load_catalog
//!     → watcher.rs diff against the store → put / delete
//!     → store watch → dispatch table
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; only the catalog changes at runtime
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_catalog, load_config, ConfigError};
pub use schema::{Catalog, ProxyConfig};
pub use validation::ValidationError;
pub use watcher::CatalogWatcher;
