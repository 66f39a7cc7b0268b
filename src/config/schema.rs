//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the gateway.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::model::{Api, Bind, Cluster, Routing, Server};
use crate::observability::logging::LogFormat;

/// Filter names in the default chain order.
pub const DEFAULT_FILTERS: [&str; 11] = [
    "PREPARE",
    "HTTP-ACCESS",
    "HEADER",
    "XFORWARD",
    "BLACKLIST",
    "WHITELIST",
    "ANALYSIS",
    "RATE-LIMITING",
    "CIRCUIT-BREAKER",
    "VALIDATION",
    "CACHING",
];

/// Every filter name the chain understands.
pub const KNOWN_FILTERS: [&str; 13] = [
    "PREPARE",
    "HTTP-ACCESS",
    "HEADER",
    "XFORWARD",
    "BLACKLIST",
    "WHITELIST",
    "ANALYSIS",
    "RATE-LIMITING",
    "CIRCUIT-BREAKER",
    "VALIDATION",
    "CACHING",
    "JWT",
    "CROSS",
];

/// Root configuration for the gateway.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Front-end bind address (e.g., "0.0.0.0:8080").
    pub addr: String,

    /// Address advertised in the proxy lease for the admin collaborator.
    pub addr_rpc: String,

    /// Store namespace every key lives under.
    pub namespace: String,

    pub log_format: LogFormat,

    /// Filter chain, front to back.
    pub filters: Vec<String>,

    /// Whole-request timeout applied by the front-end in seconds.
    pub request_timeout_secs: u64,

    pub limits: LimitsConfig,
    pub registration: RegistrationConfig,
    pub timer: TimerConfig,
    pub store: StoreConfig,
    pub cache: CacheConfig,
    pub jwt: Option<JwtConfig>,
    pub cors: CorsConfig,
    pub tls: Option<TlsConfig>,
    pub metrics: MetricsConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8080".to_string(),
            addr_rpc: String::new(),
            namespace: "/gateway".to_string(),
            log_format: LogFormat::Pretty,
            filters: DEFAULT_FILTERS.iter().map(|f| f.to_string()).collect(),
            request_timeout_secs: 60,
            limits: LimitsConfig::default(),
            registration: RegistrationConfig::default(),
            timer: TimerConfig::default(),
            store: StoreConfig::default(),
            cache: CacheConfig::default(),
            jwt: None,
            cors: CorsConfig::default(),
            tls: None,
            metrics: MetricsConfig::default(),
        }
    }
}

/// Worker pools and backend client defaults.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub dispatch_workers: usize,
    pub copy_workers: usize,
    /// Queue depth of each worker.
    pub worker_queue: usize,
    /// Connections kept per backend address.
    pub max_conns_per_backend: usize,
    /// Cap for the backed-off health check interval in seconds.
    pub health_check_max_interval_secs: u64,
    pub conn_max_duration_secs: u64,
    pub conn_idle_secs: u64,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
    pub max_body_bytes: usize,
    /// Reject with 429 instead of waiting for a rate-limit token.
    pub rate_limit_drop: bool,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            dispatch_workers: 64,
            copy_workers: 8,
            worker_queue: 1024,
            max_conns_per_backend: 512,
            health_check_max_interval_secs: 60,
            conn_max_duration_secs: 3600,
            conn_idle_secs: 90,
            read_timeout_ms: 30_000,
            write_timeout_ms: 30_000,
            read_buffer_size: 4096,
            write_buffer_size: 4096,
            max_body_bytes: 10 * 1024 * 1024,
            rate_limit_drop: false,
        }
    }
}

/// Proxy lease written to the store.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RegistrationConfig {
    pub refresh_ms: u64,
    pub lease_ttl_ms: u64,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            refresh_ms: 3000,
            lease_ttl_ms: 5000,
        }
    }
}

impl RegistrationConfig {
    pub fn refresh(&self) -> Duration {
        Duration::from_millis(self.refresh_ms)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }
}

/// Timing wheel shape.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimerConfig {
    pub tick_ms: u64,
    pub slots: usize,
    pub wheels: usize,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            tick_ms: 1000,
            slots: 60,
            wheels: 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoreDriver {
    /// In-process store with native watch.
    #[default]
    Memory,
    /// Memory store watched by periodic list and diff.
    Polling,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    pub driver: StoreDriver,
    pub poll_interval_ms: u64,
    /// Bound of the watch event stream.
    pub event_buffer: usize,
    /// Consecutive failed resyncs before the watcher gives up.
    pub resync_attempts: u32,
    pub resync_backoff_ms: u64,
    pub resync_backoff_max_ms: u64,
    /// How often expired leases are purged.
    pub sweep_interval_ms: u64,
    /// Catalog bootstrap file, watched for changes.
    pub catalog_file: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            driver: StoreDriver::Memory,
            poll_interval_ms: 1000,
            event_buffer: 1024,
            resync_attempts: 10,
            resync_backoff_ms: 200,
            resync_backoff_max_ms: 10_000,
            sweep_interval_ms: 1000,
            catalog_file: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Byte bound of the response cache.
    pub max_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: 64 * 1024 * 1024,
        }
    }
}

/// JWT filter settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct JwtConfig {
    pub secret: String,
    /// `HS256`, `HS384` or `HS512`.
    pub method: String,
    /// `header:<name>`, `query:<name>` or `cookie:<name>`.
    pub token_lookup: String,
    /// Scheme stripped from a header token, e.g. `Bearer`.
    pub auth_schema: String,
    /// Response header carrying a renewed token.
    pub renew_header: String,
    /// Token store; in-memory when unset.
    pub redis_url: Option<String>,
    pub actions: Vec<JwtAction>,
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            method: "HS256".to_string(),
            token_lookup: "header:Authorization".to_string(),
            auth_schema: "Bearer".to_string(),
            renew_header: "Authorization".to_string(),
            redis_url: None,
            actions: Vec::new(),
        }
    }
}

/// One JWT checker or post-verification action.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum JwtAction {
    /// `<prefix><token>` must exist in the token store.
    TokenInRedis { prefix: String },
    /// Reject when the `exp` claim is missing or in the past.
    ExpireByRaw,
    /// Reject when `<prefix><token>` has expired in the token store.
    ExpireByRedis { prefix: String },
    /// Re-sign with a fresh `exp` of `ttl_secs`.
    RenewByRaw { ttl_secs: u64 },
    /// Extend the TTL of `<prefix><token>` in the token store.
    RenewByRedis { prefix: String, ttl_secs: u64 },
    FetchToHeader { prefix: String, fields: Vec<String> },
    FetchToCookie { prefix: String, fields: Vec<String> },
}

/// CORS preflight answers.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CorsConfig {
    pub allow_origins: Vec<String>,
    pub allow_methods: Vec<String>,
    pub allow_headers: Vec<String>,
    pub expose_headers: Vec<String>,
    pub allow_credentials: bool,
    pub max_age_secs: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allow_origins: vec!["*".to_string()],
            allow_methods: ["GET", "POST", "PUT", "DELETE", "OPTIONS"]
                .iter()
                .map(|m| m.to_string())
                .collect(),
            allow_headers: vec!["*".to_string()],
            expose_headers: Vec::new(),
            allow_credentials: false,
            max_age_secs: 600,
        }
    }
}

/// TLS configuration for the listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to certificate file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct MetricsConfig {
    /// Prometheus listen address; no exporter when unset.
    pub address: Option<String>,
}

/// Catalog bootstrap file.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Catalog {
    pub clusters: Vec<Cluster>,
    pub servers: Vec<Server>,
    pub binds: Vec<Bind>,
    pub apis: Vec<Api>,
    pub routings: Vec<Routing>,
}
