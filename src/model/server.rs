//! Backend server records.

use serde::{Deserialize, Serialize};

use super::api::HttpResult;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Server {
    pub id: u64,
    /// `host:port` of the backend.
    pub addr: String,
    #[serde(default = "default_scheme")]
    pub scheme: String,
    pub max_qps: u64,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub health_check: Option<HealthCheck>,
    #[serde(default)]
    pub circuit_breaker: Option<CircuitBreakerSpec>,
    /// External servers are always up and never probed.
    #[serde(default)]
    pub external: bool,
    #[serde(default)]
    pub default_value: Option<HttpResult>,
}

fn default_scheme() -> String {
    "http".to_string()
}

fn default_weight() -> u32 {
    1
}

impl Server {
    pub fn validate(&self) -> Result<(), String> {
        if self.addr.is_empty() {
            return Err("missing server address".into());
        }
        if self.max_qps == 0 {
            return Err("missing server max qps".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct HealthCheck {
    pub path: String,
    /// Body the probe must return verbatim, when set.
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default = "default_check_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_check_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_check_interval_ms() -> u64 {
    10_000
}

fn default_check_timeout_ms() -> u64 {
    3_000
}

/// Thresholds are percentages in `0..=100`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CircuitBreakerSpec {
    pub close_timeout_ms: u64,
    pub half_traffic_rate: u32,
    pub rate_check_period_secs: u64,
    pub failure_rate_to_close: u32,
    pub succeed_rate_to_open: u32,
}
