//! API records and their dispatch nodes.

use serde::{Deserialize, Serialize};

use super::routing::{MatchItem, Param, Predicate};
use super::Status;

/// A routable API: one URL pattern plus method, fanned out to dispatch nodes.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Api {
    pub id: u64,
    pub name: String,
    pub url_pattern: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub status: Status,
    /// Host the request must carry, when set.
    #[serde(default)]
    pub domain: Option<String>,
    /// Extra request predicate checked after the URL matched.
    #[serde(default)]
    pub matches: Option<Predicate>,
    #[serde(default)]
    pub use_default: bool,
    #[serde(default)]
    pub default_value: Option<HttpResult>,
    #[serde(default)]
    pub render_template: Option<RenderTemplate>,
    /// Name of the auth filter guarding this API (`JWT`).
    #[serde(default)]
    pub auth_filter: Option<String>,
    #[serde(default)]
    pub access_control: Option<AccessControl>,
    #[serde(default)]
    pub nodes: Vec<DispatchNodeSpec>,
    #[serde(default)]
    pub applied_plugins: Vec<u64>,
}

fn default_method() -> String {
    "*".to_string()
}

impl Api {
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("missing api name".into());
        }
        if self.url_pattern.is_empty() {
            return Err("missing url pattern".into());
        }
        if self.method.is_empty() {
            return Err("missing http method".into());
        }
        Ok(())
    }

    /// True when the request method is accepted by this API.
    pub fn matches_method(&self, method: &str) -> bool {
        self.method == "*" || self.method.eq_ignore_ascii_case(method)
    }
}

/// One forwarding target of an API.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct DispatchNodeSpec {
    pub cluster_id: u64,
    /// Template with `{name}` placeholders filled from path params.
    pub url_rewrite: Option<String>,
    pub host_policy: HostPolicy,
    /// Host used with [`HostPolicy::Custom`].
    pub custom_host: Option<String>,
    pub http_option: Option<HttpOptions>,
    pub cache: Option<CachePolicy>,
    pub default_value: Option<HttpResult>,
    pub retry: Option<RetryStrategy>,
    pub batch_index: u32,
    pub attr_name: String,
    pub validations: Vec<Validation>,
    /// Answer with `default_value` without forwarding.
    pub use_default: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HostPolicy {
    #[default]
    Origin,
    ServerAddr,
    Custom,
}

/// Per-node overrides of the backend client options.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct HttpOptions {
    pub read_timeout_ms: Option<u64>,
    pub write_timeout_ms: Option<u64>,
    pub max_conn_duration_ms: Option<u64>,
    pub max_idle_conn_duration_ms: Option<u64>,
    pub max_response_body_size: Option<usize>,
    pub read_buffer_size: Option<usize>,
    pub write_buffer_size: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct CachePolicy {
    /// All conditions must hold for the response to be cached.
    pub conditions: Vec<MatchItem>,
    /// Request values appended to the request URI to form the key.
    pub keys: Vec<Param>,
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct RetryStrategy {
    pub max_times: u32,
    pub interval_ms: u64,
    /// Status codes that trigger a retry. Empty means every error.
    pub codes: Vec<u16>,
}

impl RetryStrategy {
    pub fn matches_code(&self, code: u16) -> bool {
        self.codes.is_empty() || self.codes.contains(&code)
    }
}

/// Parameter validation run by the `VALIDATION` filter.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Validation {
    pub parameter: Param,
    #[serde(default)]
    pub required: bool,
    /// Regular expressions the value must all match.
    #[serde(default)]
    pub rules: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct NameValue {
    pub name: String,
    pub value: String,
}

/// A canned response used as a fallback or in place of forwarding.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct HttpResult {
    #[serde(default = "default_code")]
    pub code: u16,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub headers: Vec<NameValue>,
    #[serde(default)]
    pub cookies: Vec<NameValue>,
}

fn default_code() -> u16 {
    200
}

/// Projection of backend JSON into the client response.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct RenderTemplate {
    pub objects: Vec<RenderObject>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct RenderObject {
    pub name: String,
    /// Put the attrs at the top level instead of under `name`.
    pub flat_attrs: bool,
    pub attrs: Vec<RenderAttr>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RenderAttr {
    pub name: String,
    /// Comma separated dotted paths into the source JSON.
    pub extract_exp: String,
}

/// IP rules applied by the `BLACKLIST` and `WHITELIST` filters.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct AccessControl {
    pub whitelist: Vec<String>,
    pub blacklist: Vec<String>,
}
