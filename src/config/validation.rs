//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Value ranges: worker counts, timeouts and timer shape must be non-zero
//! - Filter names must be known and listed once; `JWT` needs a `[jwt]` section
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::SocketAddr;
use thiserror::Error;

use crate::config::schema::{ProxyConfig, StoreDriver, KNOWN_FILTERS};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {reason}")]
pub struct ValidationError {
    pub field: String,
    pub reason: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

const JWT_METHODS: [&str; 3] = ["HS256", "HS384", "HS512"];

pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.addr.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new("addr", format!("invalid socket address <{}>", config.addr)));
    }
    if !config.namespace.starts_with('/') || config.namespace.ends_with('/') {
        errors.push(ValidationError::new("namespace", "must start with '/' and not end with it"));
    }
    if config.request_timeout_secs == 0 {
        errors.push(ValidationError::new("request_timeout_secs", "must be > 0"));
    }

    check_filters(config, &mut errors);

    let limits = &config.limits;
    for (field, value) in [
        ("limits.dispatch_workers", limits.dispatch_workers as u64),
        ("limits.copy_workers", limits.copy_workers as u64),
        ("limits.worker_queue", limits.worker_queue as u64),
        ("limits.max_conns_per_backend", limits.max_conns_per_backend as u64),
        ("limits.health_check_max_interval_secs", limits.health_check_max_interval_secs),
        ("limits.conn_max_duration_secs", limits.conn_max_duration_secs),
        ("limits.conn_idle_secs", limits.conn_idle_secs),
        ("limits.read_timeout_ms", limits.read_timeout_ms),
        ("limits.write_timeout_ms", limits.write_timeout_ms),
        ("limits.max_body_bytes", limits.max_body_bytes as u64),
        ("registration.refresh_ms", config.registration.refresh_ms),
        ("timer.tick_ms", config.timer.tick_ms),
        ("timer.slots", config.timer.slots as u64),
        ("timer.wheels", config.timer.wheels as u64),
        ("store.event_buffer", config.store.event_buffer as u64),
        ("cache.max_bytes", config.cache.max_bytes as u64),
    ] {
        if value == 0 {
            errors.push(ValidationError::new(field, "must be > 0"));
        }
    }

    if config.store.driver == StoreDriver::Polling && config.store.poll_interval_ms == 0 {
        errors.push(ValidationError::new("store.poll_interval_ms", "must be > 0 with the polling driver"));
    }

    if let Some(tls) = &config.tls {
        if tls.cert_path.is_empty() || tls.key_path.is_empty() {
            errors.push(ValidationError::new("tls", "cert_path and key_path are required"));
        }
    }

    if let Some(addr) = &config.metrics.address {
        if addr.parse::<SocketAddr>().is_err() {
            errors.push(ValidationError::new("metrics.address", format!("invalid socket address <{addr}>")));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_filters(config: &ProxyConfig, errors: &mut Vec<ValidationError>) {
    let mut seen = HashSet::new();
    for name in &config.filters {
        let upper = name.trim().to_ascii_uppercase();
        if !KNOWN_FILTERS.contains(&upper.as_str()) {
            errors.push(ValidationError::new("filters", format!("unknown filter <{name}>")));
        } else if !seen.insert(upper) {
            errors.push(ValidationError::new("filters", format!("filter <{name}> listed twice")));
        }
    }

    if !seen.contains("JWT") {
        return;
    }
    match &config.jwt {
        None => errors.push(ValidationError::new("jwt", "JWT filter listed without a [jwt] section")),
        Some(jwt) => {
            if jwt.secret.is_empty() {
                errors.push(ValidationError::new("jwt.secret", "must not be empty"));
            }
            if !JWT_METHODS.contains(&jwt.method.as_str()) {
                errors.push(ValidationError::new("jwt.method", format!("unsupported method <{}>", jwt.method)));
            }
            let source = jwt.token_lookup.split_once(':').map(|(s, _)| s);
            if !matches!(source, Some("header" | "query" | "cookie")) {
                errors.push(ValidationError::new(
                    "jwt.token_lookup",
                    format!("expected header:, query: or cookie:, got <{}>", jwt.token_lookup),
                ));
            }
        }
    }
}
