//! Server runtime.
//!
//! # Responsibilities
//! - Pair a server record with its live state: health, circuit, limiter
//! - Keep the live state across record updates and snapshot rebuilds
//!
//! A runtime is immutable once published in a snapshot. An update builds a
//! new runtime that shares the previous one's health and circuit state.

use std::sync::Arc;

use crate::health::state::HealthState;
use crate::model::{Server, Status};
use crate::resilience::CircuitBreaker;
use crate::security::RateLimiter;

#[derive(Debug)]
pub struct ServerRuntime {
    pub meta: Server,
    health: Arc<HealthState>,
    circuit: Arc<CircuitBreaker>,
    limiter: Arc<RateLimiter>,
}

impl ServerRuntime {
    /// A new server starts `up` unless it must pass a probe first.
    pub fn new(meta: Server, proxy_count: usize) -> Self {
        let initial = if probed(&meta) { Status::Down } else { Status::Up };
        Self {
            health: Arc::new(HealthState::new(initial)),
            circuit: CircuitBreaker::new(meta.id),
            limiter: Arc::new(RateLimiter::for_share(meta.max_qps, proxy_count)),
            meta,
        }
    }

    /// Same live state, new record.
    pub fn with_meta(&self, meta: Server, proxy_count: usize) -> Self {
        if !probed(&meta) {
            self.health.set(Status::Up);
        }
        Self {
            health: self.health.clone(),
            circuit: self.circuit.clone(),
            limiter: Arc::new(RateLimiter::for_share(meta.max_qps, proxy_count)),
            meta,
        }
    }

    /// Same record, limiter resized to a new proxy count.
    pub fn with_proxy_count(&self, proxy_count: usize) -> Self {
        self.with_meta(self.meta.clone(), proxy_count)
    }

    pub fn id(&self) -> u64 {
        self.meta.id
    }

    pub fn status(&self) -> Status {
        self.health.get()
    }

    pub fn is_up(&self) -> bool {
        self.health.is_up()
    }

    /// Applied by the dispatch table only, under its mutation lock.
    pub(crate) fn set_status(&self, status: Status) -> bool {
        self.health.set(status)
    }

    pub fn circuit(&self) -> &Arc<CircuitBreaker> {
        &self.circuit
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// True when the active health checker must probe this server.
    pub fn needs_probe(&self) -> bool {
        probed(&self.meta)
    }

    /// `scheme://addr` of the backend.
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.meta.scheme.to_ascii_lowercase(), self.meta.addr)
    }
}

fn probed(meta: &Server) -> bool {
    !meta.external && meta.health_check.is_some()
}

#[cfg(test)]
pub(crate) fn server(id: u64, addr: &str) -> Server {
    Server {
        id,
        addr: addr.to_string(),
        scheme: "http".to_string(),
        max_qps: 100,
        weight: 1,
        health_check: None,
        circuit_breaker: None,
        external: false,
        default_value: None,
    }
}
