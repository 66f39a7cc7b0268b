//! Metrics collection and exposition.
//!
//! # Metrics
//! - `api_request_total` (counter): requests per API, labelled `type` =
//!   `all | succeed | fail | limit | reject`
//! - `api_response_duration_seconds` (histogram): end-to-end latency per API
//! - `gateway_server_status` (gauge): 1 when a server is up, 0 otherwise

use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::GatewayError;

/// Outcome class of a finished request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    All,
    Succeed,
    Fail,
    Limit,
    Reject,
}

impl RequestKind {
    /// Class of a request from its first error and the status sent back.
    pub fn classify(error: Option<&GatewayError>, status: u16) -> Self {
        match error {
            Some(e) if e.is_reject() => RequestKind::Reject,
            Some(e) if e.is_limit() => RequestKind::Limit,
            Some(_) => RequestKind::Fail,
            None if status >= 400 => RequestKind::Fail,
            None => RequestKind::Succeed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::All => "all",
            RequestKind::Succeed => "succeed",
            RequestKind::Fail => "fail",
            RequestKind::Limit => "limit",
            RequestKind::Reject => "reject",
        }
    }
}

/// Install the Prometheus exporter with its own HTTP listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Prometheus exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install Prometheus exporter"),
    }
}

pub fn record_request(api: &str, kind: RequestKind) {
    metrics::counter!(
        "api_request_total",
        "name" => api.to_string(),
        "type" => kind.as_str()
    )
    .increment(1);
}

pub fn record_duration(api: &str, elapsed: Duration) {
    metrics::histogram!("api_response_duration_seconds", "name" => api.to_string())
        .record(elapsed.as_secs_f64());
}

pub fn record_server_status(server: &str, up: bool) {
    metrics::gauge!("gateway_server_status", "server" => server.to_string())
        .set(if up { 1.0 } else { 0.0 });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(RequestKind::classify(Some(&GatewayError::Blacklist), 403), RequestKind::Reject);
        assert_eq!(RequestKind::classify(Some(&GatewayError::RateLimited), 429), RequestKind::Limit);
        assert_eq!(RequestKind::classify(Some(&GatewayError::NoServer), 503), RequestKind::Fail);
        assert_eq!(RequestKind::classify(None, 502), RequestKind::Fail);
        assert_eq!(RequestKind::classify(None, 200), RequestKind::Succeed);
    }
}
