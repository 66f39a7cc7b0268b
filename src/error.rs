//! Error kinds surfaced by the dispatch engine and its filters.
//!
//! Every variant maps onto exactly one HTTP status through
//! [`GatewayError::status_code`]. `UserCancel` is special: the client is
//! gone, so nothing is written and the circuit breaker ignores it.

use axum::http::StatusCode;
use thiserror::Error;

/// Errors produced while dispatching a single request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("no matching api")]
    NoMatchingApi,

    #[error("validation failed")]
    ValidationFailed,

    #[error("rewrite not match")]
    RewriteNotMatch,

    #[error("client ip in blacklist")]
    Blacklist,

    #[error("client ip not in whitelist")]
    Whitelist,

    #[error("missing token")]
    MissingToken,

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("rate limited")]
    RateLimited,

    #[error("rate limit wait cancelled")]
    RateLimitCancelled,

    #[error("circuit close")]
    CircuitClose,

    #[error("circuit half limited")]
    CircuitHalfLimited,

    #[error("no available server")]
    NoServer,

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("upstream timeout")]
    UpstreamTimeout,

    #[error("client cancelled the request")]
    UserCancel,

    #[error("gateway stopped")]
    Stopped,

    #[error("filter {filter} failed: {reason}")]
    Filter { filter: &'static str, reason: String },
}

impl GatewayError {
    /// HTTP status written to the client for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::NoMatchingApi => StatusCode::NOT_FOUND,
            GatewayError::ValidationFailed | GatewayError::RewriteNotMatch => {
                StatusCode::BAD_REQUEST
            }
            GatewayError::Blacklist
            | GatewayError::Whitelist
            | GatewayError::MissingToken
            | GatewayError::InvalidToken(_) => StatusCode::FORBIDDEN,
            GatewayError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::CircuitClose
            | GatewayError::CircuitHalfLimited
            | GatewayError::NoServer
            | GatewayError::Stopped => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::RateLimitCancelled
            | GatewayError::Upstream(_)
            | GatewayError::UserCancel
            | GatewayError::Filter { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn is_user_cancel(&self) -> bool {
        matches!(self, GatewayError::UserCancel)
    }

    /// Errors counted as `reject` rather than `fail` in request metrics.
    pub fn is_reject(&self) -> bool {
        matches!(
            self,
            GatewayError::CircuitClose | GatewayError::Blacklist | GatewayError::Whitelist
        )
    }

    /// Errors counted as `limit` in request metrics.
    pub fn is_limit(&self) -> bool {
        matches!(
            self,
            GatewayError::CircuitHalfLimited | GatewayError::RateLimited
        )
    }
}
