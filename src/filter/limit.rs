//! `RATE-LIMITING` and `CIRCUIT-BREAKER` filters.
//!
//! Both act on the selected server. A node without a server (a default
//! answer, a short-circuited request) passes through untouched.

use super::context::{Flow, FilterContext};
use crate::error::GatewayError;

/// Take a token from the server's limiter. Waits unless `drop` is set;
/// a wait ends early when the client goes away.
pub async fn rate_limit_pre(ctx: &FilterContext, drop: bool) -> Result<Flow, GatewayError> {
    let Some(server) = ctx.server.as_ref() else {
        return Ok(Flow::Continue);
    };

    if drop {
        return if server.limiter().try_acquire() {
            Ok(Flow::Continue)
        } else {
            Err(GatewayError::RateLimited)
        };
    }

    tokio::select! {
        _ = server.limiter().acquire() => Ok(Flow::Continue),
        _ = ctx.cancel.cancelled() => Err(GatewayError::RateLimitCancelled),
    }
}

pub fn circuit_pre(ctx: &FilterContext) -> Result<Flow, GatewayError> {
    let Some(server) = ctx.server.as_ref() else {
        return Ok(Flow::Continue);
    };
    let Some(spec) = server.meta.circuit_breaker.as_ref() else {
        return Ok(Flow::Continue);
    };

    match server
        .circuit()
        .check(spec, &ctx.shared.analysis, &ctx.shared.wheel)
    {
        Ok(()) => Ok(Flow::Continue),
        Err(e) => {
            if matches!(e, GatewayError::CircuitClose) {
                ctx.shared.analysis.reject(server.id());
            }
            Err(e)
        }
    }
}

pub fn circuit_post(ctx: &FilterContext) {
    if let Some(server) = ctx.server.as_ref() {
        if let Some(spec) = server.meta.circuit_breaker.as_ref() {
            server.circuit().on_success(spec, &ctx.shared.analysis);
        }
    }
}

pub fn circuit_post_err(ctx: &FilterContext, err: Option<&GatewayError>) {
    if let Some(server) = ctx.server.as_ref() {
        if let Some(spec) = server.meta.circuit_breaker.as_ref() {
            server.circuit().on_error(spec, &ctx.shared.wheel, err);
        }
    }
}
