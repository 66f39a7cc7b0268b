//! Filter chain run around every dispatch node.
//!
//! # Data Flow
//! ```text
//! Dispatch node
//!     → pre filters, front to back (PREPARE first)
//!         → Flow::ShortCircuit: skip the forward (cache hit, CORS preflight)
//!         → Err: node fails with the error's status
//!     → forward to the backend
//!     → post filters, back to front (success)
//!     → post_err filters, back to front (forward failed)
//! ```
//!
//! # Design Decisions
//! - Filters are one tagged enum over a shared [`FilterContext`]; no trait
//!   objects on the hot path
//! - The chain is built once from the configured names and never changes
//! - A pre-filter error ends the node without running `post_err`; only a
//!   failed forward reaches the error filters

pub mod access;
pub mod basic;
pub mod cache;
pub mod context;
pub mod cors;
pub mod jwt;
pub mod limit;
pub mod validation;

use std::sync::Arc;
use thiserror::Error;

use crate::config::schema::ProxyConfig;
use crate::error::GatewayError;

pub use access::AccessLists;
pub use cache::{CacheFilter, ResponseCache};
pub use context::{attr, Flow, FilterContext, Shared};
pub use cors::CorsFilter;
pub use jwt::{JwtFilter, MemoryTokenStore, RedisTokenStore, TokenStore};

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("unknown filter: {0}")]
    Unknown(String),

    #[error("JWT filter: {0}")]
    Jwt(String),

    #[error("JWT filter listed without a [jwt] section")]
    MissingJwtConfig,
}

#[derive(Debug)]
pub enum Filter {
    Prepare,
    AccessLog,
    Headers,
    XForward,
    Blacklist(Arc<AccessLists>),
    Whitelist(Arc<AccessLists>),
    Analysis,
    RateLimit { drop: bool },
    CircuitBreaker,
    Validation,
    Caching(CacheFilter),
    Jwt(Box<JwtFilter>),
    Cross(CorsFilter),
}

impl Filter {
    pub fn name(&self) -> &'static str {
        match self {
            Filter::Prepare => "PREPARE",
            Filter::AccessLog => "HTTP-ACCESS",
            Filter::Headers => "HEADER",
            Filter::XForward => "XFORWARD",
            Filter::Blacklist(_) => "BLACKLIST",
            Filter::Whitelist(_) => "WHITELIST",
            Filter::Analysis => "ANALYSIS",
            Filter::RateLimit { .. } => "RATE-LIMITING",
            Filter::CircuitBreaker => "CIRCUIT-BREAKER",
            Filter::Validation => "VALIDATION",
            Filter::Caching(_) => "CACHING",
            Filter::Jwt(_) => jwt::NAME,
            Filter::Cross(_) => "CROSS",
        }
    }

    /// Acts on the selected server rather than the request.
    pub fn server_scoped(&self) -> bool {
        matches!(self, Filter::Analysis | Filter::RateLimit { .. } | Filter::CircuitBreaker)
    }

    pub async fn pre(&self, ctx: &mut FilterContext) -> Result<Flow, GatewayError> {
        match self {
            Filter::Prepare => Ok(basic::prepare_pre(ctx)),
            Filter::Headers => Ok(basic::headers_pre(ctx)),
            Filter::XForward => Ok(basic::xforward_pre(ctx)),
            Filter::Blacklist(lists) => lists.blacklist_pre(ctx),
            Filter::Whitelist(lists) => lists.whitelist_pre(ctx),
            Filter::Analysis => Ok(basic::analysis_pre(ctx)),
            Filter::RateLimit { drop } => limit::rate_limit_pre(ctx, *drop).await,
            Filter::CircuitBreaker => limit::circuit_pre(ctx),
            Filter::Validation => validation::validation_pre(ctx),
            Filter::Caching(cache) => cache.pre(ctx),
            Filter::Jwt(jwt) => jwt.pre(ctx).await,
            Filter::Cross(cors) => cors.pre(ctx),
            Filter::AccessLog => Ok(Flow::Continue),
        }
    }

    pub async fn post(&self, ctx: &mut FilterContext) -> Result<(), GatewayError> {
        match self {
            Filter::AccessLog => {
                let status = ctx.response.as_ref().map_or(0, |r| r.status.as_u16());
                basic::access_log(ctx, status);
            }
            Filter::Headers => basic::headers_post(ctx),
            Filter::Analysis => basic::analysis_post(ctx),
            Filter::CircuitBreaker => limit::circuit_post(ctx),
            Filter::Caching(cache) => cache.post(ctx)?,
            Filter::Jwt(jwt) => jwt.post(ctx)?,
            Filter::Cross(cors) => cors.post(ctx)?,
            _ => {}
        }
        Ok(())
    }

    pub async fn post_err(&self, ctx: &mut FilterContext, code: u16, err: Option<&GatewayError>) {
        match self {
            Filter::AccessLog => basic::access_log(ctx, code),
            Filter::Analysis => basic::analysis_post_err(ctx),
            Filter::CircuitBreaker => limit::circuit_post_err(ctx, err),
            _ => {}
        }
    }
}

/// The ordered filters of this gateway.
#[derive(Debug)]
pub struct FilterChain {
    filters: Vec<Filter>,
}

impl FilterChain {
    /// Build from `config.filters`. `PREPARE` always runs first.
    pub async fn build(config: &ProxyConfig) -> Result<Self, FilterError> {
        let lists = AccessLists::new();
        let mut filters = vec![Filter::Prepare];

        for name in &config.filters {
            let filter = match name.trim().to_ascii_uppercase().as_str() {
                "PREPARE" => continue,
                "HTTP-ACCESS" => Filter::AccessLog,
                "HEADER" => Filter::Headers,
                "XFORWARD" => Filter::XForward,
                "BLACKLIST" => Filter::Blacklist(lists.clone()),
                "WHITELIST" => Filter::Whitelist(lists.clone()),
                "ANALYSIS" => Filter::Analysis,
                "RATE-LIMITING" => Filter::RateLimit {
                    drop: config.limits.rate_limit_drop,
                },
                "CIRCUIT-BREAKER" => Filter::CircuitBreaker,
                "VALIDATION" => Filter::Validation,
                "CACHING" => Filter::Caching(CacheFilter::new(ResponseCache::new(config.cache.max_bytes))),
                "JWT" => {
                    let jwt = config.jwt.as_ref().ok_or(FilterError::MissingJwtConfig)?;
                    Filter::Jwt(Box::new(JwtFilter::new(jwt).await?))
                }
                "CROSS" => Filter::Cross(CorsFilter::new(&config.cors)),
                _ => return Err(FilterError::Unknown(name.clone())),
            };
            filters.push(filter);
        }

        let names: Vec<&str> = filters.iter().map(Filter::name).collect();
        tracing::info!(filters = ?names, "Filter chain built");
        Ok(Self { filters })
    }

    pub fn from_filters(filters: Vec<Filter>) -> Self {
        Self { filters }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.filters.iter().map(Filter::name).collect()
    }

    pub async fn pre(&self, ctx: &mut FilterContext) -> Result<Flow, GatewayError> {
        for filter in &self.filters {
            match filter.pre(ctx).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::ShortCircuit) => return Ok(Flow::ShortCircuit),
                Err(e) => {
                    tracing::debug!(filter = filter.name(), error = %e, "Pre filter failed");
                    return Err(e);
                }
            }
        }
        Ok(Flow::Continue)
    }

    /// Server-scoped pre filters only. Runs for every server a retry picks.
    pub async fn pre_server(&self, ctx: &mut FilterContext) -> Result<(), GatewayError> {
        for filter in self.filters.iter().filter(|f| f.server_scoped()) {
            if let Err(e) = filter.pre(ctx).await {
                tracing::debug!(filter = filter.name(), error = %e, "Pre filter failed on reselected server");
                return Err(e);
            }
        }
        Ok(())
    }

    /// Server-scoped error hooks for an attempt that is about to be retried.
    pub async fn post_err_server(&self, ctx: &mut FilterContext, code: u16, err: Option<&GatewayError>) {
        for filter in self.filters.iter().rev().filter(|f| f.server_scoped()) {
            filter.post_err(ctx, code, err).await;
        }
    }

    pub async fn post(&self, ctx: &mut FilterContext) -> Result<(), GatewayError> {
        for filter in self.filters.iter().rev() {
            if let Err(e) = filter.post(ctx).await {
                tracing::debug!(filter = filter.name(), error = %e, "Post filter failed");
                return Err(e);
            }
        }
        Ok(())
    }

    pub async fn post_err(&self, ctx: &mut FilterContext, code: u16, err: Option<&GatewayError>) {
        for filter in self.filters.iter().rev() {
            filter.post_err(ctx, code, err).await;
        }
    }
}
