//! `JWT` filter.
//!
//! # Responsibilities
//! - Read the token from a header, query arg or cookie
//! - Verify its HMAC signature (HS256, HS384, HS512)
//! - Run the configured actions in order: store checks, expiry checks,
//!   renewals and claim forwarding
//! - Hand a renewed token back to the client in the post phase
//!
//! Only APIs whose `auth_filter` names this filter are checked. A missing
//! or invalid token gives 403, an action that says no gives 403, and an
//! action that fails (store unreachable) gives 500.

use async_trait::async_trait;
use axum::http::{HeaderName, HeaderValue};
use dashmap::DashMap;
use jsonwebtoken::{decode, encode, get_current_timestamp, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::context::{attr, Flow, FilterContext};
use super::FilterError;
use crate::config::schema::{JwtAction, JwtConfig};
use crate::error::GatewayError;

pub const NAME: &str = "JWT";

type Claims = Map<String, Value>;

/// Key/value store holding issued tokens. TTLs follow Redis conventions:
/// `-2` missing, `-1` no expiry.
#[async_trait]
pub trait TokenStore: Send + Sync + std::fmt::Debug {
    async fn exists(&self, key: &str) -> Result<bool, GatewayError>;
    async fn ttl(&self, key: &str) -> Result<i64, GatewayError>;
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), GatewayError>;
}

fn store_error(e: impl std::fmt::Display) -> GatewayError {
    GatewayError::Filter {
        filter: NAME,
        reason: e.to_string(),
    }
}

pub struct RedisTokenStore {
    conn: ConnectionManager,
}

impl std::fmt::Debug for RedisTokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisTokenStore").finish()
    }
}

impl RedisTokenStore {
    pub async fn connect(url: &str) -> Result<Self, FilterError> {
        let client = redis::Client::open(url).map_err(|e| FilterError::Jwt(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| FilterError::Jwt(e.to_string()))?;
        tracing::info!(url = %url, "JWT token store connected");
        Ok(Self { conn })
    }
}

#[async_trait]
impl TokenStore for RedisTokenStore {
    async fn exists(&self, key: &str) -> Result<bool, GatewayError> {
        let mut conn = self.conn.clone();
        conn.exists(key).await.map_err(store_error)
    }

    async fn ttl(&self, key: &str) -> Result<i64, GatewayError> {
        let mut conn = self.conn.clone();
        conn.ttl(key).await.map_err(store_error)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), GatewayError> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl_secs)
            .await
            .map_err(store_error)
    }
}

/// Process-local token store.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    entries: DashMap<String, (String, Option<Instant>)>,
}

impl MemoryTokenStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, key: &str, value: &str, ttl: Option<Duration>) {
        self.entries
            .insert(key.to_string(), (value.to_string(), ttl.map(|t| Instant::now() + t)));
    }

    fn live(&self, key: &str) -> Option<Option<Instant>> {
        let expires = self.entries.get(key)?.1;
        match expires {
            Some(at) if at <= Instant::now() => {
                self.entries.remove(key);
                None
            }
            other => Some(other),
        }
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn exists(&self, key: &str) -> Result<bool, GatewayError> {
        Ok(self.live(key).is_some())
    }

    async fn ttl(&self, key: &str) -> Result<i64, GatewayError> {
        Ok(match self.live(key) {
            None => -2,
            Some(None) => -1,
            Some(Some(at)) => at.saturating_duration_since(Instant::now()).as_secs() as i64,
        })
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), GatewayError> {
        self.set(key, value, Some(Duration::from_secs(ttl_secs)));
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum Lookup {
    Header { name: String, schema: String },
    Query(String),
    Cookie(String),
}

impl Lookup {
    fn parse(spec: &str, schema: &str) -> Result<Self, FilterError> {
        let (kind, name) = spec
            .split_once(':')
            .ok_or_else(|| FilterError::Jwt(format!("token lookup must be <source>:<name>: {spec}")))?;
        Ok(match kind {
            "query" => Lookup::Query(name.to_string()),
            "cookie" => Lookup::Cookie(name.to_string()),
            _ => Lookup::Header {
                name: name.to_string(),
                schema: schema.to_string(),
            },
        })
    }

    fn token(&self, ctx: &FilterContext) -> Option<String> {
        let token = match self {
            Lookup::Query(name) => ctx.origin.query(name),
            Lookup::Cookie(name) => ctx.origin.cookie(name).map(str::to_string),
            Lookup::Header { name, schema } => {
                let value = ctx.origin.header(name)?;
                if schema.is_empty() {
                    Some(value.to_string())
                } else {
                    // "<schema> <token>"
                    let rest = value.strip_prefix(schema.as_str())?;
                    (rest.len() > 1).then(|| rest[1..].to_string())
                }
            }
        };
        token.filter(|t| !t.is_empty())
    }
}

fn algorithm(method: &str) -> Result<Algorithm, FilterError> {
    match method {
        "HS256" => Ok(Algorithm::HS256),
        "HS384" => Ok(Algorithm::HS384),
        "HS512" => Ok(Algorithm::HS512),
        other => Err(FilterError::Jwt(format!("unsupported method: {other}"))),
    }
}

fn claim_text(claims: &Claims, field: &str) -> String {
    match claims.get(field) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

pub struct JwtFilter {
    config: JwtConfig,
    algorithm: Algorithm,
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    lookup: Lookup,
    renew_header: Option<HeaderName>,
    store: Option<Arc<dyn TokenStore>>,
}

impl std::fmt::Debug for JwtFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtFilter")
            .field("algorithm", &self.algorithm)
            .field("lookup", &self.lookup)
            .field("actions", &self.config.actions.len())
            .finish()
    }
}

fn needs_store(action: &JwtAction) -> bool {
    matches!(
        action,
        JwtAction::TokenInRedis { .. } | JwtAction::ExpireByRedis { .. } | JwtAction::RenewByRedis { .. }
    )
}

impl JwtFilter {
    /// Build the filter, connecting to Redis when `redis_url` is set.
    pub async fn new(config: &JwtConfig) -> Result<Self, FilterError> {
        let store: Option<Arc<dyn TokenStore>> = match config.redis_url.as_deref() {
            Some(url) => Some(Arc::new(RedisTokenStore::connect(url).await?)),
            None if config.actions.iter().any(needs_store) => {
                tracing::warn!("JWT actions need a token store, using an in-memory one");
                Some(MemoryTokenStore::new())
            }
            None => None,
        };
        Self::with_store(config, store)
    }

    pub fn with_store(config: &JwtConfig, store: Option<Arc<dyn TokenStore>>) -> Result<Self, FilterError> {
        let algorithm = algorithm(&config.method)?;
        if config.secret.is_empty() {
            return Err(FilterError::Jwt("missing secret".into()));
        }

        let mut validation = Validation::new(algorithm);
        validation.algorithms = vec![Algorithm::HS256, Algorithm::HS384, Algorithm::HS512];
        validation.required_spec_claims = HashSet::new();
        validation.validate_aud = false;
        validation.leeway = 0;

        let renew_header = if config.renew_header.is_empty() {
            None
        } else {
            Some(
                HeaderName::try_from(config.renew_header.as_str())
                    .map_err(|e| FilterError::Jwt(e.to_string()))?,
            )
        };

        Ok(Self {
            algorithm,
            encoding: EncodingKey::from_secret(config.secret.as_bytes()),
            decoding: DecodingKey::from_secret(config.secret.as_bytes()),
            validation,
            lookup: Lookup::parse(&config.token_lookup, &config.auth_schema)?,
            renew_header,
            store,
            config: config.clone(),
        })
    }

    fn applies(ctx: &FilterContext) -> bool {
        ctx.api
            .auth_filter
            .as_deref()
            .is_some_and(|name| name.eq_ignore_ascii_case(NAME))
    }

    fn store(&self) -> Result<&Arc<dyn TokenStore>, GatewayError> {
        self.store.as_ref().ok_or_else(|| store_error("token store not configured"))
    }

    pub async fn pre(&self, ctx: &mut FilterContext) -> Result<Flow, GatewayError> {
        if !Self::applies(ctx) {
            return Ok(Flow::Continue);
        }

        let token = self.lookup.token(ctx).ok_or(GatewayError::MissingToken)?;
        let mut claims = decode::<Claims>(&token, &self.decoding, &self.validation)
            .map_err(|e| GatewayError::InvalidToken(e.to_string()))?
            .claims;

        for action in &self.config.actions {
            if !self.run(action, &token, &mut claims, ctx).await? {
                tracing::debug!(api = %ctx.api.name, action = ?action, "JWT action rejected token");
                return Err(GatewayError::InvalidToken("rejected by action".into()));
            }
        }
        Ok(Flow::Continue)
    }

    async fn run(
        &self,
        action: &JwtAction,
        token: &str,
        claims: &mut Claims,
        ctx: &mut FilterContext,
    ) -> Result<bool, GatewayError> {
        match action {
            JwtAction::TokenInRedis { prefix } => self.store()?.exists(&format!("{prefix}{token}")).await,
            JwtAction::ExpireByRaw => Ok(claims
                .get("exp")
                .and_then(Value::as_u64)
                .is_some_and(|exp| exp > get_current_timestamp())),
            JwtAction::ExpireByRedis { prefix } => {
                let ttl = self.store()?.ttl(&format!("{prefix}{token}")).await?;
                Ok(ttl != -2 && ttl != 0)
            }
            JwtAction::RenewByRaw { ttl_secs } => {
                if claims.contains_key("exp") {
                    claims.insert("exp".into(), Value::from(get_current_timestamp() + ttl_secs));
                    let renewed = encode(&Header::new(self.algorithm), &*claims, &self.encoding)
                        .map_err(store_error)?;
                    ctx.set_attr(attr::RENEWED_TOKEN, renewed);
                }
                Ok(true)
            }
            JwtAction::RenewByRedis { prefix, ttl_secs } => {
                let key = format!("{prefix}{token}");
                let store = self.store()?;
                match store.ttl(&key).await? {
                    -2 | 0 => Ok(false),
                    -1 => Ok(true),
                    _ => {
                        store.set_ex(&key, token, *ttl_secs).await?;
                        Ok(true)
                    }
                }
            }
            JwtAction::FetchToHeader { prefix, fields } => {
                for field in fields {
                    let name = HeaderName::try_from(format!("{prefix}{field}"));
                    let value = HeaderValue::from_str(&claim_text(claims, field));
                    if let (Ok(name), Ok(value)) = (name, value) {
                        ctx.forward.headers.append(name, value);
                    }
                }
                Ok(true)
            }
            JwtAction::FetchToCookie { prefix, fields } => {
                for field in fields {
                    ctx.forward
                        .add_cookie(&format!("{prefix}{field}"), &claim_text(claims, field));
                }
                Ok(true)
            }
        }
    }

    pub fn post(&self, ctx: &mut FilterContext) -> Result<(), GatewayError> {
        let Some(token) = ctx.take_attr(attr::RENEWED_TOKEN) else {
            return Ok(());
        };
        let (Some(name), Some(resp)) = (self.renew_header.as_ref(), ctx.response.as_mut()) else {
            return Ok(());
        };
        if let Ok(value) = HeaderValue::from_str(&token) {
            resp.headers.append(name.clone(), value);
        }
        Ok(())
    }
}
