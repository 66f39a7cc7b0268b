//! Response cache for the `CACHING` filter.
//!
//! # Design Decisions
//! - Bounded by body bytes, not entry count; inserts evict least recently
//!   used entries until the new entry fits
//! - Expiry is a timing-wheel task per entry; a replaced entry carries a
//!   generation so a stale timer cannot evict its successor
//! - Only 2xx responses are stored

use axum::body::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;

use super::context::{attr, Flow, FilterContext};
use crate::error::GatewayError;
use crate::http::response::BackendResponse;
use crate::timer::TimingWheel;

#[derive(Debug, Clone)]
struct Entry {
    content_type: Option<String>,
    body: Bytes,
    /// Recency stamp, key into `order`.
    stamp: u64,
    /// Stamp at insert; a TTL timer only evicts its own generation.
    generation: u64,
}

#[derive(Debug, Default)]
struct Lru {
    entries: HashMap<String, Entry>,
    order: BTreeMap<u64, String>,
    clock: u64,
    bytes: usize,
}

impl Lru {
    fn touch(&mut self, key: &str) -> Option<&Entry> {
        self.clock += 1;
        let clock = self.clock;
        let entry = self.entries.get_mut(key)?;
        self.order.remove(&entry.stamp);
        entry.stamp = clock;
        self.order.insert(clock, key.to_string());
        Some(entry)
    }

    fn remove(&mut self, key: &str) -> Option<Entry> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.stamp);
        self.bytes -= entry.body.len();
        Some(entry)
    }

    fn evict_oldest(&mut self) -> bool {
        let Some((_, key)) = self.order.pop_first() else {
            return false;
        };
        if let Some(entry) = self.entries.remove(&key) {
            self.bytes -= entry.body.len();
        }
        true
    }
}

/// Byte-bounded LRU of `(content type, body)` pairs.
#[derive(Debug)]
pub struct ResponseCache {
    max_bytes: usize,
    inner: Mutex<Lru>,
}

impl ResponseCache {
    pub fn new(max_bytes: usize) -> Arc<Self> {
        Arc::new(Self {
            max_bytes,
            inner: Mutex::new(Lru::default()),
        })
    }

    pub fn get(&self, key: &str) -> Option<(Option<String>, Bytes)> {
        let mut lru = self.inner.lock();
        lru.touch(key).map(|e| (e.content_type.clone(), e.body.clone()))
    }

    /// Store an entry and return its stamp. Bodies larger than the whole
    /// cache are refused.
    pub fn insert(&self, key: String, content_type: Option<String>, body: Bytes) -> Option<u64> {
        if body.len() > self.max_bytes {
            return None;
        }

        let mut lru = self.inner.lock();
        lru.remove(&key);
        while lru.bytes + body.len() > self.max_bytes {
            if !lru.evict_oldest() {
                break;
            }
        }

        lru.clock += 1;
        let stamp = lru.clock;
        lru.bytes += body.len();
        lru.order.insert(stamp, key.clone());
        lru.entries.insert(
            key,
            Entry {
                content_type,
                body,
                stamp,
                generation: stamp,
            },
        );
        Some(stamp)
    }

    /// Remove `key` only if it is still the entry inserted at `generation`.
    fn expire(&self, key: &str, generation: u64) {
        let mut lru = self.inner.lock();
        if lru.entries.get(key).is_some_and(|e| e.generation == generation) {
            lru.remove(key);
        }
    }

    pub fn remove(&self, key: &str) -> bool {
        self.inner.lock().remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bytes(&self) -> usize {
        self.inner.lock().bytes
    }

    /// Insert and schedule the TTL eviction.
    pub fn insert_with_ttl(self: &Arc<Self>, wheel: &TimingWheel, key: String, ttl: Duration, value: (Option<String>, Bytes)) {
        let Some(stamp) = self.insert(key.clone(), value.0, value.1) else {
            return;
        };
        let weak: Weak<Self> = Arc::downgrade(self);
        wheel.schedule(ttl, move || {
            if let Some(cache) = weak.upgrade() {
                cache.expire(&key, stamp);
            }
        });
    }
}

/// `requestURI-v1-v2...` over the node's key params.
fn cache_key(ctx: &FilterContext) -> Option<String> {
    let policy = ctx.node()?.cache.as_ref()?;
    let mut key = ctx.origin.request_uri().to_string();
    for param in &policy.keys {
        key.push('-');
        if let Some(v) = ctx.origin.value(param.source, &param.name, &ctx.params) {
            key.push_str(&v);
        }
    }
    Some(key)
}

#[derive(Debug)]
pub struct CacheFilter {
    cache: Arc<ResponseCache>,
}

impl CacheFilter {
    pub fn new(cache: Arc<ResponseCache>) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub fn pre(&self, ctx: &mut FilterContext) -> Result<Flow, GatewayError> {
        let Some(policy) = ctx.node().and_then(|n| n.cache.as_ref()) else {
            return Ok(Flow::Continue);
        };
        if !ctx
            .shared
            .matcher
            .all_match(&policy.conditions, &ctx.origin, &ctx.params)
        {
            return Ok(Flow::Continue);
        }
        let Some(key) = cache_key(ctx) else {
            return Ok(Flow::Continue);
        };

        if let Some((content_type, body)) = self.cache.get(&key) {
            tracing::debug!(key = %key, "Cache hit");
            ctx.response = Some(BackendResponse::cached(content_type.as_deref(), body));
            return Ok(Flow::ShortCircuit);
        }

        ctx.set_attr(attr::CACHE_KEY, key);
        Ok(Flow::Continue)
    }

    pub fn post(&self, ctx: &mut FilterContext) -> Result<(), GatewayError> {
        let Some(key) = ctx.take_attr(attr::CACHE_KEY) else {
            return Ok(());
        };
        let Some(ttl) = ctx.node().and_then(|n| n.cache.as_ref()).map(|p| p.ttl_secs) else {
            return Ok(());
        };
        let Some(resp) = ctx.response.as_ref().filter(|r| r.status.is_success()) else {
            return Ok(());
        };

        let value = (resp.content_type().map(str::to_string), resp.body.clone());
        self.cache
            .insert_with_ttl(&ctx.shared.wheel, key, Duration::from_secs(ttl.max(1)), value);
        Ok(())
    }
}
