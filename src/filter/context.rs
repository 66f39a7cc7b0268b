//! Per-node state shared by the filters of one dispatch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::http::request::{ForwardRequest, OriginRequest};
use crate::http::response::BackendResponse;
use crate::load_balancer::ServerRuntime;
use crate::model::{Api, DispatchNodeSpec};
use crate::observability::Analysis;
use crate::routing::{Params, RuleMatcher};
use crate::timer::TimingWheel;

/// Attribute keys written by filters.
pub mod attr {
    pub const REAL_IP: &str = "real-ip";
    pub const CACHE_KEY: &str = "cache-key";
    pub const RENEWED_TOKEN: &str = "jwt-renewed-token";
}

/// What the chain tells the engine after the pre phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Skip the forward; `ctx.response` already holds the answer.
    ShortCircuit,
}

/// Services every filter may reach.
#[derive(Debug, Clone)]
pub struct Shared {
    pub analysis: Arc<Analysis>,
    pub wheel: Arc<TimingWheel>,
    pub matcher: Arc<RuleMatcher>,
}

#[derive(Debug)]
pub struct FilterContext {
    pub origin: Arc<OriginRequest>,
    pub params: Arc<Params>,
    pub api: Arc<Api>,
    node_index: Option<usize>,
    pub forward: ForwardRequest,
    pub response: Option<BackendResponse>,
    pub server: Option<Arc<ServerRuntime>>,
    pub shared: Shared,
    pub cancel: CancellationToken,
    attrs: HashMap<&'static str, String>,
    pub start: Instant,
    pub end: Option<Instant>,
}

impl FilterContext {
    pub fn new(
        origin: Arc<OriginRequest>,
        params: Arc<Params>,
        api: Arc<Api>,
        node_index: Option<usize>,
        server: Option<Arc<ServerRuntime>>,
        shared: Shared,
        cancel: CancellationToken,
    ) -> Self {
        let forward = ForwardRequest::from_origin(&origin);
        Self {
            origin,
            params,
            api,
            node_index,
            forward,
            response: None,
            server,
            shared,
            cancel,
            attrs: HashMap::new(),
            start: Instant::now(),
            end: None,
        }
    }

    /// The dispatch node this context forwards for.
    pub fn node(&self) -> Option<&DispatchNodeSpec> {
        self.api.nodes.get(self.node_index?)
    }

    /// True when the API fans out to exactly one node.
    pub fn single_node(&self) -> bool {
        self.api.nodes.len() == 1
    }

    pub fn set_attr(&mut self, key: &'static str, value: String) {
        self.attrs.insert(key, value);
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }

    pub fn take_attr(&mut self, key: &str) -> Option<String> {
        self.attrs.remove(key)
    }

    /// Client IP recorded by the prepare filter, else resolved now.
    pub fn real_ip(&self) -> String {
        self.attr(attr::REAL_IP)
            .map(str::to_string)
            .unwrap_or_else(|| self.origin.real_ip())
    }

    pub fn server_id(&self) -> Option<u64> {
        self.server.as_ref().map(|s| s.id())
    }

    pub fn cost(&self) -> Duration {
        self.end.unwrap_or_else(Instant::now).duration_since(self.start)
    }
}
