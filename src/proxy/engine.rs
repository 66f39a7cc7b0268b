//! Request dispatch engine.
//!
//! # Responsibilities
//! - Route a request to an API through the current snapshot
//! - Pick a server per dispatch node, honoring split and copy routings
//! - Run batches of nodes: one node inline, several on the dispatch pool
//! - Drive the filter chain and the retry loop around each forward
//! - Send shadow copies and render the final response

use axum::body::Body;
use axum::http::Response;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::schema::ProxyConfig;
use crate::dispatch::{DispatchTable, Snapshot};
use crate::error::GatewayError;
use crate::filter::{FilterChain, FilterContext, Flow, Shared};
use crate::http::request::{ForwardRequest, OriginRequest};
use crate::http::response::{status_response, BackendResponse};
use crate::lifecycle::Shutdown;
use crate::load_balancer::ServerRuntime;
use crate::model::{Api, DispatchNodeSpec, RoutingStrategy, Status};
use crate::observability::metrics::{self, RequestKind};
use crate::proxy::client::{BackendClient, ClientOptions};
use crate::proxy::render::{render, render_default, MultiContext, NodeResult};
use crate::proxy::worker::WorkerPool;
use crate::resilience::retries::{next_delay, Attempt};
use crate::routing::{rewrite, Params, RuleMatcher};
use crate::security::headers::strip_hop_by_hop;

/// Server choice for one dispatch node.
#[derive(Debug, Clone)]
struct NodePlan {
    index: usize,
    /// Cluster the server came from; retries reselect from it.
    cluster_id: u64,
    server: Option<Arc<ServerRuntime>>,
    shadow: Option<Arc<ServerRuntime>>,
}

/// Everything the nodes of one request share.
#[derive(Clone)]
struct RequestScope {
    snapshot: Arc<Snapshot>,
    api: Arc<Api>,
    origin: Arc<OriginRequest>,
    params: Arc<Params>,
    real_ip: Arc<str>,
    cancel: CancellationToken,
    multi: Arc<MultiContext>,
}

pub struct Gateway {
    table: Arc<DispatchTable>,
    chain: FilterChain,
    client: Arc<BackendClient>,
    dispatch_pool: Arc<WorkerPool>,
    copy_pool: Arc<WorkerPool>,
    shared: Shared,
    stopped: AtomicBool,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("filters", &self.chain.names())
            .field("dispatch_workers", &self.dispatch_pool.workers())
            .field("copy_workers", &self.copy_pool.workers())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl Gateway {
    pub fn new(config: &ProxyConfig, table: Arc<DispatchTable>, chain: FilterChain) -> Arc<Self> {
        let limits = &config.limits;
        let shared = Shared {
            analysis: table.analysis().clone(),
            wheel: table.wheel().clone(),
            matcher: Arc::new(RuleMatcher::new()),
        };
        Arc::new(Self {
            table,
            chain,
            client: BackendClient::new(ClientOptions::from_limits(limits)),
            dispatch_pool: WorkerPool::new("dispatch", limits.dispatch_workers, limits.worker_queue),
            copy_pool: WorkerPool::new("copy", limits.copy_workers, limits.worker_queue),
            shared,
            stopped: AtomicBool::new(false),
        })
    }

    /// Spawn the worker pools and the connection cleaner.
    pub fn start(&self, shutdown: &Shutdown) -> Vec<JoinHandle<()>> {
        let mut handles = self.dispatch_pool.start(shutdown);
        handles.extend(self.copy_pool.start(shutdown));

        let client = self.client.clone();
        let interval = client.defaults().max_idle_duration / 2;
        handles.push(tokio::spawn(client.run_cleaner(interval, shutdown.subscribe())));
        handles
    }

    /// New requests get 503 from now on.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        tracing::info!("Gateway stopped accepting requests");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn table(&self) -> &Arc<DispatchTable> {
        &self.table
    }

    pub fn client(&self) -> &Arc<BackendClient> {
        &self.client
    }

    pub fn matcher(&self) -> &Arc<RuleMatcher> {
        &self.shared.matcher
    }

    /// Serve one buffered request. `cancel` fires when the client goes away.
    pub async fn handle(self: &Arc<Self>, origin: OriginRequest, cancel: CancellationToken) -> Response<Body> {
        if self.is_stopped() {
            return status_response(GatewayError::Stopped.status_code());
        }

        let snapshot = self.table.snapshot();
        let Some((api, params)) = self.route(&snapshot, &origin) else {
            tracing::debug!(
                request_id = %origin.request_id(),
                method = %origin.method,
                uri = %origin.request_uri(),
                "No api matched"
            );
            return status_response(GatewayError::NoMatchingApi.status_code());
        };

        let start = Instant::now();
        let real_ip: Arc<str> = Arc::from(origin.real_ip());
        let scope = RequestScope {
            snapshot,
            api: api.clone(),
            origin: Arc::new(origin),
            params: Arc::new(params),
            real_ip,
            cancel,
            multi: Arc::new(MultiContext::new()),
        };

        let (response, kind) = if api.use_default || api.nodes.is_empty() {
            if api.default_value.is_none() {
                return status_response(GatewayError::NoMatchingApi.status_code());
            }
            (render_default(api.default_value.as_ref()), RequestKind::Succeed)
        } else {
            let plans = self.resolve(&scope);
            self.send_copies(&scope, &plans);

            let results = self.dispatch(&scope, plans).await;
            if scope.cancel.is_cancelled() {
                tracing::debug!(request_id = %scope.origin.request_id(), api = %api.name, "Client went away");
                return status_response(GatewayError::UserCancel.status_code());
            }
            let error = first_error(&results);
            let response = render(&api, results, &scope.multi);
            let kind = RequestKind::classify(error.as_ref(), response.status().as_u16());
            (response, kind)
        };

        metrics::record_request(&api.name, RequestKind::All);
        metrics::record_request(&api.name, kind);
        metrics::record_duration(&api.name, start.elapsed());
        response
    }

    /// API for the request, if it is up, on the right domain and matches.
    fn route(&self, snapshot: &Snapshot, origin: &OriginRequest) -> Option<(Arc<Api>, Params)> {
        let (api, params) = snapshot.route(origin.path(), origin.method.as_str()).ok()?;
        if api.status != Status::Up {
            return None;
        }
        if let Some(domain) = api.domain.as_deref() {
            let host = origin.host().unwrap_or_default();
            let bare = host.rsplit_once(':').map_or(host, |(h, _)| h);
            if !host.eq_ignore_ascii_case(domain) && !bare.eq_ignore_ascii_case(domain) {
                return None;
            }
        }
        if let Some(predicate) = api.matches.as_ref() {
            if !self.shared.matcher.predicate_matches(predicate, origin, &params) {
                return None;
            }
        }
        Some((api, params))
    }

    /// Backend URL for a websocket upgrade: the first node of the routed
    /// API on a balanced server. Filters and render do not apply.
    pub fn websocket_target(&self, origin: &OriginRequest) -> Result<String, GatewayError> {
        if self.is_stopped() {
            return Err(GatewayError::Stopped);
        }
        let snapshot = self.table.snapshot();
        let (api, params) = self.route(&snapshot, origin).ok_or(GatewayError::NoMatchingApi)?;
        let node = api.nodes.first().ok_or(GatewayError::NoMatchingApi)?;
        let server = snapshot
            .select_server(node.cluster_id, &origin.real_ip())
            .ok_or(GatewayError::NoServer)?;

        let mut forward = ForwardRequest::from_origin(origin);
        if let Some(template) = node.url_rewrite.as_deref() {
            forward.set_uri(rewrite(template, &params).ok_or(GatewayError::RewriteNotMatch)?);
        }
        let scheme = if server.meta.scheme.eq_ignore_ascii_case("https") { "wss" } else { "ws" };
        Ok(format!("{scheme}://{}{}", server.meta.addr, forward.uri))
    }

    /// Pick a server per node and apply the routing rules.
    fn resolve(&self, scope: &RequestScope) -> Vec<NodePlan> {
        let snapshot = &scope.snapshot;
        let ip = &*scope.real_ip;
        scope
            .api
            .nodes
            .iter()
            .enumerate()
            .map(|(index, node)| {
                let mut plan = NodePlan {
                    index,
                    cluster_id: node.cluster_id,
                    server: snapshot.select_server(node.cluster_id, ip),
                    shadow: None,
                };
                let routing = self.shared.matcher.select(
                    &snapshot.routings,
                    scope.api.id,
                    &scope.origin,
                    &scope.params,
                );
                if let Some(rule) = routing {
                    match rule.strategy {
                        RoutingStrategy::Split => {
                            plan.cluster_id = rule.cluster_id;
                            plan.server = snapshot.select_server(rule.cluster_id, ip);
                        }
                        RoutingStrategy::Copy => {
                            plan.shadow = snapshot.select_server(rule.cluster_id, ip);
                        }
                    }
                    tracing::debug!(routing = rule.id, strategy = ?rule.strategy, node = index, "Routing rule applied");
                }
                plan
            })
            .collect()
    }

    /// Fire-and-forget duplicates to shadow servers.
    fn send_copies(&self, scope: &RequestScope, plans: &[NodePlan]) {
        for plan in plans {
            let Some(shadow) = plan.shadow.clone() else {
                continue;
            };
            let node = &scope.api.nodes[plan.index];
            let mut forward = ForwardRequest::from_origin(&scope.origin);
            if let Some(uri) = node.url_rewrite.as_deref().and_then(|t| rewrite(t, &scope.params)) {
                forward.set_uri(uri);
            }
            strip_hop_by_hop(&mut forward.headers);

            let shadow_id = shadow.id();
            let client = self.client.clone();
            let opts = client.defaults().with_node(node.http_option.as_ref());
            let queued = self.copy_pool.try_submit(Box::pin(async move {
                if let Err(e) = client.send(&shadow.meta.scheme, &shadow.meta.addr, &forward, &opts).await {
                    tracing::debug!(server = %shadow.meta.addr, error = %e, "Shadow copy failed");
                }
            }));
            if !queued {
                tracing::debug!(server_id = shadow_id, "Shadow copy dropped");
            }
        }
    }

    /// Run the nodes batch by batch; results come back in node order.
    async fn dispatch(self: &Arc<Self>, scope: &RequestScope, plans: Vec<NodePlan>) -> Vec<NodeResult> {
        let nodes = &scope.api.nodes;
        let mut results: Vec<Option<NodeResult>> = vec![None; nodes.len()];

        if plans.len() == 1 {
            for plan in plans {
                let index = plan.index;
                results[index] = Some(self.run_node(scope, plan).await);
            }
        } else {
            let mut batches: BTreeMap<u32, Vec<NodePlan>> = BTreeMap::new();
            for plan in plans {
                batches.entry(nodes[plan.index].batch_index).or_default().push(plan);
            }

            for (batch, plans) in batches {
                if scope.cancel.is_cancelled() {
                    break;
                }
                tracing::trace!(batch, nodes = plans.len(), "Dispatching batch");

                let mut waits = Vec::with_capacity(plans.len());
                for plan in plans {
                    let index = plan.index;
                    let (tx, rx) = oneshot::channel();
                    let gateway = self.clone();
                    let node_scope = scope.clone();
                    let job = Box::pin(async move {
                        let result = gateway.run_node(&node_scope, plan).await;
                        let _ = tx.send(result);
                    });
                    match self.dispatch_pool.submit(job).await {
                        Ok(()) => waits.push((index, rx)),
                        Err(e) => results[index] = Some(NodeResult::failed(&nodes[index].attr_name, e)),
                    }
                }
                for (index, rx) in waits {
                    let result = rx
                        .await
                        .unwrap_or_else(|_| NodeResult::failed(&nodes[index].attr_name, GatewayError::Stopped));
                    results[index] = Some(result);
                }
            }
        }

        results
            .into_iter()
            .enumerate()
            .map(|(i, r)| r.unwrap_or_else(|| NodeResult::failed(&nodes[i].attr_name, GatewayError::UserCancel)))
            .collect()
    }

    async fn run_node(&self, scope: &RequestScope, plan: NodePlan) -> NodeResult {
        let api = scope.api.clone();
        let node = &api.nodes[plan.index];

        if node.use_default {
            let mut result = NodeResult::new(&node.attr_name);
            if let Some(default) = node.default_value.as_ref() {
                let resp = BackendResponse::from_default(default);
                result.code = resp.status.as_u16();
                result.response = Some(resp);
            }
            return self.settle(scope, node, result);
        }

        let Some(server) = plan.server.clone() else {
            return self.settle(scope, node, NodeResult::failed(&node.attr_name, GatewayError::NoServer));
        };

        let mut ctx = FilterContext::new(
            scope.origin.clone(),
            scope.params.clone(),
            scope.api.clone(),
            Some(plan.index),
            Some(server),
            self.shared.clone(),
            scope.cancel.clone(),
        );

        if let Some(template) = node.url_rewrite.as_deref() {
            match rewrite(template, &scope.params).filter(|u| !u.is_empty()) {
                Some(uri) => ctx.forward.set_uri(uri),
                None => {
                    let err = GatewayError::RewriteNotMatch;
                    return self.settle(scope, node, NodeResult::failed(&node.attr_name, err));
                }
            }
        }

        match self.chain.pre(&mut ctx).await {
            Ok(Flow::Continue) => {}
            Ok(Flow::ShortCircuit) => {
                ctx.end = Some(Instant::now());
                let mut result = NodeResult::new(&node.attr_name);
                result.code = ctx.response.as_ref().map_or(200, |r| r.status.as_u16());
                result.response = ctx.response.take();
                return self.settle(scope, node, result);
            }
            Err(e) => return self.settle(scope, node, NodeResult::failed(&node.attr_name, e)),
        }

        let outcome = self.forward(scope, &plan, node, &mut ctx).await;
        ctx.end = Some(Instant::now());

        let result = match outcome {
            Ok(resp) if !resp.is_error() => {
                ctx.response = Some(resp);
                match self.chain.post(&mut ctx).await {
                    Ok(()) => {
                        let mut result = NodeResult::new(&node.attr_name);
                        result.response = ctx.response.take();
                        result.code = result.response.as_ref().map_or(200, |r| r.status.as_u16());
                        result
                    }
                    Err(e) => NodeResult::failed(&node.attr_name, e),
                }
            }
            Ok(resp) => {
                let code = resp.status.as_u16();
                self.chain.post_err(&mut ctx, code, None).await;
                let mut result = NodeResult::new(&node.attr_name);
                result.code = code;
                result.response = Some(resp);
                result
            }
            Err(e) => {
                let code = e.status_code().as_u16();
                self.chain.post_err(&mut ctx, code, Some(&e)).await;
                NodeResult::failed(&node.attr_name, e)
            }
        };
        self.settle(scope, node, result)
    }

    /// Send with retries. Each retry settles the failed attempt on its
    /// server, waits the strategy interval, reselects a server from the
    /// node's cluster and runs the server-scoped pre filters for it.
    async fn forward(
        &self,
        scope: &RequestScope,
        plan: &NodePlan,
        node: &DispatchNodeSpec,
        ctx: &mut FilterContext,
    ) -> Result<BackendResponse, GatewayError> {
        let opts = self.client.defaults().with_node(node.http_option.as_ref());
        let mut sent = 0;

        loop {
            let Some(server) = ctx.server.clone() else {
                return Err(GatewayError::NoServer);
            };

            let outcome = tokio::select! {
                r = self.client.send(&server.meta.scheme, &server.meta.addr, &ctx.forward, &opts) => {
                    r.map_err(GatewayError::from)
                }
                _ = scope.cancel.cancelled() => Err(GatewayError::UserCancel),
            };
            sent += 1;

            let attempt = match &outcome {
                Ok(resp) => Attempt::Status(resp.status.as_u16()),
                Err(e) if e.is_user_cancel() => Attempt::Cancelled,
                Err(_) => Attempt::Transport,
            };
            if let Err(e) = &outcome {
                tracing::debug!(server = %server.meta.addr, attempt = sent, error = %e, "Forward failed");
            }

            let Some(delay) = next_delay(node.retry.as_ref(), sent, attempt) else {
                return outcome;
            };
            tracing::debug!(
                api = %scope.api.name,
                server = %server.meta.addr,
                attempt = sent,
                delay_ms = delay.as_millis() as u64,
                "Retrying forward"
            );

            let code = match &outcome {
                Ok(resp) => resp.status.as_u16(),
                Err(e) => e.status_code().as_u16(),
            };
            self.chain.post_err_server(ctx, code, outcome.as_ref().err()).await;

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = scope.cancel.cancelled() => return Err(GatewayError::UserCancel),
            }
            ctx.server = scope.snapshot.select_server(plan.cluster_id, &scope.real_ip);
            ctx.start = Instant::now();
            if let Err(e) = self.chain.pre_server(ctx).await {
                // a server that refused the attempt is not charged a failure
                ctx.server = None;
                return Err(e);
            }
        }
    }

    /// Apply the node default on failure and publish the body for merging.
    fn settle(&self, scope: &RequestScope, node: &DispatchNodeSpec, mut result: NodeResult) -> NodeResult {
        if result.has_error() {
            if let Some(default) = node.default_value.as_ref() {
                let resp = BackendResponse::from_default(default);
                result.code = resp.status.as_u16();
                result.response = Some(resp);
                result.defaulted = true;
            }
        }
        if scope.api.nodes.len() > 1 && !result.has_error() {
            if let Some(resp) = result.response.as_ref() {
                scope.multi.complete_part(&node.attr_name, &resp.body);
            }
        }
        result
    }
}

/// First error of a node that was not rescued by its default value.
fn first_error(results: &[NodeResult]) -> Option<GatewayError> {
    results
        .iter()
        .filter(|r| r.has_error())
        .find_map(|r| r.error.clone())
}
