//! Copy-on-write dispatch table.
//!
//! # Responsibilities
//! - Hold the current [`Snapshot`] behind one atomic pointer
//! - Apply catalog and status mutations one at a time
//! - Keep cluster active lists equal to `bound ∧ up`
//! - Start and stop per-server probes and analysis windows

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

use crate::dispatch::{Mutation, Snapshot, TableError};
use crate::health::{HealthChecker, StatusChange};
use crate::load_balancer::{ClusterRuntime, ServerRuntime, Target};
use crate::model::{Api, Bind, Cluster, Plugin, ProxyInfo, Routing, Server, Status};
use crate::observability::Analysis;
use crate::resilience::CircuitBreaker;
use crate::routing::Router;
use crate::timer::TimingWheel;

/// Window every server gets for the analysis filter and metrics.
const BASE_WINDOW: Duration = Duration::from_secs(1);

/// Work done after a snapshot is published.
enum Effect {
    Watch(Arc<ServerRuntime>),
    Unwatch(u64, Arc<CircuitBreaker>),
}

pub struct DispatchTable {
    current: ArcSwap<Snapshot>,
    write: Mutex<()>,
    wheel: Arc<TimingWheel>,
    analysis: Arc<Analysis>,
    checker: Arc<HealthChecker>,
    status_rx: Mutex<Option<mpsc::Receiver<StatusChange>>>,
}

impl std::fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.current.load();
        f.debug_struct("DispatchTable")
            .field("apis", &snapshot.apis.len())
            .field("clusters", &snapshot.clusters.len())
            .field("servers", &snapshot.servers.len())
            .field("routings", &snapshot.routings.len())
            .finish()
    }
}

impl DispatchTable {
    pub fn new(
        wheel: Arc<TimingWheel>,
        analysis: Arc<Analysis>,
        health_max_interval: Duration,
        status_buffer: usize,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(status_buffer.max(1));
        let checker = HealthChecker::new(wheel.clone(), tx, health_max_interval);

        Arc::new(Self {
            current: ArcSwap::from_pointee(Snapshot::default()),
            write: Mutex::new(()),
            wheel,
            analysis,
            checker,
            status_rx: Mutex::new(Some(rx)),
        })
    }

    /// The current view. Cheap; hold it for the whole request.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }

    pub fn analysis(&self) -> &Arc<Analysis> {
        &self.analysis
    }

    pub fn wheel(&self) -> &Arc<TimingWheel> {
        &self.wheel
    }

    /// Apply one mutation on the single mutation path.
    pub fn apply(&self, mutation: Mutation) -> Result<(), TableError> {
        let _guard = self.write.lock();
        let name = mutation.name();

        let mut next = Snapshot::clone(&self.current.load());
        let mut effects = Vec::new();
        self.mutate(&mut next, mutation, &mut effects)?;
        self.current.store(Arc::new(next));

        for effect in effects {
            match effect {
                Effect::Watch(server) => self.checker.watch(server),
                Effect::Unwatch(id, circuit) => {
                    self.checker.unwatch(id);
                    circuit.stop(&self.wheel);
                    self.analysis.remove_target(id);
                }
            }
        }

        tracing::debug!(mutation = name, "Dispatch table updated");
        Ok(())
    }

    /// Consume status changes from the health checker until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let Some(mut rx) = self.status_rx.lock().take() else {
            tracing::warn!("Dispatch table status loop already running");
            return;
        };

        loop {
            tokio::select! {
                change = rx.recv() => {
                    let Some(change) = change else { break };
                    if let Err(e) = self.apply(Mutation::ServerStatus(change)) {
                        tracing::debug!(server_id = change.server_id, error = %e, "Status change ignored");
                    }
                }
                _ = shutdown.recv() => break,
            }
        }

        self.checker.stop();
        tracing::info!("Dispatch table status loop stopped");
    }

    fn mutate(&self, next: &mut Snapshot, mutation: Mutation, effects: &mut Vec<Effect>) -> Result<(), TableError> {
        match mutation {
            Mutation::AddApi(api) => add_api(next, api),
            Mutation::UpdateApi(api) => update_api(next, api),
            Mutation::RemoveApi(id) => remove_api(next, id),

            Mutation::AddCluster(cluster) => add_cluster(next, cluster),
            Mutation::UpdateCluster(cluster) => update_cluster(next, cluster),
            Mutation::RemoveCluster(id) => remove_cluster(next, id),

            Mutation::AddServer(server) => self.add_server(next, server, effects),
            Mutation::UpdateServer(server) => self.update_server(next, server, effects),
            Mutation::RemoveServer(id) => remove_server(next, id, effects),

            Mutation::AddBind(bind) => add_bind(next, bind),
            Mutation::RemoveBind(bind) => remove_bind(next, bind),

            Mutation::AddRouting(routing) => add_routing(next, routing),
            Mutation::UpdateRouting(routing) => update_routing(next, routing),
            Mutation::RemoveRouting(id) => remove_routing(next, id),

            Mutation::AddProxy(proxy) => add_proxy(next, proxy),
            Mutation::UpdateProxy(proxy) => {
                next.proxies.insert(proxy.addr.clone(), proxy);
                Ok(())
            }
            Mutation::RemoveProxy(addr) => remove_proxy(next, &addr),

            Mutation::AddPlugin(plugin) => add_plugin(next, plugin),
            Mutation::UpdatePlugin(plugin) => update_plugin(next, plugin),
            Mutation::RemovePlugin(id) => remove_plugin(next, id),
            Mutation::SetAppliedPlugins(applied) => {
                next.applied_plugins = applied;
                Ok(())
            }

            Mutation::ServerStatus(change) => server_status(next, change),
        }
    }

    fn add_server(&self, next: &mut Snapshot, meta: Server, effects: &mut Vec<Effect>) -> Result<(), TableError> {
        meta.validate().map_err(|r| TableError::invalid("server", r))?;
        if next.servers.contains_key(&meta.id) {
            return Err(TableError::exists("server", meta.id));
        }

        let rt = Arc::new(ServerRuntime::new(meta, next.proxy_count()));
        self.add_windows(&rt.meta);
        next.servers.insert(rt.id(), rt.clone());
        tracing::info!(server_id = rt.id(), addr = %rt.meta.addr, status = ?rt.status(), "Server added");
        effects.push(Effect::Watch(rt));
        Ok(())
    }

    fn update_server(&self, next: &mut Snapshot, meta: Server, effects: &mut Vec<Effect>) -> Result<(), TableError> {
        meta.validate().map_err(|r| TableError::invalid("server", r))?;
        let old = next
            .servers
            .get(&meta.id)
            .cloned()
            .ok_or_else(|| TableError::not_found("server", meta.id))?;

        let rt = Arc::new(old.with_meta(meta, next.proxy_count()));
        self.analysis.remove_target(rt.id());
        self.add_windows(&rt.meta);
        next.servers.insert(rt.id(), rt.clone());
        rebuild_clusters_of(next, rt.id());
        tracing::info!(server_id = rt.id(), addr = %rt.meta.addr, "Server updated");
        effects.push(Effect::Watch(rt));
        Ok(())
    }

    fn add_windows(&self, meta: &Server) {
        self.analysis.add_recent_count(meta.id, BASE_WINDOW);
        if let Some(cb) = &meta.circuit_breaker {
            self.analysis
                .add_recent_count(meta.id, Duration::from_secs(cb.rate_check_period_secs));
        }
    }
}

fn add_api(next: &mut Snapshot, api: Api) -> Result<(), TableError> {
    api.validate().map_err(|r| TableError::invalid("api", r))?;
    if next.apis.contains_key(&api.id) {
        return Err(TableError::exists("api", api.id));
    }

    let mut router = Router::clone(&next.router);
    router.add(&api.url_pattern, &api.method, api.id)?;
    next.router = Arc::new(router);
    tracing::info!(api_id = api.id, pattern = %api.url_pattern, method = %api.method, "Api added");
    next.apis.insert(api.id, Arc::new(api));
    Ok(())
}

fn update_api(next: &mut Snapshot, api: Api) -> Result<(), TableError> {
    api.validate().map_err(|r| TableError::invalid("api", r))?;
    if !next.apis.contains_key(&api.id) {
        return Err(TableError::not_found("api", api.id));
    }

    let mut router = Router::clone(&next.router);
    router.remove(api.id);
    router.add(&api.url_pattern, &api.method, api.id)?;
    next.router = Arc::new(router);
    tracing::info!(api_id = api.id, pattern = %api.url_pattern, "Api updated");
    next.apis.insert(api.id, Arc::new(api));
    Ok(())
}

fn remove_api(next: &mut Snapshot, id: u64) -> Result<(), TableError> {
    if next.apis.remove(&id).is_none() {
        return Err(TableError::not_found("api", id));
    }

    let mut router = Router::clone(&next.router);
    router.remove(id);
    next.router = Arc::new(router);
    tracing::info!(api_id = id, "Api removed");
    Ok(())
}

fn add_cluster(next: &mut Snapshot, meta: Cluster) -> Result<(), TableError> {
    meta.validate().map_err(|r| TableError::invalid("cluster", r))?;
    if next.clusters.contains_key(&meta.id) {
        return Err(TableError::exists("cluster", meta.id));
    }

    let id = meta.id;
    next.clusters.insert(id, Arc::new(ClusterRuntime::new(meta)));
    rebuild_cluster(next, id);
    tracing::info!(cluster_id = id, "Cluster added");
    Ok(())
}

fn update_cluster(next: &mut Snapshot, meta: Cluster) -> Result<(), TableError> {
    meta.validate().map_err(|r| TableError::invalid("cluster", r))?;
    let old = next
        .clusters
        .get(&meta.id)
        .ok_or_else(|| TableError::not_found("cluster", meta.id))?;

    let id = meta.id;
    let rt = old.with_meta(meta);
    next.clusters.insert(id, Arc::new(rt));
    tracing::info!(cluster_id = id, "Cluster updated");
    Ok(())
}

fn remove_cluster(next: &mut Snapshot, id: u64) -> Result<(), TableError> {
    if next.clusters.remove(&id).is_none() {
        return Err(TableError::not_found("cluster", id));
    }
    next.binds.remove(&id);
    tracing::info!(cluster_id = id, "Cluster removed");
    Ok(())
}

fn remove_server(next: &mut Snapshot, id: u64, effects: &mut Vec<Effect>) -> Result<(), TableError> {
    let rt = next
        .servers
        .remove(&id)
        .ok_or_else(|| TableError::not_found("server", id))?;

    let affected: Vec<u64> = next
        .binds
        .iter()
        .filter(|(_, servers)| servers.contains(&id))
        .map(|(cluster_id, _)| *cluster_id)
        .collect();
    for cluster_id in affected {
        if let Some(servers) = next.binds.get_mut(&cluster_id) {
            servers.retain(|s| *s != id);
        }
        rebuild_cluster(next, cluster_id);
    }

    tracing::info!(server_id = id, "Server removed");
    effects.push(Effect::Unwatch(id, rt.circuit().clone()));
    Ok(())
}

fn add_bind(next: &mut Snapshot, bind: Bind) -> Result<(), TableError> {
    if !next.servers.contains_key(&bind.server_id) {
        tracing::warn!(server_id = bind.server_id, "Bind failed, server not found");
        return Err(TableError::not_found("server", bind.server_id));
    }
    if !next.clusters.contains_key(&bind.cluster_id) {
        tracing::warn!(cluster_id = bind.cluster_id, "Bind failed, cluster not found");
        return Err(TableError::not_found("cluster", bind.cluster_id));
    }

    let servers = next.binds.entry(bind.cluster_id).or_default();
    if servers.contains(&bind.server_id) {
        return Err(TableError::exists("bind", bind_key(&bind)));
    }
    servers.push(bind.server_id);
    rebuild_cluster(next, bind.cluster_id);
    tracing::info!(cluster_id = bind.cluster_id, server_id = bind.server_id, "Bind created");
    Ok(())
}

fn remove_bind(next: &mut Snapshot, bind: Bind) -> Result<(), TableError> {
    let removed = next
        .binds
        .get_mut(&bind.cluster_id)
        .map(|servers| {
            let before = servers.len();
            servers.retain(|s| *s != bind.server_id);
            before != servers.len()
        })
        .unwrap_or(false);
    if !removed {
        return Err(TableError::not_found("bind", bind_key(&bind)));
    }

    if next.binds.get(&bind.cluster_id).is_some_and(Vec::is_empty) {
        next.binds.remove(&bind.cluster_id);
    }
    rebuild_cluster(next, bind.cluster_id);
    tracing::info!(cluster_id = bind.cluster_id, server_id = bind.server_id, "Bind removed");
    Ok(())
}

fn add_routing(next: &mut Snapshot, routing: Routing) -> Result<(), TableError> {
    routing.validate().map_err(|r| TableError::invalid("routing", r))?;
    if next.routings.iter().any(|r| r.id == routing.id) {
        return Err(TableError::exists("routing", routing.id));
    }

    let at = next.routings.partition_point(|r| r.id < routing.id);
    tracing::info!(routing_id = routing.id, api_id = routing.api_id, "Routing added");
    next.routings.insert(at, Arc::new(routing));
    Ok(())
}

fn update_routing(next: &mut Snapshot, routing: Routing) -> Result<(), TableError> {
    routing.validate().map_err(|r| TableError::invalid("routing", r))?;
    let slot = next
        .routings
        .iter_mut()
        .find(|r| r.id == routing.id)
        .ok_or_else(|| TableError::not_found("routing", routing.id))?;
    tracing::info!(routing_id = routing.id, "Routing updated");
    *slot = Arc::new(routing);
    Ok(())
}

fn remove_routing(next: &mut Snapshot, id: u64) -> Result<(), TableError> {
    let before = next.routings.len();
    next.routings.retain(|r| r.id != id);
    if before == next.routings.len() {
        return Err(TableError::not_found("routing", id));
    }
    tracing::info!(routing_id = id, "Routing removed");
    Ok(())
}

fn add_proxy(next: &mut Snapshot, proxy: ProxyInfo) -> Result<(), TableError> {
    if next.proxies.contains_key(&proxy.addr) {
        return Err(TableError::exists("proxy", &proxy.addr));
    }
    tracing::info!(proxy = %proxy.addr, "Proxy added");
    next.proxies.insert(proxy.addr.clone(), proxy);
    resize_limiters(next);
    Ok(())
}

fn remove_proxy(next: &mut Snapshot, addr: &str) -> Result<(), TableError> {
    if next.proxies.remove(addr).is_none() {
        return Err(TableError::not_found("proxy", addr));
    }
    tracing::info!(proxy = %addr, "Proxy removed");
    resize_limiters(next);
    Ok(())
}

fn add_plugin(next: &mut Snapshot, plugin: Plugin) -> Result<(), TableError> {
    if next.plugins.contains_key(&plugin.id) {
        return Err(TableError::exists("plugin", plugin.id));
    }
    next.plugins.insert(plugin.id, Arc::new(plugin));
    Ok(())
}

fn update_plugin(next: &mut Snapshot, plugin: Plugin) -> Result<(), TableError> {
    if !next.plugins.contains_key(&plugin.id) {
        return Err(TableError::not_found("plugin", plugin.id));
    }
    next.plugins.insert(plugin.id, Arc::new(plugin));
    Ok(())
}

fn remove_plugin(next: &mut Snapshot, id: u64) -> Result<(), TableError> {
    if next.plugins.remove(&id).is_none() {
        return Err(TableError::not_found("plugin", id));
    }
    next.applied_plugins.applied.retain(|p| *p != id);
    Ok(())
}

fn server_status(next: &mut Snapshot, change: StatusChange) -> Result<(), TableError> {
    let rt = next
        .servers
        .get(&change.server_id)
        .cloned()
        .ok_or_else(|| TableError::not_found("server", change.server_id))?;

    if rt.set_status(change.status) {
        match change.status {
            Status::Up => tracing::info!(server_id = rt.id(), addr = %rt.meta.addr, "Server changed to up"),
            Status::Down => tracing::warn!(server_id = rt.id(), addr = %rt.meta.addr, "Server changed to down"),
        }
    }
    rebuild_clusters_of(next, rt.id());
    Ok(())
}

/// New limiters sized for the current proxy count.
fn resize_limiters(next: &mut Snapshot) {
    let count = next.proxy_count();
    next.servers = next
        .servers
        .iter()
        .map(|(id, rt)| (*id, Arc::new(rt.with_proxy_count(count))))
        .collect();
}

fn rebuild_clusters_of(next: &mut Snapshot, server_id: u64) {
    let affected: Vec<u64> = next
        .binds
        .iter()
        .filter(|(_, servers)| servers.contains(&server_id))
        .map(|(cluster_id, _)| *cluster_id)
        .collect();
    for cluster_id in affected {
        rebuild_cluster(next, cluster_id);
    }
}

/// Active list = bound servers that are up, in bind order.
fn rebuild_cluster(next: &mut Snapshot, cluster_id: u64) {
    let Some(cluster) = next.clusters.get(&cluster_id) else {
        return;
    };

    let active: Vec<Target> = next
        .bound(cluster_id)
        .iter()
        .filter_map(|id| next.servers.get(id))
        .filter(|rt| rt.is_up())
        .map(|rt| Target {
            id: rt.id(),
            weight: rt.meta.weight,
        })
        .collect();

    let rebuilt = Arc::new(cluster.with_active(active));
    next.clusters.insert(cluster_id, rebuilt);
}

fn bind_key(bind: &Bind) -> String {
    format!("{}-{}", bind.cluster_id, bind.server_id)
}
