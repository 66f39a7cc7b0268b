//! Immutable view of the catalog used by one request.

use std::collections::HashMap;
use std::sync::Arc;

use crate::load_balancer::{ClusterRuntime, ServerRuntime};
use crate::model::{Api, AppliedPlugins, Plugin, ProxyInfo, Routing};
use crate::routing::{Params, RouteError, Router};

#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub apis: HashMap<u64, Arc<Api>>,
    pub clusters: HashMap<u64, Arc<ClusterRuntime>>,
    pub servers: HashMap<u64, Arc<ServerRuntime>>,
    /// Cluster id → bound server ids, in bind order.
    pub binds: HashMap<u64, Vec<u64>>,
    /// Ordered by id; the first applicable rule wins.
    pub routings: Vec<Arc<Routing>>,
    pub proxies: HashMap<String, ProxyInfo>,
    pub plugins: HashMap<u64, Arc<Plugin>>,
    pub applied_plugins: AppliedPlugins,
    pub router: Arc<Router>,
}

impl Snapshot {
    /// Match a request line to an API and its path params.
    pub fn route(&self, path: &str, method: &str) -> Result<(Arc<Api>, Params), RouteError> {
        let mut params = Params::new();
        let id = self.router.find(path, method, |k, v| params.push(k, v))?;
        let api = self.apis.get(&id).cloned().ok_or(RouteError::NotFound)?;
        Ok((api, params))
    }

    pub fn server(&self, id: u64) -> Option<&Arc<ServerRuntime>> {
        self.servers.get(&id)
    }

    pub fn cluster(&self, id: u64) -> Option<&Arc<ClusterRuntime>> {
        self.clusters.get(&id)
    }

    /// Load-balanced pick from the cluster's active list.
    pub fn select_server(&self, cluster_id: u64, client_ip: &str) -> Option<Arc<ServerRuntime>> {
        let id = self.clusters.get(&cluster_id)?.select(client_ip)?;
        self.servers.get(&id).cloned()
    }

    pub fn bound(&self, cluster_id: u64) -> &[u64] {
        self.binds.get(&cluster_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn proxy_count(&self) -> usize {
        self.proxies.len()
    }
}
