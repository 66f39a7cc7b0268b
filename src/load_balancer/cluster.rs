//! Cluster runtime: a record, its strategy and its active list.

use std::sync::Arc;

use crate::load_balancer::{new_load_balancer, LoadBalancer, Target};
use crate::model::Cluster;

#[derive(Debug, Clone)]
pub struct ClusterRuntime {
    pub meta: Cluster,
    lb: Arc<dyn LoadBalancer>,
    active: Vec<Target>,
}

impl ClusterRuntime {
    pub fn new(meta: Cluster) -> Self {
        Self {
            lb: new_load_balancer(meta.load_balance),
            meta,
            active: Vec::new(),
        }
    }

    /// New record. The strategy instance survives unless its kind changed.
    pub fn with_meta(&self, meta: Cluster) -> Self {
        let lb = if meta.load_balance == self.meta.load_balance {
            self.lb.clone()
        } else {
            new_load_balancer(meta.load_balance)
        };
        Self {
            meta,
            lb,
            active: self.active.clone(),
        }
    }

    pub fn with_active(&self, active: Vec<Target>) -> Self {
        Self {
            meta: self.meta.clone(),
            lb: self.lb.clone(),
            active,
        }
    }

    pub fn id(&self) -> u64 {
        self.meta.id
    }

    pub fn active(&self) -> &[Target] {
        &self.active
    }

    /// Pick a server id for a client. `None` when nothing is active.
    pub fn select(&self, client_ip: &str) -> Option<u64> {
        self.lb.next_server(client_ip, &self.active)
    }
}
