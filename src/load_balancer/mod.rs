//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! Dispatch node resolved → cluster id
//!     → cluster.rs (active list snapshot: bound ∧ up)
//!     → Apply the cluster's strategy:
//!         - round_robin.rs (rotate through the active list)
//!         - weighted.rs (smooth weighted round-robin)
//!         - hash_ip.rs (FNV-1a of the client IP)
//!         - random.rs (uniform pick)
//!     → server id, or none when the active list is empty
//! ```
//!
//! # Design Decisions
//! - The active list is an ordered `Vec` rebuilt by the dispatch table; strategies never mutate it
//! - Only round-robin (counter) and weighted (per-id weights) keep state between picks
//! - A cluster runtime is rebuilt on every change but keeps its strategy instance

pub mod cluster;
pub mod hash_ip;
pub mod random;
pub mod round_robin;
pub mod server;
pub mod weighted;

use std::fmt::Debug;
use std::sync::Arc;

use crate::model::LoadBalanceKind;

pub use cluster::ClusterRuntime;
pub use server::ServerRuntime;

/// An entry of a cluster's active list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    pub id: u64,
    pub weight: u32,
}

/// A selection strategy over the active list.
pub trait LoadBalancer: Send + Sync + Debug {
    /// Pick a server id. `None` when `targets` is empty.
    fn next_server(&self, client_ip: &str, targets: &[Target]) -> Option<u64>;
}

/// Build the strategy named by a cluster record.
pub fn new_load_balancer(kind: LoadBalanceKind) -> Arc<dyn LoadBalancer> {
    match kind {
        LoadBalanceKind::RoundRobin => Arc::new(round_robin::RoundRobin::new()),
        LoadBalanceKind::WeightedRoundRobin => Arc::new(weighted::WeightedRoundRobin::new()),
        LoadBalanceKind::HashIp => Arc::new(hash_ip::HashIp),
        LoadBalanceKind::Random => Arc::new(random::Random),
    }
}

#[cfg(test)]
pub(crate) fn targets(ids: &[u64]) -> Vec<Target> {
    ids.iter().map(|&id| Target { id, weight: 1 }).collect()
}
