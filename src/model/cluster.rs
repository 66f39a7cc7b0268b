//! Cluster and bind records.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Cluster {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub load_balance: LoadBalanceKind,
}

impl Cluster {
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("missing name".into());
        }
        Ok(())
    }
}

/// Load-balancing strategy names as they appear in records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, Default)]
pub enum LoadBalanceKind {
    #[default]
    #[serde(rename = "round-robin")]
    RoundRobin,
    #[serde(rename = "weighted-round-robin", alias = "weighted")]
    WeightedRoundRobin,
    #[serde(rename = "hash-ip")]
    HashIp,
    #[serde(rename = "random")]
    Random,
}

/// Membership of a server in a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Bind {
    pub cluster_id: u64,
    pub server_id: u64,
}
