//! Smooth weighted round-robin.
//!
//! Every pick adds each target's effective weight to its current weight,
//! chooses the largest current weight and subtracts the total from it.
//! Over one cycle of `sum(weights)` picks each target is chosen exactly
//! `weight` times, interleaved rather than in runs.

use parking_lot::Mutex;
use std::collections::HashMap;

use crate::load_balancer::{LoadBalancer, Target};

#[derive(Debug, Clone, Copy)]
struct Weights {
    effective: i64,
    current: i64,
}

#[derive(Debug, Default)]
pub struct WeightedRoundRobin {
    weights: Mutex<HashMap<u64, Weights>>,
}

impl WeightedRoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for WeightedRoundRobin {
    fn next_server(&self, _client_ip: &str, targets: &[Target]) -> Option<u64> {
        if targets.is_empty() {
            return None;
        }

        let mut weights = self.weights.lock();
        if weights.len() > targets.len() {
            weights.retain(|id, _| targets.iter().any(|t| t.id == *id));
        }

        let mut total = 0i64;
        let mut best: Option<(u64, i64)> = None;

        for target in targets {
            let configured = i64::from(target.weight.max(1));
            let w = weights.entry(target.id).or_insert(Weights {
                effective: configured,
                current: 0,
            });

            // Weight changes converge instead of resetting the rotation.
            if w.effective < configured {
                w.effective += 1;
            } else if w.effective > configured {
                w.effective = configured;
            }

            w.current += w.effective;
            total += w.effective;

            if best.map_or(true, |(_, current)| w.current > current) {
                best = Some((target.id, w.current));
            }
        }

        let (id, _) = best?;
        if let Some(w) = weights.get_mut(&id) {
            w.current -= total;
        }
        Some(id)
    }
}
