//! Uniform random pick.

use crate::load_balancer::{LoadBalancer, Target};

#[derive(Debug, Default)]
pub struct Random;

impl LoadBalancer for Random {
    fn next_server(&self, _client_ip: &str, targets: &[Target]) -> Option<u64> {
        if targets.is_empty() {
            return None;
        }
        Some(targets[fastrand::usize(..targets.len())].id)
    }
}
