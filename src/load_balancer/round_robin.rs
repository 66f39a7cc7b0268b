//! Round-robin load balancing strategy.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::load_balancer::{LoadBalancer, Target};

/// Round-robin selector.
/// Stores an internal counter to rotate through the active list.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobin {
    fn next_server(&self, _client_ip: &str, targets: &[Target]) -> Option<u64> {
        if targets.is_empty() {
            return None;
        }

        let index = self.counter.fetch_add(1, Ordering::Relaxed) % targets.len();
        Some(targets[index].id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::targets;

    #[test]
    fn test_round_robin() {
        let lb = RoundRobin::new();
        let active = targets(&[1, 2]);

        assert_eq!(lb.next_server("", &active), Some(1));
        assert_eq!(lb.next_server("", &active), Some(2));
        assert_eq!(lb.next_server("", &active), Some(1));
    }

    #[test]
    fn test_empty() {
        assert_eq!(RoundRobin::new().next_server("", &[]), None);
    }
}
