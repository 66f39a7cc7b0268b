//! Client-IP affinity.

use crate::load_balancer::{LoadBalancer, Target};

const FNV_OFFSET: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// FNV-1a (32 bit).
pub fn fnv1a(data: &[u8]) -> u32 {
    data.iter().fold(FNV_OFFSET, |hash, b| (hash ^ u32::from(*b)).wrapping_mul(FNV_PRIME))
}

/// Same client IP, same server, as long as the active list is unchanged.
#[derive(Debug, Default)]
pub struct HashIp;

impl LoadBalancer for HashIp {
    fn next_server(&self, client_ip: &str, targets: &[Target]) -> Option<u64> {
        if targets.is_empty() {
            return None;
        }

        let index = fnv1a(client_ip.as_bytes()) as usize % targets.len();
        Some(targets[index].id)
    }
}
