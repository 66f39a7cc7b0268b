//! Client IP lists for the `BLACKLIST` and `WHITELIST` filters.
//!
//! Entries are exact addresses (`10.1.2.3`), CIDR blocks (`10.0.0.0/8`,
//! `fd00::/8`) or IPv4 patterns with `*` octets (`192.168.*.*`).

use std::net::IpAddr;

#[derive(Debug, Clone, PartialEq, Eq)]
enum IpRule {
    Exact(IpAddr),
    Cidr { network: IpAddr, prefix: u8 },
    Wildcard([Option<u8>; 4]),
}

impl IpRule {
    fn parse(entry: &str) -> Option<Self> {
        let entry = entry.trim();
        if let Some((addr, prefix)) = entry.split_once('/') {
            let network: IpAddr = addr.parse().ok()?;
            let prefix: u8 = prefix.parse().ok()?;
            let max = if network.is_ipv4() { 32 } else { 128 };
            return (prefix <= max).then_some(IpRule::Cidr { network, prefix });
        }

        if entry.contains('*') {
            let mut octets = [None; 4];
            let mut parts = entry.split('.');
            for octet in &mut octets {
                let part = parts.next()?;
                *octet = if part == "*" { None } else { Some(part.parse().ok()?) };
            }
            return parts.next().is_none().then_some(IpRule::Wildcard(octets));
        }

        entry.parse().ok().map(IpRule::Exact)
    }

    fn matches(&self, ip: IpAddr) -> bool {
        match self {
            IpRule::Exact(addr) => *addr == ip,
            IpRule::Cidr { network, prefix } => in_cidr(*network, *prefix, ip),
            IpRule::Wildcard(octets) => match ip {
                IpAddr::V4(v4) => octets
                    .iter()
                    .zip(v4.octets())
                    .all(|(rule, actual)| rule.map_or(true, |expected| expected == actual)),
                IpAddr::V6(_) => false,
            },
        }
    }
}

fn in_cidr(network: IpAddr, prefix: u8, ip: IpAddr) -> bool {
    match (network, ip) {
        (IpAddr::V4(net), IpAddr::V4(ip)) => {
            let mask = u32::MAX.checked_shl(32 - u32::from(prefix)).unwrap_or(0);
            u32::from(net) & mask == u32::from(ip) & mask
        }
        (IpAddr::V6(net), IpAddr::V6(ip)) => {
            let mask = u128::MAX.checked_shl(128 - u32::from(prefix)).unwrap_or(0);
            u128::from(net) & mask == u128::from(ip) & mask
        }
        _ => false,
    }
}

/// A parsed IP list. Unparseable entries are dropped with a warning.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpList {
    rules: Vec<IpRule>,
}

impl IpList {
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> Self {
        let rules = entries
            .iter()
            .filter_map(|e| {
                let rule = IpRule::parse(e.as_ref());
                if rule.is_none() {
                    tracing::warn!(entry = %e.as_ref(), "Ignoring invalid IP list entry");
                }
                rule
            })
            .collect();
        Self { rules }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// True when `ip` matches any rule. Unparseable addresses never match.
    pub fn contains(&self, ip: &str) -> bool {
        match ip.trim().parse::<IpAddr>() {
            Ok(ip) => self.rules.iter().any(|r| r.matches(ip)),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rules() {
        let list = IpList::parse(&["10.0.0.0/8", "192.168.*.7", "172.16.0.1", "fd00::/8", "bogus"]);
        assert_eq!(list.rules.len(), 4);

        assert!(list.contains("10.200.3.4"));
        assert!(list.contains("192.168.44.7"));
        assert!(!list.contains("192.168.44.8"));
        assert!(list.contains("172.16.0.1"));
        assert!(!list.contains("172.16.0.2"));
        assert!(list.contains("fd12::1"));
        assert!(!list.contains("not-an-ip"));
    }

    #[test]
    fn test_edge_prefixes() {
        assert!(IpList::parse(&["0.0.0.0/0"]).contains("8.8.8.8"));
        assert!(IpList::parse(&["8.8.8.8/32"]).contains("8.8.8.8"));
        assert!(IpList::parse(&["8.8.8.8/33"]).is_empty());
        assert!(IpList::parse(&["1.2.*"]).is_empty());
    }
}
