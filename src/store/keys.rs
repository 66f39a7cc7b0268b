//! Key layout under the store namespace.
//!
//! ```text
//! <ns>/clusters/<id>
//! <ns>/servers/<id>
//! <ns>/binds/<cluster-id>-<server-id>
//! <ns>/apis/<base64url(url + "-" + method)>
//! <ns>/routings/<id>
//! <ns>/proxy/<addr>
//! <ns>/plugins/<id>
//! <ns>/applied-plugins
//! ```

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;

/// Record families, in full-load order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Prefix {
    Apis,
    Clusters,
    Servers,
    Binds,
    Routings,
    Proxies,
    Plugins,
    AppliedPlugins,
}

impl Prefix {
    pub const LOAD_ORDER: [Prefix; 8] = [
        Prefix::Apis,
        Prefix::Clusters,
        Prefix::Servers,
        Prefix::Binds,
        Prefix::Routings,
        Prefix::Proxies,
        Prefix::Plugins,
        Prefix::AppliedPlugins,
    ];

    pub fn dir(&self) -> &'static str {
        match self {
            Prefix::Apis => "/apis",
            Prefix::Clusters => "/clusters",
            Prefix::Servers => "/servers",
            Prefix::Binds => "/binds",
            Prefix::Routings => "/routings",
            Prefix::Proxies => "/proxy",
            Prefix::Plugins => "/plugins",
            Prefix::AppliedPlugins => "/applied-plugins",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keys {
    namespace: String,
}

impl Keys {
    pub fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.trim_end_matches('/').to_string(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Directory of a record family. `AppliedPlugins` is a singleton key.
    pub fn dir(&self, prefix: Prefix) -> String {
        match prefix {
            Prefix::AppliedPlugins => format!("{}{}", self.namespace, prefix.dir()),
            _ => format!("{}{}/", self.namespace, prefix.dir()),
        }
    }

    pub fn cluster(&self, id: u64) -> String {
        format!("{}{id}", self.dir(Prefix::Clusters))
    }

    pub fn server(&self, id: u64) -> String {
        format!("{}{id}", self.dir(Prefix::Servers))
    }

    pub fn bind(&self, cluster_id: u64, server_id: u64) -> String {
        format!("{}{cluster_id}-{server_id}", self.dir(Prefix::Binds))
    }

    pub fn api(&self, url_pattern: &str, method: &str) -> String {
        format!("{}{}", self.dir(Prefix::Apis), api_suffix(url_pattern, method))
    }

    pub fn routing(&self, id: u64) -> String {
        format!("{}{id}", self.dir(Prefix::Routings))
    }

    pub fn proxy(&self, addr: &str) -> String {
        format!("{}{addr}", self.dir(Prefix::Proxies))
    }

    pub fn plugin(&self, id: u64) -> String {
        format!("{}{id}", self.dir(Prefix::Plugins))
    }

    pub fn applied_plugins(&self) -> String {
        self.dir(Prefix::AppliedPlugins)
    }

    /// Split a full key into its family and the part after the family dir.
    pub fn classify<'k>(&self, key: &'k str) -> Option<(Prefix, &'k str)> {
        let rest = key.strip_prefix(self.namespace.as_str())?;
        if rest == Prefix::AppliedPlugins.dir() {
            return Some((Prefix::AppliedPlugins, ""));
        }

        Prefix::LOAD_ORDER
            .iter()
            .filter(|p| **p != Prefix::AppliedPlugins)
            .find_map(|p| {
                rest.strip_prefix(p.dir())
                    .and_then(|r| r.strip_prefix('/'))
                    .filter(|r| !r.is_empty())
                    .map(|r| (*p, r))
            })
    }
}

pub fn api_suffix(url_pattern: &str, method: &str) -> String {
    URL_SAFE.encode(format!("{url_pattern}-{method}"))
}

/// Inverse of [`api_suffix`].
pub fn decode_api_suffix(suffix: &str) -> Option<(String, String)> {
    let raw = URL_SAFE.decode(suffix).ok()?;
    let raw = String::from_utf8(raw).ok()?;
    let (url, method) = raw.rsplit_once('-')?;
    Some((url.to_string(), method.to_string()))
}

/// `<cluster-id>-<server-id>`.
pub fn parse_bind_suffix(suffix: &str) -> Option<(u64, u64)> {
    let (cluster, server) = suffix.split_once('-')?;
    Some((cluster.parse().ok()?, server.parse().ok()?))
}
