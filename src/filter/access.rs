//! `BLACKLIST` and `WHITELIST` filters.

use dashmap::DashMap;
use std::sync::Arc;

use super::context::{Flow, FilterContext};
use crate::error::GatewayError;
use crate::model::AccessControl;
use crate::security::IpList;

#[derive(Debug)]
struct Lists {
    source: AccessControl,
    white: IpList,
    black: IpList,
}

/// Parsed IP lists cached per API, reparsed when the API record changes.
#[derive(Debug, Default)]
pub struct AccessLists {
    by_api: DashMap<u64, Arc<Lists>>,
}

impl AccessLists {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lists(&self, api_id: u64, control: &AccessControl) -> Arc<Lists> {
        if let Some(cached) = self.by_api.get(&api_id) {
            if cached.source == *control {
                return cached.clone();
            }
        }
        let lists = Arc::new(Lists {
            source: control.clone(),
            white: IpList::parse(&control.whitelist),
            black: IpList::parse(&control.blacklist),
        });
        self.by_api.insert(api_id, lists.clone());
        lists
    }

    pub fn blacklist_pre(&self, ctx: &FilterContext) -> Result<Flow, GatewayError> {
        let Some(control) = ctx.api.access_control.as_ref() else {
            return Ok(Flow::Continue);
        };
        let ip = ctx.real_ip();
        if self.lists(ctx.api.id, control).black.contains(&ip) {
            tracing::info!(ip = %ip, api = %ctx.api.name, "Client ip in blacklist");
            return Err(GatewayError::Blacklist);
        }
        Ok(Flow::Continue)
    }

    pub fn whitelist_pre(&self, ctx: &FilterContext) -> Result<Flow, GatewayError> {
        let Some(control) = ctx.api.access_control.as_ref() else {
            return Ok(Flow::Continue);
        };
        let lists = self.lists(ctx.api.id, control);
        if lists.white.is_empty() {
            return Ok(Flow::Continue);
        }
        let ip = ctx.real_ip();
        if !lists.white.contains(&ip) {
            tracing::info!(ip = %ip, api = %ctx.api.name, "Client ip not in whitelist");
            return Err(GatewayError::Whitelist);
        }
        Ok(Flow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::context::tests::{api, context};
    use crate::http::request::tests::request;

    fn guarded(white: &[&str], black: &[&str]) -> crate::model::Api {
        let mut a = api(1);
        a.access_control = Some(AccessControl {
            whitelist: white.iter().map(|s| s.to_string()).collect(),
            blacklist: black.iter().map(|s| s.to_string()).collect(),
        });
        a
    }

    #[test]
    fn test_blacklist() {
        let lists = AccessLists::new();
        let ctx = context(guarded(&[], &["10.0.0.0/24"]), request("GET", "/a", &[], ""), None);
        assert_eq!(lists.blacklist_pre(&ctx), Err(GatewayError::Blacklist));

        let ctx = context(
            guarded(&[], &["10.0.0.0/24"]),
            request("GET", "/a", &[("x-forwarded-for", "8.8.8.8")], ""),
            None,
        );
        assert_eq!(lists.blacklist_pre(&ctx), Ok(Flow::Continue));
    }

    #[test]
    fn test_whitelist() {
        let lists = AccessLists::new();
        let ctx = context(guarded(&["192.168.*.*"], &[]), request("GET", "/a", &[], ""), None);
        assert_eq!(lists.whitelist_pre(&ctx), Err(GatewayError::Whitelist));

        // an empty whitelist admits everyone
        let ctx = context(guarded(&[], &[]), request("GET", "/a", &[], ""), None);
        assert_eq!(lists.whitelist_pre(&ctx), Ok(Flow::Continue));
    }

    #[test]
    fn test_lists_follow_api_updates() {
        let lists = AccessLists::new();
        let ctx = context(guarded(&[], &["10.0.0.9"]), request("GET", "/a", &[], ""), None);
        assert!(lists.blacklist_pre(&ctx).is_err());

        let ctx = context(guarded(&[], &["10.0.0.10"]), request("GET", "/a", &[], ""), None);
        assert!(lists.blacklist_pre(&ctx).is_ok());
    }
}
