//! Stateless filters: `PREPARE`, `HTTP-ACCESS`, `HEADER`, `XFORWARD`, `ANALYSIS`.

use axum::http::header;

use super::context::{attr, Flow, FilterContext};
use crate::model::HostPolicy;
use crate::security::headers::{append_forwarded_for, strip_hop_by_hop};

pub fn prepare_pre(ctx: &mut FilterContext) -> Flow {
    let ip = ctx.origin.real_ip();
    ctx.set_attr(attr::REAL_IP, ip);
    Flow::Continue
}

/// One `access` event per node: `ip method uri status ua server cost`.
pub fn access_log(ctx: &FilterContext, status: u16) {
    let server = ctx
        .server
        .as_ref()
        .map_or_else(|| "-".to_string(), |s| s.meta.addr.clone());
    tracing::info!(
        target: "access",
        ip = %ctx.real_ip(),
        method = %ctx.origin.method,
        uri = %ctx.origin.request_uri(),
        status,
        ua = ctx.origin.header(header::USER_AGENT.as_str()).unwrap_or("-"),
        server = %server,
        cost_ms = ctx.cost().as_millis() as u64,
    );
}

/// Strip hop-by-hop headers and apply the node's host policy.
pub fn headers_pre(ctx: &mut FilterContext) -> Flow {
    strip_hop_by_hop(&mut ctx.forward.headers);

    let policy = ctx.node().map(|n| (n.host_policy, n.custom_host.clone()));
    match policy {
        Some((HostPolicy::ServerAddr, _)) => {
            if let Some(addr) = ctx.server.as_ref().map(|s| s.meta.addr.clone()) {
                ctx.forward.set_host(&addr);
            }
        }
        Some((HostPolicy::Custom, Some(host))) => ctx.forward.set_host(&host),
        _ => {}
    }
    Flow::Continue
}

pub fn headers_post(ctx: &mut FilterContext) {
    if let Some(resp) = ctx.response.as_mut() {
        strip_hop_by_hop(&mut resp.headers);
    }
}

pub fn xforward_pre(ctx: &mut FilterContext) -> Flow {
    let ip = ctx.origin.remote_ip().to_string();
    append_forwarded_for(&mut ctx.forward.headers, &ip);
    Flow::Continue
}

pub fn analysis_pre(ctx: &FilterContext) -> Flow {
    if let Some(id) = ctx.server_id() {
        ctx.shared.analysis.request(id);
    }
    Flow::Continue
}

pub fn analysis_post(ctx: &FilterContext) {
    if let Some(id) = ctx.server_id() {
        ctx.shared.analysis.response(id, ctx.cost());
    }
}

pub fn analysis_post_err(ctx: &FilterContext) {
    if let Some(id) = ctx.server_id() {
        ctx.shared.analysis.failure(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::context::tests::{api, context};
    use crate::http::request::tests::request;
    use crate::load_balancer::server::server;
    use crate::load_balancer::ServerRuntime;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_prepare_records_real_ip() {
        let mut ctx = context(api(1), request("GET", "/a", &[("x-real-ip", "4.4.4.4")], ""), None);
        prepare_pre(&mut ctx);
        assert_eq!(ctx.attr(attr::REAL_IP), Some("4.4.4.4"));
    }

    #[test]
    fn test_headers_and_host_policy() {
        let mut a = api(1);
        a.nodes[0].host_policy = HostPolicy::ServerAddr;
        let rt = Arc::new(ServerRuntime::new(server(1, "10.1.1.1:8080"), 1));
        let req = request("GET", "/a", &[("host", "gw"), ("keep-alive", "timeout=5"), ("te", "trailers")], "");
        let mut ctx = context(a, req, Some(rt));

        headers_pre(&mut ctx);
        assert_eq!(ctx.forward.host(), Some("10.1.1.1:8080"));
        assert!(!ctx.forward.headers.contains_key("keep-alive"));
        assert!(!ctx.forward.headers.contains_key("te"));

        let mut a = api(1);
        a.nodes[0].host_policy = HostPolicy::Custom;
        a.nodes[0].custom_host = Some("api.internal".into());
        let mut ctx = context(a, request("GET", "/a", &[("host", "gw")], ""), None);
        headers_pre(&mut ctx);
        assert_eq!(ctx.forward.host(), Some("api.internal"));

        let mut ctx = context(api(1), request("GET", "/a", &[("host", "gw")], ""), None);
        headers_pre(&mut ctx);
        assert_eq!(ctx.forward.host(), Some("gw"));
    }

    #[test]
    fn test_xforward_appends_peer() {
        let req = request("GET", "/a", &[("x-forwarded-for", "1.1.1.1")], "");
        let mut ctx = context(api(1), req, None);
        xforward_pre(&mut ctx);
        assert_eq!(ctx.forward.headers["x-forwarded-for"], "1.1.1.1, 10.0.0.9");
    }

    #[test]
    fn test_analysis_counts() {
        let rt = Arc::new(ServerRuntime::new(server(5, "10.1.1.1:8080"), 1));
        let ctx = context(api(1), request("GET", "/a", &[], ""), Some(rt));
        let analysis = ctx.shared.analysis.clone();
        let period = Duration::from_secs(1);
        analysis.add_recent_count(5, period);

        analysis_pre(&ctx);
        analysis_post(&ctx);
        analysis_pre(&ctx);
        analysis_post_err(&ctx);
        analysis.rotate(5, period);

        let recent = analysis.recent(5, period).unwrap();
        assert_eq!(recent.requests, 2);
        assert_eq!(recent.successes, 1);
        assert_eq!(recent.failures, 1);
        assert_eq!(analysis.continuous_failures(5), 1);
    }
}
