//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create Axum Router with a catch-all handler
//! - Wire up middleware (tracing, timeout, request ID)
//! - Buffer the client request and hand it to the dispatch engine
//! - Cancel the dispatch when the client goes away
//! - Bridge websocket upgrades
//! - Bind server to listener, plain or TLS

use axum::{
    body::Body,
    extract::{ConnectInfo, FromRequestParts, State, WebSocketUpgrade},
    http::{request::Parts, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use axum_server::tls_rustls::RustlsConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::{
    request_id::{PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::config::ProxyConfig;
use crate::http::request::{MakeRequestUuid, OriginRequest};
use crate::http::response::status_response;
use crate::http::websocket;
use crate::lifecycle::Shutdown;
use crate::proxy::Gateway;

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub max_body: usize,
}

/// HTTP front-end of the gateway.
pub struct HttpServer {
    router: Router,
}

impl HttpServer {
    pub fn new(gateway: Arc<Gateway>, config: &ProxyConfig) -> Self {
        let state = AppState {
            gateway,
            max_body: config.limits.max_body_bytes,
        };
        Self {
            router: Self::build_router(config, state),
        }
    }

    /// Build the Axum router with all middleware layers.
    #[allow(deprecated)]
    fn build_router(config: &ProxyConfig, state: AppState) -> Router {
        Router::new()
            .route("/{*path}", any(proxy_handler))
            .route("/", any(proxy_handler))
            .with_state(state)
            .layer(TimeoutLayer::new(Duration::from_secs(config.request_timeout_secs)))
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
            .layer(TraceLayer::new_for_http())
    }

    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Run the server, accepting connections until shutdown.
    pub async fn run(self, listener: TcpListener, shutdown: Shutdown) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();
        let mut stop = shutdown.subscribe();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = stop.recv().await;
            })
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }

    /// Run with TLS on an already bound listener.
    pub async fn run_tls(
        self,
        listener: TcpListener,
        tls: RustlsConfig,
        shutdown: Shutdown,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTPS server starting");

        let handle = axum_server::Handle::new();
        let on_stop = handle.clone();
        let mut stop = shutdown.subscribe();
        tokio::spawn(async move {
            let _ = stop.recv().await;
            on_stop.graceful_shutdown(Some(Duration::from_secs(30)));
        });

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();
        axum_server::from_tcp_rustls(listener.into_std()?, tls)
            .handle(handle)
            .serve(app)
            .await?;

        tracing::info!("HTTPS server stopped");
        Ok(())
    }
}

/// Catch-all handler: every request goes through the dispatch engine.
async fn proxy_handler(
    State(state): State<AppState>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    let (parts, body) = request.into_parts();
    if websocket::is_upgrade(&parts.headers) {
        return websocket_handler(state, parts, remote_addr).await;
    }

    let body = match axum::body::to_bytes(body, state.max_body).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::debug!(remote = %remote_addr, error = %e, "Request body rejected");
            return status_response(StatusCode::PAYLOAD_TOO_LARGE);
        }
    };
    let origin = OriginRequest::new(parts.method, parts.uri, parts.version, parts.headers, body, remote_addr);

    // Dropping this handler (client gone, front-end timeout) cancels the dispatch.
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let gateway = state.gateway.clone();
    let dispatch = tokio::spawn(async move { gateway.handle(origin, cancel).await });

    let response = match dispatch.await {
        Ok(response) => response,
        Err(e) => {
            tracing::error!(error = %e, "Dispatch task failed");
            status_response(StatusCode::INTERNAL_SERVER_ERROR)
        }
    };
    let _ = guard.disarm();
    response
}

async fn websocket_handler(state: AppState, mut parts: Parts, remote_addr: SocketAddr) -> Response {
    let upgrade = match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };

    let headers = parts.headers.clone();
    let origin = OriginRequest::new(
        parts.method,
        parts.uri,
        parts.version,
        parts.headers,
        Default::default(),
        remote_addr,
    );
    match state.gateway.websocket_target(&origin) {
        Ok(target) => {
            tracing::debug!(remote = %remote_addr, target = %target, "Websocket upgrade");
            upgrade.on_upgrade(move |socket| websocket::bridge(socket, target, headers))
        }
        Err(e) => status_response(e.status_code()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DispatchTable;
    use crate::filter::FilterChain;
    use crate::observability::Analysis;
    use crate::timer::TimingWheel;
    use axum::extract::connect_info::MockConnectInfo;
    use tower::ServiceExt;

    async fn app(config: &ProxyConfig) -> (Router, Arc<Gateway>) {
        let wheel = TimingWheel::new(Duration::from_millis(10), 64, 1);
        let analysis = Arc::new(Analysis::new(wheel.clone()));
        let table = DispatchTable::new(wheel, analysis, Duration::from_secs(1), 16);
        let chain = FilterChain::build(config).await.unwrap();
        let gateway = Gateway::new(config, table, chain);
        let router = HttpServer::new(gateway.clone(), config)
            .router()
            .layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40000))));
        (router, gateway)
    }

    fn request(method: &str, uri: &str, body: &'static str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn test_unrouted_request_gets_request_id() {
        let (router, _) = app(&ProxyConfig::default()).await;

        let response = router.oneshot(request("GET", "/missing", "")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(response.headers().contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn test_oversized_body_rejected() {
        let mut config = ProxyConfig::default();
        config.limits.max_body_bytes = 8;
        let (router, _) = app(&config).await;

        let response = router
            .clone()
            .oneshot(request("POST", "/upload", "far more than eight bytes"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);

        let response = router.oneshot(request("POST", "/upload", "small")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_stopped_gateway_unavailable() {
        let (router, gateway) = app(&ProxyConfig::default()).await;
        gateway.stop();

        let response = router.oneshot(request("GET", "/", "")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
