//! Keep-alive backend client.
//!
//! # Responsibilities
//! - Keep one LIFO free-list of HTTP/1.1 connections per backend address
//! - Cap the connections per address
//! - Apply per-node timeouts, body limits and buffer sizes
//! - Evict idle connections from a background cleaner
//!
//! # Design Decisions
//! - A connection is created only when the free-list is empty, so the
//!   per-address permit count bounds open connections too
//! - Connections past `max_conn_duration` are closed after their request
//! - GET, HEAD and PUT are retried once when a reused connection fails

use axum::body::Bytes;
use axum::http::{header, HeaderValue, Method, Request};
use dashmap::DashMap;
use http_body_util::{BodyExt, Full, Limited};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;

use crate::config::schema::LimitsConfig;
use crate::error::GatewayError;
use crate::http::request::ForwardRequest;
use crate::http::response::BackendResponse;
use crate::model::HttpOptions;

/// hyper refuses smaller read buffers.
const MIN_BUF_SIZE: usize = 8192;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connect {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },

    #[error("timed out while {0}")]
    Timeout(&'static str),

    #[error("http: {0}")]
    Http(#[from] hyper::Error),

    #[error("response body: {0}")]
    Body(String),

    #[error("unsupported backend scheme: {0}")]
    Scheme(String),

    #[error("connection pool closed")]
    Closed,
}

impl From<ClientError> for GatewayError {
    fn from(e: ClientError) -> Self {
        match e {
            ClientError::Timeout(_) => GatewayError::UpstreamTimeout,
            other => GatewayError::Upstream(other.to_string()),
        }
    }
}

/// Effective options for one forward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOptions {
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub max_conn_duration: Duration,
    pub max_idle_duration: Duration,
    pub max_body: usize,
    pub buf_size: usize,
    pub max_conns: usize,
}

impl ClientOptions {
    pub fn from_limits(limits: &LimitsConfig) -> Self {
        Self {
            read_timeout: Duration::from_millis(limits.read_timeout_ms),
            write_timeout: Duration::from_millis(limits.write_timeout_ms),
            max_conn_duration: Duration::from_secs(limits.conn_max_duration_secs),
            max_idle_duration: Duration::from_secs(limits.conn_idle_secs),
            max_body: limits.max_body_bytes,
            buf_size: limits.read_buffer_size.max(limits.write_buffer_size),
            max_conns: limits.max_conns_per_backend.max(1),
        }
    }

    /// These options with a node's overrides applied.
    pub fn with_node(&self, node: Option<&HttpOptions>) -> Self {
        let Some(o) = node else {
            return self.clone();
        };
        let ms = |v: Option<u64>, base: Duration| v.map_or(base, Duration::from_millis);
        let buf_size = match (o.read_buffer_size, o.write_buffer_size) {
            (None, None) => self.buf_size,
            (r, w) => r.unwrap_or(0).max(w.unwrap_or(0)),
        };
        Self {
            read_timeout: ms(o.read_timeout_ms, self.read_timeout),
            write_timeout: ms(o.write_timeout_ms, self.write_timeout),
            max_conn_duration: ms(o.max_conn_duration_ms, self.max_conn_duration),
            max_idle_duration: ms(o.max_idle_conn_duration_ms, self.max_idle_duration),
            max_body: o.max_response_body_size.unwrap_or(self.max_body),
            buf_size,
            max_conns: self.max_conns,
        }
    }
}

struct PooledConn {
    sender: http1::SendRequest<Full<Bytes>>,
    created: Instant,
    last_used: Instant,
}

struct HostPool {
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<PooledConn>>,
}

impl HostPool {
    fn new(max_conns: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_conns)),
            idle: Mutex::new(Vec::new()),
        }
    }

    /// Most recently used live connection.
    fn pop(&self, max_duration: Duration) -> Option<PooledConn> {
        let mut idle = self.idle.lock();
        while let Some(conn) = idle.pop() {
            if !conn.sender.is_closed() && conn.created.elapsed() < max_duration {
                return Some(conn);
            }
        }
        None
    }

    fn push(&self, conn: PooledConn) {
        self.idle.lock().push(conn);
    }
}

/// Per-process backend client shared by every dispatch node.
pub struct BackendClient {
    hosts: DashMap<String, Arc<HostPool>>,
    defaults: ClientOptions,
}

impl std::fmt::Debug for BackendClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendClient")
            .field("hosts", &self.hosts.len())
            .field("idle", &self.idle_count())
            .finish()
    }
}

impl BackendClient {
    pub fn new(defaults: ClientOptions) -> Arc<Self> {
        Arc::new(Self {
            hosts: DashMap::new(),
            defaults,
        })
    }

    pub fn defaults(&self) -> &ClientOptions {
        &self.defaults
    }

    /// Idle connections across all addresses.
    pub fn idle_count(&self) -> usize {
        self.hosts.iter().map(|h| h.idle.lock().len()).sum()
    }

    fn host(&self, addr: &str) -> Arc<HostPool> {
        if let Some(pool) = self.hosts.get(addr) {
            return pool.clone();
        }
        self.hosts
            .entry(addr.to_string())
            .or_insert_with(|| Arc::new(HostPool::new(self.defaults.max_conns)))
            .clone()
    }

    /// Forward `req` to `addr` and buffer the response.
    pub async fn send(
        &self,
        scheme: &str,
        addr: &str,
        req: &ForwardRequest,
        opts: &ClientOptions,
    ) -> Result<BackendResponse, ClientError> {
        if !scheme.eq_ignore_ascii_case("http") {
            return Err(ClientError::Scheme(scheme.to_string()));
        }

        let pool = self.host(addr);
        let _permit: OwnedSemaphorePermit = timeout(opts.write_timeout, pool.permits.clone().acquire_owned())
            .await
            .map_err(|_| ClientError::Timeout("waiting for a connection"))?
            .map_err(|_| ClientError::Closed)?;

        let retryable = matches!(req.method, Method::GET | Method::HEAD | Method::PUT);
        let mut reused = pool.pop(opts.max_conn_duration);

        loop {
            let was_reused = reused.is_some();
            let conn = match reused.take() {
                Some(conn) => conn,
                None => connect(addr, opts).await?,
            };

            match round_trip(conn, addr, req, opts).await {
                Ok((resp, conn, keep_alive)) => {
                    if keep_alive && conn.created.elapsed() < opts.max_conn_duration {
                        pool.push(conn);
                    }
                    return Ok(resp);
                }
                Err(ClientError::Http(e)) if was_reused && retryable => {
                    tracing::debug!(addr = %addr, error = %e, "Reused connection failed, retrying on a new one");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Evict idle connections until shutdown.
    pub async fn run_cleaner(self: Arc<Self>, interval: Duration, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(100)));
        loop {
            tokio::select! {
                _ = ticker.tick() => self.clean(),
                _ = shutdown.recv() => break,
            }
        }
        self.hosts.clear();
        tracing::info!("Backend connection cleaner stopped");
    }

    fn clean(&self) {
        let max_idle = self.defaults.max_idle_duration;
        let max_duration = self.defaults.max_conn_duration;
        let mut evicted = 0;
        for host in self.hosts.iter() {
            let mut idle = host.idle.lock();
            let before = idle.len();
            idle.retain(|c| {
                !c.sender.is_closed() && c.last_used.elapsed() < max_idle && c.created.elapsed() < max_duration
            });
            evicted += before - idle.len();
        }
        if evicted > 0 {
            tracing::debug!(evicted, "Idle backend connections closed");
        }
    }
}

async fn connect(addr: &str, opts: &ClientOptions) -> Result<PooledConn, ClientError> {
    let stream = timeout(opts.write_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| ClientError::Timeout("connecting"))?
        .map_err(|source| ClientError::Connect {
            addr: addr.to_string(),
            source,
        })?;
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(addr = %addr, error = %e, "Failed to set TCP_NODELAY on backend connection");
    }

    let mut builder = http1::Builder::new();
    builder.max_buf_size(opts.buf_size.max(MIN_BUF_SIZE));
    let (sender, conn) = builder.handshake(TokioIo::new(stream)).await?;

    let peer = addr.to_string();
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            tracing::debug!(addr = %peer, error = %e, "Backend connection closed with error");
        }
    });

    let now = Instant::now();
    Ok(PooledConn {
        sender,
        created: now,
        last_used: now,
    })
}

async fn round_trip(
    mut conn: PooledConn,
    addr: &str,
    req: &ForwardRequest,
    opts: &ClientOptions,
) -> Result<(BackendResponse, PooledConn, bool), ClientError> {
    let mut request = Request::new(Full::new(req.body.clone()));
    *request.method_mut() = req.method.clone();
    *request.uri_mut() = req
        .uri
        .parse()
        .map_err(|e| ClientError::Body(format!("invalid forward uri {}: {e}", req.uri)))?;
    *request.headers_mut() = req.headers.clone();
    if !request.headers().contains_key(header::HOST) {
        if let Ok(host) = HeaderValue::from_str(addr) {
            request.headers_mut().insert(header::HOST, host);
        }
    }

    timeout(opts.write_timeout, conn.sender.ready())
        .await
        .map_err(|_| ClientError::Timeout("writing the request"))??;

    let response = timeout(opts.read_timeout, conn.sender.send_request(request))
        .await
        .map_err(|_| ClientError::Timeout("reading the response head"))??;

    let (parts, body) = response.into_parts();
    let collected = timeout(opts.read_timeout, Limited::new(body, opts.max_body).collect())
        .await
        .map_err(|_| ClientError::Timeout("reading the response body"))?
        .map_err(|e| ClientError::Body(e.to_string()))?;

    let keep_alive = !parts
        .headers
        .get(header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("close"));

    conn.last_used = Instant::now();
    let resp = BackendResponse::new(parts.status, parts.headers, collected.to_bytes());
    Ok((resp, conn, keep_alive))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, StatusCode};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn opts() -> ClientOptions {
        ClientOptions::from_limits(&LimitsConfig::default())
    }

    fn get(uri: &str) -> ForwardRequest {
        ForwardRequest {
            method: Method::GET,
            uri: uri.to_string(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Keep-alive backend answering every request with `body`; counts accepts.
    async fn backend(body: &'static str) -> (String, Arc<std::sync::atomic::AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let accepts = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = accepts.clone();
        tokio::spawn(async move {
            loop {
                let (mut socket, _) = listener.accept().await.unwrap();
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    loop {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(_) => {
                                let resp = format!(
                                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{}",
                                    body.len(),
                                    body
                                );
                                if socket.write_all(resp.as_bytes()).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                });
            }
        });
        (addr, accepts)
    }

    #[test]
    fn test_node_overrides() {
        let base = opts();
        assert_eq!(base.with_node(None), base);

        let node = HttpOptions {
            read_timeout_ms: Some(250),
            write_buffer_size: Some(16 * 1024),
            ..Default::default()
        };
        let merged = base.with_node(Some(&node));
        assert_eq!(merged.read_timeout, Duration::from_millis(250));
        assert_eq!(merged.write_timeout, base.write_timeout);
        assert_eq!(merged.buf_size, 16 * 1024);
    }

    #[tokio::test]
    async fn test_connection_reused() {
        let (addr, accepts) = backend("pong").await;
        let client = BackendClient::new(opts());

        for _ in 0..3 {
            let resp = client.send("http", &addr, &get("/ping"), &opts()).await.unwrap();
            assert_eq!(resp.status, StatusCode::OK);
            assert_eq!(&resp.body[..], b"pong");
        }
        assert_eq!(accepts.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(client.idle_count(), 1);
    }

    #[tokio::test]
    async fn test_body_limit_and_errors() {
        let (addr, _) = backend("0123456789").await;
        let client = BackendClient::new(opts());
        let mut small = opts();
        small.max_body = 4;
        assert!(matches!(
            client.send("http", &addr, &get("/"), &small).await,
            Err(ClientError::Body(_))
        ));

        assert!(matches!(
            client.send("https", &addr, &get("/"), &opts()).await,
            Err(ClientError::Scheme(_))
        ));

        let err: GatewayError = ClientError::Timeout("reading the response head").into();
        assert_eq!(err, GatewayError::UpstreamTimeout);
    }

    #[tokio::test]
    async fn test_cleaner_evicts_idle() {
        let (addr, _) = backend("ok").await;
        let mut o = opts();
        o.max_idle_duration = Duration::from_millis(1);
        let client = BackendClient::new(o.clone());
        client.send("http", &addr, &get("/"), &o).await.unwrap();
        assert_eq!(client.idle_count(), 1);

        tokio::time::sleep(Duration::from_millis(10)).await;
        client.clean();
        assert_eq!(client.idle_count(), 0);
    }
}
