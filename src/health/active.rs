//! Active health checking.
//!
//! # Responsibilities
//! - Probe each watched server on its own timer
//! - Back off on failing servers: the interval grows ×1.5 up to a cap
//! - Report status transitions to the dispatch table

use axum::body::Body;
use axum::http::{Request, StatusCode};
use dashmap::DashMap;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time;

use crate::health::state::StatusChange;
use crate::load_balancer::ServerRuntime;
use crate::model::Status;
use crate::observability::metrics;
use crate::timer::{TimerHandle, TimingWheel};

const MAX_CHECK_BODY: usize = 64 * 1024;

struct Probe {
    server: Arc<ServerRuntime>,
    url: String,
    expect_body: Option<String>,
    base_interval: Duration,
    timeout: Duration,
    interval: Mutex<Duration>,
    fails: AtomicU32,
    timer: Mutex<Option<TimerHandle>>,
    cancelled: AtomicBool,
}

pub struct HealthChecker {
    client: Client<HttpConnector, Body>,
    wheel: Arc<TimingWheel>,
    events: mpsc::Sender<StatusChange>,
    max_interval: Duration,
    probes: DashMap<u64, Arc<Probe>>,
}

impl std::fmt::Debug for HealthChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthChecker")
            .field("probes", &self.probes.len())
            .field("max_interval", &self.max_interval)
            .finish()
    }
}

impl HealthChecker {
    pub fn new(wheel: Arc<TimingWheel>, events: mpsc::Sender<StatusChange>, max_interval: Duration) -> Arc<Self> {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());

        Arc::new(Self {
            client,
            wheel,
            events,
            max_interval,
            probes: DashMap::new(),
        })
    }

    /// Start probing `server`, replacing any previous probe for its id.
    /// The first probe runs right away.
    pub fn watch(self: &Arc<Self>, server: Arc<ServerRuntime>) {
        self.unwatch(server.id());

        let Some(check) = server.meta.health_check.clone() else {
            return;
        };
        if !server.needs_probe() {
            return;
        }

        let base_interval = Duration::from_millis(check.interval_ms.max(1));
        let probe = Arc::new(Probe {
            url: format!("{}{}", server.base_url(), check.path),
            expect_body: check.body.filter(|b| !b.is_empty()),
            base_interval,
            timeout: Duration::from_millis(check.timeout_ms.max(1)),
            interval: Mutex::new(base_interval),
            fails: AtomicU32::new(0),
            timer: Mutex::new(None),
            cancelled: AtomicBool::new(false),
            server,
        });

        tracing::debug!(server_id = probe.server.id(), url = %probe.url, "Health check watching");
        self.probes.insert(probe.server.id(), probe.clone());
        self.spawn_check(probe);
    }

    pub fn unwatch(&self, server_id: u64) {
        if let Some((_, probe)) = self.probes.remove(&server_id) {
            probe.cancelled.store(true, Ordering::Release);
            if let Some(handle) = probe.timer.lock().take() {
                self.wheel.cancel(handle);
            }
        }
    }

    /// Cancel every probe.
    pub fn stop(&self) {
        let ids: Vec<u64> = self.probes.iter().map(|p| *p.key()).collect();
        for id in ids {
            self.unwatch(id);
        }
    }

    pub fn watched(&self) -> usize {
        self.probes.len()
    }

    fn spawn_check(self: &Arc<Self>, probe: Arc<Probe>) {
        let checker = self.clone();
        tokio::spawn(async move {
            if probe.cancelled.load(Ordering::Acquire) {
                return;
            }
            checker.check(&probe).await;
            checker.reschedule(probe);
        });
    }

    fn reschedule(self: &Arc<Self>, probe: Arc<Probe>) {
        if probe.cancelled.load(Ordering::Acquire) {
            return;
        }

        let delay = (*probe.interval.lock()).min(self.max_interval);
        let weak = Arc::downgrade(self);
        let next = probe.clone();
        let handle = self.wheel.schedule(delay, move || {
            if let Some(checker) = weak.upgrade() {
                checker.spawn_check(next);
            }
        });

        let mut timer = probe.timer.lock();
        if probe.cancelled.load(Ordering::Acquire) {
            self.wheel.cancel(handle);
        } else {
            *timer = Some(handle);
        }
    }

    async fn check(&self, probe: &Probe) {
        let healthy = self.probe_once(probe).await;
        let id = probe.server.id();

        let status = if healthy {
            probe.fails.store(0, Ordering::Relaxed);
            *probe.interval.lock() = probe.base_interval;
            Status::Up
        } else {
            let fails = probe.fails.fetch_add(1, Ordering::Relaxed) + 1;
            let mut interval = probe.interval.lock();
            *interval = (*interval + *interval / 2).min(self.max_interval);
            tracing::warn!(server_id = id, url = %probe.url, fails, next_check = ?*interval, "Health check failed");
            Status::Down
        };

        metrics::record_server_status(&probe.server.meta.addr, healthy);

        if status != probe.server.status() {
            let change = StatusChange { server_id: id, status };
            if self.events.send(change).await.is_err() {
                tracing::debug!(server_id = id, "Status event dropped, table loop gone");
            }
        }
    }

    async fn probe_once(&self, probe: &Probe) -> bool {
        let request = match Request::builder()
            .method("GET")
            .uri(&probe.url)
            .header("user-agent", "gateway-health-check")
            .body(Body::empty())
        {
            Ok(req) => req,
            Err(e) => {
                tracing::error!(url = %probe.url, error = %e, "Failed to build health check request");
                return false;
            }
        };

        let response = match time::timeout(probe.timeout, self.client.request(request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                tracing::debug!(url = %probe.url, error = %e, "Health check connection error");
                return false;
            }
            Err(_) => {
                tracing::debug!(url = %probe.url, "Health check timeout");
                return false;
            }
        };

        if response.status() != StatusCode::OK {
            tracing::debug!(url = %probe.url, status = %response.status(), "Health check non-200 status");
            return false;
        }

        let Some(expect) = &probe.expect_body else {
            return true;
        };

        let body = Body::new(response.into_body());
        match time::timeout(probe.timeout, axum::body::to_bytes(body, MAX_CHECK_BODY)).await {
            Ok(Ok(bytes)) => bytes.as_ref() == expect.as_bytes(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::server::server;
    use crate::model::HealthCheck;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn backend(status: &'static str, body: &'static str) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else { break };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = socket.read(&mut buf).await;
                    let response = format!(
                        "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                });
            }
        });
        addr
    }

    async fn next_change(rx: &mut mpsc::Receiver<StatusChange>, server_id: u64) -> StatusChange {
        loop {
            let change = time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
            if change.server_id == server_id {
                return change;
            }
        }
    }

    fn probed(id: u64, addr: &str, body: Option<&str>) -> Arc<ServerRuntime> {
        let mut meta = server(id, addr);
        meta.health_check = Some(HealthCheck {
            path: "/ok".into(),
            body: body.map(str::to_string),
            interval_ms: 50,
            timeout_ms: 500,
        });
        Arc::new(ServerRuntime::new(meta, 1))
    }

    #[tokio::test]
    async fn test_reports_up_then_backs_off() {
        let wheel = TimingWheel::new(Duration::from_millis(10), 64, 1);
        let (_stop, stop_rx) = tokio::sync::broadcast::channel(1);
        wheel.start(stop_rx);

        let (tx, mut rx) = mpsc::channel(8);
        let checker = HealthChecker::new(wheel.clone(), tx, Duration::from_millis(200));

        let ok = backend("200 OK", "pong").await;
        checker.watch(probed(1, &ok.to_string(), Some("pong")));
        let change = next_change(&mut rx, 1).await;
        assert_eq!(change, StatusChange { server_id: 1, status: Status::Up });
        checker.unwatch(1);

        let wrong_body = backend("200 OK", "nope").await;
        let rt = probed(2, &wrong_body.to_string(), Some("pong"));
        rt.set_status(Status::Up);
        checker.watch(rt);
        let change = next_change(&mut rx, 2).await;
        assert_eq!(change, StatusChange { server_id: 2, status: Status::Down });

        time::sleep(Duration::from_millis(300)).await;
        let interval = *checker.probes.get(&2).unwrap().interval.lock();
        assert!(interval > Duration::from_millis(50));
        assert!(interval <= Duration::from_millis(200));

        checker.stop();
        assert_eq!(checker.watched(), 0);
    }

    #[tokio::test]
    async fn test_unprobed_servers_ignored() {
        let wheel = TimingWheel::new(Duration::from_millis(10), 8, 1);
        let (tx, _rx) = mpsc::channel(1);
        let checker = HealthChecker::new(wheel, tx, Duration::from_secs(1));
        checker.watch(Arc::new(ServerRuntime::new(server(3, "127.0.0.1:1"), 1)));
        assert_eq!(checker.watched(), 0);
    }
}
