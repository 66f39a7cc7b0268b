//! Shared utilities for integration testing.

#![allow(dead_code)]

use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use gateway_proxy::config::ProxyConfig;
use gateway_proxy::dispatch::Snapshot;
use gateway_proxy::lifecycle::{start, Running};
use gateway_proxy::model::{Api, Routing};
use gateway_proxy::store::Store;

/// What a mock backend saw.
#[derive(Debug, Clone)]
pub struct Seen {
    pub method: String,
    pub uri: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Seen {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Start a simple mock backend that returns a fixed response.
pub async fn start_mock_backend(response: &'static str) -> SocketAddr {
    start_programmable_backend(move |_| async move { (200, response.to_string()) }).await
}

/// Start a programmable mock backend. Every connection serves one request
/// and closes.
pub async fn start_programmable_backend<F, Fut>(f: F) -> SocketAddr
where
    F: Fn(Seen) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = (u16, String)> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let f = Arc::new(f);

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    let f = f.clone();
                    tokio::spawn(async move {
                        let Some(seen) = read_request(&mut socket).await else {
                            return;
                        };
                        let (status, body) = f(seen).await;
                        let status_text = match status {
                            200 => "200 OK",
                            404 => "404 Not Found",
                            429 => "429 Too Many Requests",
                            500 => "500 Internal Server Error",
                            502 => "502 Bad Gateway",
                            503 => "503 Service Unavailable",
                            _ => "200 OK",
                        };

                        let response_str = format!(
                            "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            status_text,
                            body.len(),
                            body
                        );
                        let _ = socket.write_all(response_str.as_bytes()).await;
                        let _ = socket.shutdown().await;
                    });
                }
                Err(_) => break,
            }
        }
    });
    addr
}

async fn read_request(socket: &mut TcpStream) -> Option<Seen> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let head_end = loop {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next()?.split(' ');
    let method = request_line.next()?.to_string();
    let uri = request_line.next()?.to_string();
    let headers: Vec<(String, String)> = lines
        .filter_map(|l| l.split_once(':'))
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
        .collect();

    let length = headers
        .iter()
        .find(|(k, _)| k == "content-length")
        .and_then(|(_, v)| v.parse::<usize>().ok())
        .unwrap_or(0);
    let mut body = buf[head_end + 4..].to_vec();
    while body.len() < length {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }

    Some(Seen {
        method,
        uri,
        headers,
        body: String::from_utf8_lossy(&body).to_string(),
    })
}

/// A gateway on an ephemeral port.
pub struct TestGateway {
    pub running: Running,
    pub client: reqwest::Client,
}

impl TestGateway {
    pub async fn boot(mut config: ProxyConfig) -> Self {
        config.addr = "127.0.0.1:0".into();
        config.timer.tick_ms = 10;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let running = start(config, listener).await.unwrap();
        let client = reqwest::Client::builder()
            .no_proxy()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap();
        Self { running, client }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.running.local_addr, path)
    }

    /// Write a catalog record the way the admin collaborator would.
    pub async fn put<T: Serialize>(&self, key: String, record: &T) {
        let value = serde_json::to_string(record).unwrap();
        self.running.store.put(&key, value, None).await.unwrap();
    }

    pub async fn put_json(&self, key: String, record: serde_json::Value) {
        self.put(key, &record).await;
    }

    /// Wait until the dispatch table satisfies `ready`.
    pub async fn wait_for(&self, ready: impl Fn(&Snapshot) -> bool) {
        let table = self.running.gateway.table().clone();
        tokio::time::timeout(Duration::from_secs(5), async move {
            while !ready(table.snapshot().as_ref()) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("dispatch table never reached the expected state");
    }

    /// Cluster `id` with one server per address, ids `id * 10 + n`.
    pub async fn cluster(&self, id: u64, addrs: &[SocketAddr]) {
        self.cluster_with_qps(id, addrs, 1000).await;
    }

    pub async fn cluster_with_qps(&self, id: u64, addrs: &[SocketAddr], max_qps: u64) {
        let keys = &self.running.keys;
        self.put_json(keys.cluster(id), serde_json::json!({"id": id, "name": format!("c{id}")}))
            .await;
        for (n, addr) in addrs.iter().enumerate() {
            let server_id = id * 10 + n as u64;
            self.put_json(
                keys.server(server_id),
                serde_json::json!({"id": server_id, "addr": addr.to_string(), "max_qps": max_qps}),
            )
            .await;
            self.put_json(
                keys.bind(id, server_id),
                serde_json::json!({"cluster_id": id, "server_id": server_id}),
            )
            .await;
        }
        let servers = addrs.len();
        self.wait_for(move |s| s.cluster(id).is_some_and(|c| c.active().len() == servers))
            .await;
    }

    /// Put an API record and wait until the table holds it.
    pub async fn api(&self, record: serde_json::Value) {
        let expected: Api = serde_json::from_value(record).unwrap();
        let key = self.running.keys.api(&expected.url_pattern, &expected.method);
        self.put(key, &expected).await;
        self.wait_for(move |s| s.apis.get(&expected.id).is_some_and(|a| **a == expected))
            .await;
    }

    /// Put a routing rule and wait until the table holds it.
    pub async fn routing(&self, record: serde_json::Value) {
        let expected: Routing = serde_json::from_value(record).unwrap();
        self.put(self.running.keys.routing(expected.id), &expected).await;
        self.wait_for(move |s| s.routings.iter().any(|r| **r == expected))
            .await;
    }

    pub async fn get(&self, path: &str) -> reqwest::Response {
        self.client.get(self.url(path)).send().await.unwrap()
    }

    pub async fn stop(self) {
        self.running.stop(Duration::from_secs(2)).await;
    }
}
