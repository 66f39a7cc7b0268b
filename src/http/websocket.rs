//! WebSocket proxy handling.
//!
//! # Responsibilities
//! - Detect WebSocket upgrade requests
//! - Establish WebSocket connection to backend
//! - Bidirectional frame forwarding
//!
//! # Data Flow
//! ```text
//! Client ←──── WebSocket frames ────→ Gateway ←──── WebSocket frames ────→ Backend
//! ```
//!
//! # Design Decisions
//! - Routed like any request (router + load balancer), then bridged; no
//!   filters or render
//! - Frame-level forwarding (no message buffering)
//! - Close frames propagated in both directions

use axum::extract::ws::{self, WebSocket};
use axum::http::{header, HeaderMap};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

/// Client headers carried over to the backend handshake.
const FORWARDED: [header::HeaderName; 4] = [
    header::AUTHORIZATION,
    header::COOKIE,
    header::ORIGIN,
    header::SEC_WEBSOCKET_PROTOCOL,
];

pub fn is_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

/// Connect to `target` and pump frames until either side closes.
pub async fn bridge(client: WebSocket, target: String, headers: HeaderMap) {
    let mut request = match target.as_str().into_client_request() {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(target = %target, error = %e, "Bad websocket target");
            return;
        }
    };
    for name in FORWARDED {
        if let Some(value) = headers.get(&name) {
            request.headers_mut().insert(name, value.clone());
        }
    }

    let backend = match tokio_tungstenite::connect_async(request).await {
        Ok((stream, _)) => stream,
        Err(e) => {
            tracing::warn!(target = %target, error = %e, "Websocket backend connect failed");
            let mut client = client;
            let _ = client
                .send(ws::Message::Close(Some(ws::CloseFrame {
                    code: 1011,
                    reason: "backend unavailable".into(),
                })))
                .await;
            return;
        }
    };
    tracing::debug!(target = %target, "Websocket bridged");

    let (mut client_tx, mut client_rx) = client.split();
    let (mut backend_tx, mut backend_rx) = backend.split();

    let upstream = async {
        while let Some(Ok(msg)) = client_rx.next().await {
            if backend_tx.send(to_backend(msg)).await.is_err() {
                break;
            }
        }
        let _ = backend_tx.close().await;
    };
    let downstream = async {
        while let Some(Ok(msg)) = backend_rx.next().await {
            let Some(msg) = to_client(msg) else { continue };
            if client_tx.send(msg).await.is_err() {
                break;
            }
        }
        let _ = client_tx.close().await;
    };

    tokio::select! {
        _ = upstream => {}
        _ = downstream => {}
    }
    tracing::debug!(target = %target, "Websocket closed");
}

fn to_backend(msg: ws::Message) -> Message {
    match msg {
        ws::Message::Text(text) => Message::Text(text.as_str().into()),
        ws::Message::Binary(data) => Message::Binary(data),
        ws::Message::Ping(data) => Message::Ping(data),
        ws::Message::Pong(data) => Message::Pong(data),
        ws::Message::Close(frame) => Message::Close(frame.map(|f| CloseFrame {
            code: CloseCode::from(f.code),
            reason: f.reason.as_str().into(),
        })),
    }
}

fn to_client(msg: Message) -> Option<ws::Message> {
    Some(match msg {
        Message::Text(text) => ws::Message::Text(text.as_str().into()),
        Message::Binary(data) => ws::Message::Binary(data),
        Message::Ping(data) => ws::Message::Ping(data),
        Message::Pong(data) => ws::Message::Pong(data),
        Message::Close(frame) => ws::Message::Close(frame.map(|f| ws::CloseFrame {
            code: f.code.into(),
            reason: f.reason.as_str().into(),
        })),
        Message::Frame(_) => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_upgrade_detection() {
        let mut headers = HeaderMap::new();
        assert!(!is_upgrade(&headers));
        headers.insert(header::UPGRADE, HeaderValue::from_static("WebSocket"));
        assert!(is_upgrade(&headers));
        headers.insert(header::UPGRADE, HeaderValue::from_static("h2c"));
        assert!(!is_upgrade(&headers));
    }

    #[test]
    fn test_frame_conversion() {
        assert_eq!(to_backend(ws::Message::Text("hi".into())), Message::Text("hi".into()));
        let close = to_client(Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "bye".into(),
        })));
        match close {
            Some(ws::Message::Close(Some(frame))) => {
                assert_eq!(frame.code, 1000);
                assert_eq!(frame.reason.as_str(), "bye");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
