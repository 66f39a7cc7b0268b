//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP/TLS connection
//!     → server.rs (Axum setup, request id, timeout, trace)
//!     → request.rs (buffer into OriginRequest, read values by source)
//!     → proxy::Gateway::handle (route, dispatch, render)
//!     → response.rs (buffered backend / default responses)
//!     → Send to client
//!
//! Upgrade: websocket
//!     → websocket.rs (route, then bridge frames to the backend)
//! ```

pub mod request;
pub mod response;
pub mod server;
pub mod websocket;

pub use request::{ForwardRequest, MakeRequestUuid, OriginRequest, X_REQUEST_ID};
pub use response::{BackendResponse, JSON_CONTENT_TYPE};
pub use server::HttpServer;
