//! Header manipulation.
//!
//! # Responsibilities
//! - Strip hop-by-hop headers from forward requests and backend responses
//! - Append the client IP to `X-Forwarded-For`

use axum::http::{HeaderMap, HeaderName, HeaderValue};

use crate::http::request::X_FORWARDED_FOR;

/// Hop-by-hop headers removed in both directions.
pub const HOP_BY_HOP: [&str; 6] = [
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
];

pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Append `ip` to the existing list, or start one.
pub fn append_forwarded_for(headers: &mut HeaderMap, ip: &str) {
    let value = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(prior) if !prior.trim().is_empty() => format!("{prior}, {ip}"),
        _ => ip.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(HeaderName::from_static(X_FORWARDED_FOR), value);
    }
}
