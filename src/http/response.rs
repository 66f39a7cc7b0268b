//! Response handling and transformation.
//!
//! # Responsibilities
//! - Hold a buffered backend response for filters and render
//! - Build client responses from backend results, defaults and errors
//! - Strip hop-by-hop headers before anything reaches the client

use axum::body::{Body, Bytes};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Response, StatusCode};

use crate::model::HttpResult;

pub const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";

/// A fully buffered backend (or synthesized) response.
#[derive(Debug, Clone)]
pub struct BackendResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl BackendResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self { status, headers, body }
    }

    /// A response carrying only a content type and a body, as served from cache.
    pub fn cached(content_type: Option<&str>, body: Bytes) -> Self {
        let mut headers = HeaderMap::new();
        if let Some(value) = content_type.and_then(|ct| HeaderValue::from_str(ct).ok()) {
            headers.insert(header::CONTENT_TYPE, value);
        }
        Self::new(StatusCode::OK, headers, body)
    }

    /// The canned response of an API or node default value.
    pub fn from_default(value: &HttpResult) -> Self {
        let mut headers = HeaderMap::new();
        for h in &value.headers {
            if let (Ok(name), Ok(v)) = (HeaderName::try_from(h.name.as_str()), HeaderValue::from_str(&h.value)) {
                headers.append(name, v);
            }
        }
        for c in &value.cookies {
            if let Ok(v) = HeaderValue::from_str(&format!("{}={}", c.name, c.value)) {
                headers.append(header::SET_COOKIE, v);
            }
        }
        let status = StatusCode::from_u16(value.code).unwrap_or(StatusCode::OK);
        Self::new(status, headers, Bytes::from(value.body.clone()))
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
    }

    pub fn is_error(&self) -> bool {
        self.status.as_u16() >= 400
    }

    pub fn into_response(self) -> Response<Body> {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// An empty response with only a status.
pub fn status_response(status: StatusCode) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    response
}

pub fn json_response(status: StatusCode, headers: HeaderMap, body: Bytes) -> Response<Body> {
    let mut response = BackendResponse::new(status, headers, body).into_response();
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(JSON_CONTENT_TYPE));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NameValue;

    #[test]
    fn test_default_value_response() {
        let value = HttpResult {
            code: 202,
            body: "fallback".into(),
            headers: vec![NameValue {
                name: "Content-Type".into(),
                value: "text/plain".into(),
            }],
            cookies: vec![NameValue {
                name: "sid".into(),
                value: "1".into(),
            }],
        };
        let resp = BackendResponse::from_default(&value);
        assert_eq!(resp.status, StatusCode::ACCEPTED);
        assert_eq!(resp.content_type(), Some("text/plain"));
        assert_eq!(resp.headers.get(header::SET_COOKIE).unwrap(), "sid=1");
        assert_eq!(&resp.body[..], b"fallback");
    }

    #[test]
    fn test_json_response_sets_content_type() {
        let resp = json_response(StatusCode::OK, HeaderMap::new(), Bytes::from_static(b"{}"));
        assert_eq!(resp.headers().get(header::CONTENT_TYPE).unwrap(), JSON_CONTENT_TYPE);
    }
}
