//! Request handling and transformation.
//!
//! # Responsibilities
//! - Generate a request id (UUID v4) for requests that lack one
//! - Buffer the client request into an [`OriginRequest`] shared by every
//!   dispatch node
//! - Read request values by source: header, cookie, query, form, JSON body,
//!   path param
//! - Resolve the real client IP

use axum::body::Bytes;
use axum::http::{header, HeaderMap, HeaderValue, Method, Request, Uri, Version};
use std::borrow::Cow;
use std::net::{IpAddr, SocketAddr};
use std::sync::OnceLock;
use tower_http::request_id::{MakeRequestId, RequestId};
use uuid::Uuid;

use crate::model::Source;
use crate::routing::Params;

pub const X_REQUEST_ID: &str = "x-request-id";
pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
pub const X_REAL_IP: &str = "x-real-ip";

/// Request id generator for `tower_http::request_id`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MakeRequestUuid;

impl MakeRequestId for MakeRequestUuid {
    fn make_request_id<B>(&mut self, _request: &Request<B>) -> Option<RequestId> {
        HeaderValue::from_str(&Uuid::new_v4().to_string())
            .ok()
            .map(RequestId::new)
    }
}

/// The buffered client request.
#[derive(Debug)]
pub struct OriginRequest {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub remote_addr: SocketAddr,
    json: OnceLock<Option<serde_json::Value>>,
}

impl OriginRequest {
    pub fn new(
        method: Method,
        uri: Uri,
        version: Version,
        headers: HeaderMap,
        body: Bytes,
        remote_addr: SocketAddr,
    ) -> Self {
        Self {
            method,
            uri,
            version,
            headers,
            body,
            remote_addr,
            json: OnceLock::new(),
        }
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// Path plus query, as the client sent it.
    pub fn request_uri(&self) -> &str {
        self.uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or_else(|| self.uri.path())
    }

    pub fn request_id(&self) -> &str {
        self.header(X_REQUEST_ID).unwrap_or("-")
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn host(&self) -> Option<&str> {
        self.header(header::HOST.as_str())
            .or_else(|| self.uri.authority().map(|a| a.as_str()))
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v)
    }

    pub fn query(&self, name: &str) -> Option<String> {
        let query = self.uri.query()?;
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }

    pub fn form(&self, name: &str) -> Option<String> {
        let is_form = self
            .header(header::CONTENT_TYPE.as_str())
            .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"));
        if !is_form {
            return None;
        }
        url::form_urlencoded::parse(&self.body[..])
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }

    /// Value at a dotted path in the JSON body. Strings come back unquoted.
    pub fn json_value(&self, path: &str) -> Option<String> {
        let root = self
            .json
            .get_or_init(|| serde_json::from_slice(&self.body).ok())
            .as_ref()?;
        json_path(root, path).and_then(json_to_string)
    }

    /// Read a request value by source.
    pub fn value<'a>(&'a self, source: Source, name: &str, params: &'a Params) -> Option<Cow<'a, str>> {
        match source {
            Source::Header => self.header(name).map(Cow::Borrowed),
            Source::Cookie => self.cookie(name).map(Cow::Borrowed),
            Source::Query => self.query(name).map(Cow::Owned),
            Source::Form => self.form(name).map(Cow::Owned),
            Source::JsonBody => self.json_value(name).map(Cow::Owned),
            Source::PathValue => params.get(name).map(Cow::Borrowed),
        }
    }

    /// First `X-Forwarded-For` entry, else `X-Real-Ip`, else the peer.
    pub fn real_ip(&self) -> String {
        if let Some(first) = self
            .header(X_FORWARDED_FOR)
            .and_then(|xff| xff.split(',').next())
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            return first.to_string();
        }
        if let Some(real) = self.header(X_REAL_IP).filter(|s| !s.is_empty()) {
            return real.trim().to_string();
        }
        self.remote_addr.ip().to_string()
    }

    pub fn remote_ip(&self) -> IpAddr {
        self.remote_addr.ip()
    }
}

/// The copy of the origin request a dispatch node sends to its backend.
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub method: Method,
    /// Path plus query.
    pub uri: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ForwardRequest {
    pub fn from_origin(origin: &OriginRequest) -> Self {
        Self {
            method: origin.method.clone(),
            uri: origin.request_uri().to_string(),
            headers: origin.headers.clone(),
            body: origin.body.clone(),
        }
    }

    /// Replace path and query with a rewritten target.
    pub fn set_uri(&mut self, uri: String) {
        self.uri = if uri.starts_with('/') { uri } else { format!("/{uri}") };
    }

    pub fn set_host(&mut self, host: &str) {
        if let Ok(value) = HeaderValue::from_str(host) {
            self.headers.insert(header::HOST, value);
        }
    }

    pub fn host(&self) -> Option<&str> {
        self.headers.get(header::HOST).and_then(|v| v.to_str().ok())
    }

    /// Append a `name=value` pair to the `Cookie` header.
    pub fn add_cookie(&mut self, name: &str, value: &str) {
        let cookie = match self.headers.get(header::COOKIE).and_then(|v| v.to_str().ok()) {
            Some(existing) if !existing.is_empty() => format!("{existing}; {name}={value}"),
            _ => format!("{name}={value}"),
        };
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            self.headers.insert(header::COOKIE, value);
        }
    }
}

/// Walk a dotted path. Numeric components index arrays.
pub fn json_path<'v>(root: &'v serde_json::Value, path: &str) -> Option<&'v serde_json::Value> {
    path.split('.')
        .filter(|p| !p.is_empty())
        .try_fold(root, |value, part| match value {
            serde_json::Value::Object(map) => map.get(part),
            serde_json::Value::Array(items) => part.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

fn json_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}
