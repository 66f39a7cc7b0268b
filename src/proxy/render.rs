//! Turn dispatch results into the client response.
//!
//! # Data Flow
//! ```text
//! no nodes / use_default  → API default value
//! one node                → backend status, headers and body
//!                           (projected through the render template if any)
//! several nodes           → {attr_name: body, ...} from the multi context
//!                           (projected through the render template if any)
//! ```
//!
//! # Design Decisions
//! - A failed node without its own default fails the whole response,
//!   falling back to the API default when one exists
//! - Template values that are missing or null render as `""`

use axum::body::{Body, Bytes};
use axum::http::{header, HeaderMap, HeaderValue, Response, StatusCode};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::error::GatewayError;
use crate::http::request::json_path;
use crate::http::response::{json_response, BackendResponse, JSON_CONTENT_TYPE};
use crate::model::{Api, HttpResult, RenderAttr, RenderTemplate};
use crate::security::headers::strip_hop_by_hop;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RenderError {
    #[error("source is not JSON: {0}")]
    InvalidJson(String),
}

/// What one dispatch node produced.
#[derive(Debug, Clone)]
pub struct NodeResult {
    pub attr_name: String,
    pub response: Option<BackendResponse>,
    pub error: Option<GatewayError>,
    /// Status the node failed with, or the backend status.
    pub code: u16,
    /// The node fell back to its own default value.
    pub defaulted: bool,
}

impl NodeResult {
    pub fn new(attr_name: &str) -> Self {
        Self {
            attr_name: attr_name.to_string(),
            response: None,
            error: None,
            code: 0,
            defaulted: false,
        }
    }

    pub fn failed(attr_name: &str, err: GatewayError) -> Self {
        let mut result = Self::new(attr_name);
        result.code = err.status_code().as_u16();
        result.error = Some(err);
        result
    }

    pub fn has_error(&self) -> bool {
        !self.defaulted && (self.error.is_some() || self.code >= 400)
    }
}

/// Node bodies of one request keyed by attr name.
#[derive(Debug, Default)]
pub struct MultiContext {
    data: Mutex<Map<String, Value>>,
}

impl MultiContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a node body. Non-JSON bodies are kept as strings.
    pub fn complete_part(&self, attr: &str, body: &[u8]) {
        if body.is_empty() {
            return;
        }
        let value = serde_json::from_slice(body)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()));
        self.data.lock().insert(attr.to_string(), value);
    }

    pub fn get(&self, attr: &str) -> Option<Value> {
        self.data.lock().get(attr).cloned()
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.data.lock().clone())
    }
}

pub fn render(api: &Api, mut nodes: Vec<NodeResult>, multi: &MultiContext) -> Response<Body> {
    if nodes.len() > 1 {
        return render_multi(api, nodes, multi);
    }
    match nodes.pop() {
        Some(node) => render_single(api, node),
        None => render_default(api.default_value.as_ref()),
    }
}

/// The API default value, with `code` 0 meaning 200.
pub fn render_default(value: Option<&HttpResult>) -> Response<Body> {
    let Some(value) = value else {
        return json_response(StatusCode::OK, HeaderMap::new(), Bytes::new());
    };
    let mut resp = BackendResponse::from_default(value);
    if resp.content_type().is_none() {
        resp.headers
            .insert(header::CONTENT_TYPE, HeaderValue::from_static(JSON_CONTENT_TYPE));
    }
    resp.into_response()
}

fn render_single(api: &Api, node: NodeResult) -> Response<Body> {
    if node.has_error() && api.default_value.is_some() {
        return render_default(api.default_value.as_ref());
    }
    // A backend error status passes through; only engine errors lose the body.
    if node.error.is_some() && !node.defaulted {
        let status = StatusCode::from_u16(node.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        return json_response(status, HeaderMap::new(), Bytes::new());
    }

    let Some(mut resp) = node.response else {
        return json_response(StatusCode::OK, HeaderMap::new(), Bytes::new());
    };
    strip_hop_by_hop(&mut resp.headers);
    resp.headers.remove(header::CONTENT_LENGTH);

    let Some(template) = api.render_template.as_ref() else {
        if resp.content_type().is_none() {
            resp.headers
                .insert(header::CONTENT_TYPE, HeaderValue::from_static(JSON_CONTENT_TYPE));
        }
        return resp.into_response();
    };

    let source = match serde_json::from_slice::<Value>(&resp.body) {
        Ok(v) => v,
        Err(e) => return template_failed(&RenderError::InvalidJson(e.to_string())),
    };
    let body = extract(template, &source).to_string();
    json_response(resp.status, resp.headers, Bytes::from(body))
}

fn render_multi(api: &Api, nodes: Vec<NodeResult>, multi: &MultiContext) -> Response<Body> {
    let mut headers = HeaderMap::new();
    let failed = nodes.iter().find(|n| n.has_error());

    if let Some(node) = failed {
        if api.default_value.is_some() {
            return render_default(api.default_value.as_ref());
        }
        tracing::warn!(
            api = %api.name,
            attr = %node.attr_name,
            code = node.code,
            error = ?node.error,
            "Aggregated request failed"
        );
        let status = StatusCode::from_u16(node.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        return json_response(status, headers, Bytes::new());
    }

    for node in &nodes {
        if let Some(resp) = &node.response {
            for (name, value) in &resp.headers {
                headers.insert(name.clone(), value.clone());
            }
        }
    }
    strip_hop_by_hop(&mut headers);
    for name in [header::CONTENT_LENGTH, header::CONTENT_TYPE, header::DATE] {
        headers.remove(name);
    }

    let merged = multi.to_value();
    let body = match api.render_template.as_ref() {
        Some(template) => extract(template, &merged),
        None => merged,
    };
    json_response(StatusCode::OK, headers, Bytes::from(body.to_string()))
}

fn template_failed(err: &RenderError) -> Response<Body> {
    tracing::error!(error = %err, "Render template failed");
    json_response(StatusCode::INTERNAL_SERVER_ERROR, HeaderMap::new(), Bytes::new())
}

/// Project `source` through a render template.
pub fn extract(template: &RenderTemplate, source: &Value) -> Value {
    let mut data = Map::new();
    for object in &template.objects {
        let mut nested = Map::new();
        for attr in object.attrs.iter().filter(|a| !a.name.is_empty()) {
            let value = extract_value(attr, source);
            if object.flat_attrs {
                data.insert(attr.name.clone(), value);
            } else {
                nested.insert(attr.name.clone(), value);
            }
        }
        if !object.flat_attrs && !object.name.is_empty() {
            data.insert(object.name.clone(), Value::Object(nested));
        }
    }
    Value::Object(data)
}

fn extract_value(attr: &RenderAttr, source: &Value) -> Value {
    let paths: Vec<&str> = attr
        .extract_exp
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();

    if let [path] = paths.as_slice() {
        return extract_path(source, path);
    }

    let mut object = Map::new();
    for path in paths {
        if let Some(last) = path.rsplit('.').find(|p| !p.is_empty()) {
            object.insert(last.to_string(), extract_path(source, path));
        }
    }
    Value::Object(object)
}

fn extract_path(source: &Value, path: &str) -> Value {
    match json_path(source, path) {
        None | Some(Value::Null) => Value::String(String::new()),
        Some(v) => v.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::context::tests::api;
    use crate::model::{NameValue, RenderObject};
    use http_body_util::BodyExt;

    async fn body(resp: Response<Body>) -> String {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn ok(attr: &str, status: u16, headers: &[(&'static str, &'static str)], body: &str) -> NodeResult {
        let mut map = HeaderMap::new();
        for (k, v) in headers {
            map.insert(*k, HeaderValue::from_static(*v));
        }
        let mut node = NodeResult::new(attr);
        node.code = status;
        node.response = Some(BackendResponse::new(
            StatusCode::from_u16(status).unwrap(),
            map,
            Bytes::from(body.to_string()),
        ));
        node
    }

    fn attr(name: &str, exp: &str) -> RenderAttr {
        RenderAttr {
            name: name.into(),
            extract_exp: exp.into(),
        }
    }

    #[tokio::test]
    async fn test_single_raw_passthrough() {
        let a = api(1);
        let node = ok("", 201, &[("content-type", "text/plain"), ("x-trace", "t1")], "hello");
        let resp = render(&a, vec![node], &MultiContext::new());
        assert_eq!(resp.status(), StatusCode::CREATED);
        assert_eq!(resp.headers()["content-type"], "text/plain");
        assert_eq!(resp.headers()["x-trace"], "t1");
        assert_eq!(body(resp).await, "hello");
    }

    #[tokio::test]
    async fn test_single_error_uses_api_default() {
        let mut a = api(1);
        let failed = NodeResult::failed("", GatewayError::NoServer);
        let resp = render(&a, vec![failed.clone()], &MultiContext::new());
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let resp = render(&a, vec![ok("", 404, &[], "missing")], &MultiContext::new());
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(body(resp).await, "missing");

        a.default_value = Some(HttpResult {
            code: 0,
            body: "fallback".into(),
            headers: vec![NameValue {
                name: "Content-Type".into(),
                value: "text/plain".into(),
            }],
            cookies: vec![],
        });
        let resp = render(&a, vec![failed], &MultiContext::new());
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["content-type"], "text/plain");
        assert_eq!(body(resp).await, "fallback");
    }

    #[tokio::test]
    async fn test_multi_merge() {
        let mut a = api(2);
        a.nodes[0].attr_name = "user".into();
        a.nodes[1].attr_name = "orders".into();
        let multi = MultiContext::new();
        multi.complete_part("user", br#"{"id":1}"#);
        multi.complete_part("orders", b"[1,2]");

        let nodes = vec![
            ok("user", 200, &[("content-type", "text/plain"), ("x-a", "1"), ("date", "x")], ""),
            ok("orders", 200, &[("x-b", "2")], ""),
        ];
        let resp = render(&a, nodes, &multi);
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["content-type"], JSON_CONTENT_TYPE);
        assert_eq!(resp.headers()["x-a"], "1");
        assert_eq!(resp.headers()["x-b"], "2");
        assert!(resp.headers().get("date").is_none());

        let value: Value = serde_json::from_str(&body(resp).await).unwrap();
        assert_eq!(value, serde_json::json!({"user": {"id": 1}, "orders": [1, 2]}));
    }

    #[tokio::test]
    async fn test_multi_failure_and_node_default() {
        let a = api(2);
        let nodes = vec![ok("a", 200, &[], ""), NodeResult::failed("b", GatewayError::Blacklist)];
        let resp = render(&a, nodes, &MultiContext::new());
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let mut defaulted = NodeResult::failed("b", GatewayError::NoServer);
        defaulted.defaulted = true;
        let nodes = vec![ok("a", 200, &[], ""), defaulted];
        let resp = render(&a, nodes, &MultiContext::new());
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[test]
    fn test_template_projection() {
        let template = RenderTemplate {
            objects: vec![
                RenderObject {
                    name: String::new(),
                    flat_attrs: true,
                    attrs: vec![attr("id", "user.id"), attr("missing", "user.nope")],
                },
                RenderObject {
                    name: "profile".into(),
                    flat_attrs: false,
                    attrs: vec![
                        attr("name", "user.name"),
                        attr("contact", "user.email, user.phone"),
                        attr("tags", "user.tags"),
                    ],
                },
            ],
        };
        let source = serde_json::json!({
            "user": {"id": 7, "name": "ann", "email": "a@x", "phone": null, "tags": []}
        });
        assert_eq!(
            extract(&template, &source),
            serde_json::json!({
                "id": 7,
                "missing": "",
                "profile": {
                    "name": "ann",
                    "contact": {"email": "a@x", "phone": ""},
                    "tags": []
                }
            })
        );
    }

    #[tokio::test]
    async fn test_template_on_invalid_json_fails() {
        let mut a = api(1);
        a.render_template = Some(RenderTemplate {
            objects: vec![RenderObject {
                name: "x".into(),
                flat_attrs: false,
                attrs: vec![attr("a", "a")],
            }],
        });
        let resp = render(&a, vec![ok("", 200, &[], "not json")], &MultiContext::new());
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
