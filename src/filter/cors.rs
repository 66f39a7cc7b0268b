//! `CROSS` filter: answers CORS preflights locally and decorates responses.

use axum::body::Bytes;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};

use super::context::{Flow, FilterContext};
use crate::config::schema::CorsConfig;
use crate::error::GatewayError;
use crate::http::response::BackendResponse;

#[derive(Debug)]
pub struct CorsFilter {
    preflight: HeaderMap,
    simple: HeaderMap,
}

fn insert(headers: &mut HeaderMap, name: HeaderName, values: &[String]) {
    if values.is_empty() {
        return;
    }
    if let Ok(value) = HeaderValue::from_str(&values.join(", ")) {
        headers.insert(name, value);
    }
}

impl CorsFilter {
    pub fn new(config: &CorsConfig) -> Self {
        let mut simple = HeaderMap::new();
        insert(&mut simple, header::ACCESS_CONTROL_ALLOW_ORIGIN, &config.allow_origins);
        insert(&mut simple, header::ACCESS_CONTROL_EXPOSE_HEADERS, &config.expose_headers);
        if config.allow_credentials {
            simple.insert(
                header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
                HeaderValue::from_static("true"),
            );
        }

        let mut preflight = simple.clone();
        insert(&mut preflight, header::ACCESS_CONTROL_ALLOW_METHODS, &config.allow_methods);
        insert(&mut preflight, header::ACCESS_CONTROL_ALLOW_HEADERS, &config.allow_headers);
        preflight.insert(header::ACCESS_CONTROL_MAX_AGE, HeaderValue::from(config.max_age_secs));

        Self { preflight, simple }
    }

    pub fn pre(&self, ctx: &mut FilterContext) -> Result<Flow, GatewayError> {
        if ctx.origin.method != Method::OPTIONS {
            return Ok(Flow::Continue);
        }
        ctx.response = Some(BackendResponse::new(
            StatusCode::NO_CONTENT,
            self.preflight.clone(),
            Bytes::new(),
        ));
        Ok(Flow::ShortCircuit)
    }

    pub fn post(&self, ctx: &mut FilterContext) -> Result<(), GatewayError> {
        if let Some(resp) = ctx.response.as_mut() {
            for (name, value) in &self.simple {
                resp.headers.insert(name.clone(), value.clone());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::context::tests::{api, context};
    use crate::http::request::tests::request;

    #[test]
    fn test_preflight_short_circuits() {
        let filter = CorsFilter::new(&CorsConfig::default());
        let mut ctx = context(api(1), request("OPTIONS", "/a", &[], ""), None);
        assert_eq!(filter.pre(&mut ctx).unwrap(), Flow::ShortCircuit);

        let resp = ctx.response.unwrap();
        assert_eq!(resp.status, StatusCode::NO_CONTENT);
        assert_eq!(resp.headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(resp.headers[header::ACCESS_CONTROL_MAX_AGE], "600");
        assert!(resp.headers[header::ACCESS_CONTROL_ALLOW_METHODS]
            .to_str()
            .unwrap()
            .contains("POST"));
    }

    #[test]
    fn test_simple_request_decorated() {
        let filter = CorsFilter::new(&CorsConfig::default());
        let mut ctx = context(api(1), request("GET", "/a", &[], ""), None);
        assert_eq!(filter.pre(&mut ctx).unwrap(), Flow::Continue);

        ctx.response = Some(BackendResponse::new(StatusCode::OK, HeaderMap::new(), Bytes::new()));
        filter.post(&mut ctx).unwrap();
        let resp = ctx.response.unwrap();
        assert_eq!(resp.headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert!(!resp.headers.contains_key(header::ACCESS_CONTROL_MAX_AGE));
    }
}
