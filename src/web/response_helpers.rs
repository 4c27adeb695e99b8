// HTTP response helpers shared by the admin route handlers

use hyper::header::{HeaderName, HeaderValue, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_TYPE};
use hyper::{Body, Response, StatusCode};
use serde::Serialize;

/// Standard CORS headers
const CORS_ORIGIN: &str = "*";
const CORS_METHODS: &str = "GET, POST, OPTIONS";
const CORS_HEADERS: &str = "content-type, authorization";

fn with_headers(status: StatusCode, body: Body, json: bool) -> Response<Body> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    let headers = response.headers_mut();
    let mut set = |name: HeaderName, value: &'static str| {
        headers.insert(name, HeaderValue::from_static(value));
    };
    if json {
        set(CONTENT_TYPE, "application/json");
    }
    set(ACCESS_CONTROL_ALLOW_ORIGIN, CORS_ORIGIN);
    set(ACCESS_CONTROL_ALLOW_METHODS, CORS_METHODS);
    set(ACCESS_CONTROL_ALLOW_HEADERS, CORS_HEADERS);
    response
}

/// Build a JSON response with CORS headers
pub fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Body> {
    let json = serde_json::to_string(body).unwrap_or_else(|_| r#"{"error":"Serialization failed"}"#.to_string());
    with_headers(status, Body::from(json), true)
}

/// Build a JSON error response
pub fn json_error(status: StatusCode, message: &str) -> Response<Body> {
    json_response(status, &serde_json::json!({ "error": message }))
}

/// Build an empty response with CORS headers
pub fn empty_response(status: StatusCode) -> Response<Body> {
    with_headers(status, Body::empty(), false)
}

/// CORS preflight response
pub fn cors_preflight() -> Response<Body> {
    empty_response(StatusCode::OK)
}
