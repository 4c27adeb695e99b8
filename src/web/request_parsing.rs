// Request parsing utilities for HTTP handlers

use hyper::{Body, Response, StatusCode, Uri};
use log::{debug, error};
use serde::de::DeserializeOwned;

use crate::web::response_helpers::json_error;

/// Parse JSON request body into a typed structure.
///
/// Returns the deserialized value on success, or a ready-to-send 400 response.
///
/// # Example
/// ```ignore
/// let request: LoadBackendRequest = match parse_json_body(req.into_body()).await {
///     Ok(req) => req,
///     Err(error_response) => return Ok(error_response),
/// };
/// ```
pub async fn parse_json_body<T: DeserializeOwned>(body: Body) -> Result<T, Response<Body>> {
    let body_bytes = match hyper::body::to_bytes(body).await {
        Ok(bytes) => bytes,
        Err(_) => return Err(json_error(StatusCode::BAD_REQUEST, "Failed to read request body")),
    };

    if let Ok(body_str) = std::str::from_utf8(&body_bytes) {
        if !body_str.is_empty() {
            debug!("[REQUEST] Body: {}", body_str);
        }
    }

    serde_json::from_slice::<T>(&body_bytes).map_err(|e| {
        error!("[REQUEST] JSON parsing error: {}", e);
        json_error(StatusCode::BAD_REQUEST, "Invalid JSON format")
    })
}

/// Extract a URL-decoded query parameter from URI.
pub fn get_query_param(uri: &Uri, key: &str) -> Option<String> {
    let query = uri.query()?;

    for param in query.split('&') {
        if let Some((param_key, param_value)) = param.split_once('=') {
            if param_key == key {
                return urlencoding::decode(param_value).ok().map(|s| s.to_string());
            }
        }
    }

    None
}
