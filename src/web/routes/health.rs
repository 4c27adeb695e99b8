// Health check route handler

use hyper::{Body, Response, StatusCode};
use std::convert::Infallible;

use super::AppState;
use crate::web::response_helpers::json_response;

pub async fn handle(state: &AppState) -> Result<Response<Body>, Infallible> {
    Ok(json_response(
        StatusCode::OK,
        &serde_json::json!({
            "status": "ok",
            "service": "llama-gateway",
            "loaded_backends": state.loader.loaded_count(),
        }),
    ))
}
