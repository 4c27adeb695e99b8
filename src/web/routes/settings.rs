// Runtime watchdog settings

use hyper::{Body, Request, Response, StatusCode};
use log::{info, warn};
use std::convert::Infallible;

use llama_gateway_types::WatchdogSettings;

use super::AppState;
use crate::web::request_parsing::parse_json_body;
use crate::web::response_helpers::{json_error, json_response};

pub async fn handle_get(state: &AppState) -> Result<Response<Body>, Infallible> {
    Ok(json_response(StatusCode::OK, &state.watchdog.config().to_settings()))
}

/// Patch the settings that may change without a restart. Absent fields keep
/// their value; an invalid patch leaves everything untouched.
pub async fn handle_post(req: Request<Body>, state: &AppState) -> Result<Response<Body>, Infallible> {
    let patch: WatchdogSettings = match parse_json_body(req.into_body()).await {
        Ok(patch) => patch,
        Err(error_response) => return Ok(error_response),
    };

    match state.watchdog.update_settings(&patch) {
        Ok(config) => {
            info!("[SETTINGS] Watchdog settings updated: {:?}", patch);
            Ok(json_response(StatusCode::OK, &config.to_settings()))
        }
        Err(e) => {
            warn!("[SETTINGS] Rejected settings update: {e}");
            Ok(json_error(StatusCode::BAD_REQUEST, &e.to_string()))
        }
    }
}
