// Backend lifecycle routes: list, load, shutdown, monitor

use hyper::{Body, Request, Response, StatusCode};
use log::{error, info};
use std::convert::Infallible;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

use llama_gateway_types::{BackendActionResponse, BackendMonitorResponse, LoadBackendRequest, ShutdownBackendRequest};

use super::AppState;
use crate::web::backend::error::BackendError;
use crate::web::backend::selection::LoadOptions;
use crate::web::request_parsing::{get_query_param, parse_json_body};
use crate::web::response_helpers::{json_error, json_response};

fn error_status(err: &BackendError) -> StatusCode {
    match err {
        BackendError::NotFound(_) => StatusCode::NOT_FOUND,
        BackendError::BackendNotFound(_) | BackendError::UnsupportedBackend(_) | BackendError::Config(_) => {
            StatusCode::BAD_REQUEST
        }
        BackendError::AddressInUse { .. } => StatusCode::CONFLICT,
        BackendError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        BackendError::Connect { .. } | BackendError::NotReady { .. } | BackendError::HealthCheck { .. } => {
            StatusCode::BAD_GATEWAY
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub async fn handle_list(state: &AppState) -> Result<Response<Body>, Infallible> {
    Ok(json_response(StatusCode::OK, &state.loader.list()))
}

pub async fn handle_load(req: Request<Body>, state: &AppState) -> Result<Response<Body>, Infallible> {
    let request: LoadBackendRequest = match parse_json_body(req.into_body()).await {
        Ok(request) => request,
        Err(error_response) => return Ok(error_response),
    };
    if request.model.trim().is_empty() {
        return Ok(json_error(StatusCode::BAD_REQUEST, "model is required"));
    }

    let load = LoadOptions {
        model_id: request.model.clone(),
        model: request.model_file.unwrap_or_else(|| request.model.clone()),
        backend: request.backend,
        ..Default::default()
    };
    match state.loader.load_auto(&load).await {
        Ok(model) => {
            info!("[API] Model '{}' served at {}", model.id(), model.address());
            Ok(json_response(
                StatusCode::OK,
                &BackendActionResponse {
                    success: true,
                    message: format!("model '{}' loaded", request.model),
                    status: Some(model.status()),
                },
            ))
        }
        Err(e) => {
            error!("[API] Failed to load '{}': {e}", request.model);
            Ok(json_error(error_status(&e), &e.to_string()))
        }
    }
}

pub async fn handle_shutdown(req: Request<Body>, state: &AppState) -> Result<Response<Body>, Infallible> {
    let request: ShutdownBackendRequest = match parse_json_body(req.into_body()).await {
        Ok(request) => request,
        Err(error_response) => return Ok(error_response),
    };

    match state.loader.stop(&request.model).await {
        Ok(()) => Ok(json_response(
            StatusCode::OK,
            &BackendActionResponse {
                success: true,
                message: format!("model '{}' stopped", request.model),
                status: None,
            },
        )),
        Err(e) => Ok(json_error(error_status(&e), &e.to_string())),
    }
}

pub async fn handle_monitor(req: Request<Body>, state: &AppState) -> Result<Response<Body>, Infallible> {
    let Some(model) = get_query_param(req.uri(), "model") else {
        return Ok(json_error(StatusCode::BAD_REQUEST, "missing 'model' query parameter"));
    };
    if state.loader.get(&model).is_none() {
        return Ok(json_error(StatusCode::NOT_FOUND, &format!("model '{model}' is not loaded")));
    }
    let Some(pid) = state.loader.get_pid(&model) else {
        return Ok(json_error(
            StatusCode::BAD_REQUEST,
            &format!("model '{model}' is served by an external backend"),
        ));
    };

    match sample_process(pid).await {
        Some(mut usage) => {
            usage.model = model;
            Ok(json_response(StatusCode::OK, &usage))
        }
        None => Ok(json_error(
            StatusCode::NOT_FOUND,
            &format!("process {pid} of model '{model}' is gone"),
        )),
    }
}

/// Two refreshes apart so the CPU figure covers a real interval.
async fn sample_process(pid: u32) -> Option<BackendMonitorResponse> {
    let pid = Pid::from_u32(pid);
    let refresh = ProcessRefreshKind::nothing().with_memory().with_cpu();
    let mut system = System::new();
    system.refresh_processes_specifics(ProcessesToUpdate::Some(&[pid]), true, refresh);
    tokio::time::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL).await;
    system.refresh_processes_specifics(ProcessesToUpdate::Some(&[pid]), true, refresh);

    let process = system.process(pid)?;
    Some(BackendMonitorResponse {
        model: String::new(),
        pid: Some(pid.as_u32()),
        memory_rss_bytes: process.memory(),
        memory_virtual_bytes: process.virtual_memory(),
        cpu_percent: process.cpu_usage(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(error_status(&BackendError::NotFound("m".into())), StatusCode::NOT_FOUND);
        assert_eq!(
            error_status(&BackendError::UnsupportedBackend("../x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            error_status(&BackendError::AllBackendsFailed {
                model: "m".into(),
                errors: vec![]
            }),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_sample_own_process() {
        let usage = sample_process(std::process::id()).await.unwrap();
        assert_eq!(usage.pid, Some(std::process::id()));
        assert!(usage.memory_rss_bytes > 0);
    }
}
