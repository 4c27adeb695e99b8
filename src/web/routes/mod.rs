// Admin API route handlers

pub mod backends;
pub mod health;
pub mod settings;

use std::convert::Infallible;
use std::sync::Arc;

use hyper::{Body, Method, Request, Response, StatusCode};
use log::debug;

use crate::web::backend::registry::ModelLoader;
use crate::web::backend::watchdog::Watchdog;
use crate::web::response_helpers::{cors_preflight, json_error};

/// Shared handles every route needs.
#[derive(Clone)]
pub struct AppState {
    pub loader: Arc<ModelLoader>,
    pub watchdog: Arc<Watchdog>,
}

pub async fn handle_request(req: Request<Body>, state: AppState) -> Result<Response<Body>, Infallible> {
    debug!("[API] {} {}", req.method(), req.uri());

    match (req.method(), req.uri().path()) {
        (&Method::OPTIONS, _) => Ok(cors_preflight()),
        (&Method::GET, "/health") => health::handle(&state).await,
        (&Method::GET, "/api/backends") => backends::handle_list(&state).await,
        (&Method::POST, "/api/backends/load") => backends::handle_load(req, &state).await,
        (&Method::POST, "/api/backends/shutdown") => backends::handle_shutdown(req, &state).await,
        (&Method::GET, "/api/backends/monitor") => backends::handle_monitor(req, &state).await,
        (&Method::GET, "/api/settings") => settings::handle_get(&state).await,
        (&Method::POST, "/api/settings") => settings::handle_post(req, &state).await,
        _ => Ok(json_error(StatusCode::NOT_FOUND, "Not Found")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use llama_gateway_types::{BackendActionResponse, BackendStatus, WatchdogSettings};

    use crate::web::backend::memory::testing::ScriptedSampler;
    use crate::web::backend::registry::LoaderOptions;
    use crate::web::backend::test_support::FakeBackend;
    use crate::web::backend::watchdog_config::WatchdogConfig;

    fn state_with(backend: &FakeBackend) -> AppState {
        let (watchdog, _queue) = Watchdog::new(WatchdogConfig::default(), Arc::new(ScriptedSampler::new(&[])));
        let options = LoaderOptions {
            assets_path: "/nonexistent/assets".into(),
            external_backends: vec![("fake".into(), backend.address.clone())],
            grpc_attempts: 2,
            grpc_attempts_delay: Duration::from_millis(50),
            health_check_timeout: Duration::from_secs(1),
            ..Default::default()
        };
        AppState {
            loader: Arc::new(ModelLoader::new(options, Some(watchdog.clone()))),
            watchdog,
        }
    }

    fn request(method: Method, uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn call(state: &AppState, req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = handle_request(req, state.clone()).await.unwrap();
        let status = response.status();
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn test_health() {
        let backend = FakeBackend::start().await;
        let state = state_with(&backend);
        let (status, json) = call(&state, request(Method::GET, "/health", "")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
        assert_eq!(json["loaded_backends"], 0);
    }

    #[tokio::test]
    async fn test_load_list_shutdown() {
        let backend = FakeBackend::start().await;
        let state = state_with(&backend);

        let (status, json) = call(
            &state,
            request(Method::POST, "/api/backends/load", r#"{"model":"phi","backend":"fake"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let reply: BackendActionResponse = serde_json::from_value(json).unwrap();
        assert!(reply.success);
        assert_eq!(reply.status.unwrap().address, backend.address);
        assert!(state.watchdog.is_tracked(&backend.address));

        let (status, json) = call(&state, request(Method::GET, "/api/backends", "")).await;
        assert_eq!(status, StatusCode::OK);
        let listed: Vec<BackendStatus> = serde_json::from_value(json).unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].external);

        let (status, _) = call(
            &state,
            request(Method::POST, "/api/backends/shutdown", r#"{"model":"phi"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(state.loader.loaded_count(), 0);
        assert!(!state.watchdog.is_tracked(&backend.address));

        let (status, _) = call(
            &state,
            request(Method::POST, "/api/backends/shutdown", r#"{"model":"phi"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_load_rejects_bad_input() {
        let backend = FakeBackend::start().await;
        let state = state_with(&backend);
        let (status, _) = call(&state, request(Method::POST, "/api/backends/load", "{oops")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = call(&state, request(Method::POST, "/api/backends/load", r#"{"model":" "}"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = call(
            &state,
            request(Method::POST, "/api/backends/load", r#"{"model":"m","backend":"../../bin/sh"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = call(
            &state,
            request(
                Method::POST,
                "/api/backends/load",
                r#"{"model":"m","backend":"fake","model_file":"../outside.gguf"}"#,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(backend.loads().is_empty());
    }

    #[tokio::test]
    async fn test_monitor_external_and_missing() {
        let backend = FakeBackend::start().await;
        let state = state_with(&backend);
        let (status, _) = call(&state, request(Method::GET, "/api/backends/monitor", "")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = call(&state, request(Method::GET, "/api/backends/monitor?model=phi", "")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        call(
            &state,
            request(Method::POST, "/api/backends/load", r#"{"model":"phi","backend":"fake"}"#),
        )
        .await;
        let (status, json) = call(&state, request(Method::GET, "/api/backends/monitor?model=phi", "")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].as_str().unwrap().contains("external"));
    }

    #[tokio::test]
    async fn test_settings_roundtrip() {
        let backend = FakeBackend::start().await;
        let state = state_with(&backend);

        let (status, json) = call(
            &state,
            request(
                Method::POST,
                "/api/settings",
                r#"{"watchdog_idle_enabled":true,"watchdog_idle_timeout":"10m","max_active_backends":3}"#,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let settings: WatchdogSettings = serde_json::from_value(json).unwrap();
        assert_eq!(settings.max_active_backends, Some(3));
        assert_eq!(state.watchdog.config().idle_timeout, Duration::from_secs(600));
        assert!(state.watchdog.config().idle_check);

        let (status, _) = call(
            &state,
            request(Method::POST, "/api/settings", r#"{"memory_reclaimer_threshold":2.0}"#),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(state.watchdog.config().lru_limit, 3);

        let (status, json) = call(&state, request(Method::GET, "/api/settings", "")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["max_active_backends"], 3);
    }

    #[tokio::test]
    async fn test_unknown_route_and_preflight() {
        let backend = FakeBackend::start().await;
        let state = state_with(&backend);
        let (status, _) = call(&state, request(Method::GET, "/nope", "")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&state, request(Method::OPTIONS, "/api/backends", "")).await;
        assert_eq!(status, StatusCode::OK);
    }
}
