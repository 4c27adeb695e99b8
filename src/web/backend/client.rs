//! Handles to loaded backends.
//!
//! [`BackendModel`] is what the registry hands out: the model's address, the
//! process that serves it (when the gateway spawned one) and a lazily built
//! [`BackendClient`]. [`BusyGuard`] brackets a request so the watchdog sees
//! the backend as busy for exactly as long as work is in flight.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use hyper::client::HttpConnector;
use hyper::{Body, Client, Method, Request, StatusCode, Uri};
use log::debug;
use tokio::sync::Mutex;

use llama_gateway_types::{BackendStatus, LoadModelReply, LoadModelRequest};

use super::error::BackendError;
use super::process::BackendProcess;
use super::watchdog::Watchdog;

pub const DEFAULT_HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_LOAD_MODEL_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientTimeouts {
    pub health_check: Duration,
    pub load_model: Duration,
}

impl Default for ClientTimeouts {
    fn default() -> Self {
        Self {
            health_check: DEFAULT_HEALTH_CHECK_TIMEOUT,
            load_model: DEFAULT_LOAD_MODEL_TIMEOUT,
        }
    }
}

/// Control-plane client for one backend address.
pub struct BackendClient {
    address: String,
    base_url: String,
    http: Client<HttpConnector>,
    timeouts: ClientTimeouts,
    parallel: bool,
    // Serializes calls when the backend cannot serve requests in parallel.
    op_lock: Mutex<()>,
}

impl BackendClient {
    pub fn new(address: &str, parallel: bool, timeouts: ClientTimeouts) -> Self {
        let base_url = if address.starts_with("http://") || address.starts_with("https://") {
            address.trim_end_matches('/').to_string()
        } else {
            format!("http://{address}")
        };
        Self {
            address: address.to_string(),
            base_url,
            http: Client::new(),
            timeouts,
            parallel,
            op_lock: Mutex::new(()),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// True while a serialized operation holds the backend.
    pub fn is_busy(&self) -> bool {
        !self.parallel && self.op_lock.try_lock().is_err()
    }

    fn uri(&self, path: &str) -> Result<Uri, BackendError> {
        format!("{}{path}", self.base_url)
            .parse()
            .map_err(|e| BackendError::Connect {
                address: self.address.clone(),
                message: format!("invalid address: {e}"),
            })
    }

    /// Bounded liveness probe. `Ok(false)` means the backend answered but is
    /// not healthy; transport failures and deadlines are errors.
    pub async fn health_check(&self) -> Result<bool, BackendError> {
        let uri = self.uri("/health")?;
        let timeout = self.timeouts.health_check;
        match tokio::time::timeout(timeout, self.http.get(uri)).await {
            Err(_) => Err(BackendError::Timeout {
                operation: "health check",
                timeout,
            }),
            Ok(Err(e)) => Err(BackendError::HealthCheck {
                address: self.address.clone(),
                message: e.to_string(),
            }),
            Ok(Ok(response)) => {
                debug!("[CLIENT] {} health: {}", self.address, response.status());
                Ok(response.status().is_success())
            }
        }
    }

    /// Ask a ready backend to load its model.
    pub async fn load_model(&self, request: &LoadModelRequest) -> Result<(), BackendError> {
        let _serialized = if self.parallel {
            None
        } else {
            Some(self.op_lock.lock().await)
        };

        let body = serde_json::to_vec(request).map_err(|e| BackendError::LoadFailed {
            model: request.model.clone(),
            message: e.to_string(),
        })?;
        let http_request = Request::builder()
            .method(Method::POST)
            .uri(self.uri("/load")?)
            .header("content-type", "application/json")
            .body(Body::from(body))
            .map_err(|e| BackendError::LoadFailed {
                model: request.model.clone(),
                message: e.to_string(),
            })?;

        let timeout = self.timeouts.load_model;
        let response = tokio::time::timeout(timeout, self.http.request(http_request))
            .await
            .map_err(|_| BackendError::Timeout {
                operation: "load model",
                timeout,
            })?
            .map_err(|e| BackendError::Connect {
                address: self.address.clone(),
                message: e.to_string(),
            })?;

        let status = response.status();
        let bytes = hyper::body::to_bytes(response.into_body())
            .await
            .map_err(|e| BackendError::Connect {
                address: self.address.clone(),
                message: e.to_string(),
            })?;
        if status != StatusCode::OK {
            return Err(BackendError::LoadFailed {
                model: request.model.clone(),
                message: format!("backend replied {status}: {}", String::from_utf8_lossy(&bytes)),
            });
        }

        let reply: LoadModelReply = serde_json::from_slice(&bytes).map_err(|e| BackendError::LoadFailed {
            model: request.model.clone(),
            message: format!("invalid reply: {e}"),
        })?;
        if !reply.success {
            return Err(BackendError::LoadFailed {
                model: request.model.clone(),
                message: reply.message,
            });
        }
        Ok(())
    }
}

/// A loaded backend, shared between the registry and request handlers.
pub struct BackendModel {
    id: String,
    address: String,
    process: Option<BackendProcess>,
    parallel: bool,
    timeouts: ClientTimeouts,
    client: OnceLock<BackendClient>,
    in_flight: AtomicUsize,
}

impl std::fmt::Debug for BackendModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendModel")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("process", &self.process)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl BackendModel {
    pub fn new(id: &str, address: &str, process: Option<BackendProcess>) -> Self {
        Self {
            id: id.to_string(),
            address: address.to_string(),
            process,
            parallel: false,
            timeouts: ClientTimeouts::default(),
            client: OnceLock::new(),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_timeouts(mut self, timeouts: ClientTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn process(&self) -> Option<&BackendProcess> {
        self.process.as_ref()
    }

    /// The protocol client, built on first use and reused afterwards.
    pub fn client(&self) -> &BackendClient {
        self.client
            .get_or_init(|| BackendClient::new(&self.address, self.parallel, self.timeouts))
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight() > 0 || self.client.get().is_some_and(BackendClient::is_busy)
    }

    pub fn status(&self) -> BackendStatus {
        BackendStatus {
            model: self.id.clone(),
            address: self.address.clone(),
            pid: self.process.as_ref().and_then(BackendProcess::pid),
            external: self.process.is_none(),
            busy: self.is_busy(),
            in_flight: self.in_flight(),
        }
    }
}

/// Marks a backend busy for the guard's lifetime.
///
/// Every guard refreshes the busy timestamp; the backend goes back to idle
/// when the last outstanding guard drops, on success, error or cancellation.
pub struct BusyGuard {
    model: Arc<BackendModel>,
    watchdog: Option<Arc<Watchdog>>,
}

impl BusyGuard {
    pub fn new(model: Arc<BackendModel>, watchdog: Option<Arc<Watchdog>>) -> Self {
        model.in_flight.fetch_add(1, Ordering::SeqCst);
        if let Some(ref watchdog) = watchdog {
            watchdog.mark(model.address());
        }
        Self { model, watchdog }
    }

    pub fn model(&self) -> &Arc<BackendModel> {
        &self.model
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        if self.model.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            if let Some(ref watchdog) = self.watchdog {
                watchdog.unmark(self.model.address());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::web::backend::memory::testing::ScriptedSampler;
    use crate::web::backend::test_support::FakeBackend;
    use crate::web::backend::watchdog_config::WatchdogConfig;

    fn short_timeouts() -> ClientTimeouts {
        ClientTimeouts {
            health_check: Duration::from_millis(300),
            load_model: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_base_url_normalization() {
        let client = BackendClient::new("127.0.0.1:5000", false, ClientTimeouts::default());
        assert_eq!(client.base_url, "http://127.0.0.1:5000");
        let client = BackendClient::new("http://backend:9000/", false, ClientTimeouts::default());
        assert_eq!(client.base_url, "http://backend:9000");
    }

    #[tokio::test]
    async fn test_client_is_created_once() {
        let model = BackendModel::new("m", "127.0.0.1:1", None);
        let first = model.client() as *const BackendClient;
        let second = model.client() as *const BackendClient;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_health_check_states() {
        let backend = FakeBackend::start().await;
        let client = BackendClient::new(&backend.address, false, short_timeouts());
        assert!(client.health_check().await.unwrap());

        backend.set_healthy(false);
        assert!(!client.health_check().await.unwrap());

        backend.set_slow_health(true);
        let err = client.health_check().await.unwrap_err();
        assert!(matches!(err, BackendError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_health_check_unreachable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let client = BackendClient::new(&address, false, short_timeouts());
        assert!(client.health_check().await.is_err());
    }

    #[tokio::test]
    async fn test_load_model_success_and_failure() {
        let backend = FakeBackend::start().await;
        let client = BackendClient::new(&backend.address, false, short_timeouts());
        let request = LoadModelRequest {
            model: "phi-2".into(),
            model_file: "/models/phi-2.gguf".into(),
            model_path: "/models".into(),
            ..Default::default()
        };

        client.load_model(&request).await.unwrap();
        assert_eq!(backend.loads(), vec![request.clone()]);

        backend.set_load_ok(false);
        let err = client.load_model(&request).await.unwrap_err();
        assert!(matches!(err, BackendError::LoadFailed { .. }));
        assert!(!client.is_busy());
    }

    #[tokio::test]
    async fn test_busy_guard_marks_until_last_drop() {
        let (watchdog, _queue) = Watchdog::new(WatchdogConfig::default(), Arc::new(ScriptedSampler::new(&[])));
        let model = Arc::new(BackendModel::new("m", "a:1", None));
        watchdog.track("a:1", "m");

        let first = BusyGuard::new(model.clone(), Some(watchdog.clone()));
        let second = BusyGuard::new(model.clone(), Some(watchdog.clone()));
        assert!(watchdog.is_busy("a:1"));
        assert_eq!(model.in_flight(), 2);

        drop(first);
        assert!(watchdog.is_busy("a:1"));
        assert!(model.is_busy());

        drop(second);
        assert!(watchdog.is_idle("a:1"));
        assert!(!model.is_busy());
    }

    #[test]
    fn test_debug_names_model_and_address() {
        let model = BackendModel::new("phi", "127.0.0.1:9000", None);
        let debug = format!("{model:?}");
        assert!(debug.contains("phi"));
        assert!(debug.contains("127.0.0.1:9000"));
    }

    #[tokio::test]
    async fn test_status_of_external_backend() {
        let model = BackendModel::new("m", "10.0.0.2:9000", None);
        let status = model.status();
        assert!(status.external);
        assert_eq!(status.pid, None);
        assert!(!status.busy);
    }
}
