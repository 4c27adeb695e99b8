//! Backend registry.
//!
//! [`ModelLoader`] owns the map from model name to loaded backend. Loads of
//! the same name are single-flight; loads of different names only contend on
//! the short map critical sections. Lock order is registry map, then watchdog
//! tracking; neither lock is ever held across an await.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::BoxFuture;
use log::{debug, info, warn};
use tokio::time::Instant;

use llama_gateway_types::BackendStatus;

use super::client::{BackendModel, BusyGuard, ClientTimeouts};
use super::error::BackendError;
use super::watchdog::{ProcessManager, Watchdog};

/// Spawn-or-connect strategy used by [`ModelLoader::load`].
pub trait BackendLauncher: Send + Sync {
    /// Bring up a backend serving `model` and return a handle to it.
    fn launch<'a>(&'a self, model: &'a str) -> BoxFuture<'a, Result<BackendModel, BackendError>>;
}

#[derive(Debug, Clone)]
pub struct LoaderOptions {
    pub models_path: PathBuf,
    pub assets_path: PathBuf,
    /// Backends managed outside the gateway, as `(name, uri or executable)`.
    pub external_backends: Vec<(String, String)>,
    pub parallel_requests: bool,
    /// Pick the CPU/GPU build of llama-cpp matching the host.
    pub autodetect: bool,
    pub health_check_timeout: Duration,
    pub load_timeout: Duration,
    /// Grace period between SIGTERM and SIGKILL.
    pub stop_timeout: Duration,
    /// How long `stop` waits for in-flight requests before forcing.
    pub busy_wait_timeout: Duration,
    pub busy_wait_max_backoff: Duration,
    /// Readiness probes after spawning a backend.
    pub grpc_attempts: u32,
    pub grpc_attempts_delay: Duration,
    pub client_timeouts: ClientTimeouts,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            models_path: PathBuf::from("models"),
            assets_path: PathBuf::from("assets"),
            external_backends: Vec::new(),
            parallel_requests: false,
            autodetect: true,
            health_check_timeout: Duration::from_secs(10),
            load_timeout: Duration::from_secs(10 * 60),
            stop_timeout: Duration::from_secs(10),
            busy_wait_timeout: Duration::from_secs(60),
            busy_wait_max_backoff: Duration::from_secs(2),
            grpc_attempts: 20,
            grpc_attempts_delay: Duration::from_secs(2),
            client_timeouts: ClientTimeouts::default(),
        }
    }
}

#[derive(Default)]
struct Registry {
    models: HashMap<String, Arc<BackendModel>>,
    /// Reverse map, address to owning model name.
    owners: HashMap<String, String>,
}

/// Decrements the pending load counter when a load finishes either way.
struct PendingLoad<'a>(&'a AtomicUsize);

impl<'a> PendingLoad<'a> {
    fn begin(counter: &'a AtomicUsize) -> (Self, usize) {
        let others = counter.fetch_add(1, Ordering::SeqCst);
        (Self(counter), others)
    }
}

impl Drop for PendingLoad<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct ModelLoader {
    options: LoaderOptions,
    registry: Mutex<Registry>,
    load_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    pending_loads: AtomicUsize,
    watchdog: Option<Arc<Watchdog>>,
}

impl ModelLoader {
    pub fn new(options: LoaderOptions, watchdog: Option<Arc<Watchdog>>) -> Self {
        Self {
            options,
            registry: Mutex::new(Registry::default()),
            load_locks: Mutex::new(HashMap::new()),
            pending_loads: AtomicUsize::new(0),
            watchdog,
        }
    }

    pub fn options(&self) -> &LoaderOptions {
        &self.options
    }

    pub fn watchdog(&self) -> Option<&Arc<Watchdog>> {
        self.watchdog.as_ref()
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn load_lock(&self, model: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.load_locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(model.to_string()).or_default().clone()
    }

    pub fn get(&self, model: &str) -> Option<Arc<BackendModel>> {
        self.registry().models.get(model).cloned()
    }

    pub fn get_pid(&self, model: &str) -> Option<u32> {
        self.get(model)?.process()?.pid()
    }

    pub fn loaded_count(&self) -> usize {
        self.registry().models.len()
    }

    pub fn pending_loads(&self) -> usize {
        self.pending_loads.load(Ordering::SeqCst)
    }

    pub fn list(&self) -> Vec<BackendStatus> {
        let mut statuses: Vec<_> = self.registry().models.values().map(|m| m.status()).collect();
        statuses.sort_by(|a, b| a.model.cmp(&b.model));
        statuses
    }

    /// Return `model` if it is loaded and answers its health check.
    /// A backend that fails the check is torn down and `None` is returned.
    pub async fn check_is_loaded(&self, model: &str) -> Option<Arc<BackendModel>> {
        let existing = self.get(model)?;

        let timeout = self.options.health_check_timeout;
        let failure = match tokio::time::timeout(timeout, existing.client().health_check()).await {
            Ok(Ok(true)) => None,
            Ok(Ok(false)) => Some("backend reported unhealthy".to_string()),
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!("no answer within {timeout:?}")),
        };

        match failure {
            None => {
                if let Some(ref watchdog) = self.watchdog {
                    watchdog.update_last_used(existing.address());
                }
                Some(existing)
            }
            Some(reason) => {
                warn!(
                    "[LOADER] Model '{model}' at {} failed health check ({reason}), reloading",
                    existing.address()
                );
                let still_registered = self.get(model).is_some_and(|current| Arc::ptr_eq(&current, &existing));
                if !still_registered {
                    return None;
                }
                match self.stop(model).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => warn!("[LOADER] Teardown of stale '{model}' failed: {e}"),
                }
                None
            }
        }
    }

    /// Load `model` through `launcher`, or reuse the healthy loaded backend.
    pub async fn load(
        &self,
        model: &str,
        launcher: &dyn BackendLauncher,
    ) -> Result<Arc<BackendModel>, BackendError> {
        let lock = self.load_lock(model);
        let _single_flight = lock.lock().await;

        if let Some(existing) = self.check_is_loaded(model).await {
            debug!("[LOADER] Reusing '{model}' at {}", existing.address());
            return Ok(existing);
        }

        let (_pending, other_pending) = PendingLoad::begin(&self.pending_loads);
        self.make_room(other_pending).await;

        info!("[LOADER] Loading model '{model}'");
        let timeout = self.options.load_timeout;
        let backend = match tokio::time::timeout(timeout, launcher.launch(model)).await {
            Ok(result) => Arc::new(result?),
            Err(_) => {
                return Err(BackendError::Timeout {
                    operation: "backend load",
                    timeout,
                })
            }
        };

        self.register(model, backend.clone()).await?;
        info!("[LOADER] Model '{model}' ready at {}", backend.address());
        Ok(backend)
    }

    /// Enforce the LRU limit before a load, retrying while busy backends
    /// block eviction.
    async fn make_room(&self, pending: usize) {
        let Some(ref watchdog) = self.watchdog else {
            return;
        };
        let config = watchdog.config();
        if config.lru_limit == 0 {
            return;
        }

        for attempt in 0..=config.lru_eviction_max_retries {
            let result = watchdog.enforce_lru_limit(pending).await;
            if !result.need_more {
                return;
            }
            if attempt == config.lru_eviction_max_retries {
                break;
            }
            debug!(
                "[LOADER] LRU limit {} not yet satisfied, retry {}/{}",
                config.lru_limit,
                attempt + 1,
                config.lru_eviction_max_retries
            );
            tokio::time::sleep(config.lru_eviction_retry_interval).await;
        }
        warn!(
            "[LOADER] Could not free enough backends for LRU limit {}, loading anyway",
            config.lru_limit
        );
    }

    async fn register(&self, model: &str, backend: Arc<BackendModel>) -> Result<(), BackendError> {
        let conflict = {
            let mut registry = self.registry();
            match registry.owners.get(backend.address()) {
                Some(owner) if owner != model => Some(owner.clone()),
                _ => {
                    registry.owners.insert(backend.address().to_string(), model.to_string());
                    registry.models.insert(model.to_string(), backend.clone());
                    if let Some(ref watchdog) = self.watchdog {
                        watchdog.track(backend.address(), model);
                    }
                    None
                }
            }
        };

        if let Some(owner) = conflict {
            if let Some(process) = backend.process() {
                if let Err(e) = process.stop(self.options.stop_timeout).await {
                    warn!("[LOADER] Failed to stop rejected backend for '{model}': {e}");
                }
            }
            return Err(BackendError::AddressInUse {
                address: backend.address().to_string(),
                owner,
            });
        }
        Ok(())
    }

    /// Unregister `model` and stop its backend. A second stop of the same
    /// name reports [`BackendError::NotFound`].
    pub async fn stop(&self, model: &str) -> Result<(), BackendError> {
        let backend = {
            let mut registry = self.registry();
            let backend = registry
                .models
                .remove(model)
                .ok_or_else(|| BackendError::NotFound(model.to_string()))?;
            if registry.owners.get(backend.address()).is_some_and(|owner| owner == model) {
                registry.owners.remove(backend.address());
            }
            if let Some(ref watchdog) = self.watchdog {
                watchdog.untrack(backend.address());
            }
            backend
        };

        self.wait_until_idle(&backend).await;

        let result = match backend.process() {
            Some(process) => process.stop(self.options.stop_timeout).await,
            None => Ok(()),
        };

        // Requests that finished while we waited may have re-marked the address.
        self.forget_address(backend.address());

        match result {
            Ok(()) => {
                info!("[LOADER] Stopped model '{model}' at {}", backend.address());
                Ok(())
            }
            Err(e) => {
                warn!("[LOADER] Model '{model}' unregistered but its process failed to stop: {e}");
                Err(e)
            }
        }
    }

    fn forget_address(&self, address: &str) {
        let registry = self.registry();
        if !registry.owners.contains_key(address) {
            if let Some(ref watchdog) = self.watchdog {
                watchdog.untrack(address);
            }
        }
    }

    /// Poll with backoff until no request is in flight, up to the busy wait
    /// timeout. Past the deadline the caller proceeds anyway.
    async fn wait_until_idle(&self, backend: &BackendModel) {
        if !backend.is_busy() {
            return;
        }
        debug!("[LOADER] Waiting for '{}' to finish in-flight requests", backend.id());

        let deadline = Instant::now() + self.options.busy_wait_timeout;
        let mut backoff = Duration::from_millis(50);
        while backend.is_busy() {
            let now = Instant::now();
            if now >= deadline {
                warn!(
                    "[LOADER] '{}' still busy after {:?}, forcing shutdown",
                    backend.id(),
                    self.options.busy_wait_timeout
                );
                return;
            }
            tokio::time::sleep(backoff.min(deadline - now)).await;
            backoff = (backoff * 2).min(self.options.busy_wait_max_backoff);
        }
    }

    pub async fn stop_all(&self) -> Result<(), BackendError> {
        self.stop_matching(|_| true).await
    }

    pub async fn stop_all_except(&self, keep: &str) -> Result<(), BackendError> {
        self.stop_matching(|name| name != keep).await
    }

    async fn stop_matching<F>(&self, filter: F) -> Result<(), BackendError>
    where
        F: Fn(&str) -> bool,
    {
        let mut names: Vec<String> = self
            .registry()
            .models
            .keys()
            .filter(|name| filter(name))
            .cloned()
            .collect();
        names.sort();

        let mut failures = Vec::new();
        for name in names {
            match self.stop(&name).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => failures.push((name, e.to_string())),
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(BackendError::Shutdown { failures })
        }
    }

    /// Mark the backend busy until the returned guard drops.
    pub fn begin_request(&self, backend: &Arc<BackendModel>) -> BusyGuard {
        BusyGuard::new(backend.clone(), self.watchdog.clone())
    }

    pub fn mark(&self, address: &str) {
        if let Some(ref watchdog) = self.watchdog {
            watchdog.mark(address);
        }
    }

    pub fn unmark(&self, address: &str) {
        if let Some(ref watchdog) = self.watchdog {
            watchdog.unmark(address);
        }
    }
}

impl ProcessManager for ModelLoader {
    fn shutdown_model<'a>(&'a self, model: &'a str) -> BoxFuture<'a, Result<(), BackendError>> {
        Box::pin(self.stop(model))
    }
}
