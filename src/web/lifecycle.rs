// Gateway startup and teardown around the admin server

use std::future::Future;
use std::sync::Arc;

use log::{error, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::web::backend::memory::MemorySampler;
use crate::web::backend::registry::LoaderOptions;
use crate::web::backend::watchdog_config::WatchdogConfig;
use crate::web::backend::{spawn_evictor, LoadOptions, ModelLoader, Watchdog};
use crate::web::routes::AppState;

/// Resolves on Ctrl+C, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("[SERVER] Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("[SERVER] Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("[SERVER] Received Ctrl+C"),
        _ = terminate => info!("[SERVER] Received SIGTERM"),
    }
}

/// Install the signal listener now. Every clone of the receiver sees the stop.
pub fn listen_for_shutdown() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = tx.send(true);
    });
    rx
}

/// Resolves once `stop` flips to true. A closed channel counts as a stop.
pub async fn stopped(mut stop: watch::Receiver<bool>) {
    let _ = stop.wait_for(|flag| *flag).await;
}

/// Watchdog, loader and eviction worker, wired together and running.
pub struct Gateway {
    pub loader: Arc<ModelLoader>,
    pub watchdog: Arc<Watchdog>,
    watchdog_task: JoinHandle<()>,
    evictor: JoinHandle<()>,
}

impl Gateway {
    pub fn start(config: WatchdogConfig, options: LoaderOptions, sampler: Arc<dyn MemorySampler>) -> Self {
        let (watchdog, evictions) = Watchdog::new(config, sampler);
        let loader = Arc::new(ModelLoader::new(options, Some(watchdog.clone())));
        let evictor = spawn_evictor(evictions, loader.clone());
        let watchdog_task = watchdog.spawn();
        Self {
            loader,
            watchdog,
            watchdog_task,
            evictor,
        }
    }

    pub fn state(&self) -> AppState {
        AppState {
            loader: self.loader.clone(),
            watchdog: self.watchdog.clone(),
        }
    }

    /// Load `(model, backend)` entries in order until done or `stop` fires.
    /// Returns false when interrupted; a load in flight is abandoned.
    pub async fn preload<F>(&self, entries: Vec<(String, Option<String>)>, stop: F) -> bool
    where
        F: Future<Output = ()>,
    {
        let loads = async {
            for (model, backend) in entries {
                let load = LoadOptions {
                    model_id: model.clone(),
                    model: model.clone(),
                    backend,
                    ..Default::default()
                };
                match self.loader.load_auto(&load).await {
                    Ok(loaded) => info!("[SERVER] Preloaded '{model}' at {}", loaded.address()),
                    Err(e) => warn!("[SERVER] Failed to preload '{model}': {e}"),
                }
            }
        };

        tokio::select! {
            biased;
            _ = stop => {
                warn!("[SERVER] Shutdown requested during preload");
                false
            }
            _ = loads => true,
        }
    }

    /// Stop the watchdog, then every backend, then the eviction worker.
    pub async fn shutdown(self) {
        info!("[SERVER] Shutting down, stopping all backends");
        self.watchdog.shutdown();
        if let Err(e) = self.loader.stop_all().await {
            error!("[SERVER] {e}");
        }
        if let Err(e) = self.watchdog_task.await {
            warn!("[SERVER] Watchdog task ended abnormally: {e}");
        }
        self.evictor.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::web::backend::client::ClientTimeouts;
    use crate::web::backend::memory::testing::ScriptedSampler;
    use crate::web::backend::test_support::FakeBackend;

    fn gateway_with(external: Vec<(String, String)>) -> Gateway {
        let options = LoaderOptions {
            assets_path: "/nonexistent/assets".into(),
            models_path: "/models".into(),
            external_backends: external,
            grpc_attempts: 2,
            grpc_attempts_delay: Duration::from_millis(50),
            health_check_timeout: Duration::from_secs(1),
            client_timeouts: ClientTimeouts {
                health_check: Duration::from_secs(1),
                load_model: Duration::from_secs(5),
            },
            ..Default::default()
        };
        Gateway::start(WatchdogConfig::default(), options, Arc::new(ScriptedSampler::new(&[])))
    }

    fn entries(pairs: &[(&str, &str)]) -> Vec<(String, Option<String>)> {
        pairs
            .iter()
            .map(|(model, backend)| (model.to_string(), Some(backend.to_string())))
            .collect()
    }

    #[tokio::test]
    async fn test_preload_then_shutdown_stops_everything() {
        let a = FakeBackend::start().await;
        let b = FakeBackend::start().await;
        let gateway = gateway_with(vec![("a".into(), a.address.clone()), ("b".into(), b.address.clone())]);

        let finished = gateway
            .preload(entries(&[("phi", "a"), ("mistral", "b")]), std::future::pending())
            .await;
        assert!(finished);
        assert_eq!(gateway.loader.loaded_count(), 2);

        let loader = gateway.loader.clone();
        let watchdog = gateway.watchdog.clone();
        gateway.shutdown().await;
        assert_eq!(loader.loaded_count(), 0);
        assert!(!watchdog.is_tracked(&a.address));
        assert!(!watchdog.is_tracked(&b.address));
    }

    #[tokio::test]
    async fn test_stop_during_preload_still_stops_loaded_backends() {
        let a = FakeBackend::start().await;
        let b = FakeBackend::start().await;
        b.set_slow_health(true);
        let gateway = gateway_with(vec![("a".into(), a.address.clone()), ("b".into(), b.address.clone())]);

        let (tx, rx) = watch::channel(false);
        let loader = gateway.loader.clone();
        tokio::spawn(async move {
            while loader.loaded_count() < 1 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            // Let the second load reach its hanging health check.
            tokio::time::sleep(Duration::from_millis(200)).await;
            let _ = tx.send(true);
        });

        let finished = gateway
            .preload(entries(&[("phi", "a"), ("mistral", "b")]), stopped(rx))
            .await;
        assert!(!finished);
        assert_eq!(gateway.loader.loaded_count(), 1);
        assert_eq!(gateway.loader.pending_loads(), 0);
        assert!(b.loads().is_empty());

        let loader = gateway.loader.clone();
        gateway.shutdown().await;
        assert_eq!(loader.loaded_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_before_preload_loads_nothing() {
        let a = FakeBackend::start().await;
        let gateway = gateway_with(vec![("a".into(), a.address.clone())]);

        let finished = gateway.preload(entries(&[("phi", "a")]), async {}).await;
        assert!(!finished);
        assert_eq!(gateway.loader.loaded_count(), 0);
        assert!(a.loads().is_empty());
        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn test_stopped_on_closed_channel() {
        let (tx, rx) = watch::channel(false);
        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), stopped(rx))
            .await
            .unwrap();
    }
}
