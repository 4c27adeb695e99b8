//! Backend watchdog.
//!
//! Tracks busy/idle state and recency per backend address, and evicts
//! backends when they stay busy or idle too long, when the LRU capacity limit
//! would be exceeded by a new load, or when memory utilization crosses the
//! reclaimer threshold.
//!
//! The watchdog never shuts a backend down itself. Victims are untracked under
//! the tracking lock, the lock is released, and an [`EvictionRequest`] is
//! queued for the evictor task, which owns the [`ProcessManager`] capability.
//! The shutdown path can therefore call back into the watchdog (to untrack or
//! read state) without any chance of re-entering a held lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::BoxFuture;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use llama_gateway_types::WatchdogSettings;

use super::error::BackendError;
use super::memory::{MemorySampler, MemoryUsage};
use super::watchdog_config::WatchdogConfig;

/// Shutdown attempts made by the evictor before giving up on a backend.
const SHUTDOWN_ATTEMPTS: u32 = 3;
const SHUTDOWN_RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// The narrow capability the watchdog needs from the registry.
pub trait ProcessManager: Send + Sync {
    fn shutdown_model<'a>(&'a self, model: &'a str) -> BoxFuture<'a, Result<(), BackendError>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    BusyTimeout,
    IdleTimeout,
    LruLimit,
    MemoryPressure,
}

impl std::fmt::Display for EvictionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            EvictionReason::BusyTimeout => "busy timeout",
            EvictionReason::IdleTimeout => "idle timeout",
            EvictionReason::LruLimit => "LRU limit",
            EvictionReason::MemoryPressure => "memory pressure",
        };
        f.write_str(reason)
    }
}

/// An eviction decided by the watchdog, waiting to be carried out.
#[derive(Debug)]
pub struct EvictionRequest {
    pub model: String,
    pub address: String,
    pub reason: EvictionReason,
    done: oneshot::Sender<bool>,
}

/// Receiving end of the eviction hand-off. Drained by [`spawn_evictor`].
pub struct EvictionQueue {
    rx: mpsc::UnboundedReceiver<EvictionRequest>,
}

impl EvictionQueue {
    pub async fn recv(&mut self) -> Option<EvictionRequest> {
        self.rx.recv().await
    }
}

/// Result of [`Watchdog::enforce_lru_limit`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LruEnforcement {
    pub evicted: usize,
    /// Candidates ran out before the limit could be satisfied.
    pub need_more: bool,
}

#[derive(Default)]
struct TrackingState {
    busy: HashMap<String, Instant>,
    idle: HashMap<String, Instant>,
    last_used: HashMap<String, Instant>,
    address_models: HashMap<String, String>,
}

impl TrackingState {
    fn untrack(&mut self, address: &str) {
        self.busy.remove(address);
        self.idle.remove(address);
        self.last_used.remove(address);
        self.address_models.remove(address);
    }

    /// Addresses with a known model, oldest last-use first. Ties break on the
    /// address so the order is deterministic.
    fn lru_candidates(&self) -> Vec<(String, String)> {
        let mut candidates: Vec<_> = self
            .address_models
            .iter()
            .map(|(address, model)| (self.last_used.get(address).copied(), address, model))
            .collect();
        candidates.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(b.1)));
        candidates
            .into_iter()
            .map(|(_, address, model)| (address.clone(), model.clone()))
            .collect()
    }

    /// Untrack every address whose marker in `markers` is older than `timeout`.
    fn take_expired(&mut self, busy: bool, timeout: Duration, now: Instant) -> Vec<(String, Option<String>)> {
        let markers = if busy { &self.busy } else { &self.idle };
        let expired: Vec<String> = markers
            .iter()
            .filter(|(_, since)| now.saturating_duration_since(**since) > timeout)
            .map(|(address, _)| address.clone())
            .collect();

        expired
            .into_iter()
            .map(|address| {
                let model = self.address_models.get(&address).cloned();
                self.untrack(&address);
                (address, model)
            })
            .collect()
    }
}

pub struct Watchdog {
    state: Mutex<TrackingState>,
    config: Mutex<WatchdogConfig>,
    sampler: Arc<dyn MemorySampler>,
    evictions: mpsc::UnboundedSender<EvictionRequest>,
    stop: watch::Sender<bool>,
}

impl Watchdog {
    /// Build a watchdog and the queue its evictions are delivered on.
    pub fn new(config: WatchdogConfig, sampler: Arc<dyn MemorySampler>) -> (Arc<Self>, EvictionQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (stop, _) = watch::channel(false);
        let watchdog = Arc::new(Self {
            state: Mutex::new(TrackingState::default()),
            config: Mutex::new(config),
            sampler,
            evictions: tx,
            stop,
        });
        (watchdog, EvictionQueue { rx })
    }

    fn state(&self) -> MutexGuard<'_, TrackingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn config_guard(&self) -> MutexGuard<'_, WatchdogConfig> {
        self.config.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ─── Configuration ─────────────────────────────────────────────

    pub fn config(&self) -> WatchdogConfig {
        self.config_guard().clone()
    }

    /// Apply a partial runtime update. Nothing changes if validation fails.
    pub fn update_settings(&self, settings: &WatchdogSettings) -> Result<WatchdogConfig, BackendError> {
        let mut config = self.config_guard();
        let next = config.apply(settings)?;
        info!("[WATCHDOG] Settings updated: {next:?}");
        *config = next.clone();
        Ok(next)
    }

    pub fn set_lru_limit(&self, limit: usize) {
        self.config_guard().lru_limit = limit;
    }

    pub fn set_memory_reclaimer(&self, enabled: bool, threshold: f64) -> Result<(), BackendError> {
        let mut config = self.config_guard();
        let next = WatchdogConfig {
            memory_reclaimer_enabled: enabled,
            memory_reclaimer_threshold: threshold,
            ..config.clone()
        };
        next.validate()?;
        *config = next;
        Ok(())
    }

    pub fn set_force_eviction_when_busy(&self, force: bool) {
        self.config_guard().force_eviction_when_busy = force;
    }

    // ─── Tracking ──────────────────────────────────────────────────

    /// Start tracking a freshly loaded backend as idle.
    pub fn track(&self, address: &str, model: &str) {
        let now = Instant::now();
        let mut state = self.state();
        state.address_models.insert(address.to_string(), model.to_string());
        state.busy.remove(address);
        state.idle.insert(address.to_string(), now);
        state.last_used.insert(address.to_string(), now);
    }

    pub fn untrack(&self, address: &str) {
        self.state().untrack(address);
    }

    pub fn mark(&self, address: &str) {
        let now = Instant::now();
        let mut state = self.state();
        state.idle.remove(address);
        state.busy.insert(address.to_string(), now);
        state.last_used.insert(address.to_string(), now);
    }

    /// Busy to idle. A no-op for an address that is not busy, so a request
    /// finishing after its backend was evicted does not resurrect it.
    pub fn unmark(&self, address: &str) {
        let now = Instant::now();
        let mut state = self.state();
        if state.busy.remove(address).is_none() {
            return;
        }
        state.idle.insert(address.to_string(), now);
        state.last_used.insert(address.to_string(), now);
    }

    /// Refresh recency without touching busy/idle state.
    pub fn update_last_used(&self, address: &str) {
        self.state().last_used.insert(address.to_string(), Instant::now());
    }

    pub fn is_busy(&self, address: &str) -> bool {
        self.state().busy.contains_key(address)
    }

    pub fn is_idle(&self, address: &str) -> bool {
        self.state().idle.contains_key(address)
    }

    pub fn is_tracked(&self, address: &str) -> bool {
        let state = self.state();
        state.address_models.contains_key(address)
            || state.busy.contains_key(address)
            || state.idle.contains_key(address)
    }

    pub fn last_used(&self, address: &str) -> Option<Instant> {
        self.state().last_used.get(address).copied()
    }

    /// Number of backends with a known model mapping.
    pub fn loaded_count(&self) -> usize {
        self.state().address_models.len()
    }

    // ─── Eviction ──────────────────────────────────────────────────

    /// Hand a victim to the evictor and wait for the outcome.
    async fn evict(&self, model: String, address: String, reason: EvictionReason) -> bool {
        info!("[WATCHDOG] Evicting model '{model}' at {address} ({reason})");
        let (done, outcome) = oneshot::channel();
        let request = EvictionRequest {
            model,
            address,
            reason,
            done,
        };
        if let Err(mpsc::error::SendError(request)) = self.evictions.send(request) {
            warn!(
                "[WATCHDOG] Evictor is not running, model '{}' was untracked but not stopped",
                request.model
            );
            return false;
        }
        outcome.await.unwrap_or(false)
    }

    /// Make room for a new load, counting `pending_loads` already in flight.
    pub async fn enforce_lru_limit(&self, pending_loads: usize) -> LruEnforcement {
        let (limit, force) = {
            let config = self.config_guard();
            (config.lru_limit, config.force_eviction_when_busy)
        };
        if limit == 0 {
            return LruEnforcement::default();
        }

        let (victims, to_evict) = {
            let mut state = self.state();
            let total = state.address_models.len() + pending_loads + 1;
            if total <= limit {
                return LruEnforcement::default();
            }
            let to_evict = total - limit;

            let mut victims = Vec::with_capacity(to_evict);
            let mut skipped_busy = 0;
            for (address, model) in state.lru_candidates() {
                if victims.len() == to_evict {
                    break;
                }
                if !force && state.busy.contains_key(&address) {
                    skipped_busy += 1;
                    continue;
                }
                victims.push((address, model));
            }
            for (address, _) in &victims {
                state.untrack(address);
            }

            debug!(
                "[WATCHDOG] LRU limit {limit}: total {total}, evicting {} of {to_evict} (skipped {skipped_busy} busy)",
                victims.len()
            );
            (victims, to_evict)
        };

        let evicted = victims.len();
        for (address, model) in victims {
            self.evict(model, address, EvictionReason::LruLimit).await;
        }

        let need_more = evicted < to_evict;
        if need_more {
            warn!("[WATCHDOG] LRU limit {limit} still exceeded after evicting {evicted} backend(s)");
        }
        LruEnforcement { evicted, need_more }
    }

    pub async fn check_busy(&self) {
        let timeout = self.config_guard().busy_timeout;
        let expired = self.state().take_expired(true, timeout, Instant::now());
        self.evict_expired(expired, EvictionReason::BusyTimeout).await;
    }

    pub async fn check_idle(&self) {
        let timeout = self.config_guard().idle_timeout;
        let expired = self.state().take_expired(false, timeout, Instant::now());
        self.evict_expired(expired, EvictionReason::IdleTimeout).await;
    }

    async fn evict_expired(&self, expired: Vec<(String, Option<String>)>, reason: EvictionReason) {
        for (address, model) in expired {
            match model {
                Some(model) => {
                    self.evict(model, address, reason).await;
                }
                None => warn!("[WATCHDOG] No model registered for {address}, dropped tracking ({reason})"),
            }
        }
    }

    async fn sample_memory(&self) -> Option<MemoryUsage> {
        let sampler = self.sampler.clone();
        tokio::task::spawn_blocking(move || sampler.sample()).await.ok().flatten()
    }

    /// Evict LRU backends one at a time while memory stays above the threshold.
    pub async fn check_memory(&self) {
        let (threshold, force) = {
            let config = self.config_guard();
            (config.memory_reclaimer_threshold, config.force_eviction_when_busy)
        };
        if threshold <= 0.0 {
            return;
        }

        loop {
            if self.loaded_count() == 0 {
                return;
            }
            let Some(usage) = self.sample_memory().await else {
                debug!("[WATCHDOG] No memory sample available");
                return;
            };
            let ratio = usage.ratio();
            if ratio <= threshold {
                return;
            }

            let victim = {
                let mut state = self.state();
                let victim = state
                    .lru_candidates()
                    .into_iter()
                    .find(|(address, _)| force || !state.busy.contains_key(address));
                if let Some((ref address, _)) = victim {
                    state.untrack(address);
                }
                victim
            };

            let Some((address, model)) = victim else {
                warn!(
                    "[WATCHDOG] {} usage {:.1}% above threshold {:.1}% but no backend can be evicted",
                    usage.kind,
                    ratio * 100.0,
                    threshold * 100.0
                );
                return;
            };
            info!(
                "[WATCHDOG] {} usage {:.1}% above threshold {:.1}%",
                usage.kind,
                ratio * 100.0,
                threshold * 100.0
            );
            self.evict(model, address, EvictionReason::MemoryPressure).await;
        }
    }

    /// Run every enabled check once.
    pub async fn tick(&self) {
        let config = self.config();
        if config.busy_check {
            self.check_busy().await;
        }
        if config.idle_check {
            self.check_idle().await;
        }
        if config.memory_reclaimer_enabled {
            self.check_memory().await;
        }
    }

    /// Tick until [`shutdown`](Self::shutdown). The interval is re-read every
    /// tick so runtime settings take effect without a restart.
    pub async fn run(&self) {
        let mut stop = self.stop.subscribe();
        if *stop.borrow() {
            return;
        }
        let config = self.config();
        if !config.has_periodic_checks() {
            info!("[WATCHDOG] No periodic checks enabled, idling until settings change");
        } else {
            info!("[WATCHDOG] Started (interval {:?})", config.interval);
        }

        loop {
            let interval = self.config_guard().interval;
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
            if *stop.borrow() {
                break;
            }
            self.tick().await;
        }
        info!("[WATCHDOG] Stopped");
    }

    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let watchdog = self.clone();
        tokio::spawn(async move { watchdog.run().await })
    }

    pub fn shutdown(&self) {
        self.stop.send_replace(true);
    }
}

/// Drain the eviction queue, shutting backends down through `manager`.
///
/// Failed shutdowns are retried with backoff. A model the manager no longer
/// knows counts as stopped. Tracking state is already gone either way.
pub fn spawn_evictor(mut queue: EvictionQueue, manager: Arc<dyn ProcessManager>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(request) = queue.recv().await {
            let stopped = shutdown_with_retry(manager.as_ref(), &request).await;
            let _ = request.done.send(stopped);
        }
        debug!("[WATCHDOG] Eviction queue closed");
    })
}

async fn shutdown_with_retry(manager: &dyn ProcessManager, request: &EvictionRequest) -> bool {
    let mut backoff = SHUTDOWN_RETRY_BACKOFF;
    for attempt in 1..=SHUTDOWN_ATTEMPTS {
        match manager.shutdown_model(&request.model).await {
            Ok(()) => return true,
            Err(e) if e.is_not_found() => {
                debug!("[WATCHDOG] Model '{}' already stopped", request.model);
                return true;
            }
            Err(e) => {
                warn!(
                    "[WATCHDOG] Shutdown of '{}' at {} failed (attempt {attempt}/{SHUTDOWN_ATTEMPTS}): {e}",
                    request.model, request.address
                );
                if attempt < SHUTDOWN_ATTEMPTS {
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }
    }
    error!(
        "[WATCHDOG] Giving up on '{}' at {} after {} eviction ({SHUTDOWN_ATTEMPTS} attempts); the process may still be running",
        request.model,
        request.address,
        request.reason
    );
    false
}
