//! Watchdog policy configuration.
//!
//! A plain value type: the [`Watchdog`](super::watchdog::Watchdog) keeps one
//! behind a lock and swaps it when runtime settings change. Builders are a
//! construction convenience only.

use std::time::Duration;

use llama_gateway_types::WatchdogSettings;

use super::error::BackendError;

pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(15 * 60);
pub const DEFAULT_WATCHDOG_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_MEMORY_RECLAIMER_THRESHOLD: f64 = 0.95;
pub const DEFAULT_LRU_EVICTION_MAX_RETRIES: u32 = 30;
pub const DEFAULT_LRU_EVICTION_RETRY_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq)]
pub struct WatchdogConfig {
    /// Evict backends that stay busy longer than `busy_timeout`.
    pub busy_check: bool,
    /// Evict backends that stay idle longer than `idle_timeout`.
    pub idle_check: bool,
    pub busy_timeout: Duration,
    pub idle_timeout: Duration,
    /// Tick period of the background checks.
    pub interval: Duration,
    /// Maximum number of simultaneously loaded backends. 0 disables the limit.
    pub lru_limit: usize,
    pub memory_reclaimer_enabled: bool,
    /// Utilization ratio in `[0, 1]` above which the reclaimer evicts.
    pub memory_reclaimer_threshold: f64,
    /// Allow LRU and memory eviction to pick backends with requests in flight.
    pub force_eviction_when_busy: bool,
    pub lru_eviction_max_retries: u32,
    pub lru_eviction_retry_interval: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            busy_check: false,
            idle_check: false,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            interval: DEFAULT_WATCHDOG_INTERVAL,
            lru_limit: 0,
            memory_reclaimer_enabled: false,
            memory_reclaimer_threshold: DEFAULT_MEMORY_RECLAIMER_THRESHOLD,
            force_eviction_when_busy: false,
            lru_eviction_max_retries: DEFAULT_LRU_EVICTION_MAX_RETRIES,
            lru_eviction_retry_interval: DEFAULT_LRU_EVICTION_RETRY_INTERVAL,
        }
    }
}

impl WatchdogConfig {
    pub fn with_busy_check(mut self, timeout: Duration) -> Self {
        self.busy_check = true;
        self.busy_timeout = timeout;
        self
    }

    pub fn with_idle_check(mut self, timeout: Duration) -> Self {
        self.idle_check = true;
        self.idle_timeout = timeout;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_lru_limit(mut self, limit: usize) -> Self {
        self.lru_limit = limit;
        self
    }

    /// Single active backend mode is an LRU limit of one.
    pub fn with_single_backend(self) -> Self {
        self.with_lru_limit(1)
    }

    pub fn with_memory_reclaimer(mut self, threshold: f64) -> Self {
        self.memory_reclaimer_enabled = true;
        self.memory_reclaimer_threshold = threshold;
        self
    }

    pub fn with_force_eviction_when_busy(mut self, force: bool) -> Self {
        self.force_eviction_when_busy = force;
        self
    }

    pub fn with_lru_eviction_retries(mut self, max_retries: u32, interval: Duration) -> Self {
        self.lru_eviction_max_retries = max_retries;
        self.lru_eviction_retry_interval = interval;
        self
    }

    /// True when at least one periodic check has work to do.
    pub fn has_periodic_checks(&self) -> bool {
        self.busy_check || self.idle_check || self.memory_reclaimer_enabled
    }

    pub fn validate(&self) -> Result<(), BackendError> {
        if !(0.0..=1.0).contains(&self.memory_reclaimer_threshold) {
            return Err(BackendError::Config(format!(
                "memory reclaimer threshold must be within [0, 1], got {}",
                self.memory_reclaimer_threshold
            )));
        }
        if self.interval.is_zero() {
            return Err(BackendError::Config("watchdog interval must be non-zero".into()));
        }
        if self.busy_check && self.busy_timeout.is_zero() {
            return Err(BackendError::Config("busy timeout must be non-zero".into()));
        }
        if self.idle_check && self.idle_timeout.is_zero() {
            return Err(BackendError::Config("idle timeout must be non-zero".into()));
        }
        Ok(())
    }

    /// Return a copy with the given partial settings applied and validated.
    pub fn apply(&self, settings: &WatchdogSettings) -> Result<Self, BackendError> {
        let mut next = self.clone();

        if let Some(enabled) = settings.watchdog_busy_enabled {
            next.busy_check = enabled;
        }
        if let Some(enabled) = settings.watchdog_idle_enabled {
            next.idle_check = enabled;
        }
        if let Some(ref value) = settings.watchdog_busy_timeout {
            next.busy_timeout = parse_duration("watchdog_busy_timeout", value)?;
        }
        if let Some(ref value) = settings.watchdog_idle_timeout {
            next.idle_timeout = parse_duration("watchdog_idle_timeout", value)?;
        }
        if let Some(ref value) = settings.watchdog_interval {
            next.interval = parse_duration("watchdog_interval", value)?;
        }
        if let Some(limit) = settings.max_active_backends {
            next.lru_limit = limit;
        }
        match settings.single_backend {
            Some(true) => next.lru_limit = 1,
            Some(false) if settings.max_active_backends.is_none() && next.lru_limit == 1 => {
                next.lru_limit = 0;
            }
            _ => {}
        }
        if let Some(enabled) = settings.memory_reclaimer_enabled {
            next.memory_reclaimer_enabled = enabled;
        }
        if let Some(threshold) = settings.memory_reclaimer_threshold {
            next.memory_reclaimer_threshold = threshold;
        }
        if let Some(force) = settings.force_eviction_when_busy {
            next.force_eviction_when_busy = force;
        }
        if let Some(retries) = settings.lru_eviction_max_retries {
            next.lru_eviction_max_retries = retries;
        }
        if let Some(ref value) = settings.lru_eviction_retry_interval {
            next.lru_eviction_retry_interval = parse_duration("lru_eviction_retry_interval", value)?;
        }

        next.validate()?;
        Ok(next)
    }

    /// Full view of the runtime-mutable settings.
    pub fn to_settings(&self) -> WatchdogSettings {
        WatchdogSettings {
            watchdog_busy_enabled: Some(self.busy_check),
            watchdog_idle_enabled: Some(self.idle_check),
            watchdog_busy_timeout: Some(humantime::format_duration(self.busy_timeout).to_string()),
            watchdog_idle_timeout: Some(humantime::format_duration(self.idle_timeout).to_string()),
            watchdog_interval: Some(humantime::format_duration(self.interval).to_string()),
            max_active_backends: Some(self.lru_limit),
            single_backend: Some(self.lru_limit == 1),
            memory_reclaimer_enabled: Some(self.memory_reclaimer_enabled),
            memory_reclaimer_threshold: Some(self.memory_reclaimer_threshold),
            force_eviction_when_busy: Some(self.force_eviction_when_busy),
            lru_eviction_max_retries: Some(self.lru_eviction_max_retries),
            lru_eviction_retry_interval: Some(
                humantime::format_duration(self.lru_eviction_retry_interval).to_string(),
            ),
        }
    }
}

/// Parse a humantime duration ("15m", "1h 30m"), naming the field on error.
pub fn parse_duration(field: &str, value: &str) -> Result<Duration, BackendError> {
    humantime::parse_duration(value.trim())
        .map_err(|e| BackendError::Config(format!("{field}: invalid duration '{value}': {e}")))
}
