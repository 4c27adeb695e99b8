//! Command line and environment configuration of the gateway.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use log::LevelFilter;

use crate::web::backend::client::ClientTimeouts;
use crate::web::backend::error::BackendError;
use crate::web::backend::registry::LoaderOptions;
use crate::web::backend::watchdog_config::WatchdogConfig;

fn parse_duration(value: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(value)
}

/// `name:uri` pair; the uri may itself contain colons.
fn parse_external_backend(value: &str) -> Result<(String, String), String> {
    match value.split_once(':') {
        Some((name, uri)) if !name.is_empty() && !uri.is_empty() => Ok((name.to_string(), uri.to_string())),
        _ => Err(format!("expected NAME:URI, got '{value}'")),
    }
}

#[derive(Debug, Clone, Parser)]
#[command(name = "llama_gateway_web")]
#[command(about = "Inference gateway managing llama backend processes")]
#[command(version)]
pub struct GatewayArgs {
    /// Admin API listen address
    #[arg(long, env = "LLAMA_GATEWAY_ADDRESS", default_value = "0.0.0.0:8000")]
    pub address: SocketAddr,

    #[arg(long, env = "LLAMA_GATEWAY_MODELS_PATH", value_name = "PATH", default_value = "models")]
    pub models_path: PathBuf,

    /// Directory holding backend-assets/grpc/<backend>
    #[arg(long, env = "LLAMA_GATEWAY_ASSETS_PATH", value_name = "PATH", default_value = "assets")]
    pub assets_path: PathBuf,

    /// Externally managed backend, as NAME:URI or NAME:/path/to/executable
    #[arg(long = "external-backend", env = "LLAMA_GATEWAY_EXTERNAL_BACKENDS", value_delimiter = ',', value_parser = parse_external_backend)]
    pub external_backends: Vec<(String, String)>,

    /// Let backends serve requests in parallel
    #[arg(long, env = "LLAMA_GATEWAY_PARALLEL_REQUESTS")]
    pub parallel_requests: bool,

    /// Do not pick llama-cpp builds by host CPU/GPU
    #[arg(long, env = "LLAMA_GATEWAY_DISABLE_AUTODETECT")]
    pub disable_autodetect: bool,

    /// Keep at most one backend loaded (same as --max-active-backends 1)
    #[arg(long, env = "LLAMA_GATEWAY_SINGLE_ACTIVE_BACKEND")]
    pub single_active_backend: bool,

    /// Maximum loaded backends, 0 for unlimited
    #[arg(long, env = "LLAMA_GATEWAY_MAX_ACTIVE_BACKENDS", value_name = "N", default_value_t = 0)]
    pub max_active_backends: usize,

    #[arg(long, env = "LLAMA_GATEWAY_WATCHDOG_BUSY")]
    pub watchdog_busy: bool,

    #[arg(long, env = "LLAMA_GATEWAY_WATCHDOG_BUSY_TIMEOUT", value_parser = parse_duration, default_value = "5m")]
    pub watchdog_busy_timeout: Duration,

    #[arg(long, env = "LLAMA_GATEWAY_WATCHDOG_IDLE")]
    pub watchdog_idle: bool,

    #[arg(long, env = "LLAMA_GATEWAY_WATCHDOG_IDLE_TIMEOUT", value_parser = parse_duration, default_value = "15m")]
    pub watchdog_idle_timeout: Duration,

    #[arg(long, env = "LLAMA_GATEWAY_WATCHDOG_INTERVAL", value_parser = parse_duration, default_value = "2s")]
    pub watchdog_interval: Duration,

    #[arg(long, env = "LLAMA_GATEWAY_MEMORY_RECLAIMER")]
    pub memory_reclaimer: bool,

    /// Memory utilization ratio that triggers eviction
    #[arg(long, env = "LLAMA_GATEWAY_MEMORY_RECLAIMER_THRESHOLD", default_value_t = 0.95)]
    pub memory_reclaimer_threshold: f64,

    /// Allow evicting backends that still have requests in flight
    #[arg(long, env = "LLAMA_GATEWAY_FORCE_EVICTION_WHEN_BUSY")]
    pub force_eviction_when_busy: bool,

    #[arg(long, env = "LLAMA_GATEWAY_LRU_EVICTION_MAX_RETRIES", default_value_t = 30)]
    pub lru_eviction_max_retries: u32,

    #[arg(long, env = "LLAMA_GATEWAY_LRU_EVICTION_RETRY_INTERVAL", value_parser = parse_duration, default_value = "1s")]
    pub lru_eviction_retry_interval: Duration,

    /// Readiness probes after starting a backend
    #[arg(long, env = "LLAMA_GATEWAY_GRPC_ATTEMPTS", default_value_t = 20)]
    pub grpc_attempts: u32,

    #[arg(long, env = "LLAMA_GATEWAY_GRPC_ATTEMPTS_DELAY", value_parser = parse_duration, default_value = "2s")]
    pub grpc_attempts_delay: Duration,

    #[arg(long, env = "LLAMA_GATEWAY_HEALTH_CHECK_TIMEOUT", value_parser = parse_duration, default_value = "10s")]
    pub health_check_timeout: Duration,

    #[arg(long, env = "LLAMA_GATEWAY_LOAD_TIMEOUT", value_parser = parse_duration, default_value = "10m")]
    pub load_timeout: Duration,

    /// Models to load at startup, as MODEL or MODEL=BACKEND
    #[arg(long = "preload", env = "LLAMA_GATEWAY_PRELOAD_MODELS", value_delimiter = ',')]
    pub preload_models: Vec<String>,

    /// off, error, warn, info, debug or trace
    #[arg(long, env = "LLAMA_GATEWAY_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "LLAMA_GATEWAY_LOG_DIR", value_name = "PATH", default_value = "logs")]
    pub log_dir: PathBuf,
}

impl GatewayArgs {
    pub fn watchdog_config(&self) -> Result<WatchdogConfig, BackendError> {
        let mut config = WatchdogConfig::default()
            .with_interval(self.watchdog_interval)
            .with_lru_limit(self.max_active_backends)
            .with_force_eviction_when_busy(self.force_eviction_when_busy)
            .with_lru_eviction_retries(self.lru_eviction_max_retries, self.lru_eviction_retry_interval);
        config.busy_timeout = self.watchdog_busy_timeout;
        config.idle_timeout = self.watchdog_idle_timeout;
        config.memory_reclaimer_threshold = self.memory_reclaimer_threshold;
        if self.watchdog_busy {
            config = config.with_busy_check(self.watchdog_busy_timeout);
        }
        if self.watchdog_idle {
            config = config.with_idle_check(self.watchdog_idle_timeout);
        }
        if self.memory_reclaimer {
            config = config.with_memory_reclaimer(self.memory_reclaimer_threshold);
        }
        if self.single_active_backend {
            config = config.with_single_backend();
        }
        config.validate()?;
        Ok(config)
    }

    pub fn loader_options(&self) -> LoaderOptions {
        LoaderOptions {
            models_path: self.models_path.clone(),
            assets_path: self.assets_path.clone(),
            external_backends: self.external_backends.clone(),
            parallel_requests: self.parallel_requests,
            autodetect: !self.disable_autodetect,
            health_check_timeout: self.health_check_timeout,
            load_timeout: self.load_timeout,
            grpc_attempts: self.grpc_attempts,
            grpc_attempts_delay: self.grpc_attempts_delay,
            client_timeouts: ClientTimeouts {
                health_check: self.health_check_timeout,
                ..ClientTimeouts::default()
            },
            ..LoaderOptions::default()
        }
    }

    pub fn log_level_filter(&self) -> LevelFilter {
        self.log_level.parse().unwrap_or(LevelFilter::Info)
    }

    /// Preload entries split into `(model, backend)`.
    pub fn preload(&self) -> Vec<(String, Option<String>)> {
        self.preload_models
            .iter()
            .filter(|entry| !entry.trim().is_empty())
            .map(|entry| match entry.split_once('=') {
                Some((model, backend)) => (model.trim().to_string(), Some(backend.trim().to_string())),
                None => (entry.trim().to_string(), None),
            })
            .collect()
    }
}
