//! Shared DTOs for the llama gateway.
//!
//! These types cross a process or HTTP boundary: the admin API, and the
//! control-plane calls the gateway makes to backend processes.

use serde::{Deserialize, Serialize};

/// Snapshot of one loaded backend, as reported by `GET /api/backends`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendStatus {
    pub model: String,
    pub address: String,
    pub pid: Option<u32>,
    /// True when the gateway connected to an already running backend
    /// instead of spawning it.
    pub external: bool,
    pub busy: bool,
    pub in_flight: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadBackendRequest {
    pub model: String,
    #[serde(default)]
    pub backend: Option<String>,
    #[serde(default)]
    pub model_file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownBackendRequest {
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendActionResponse {
    pub success: bool,
    pub message: String,
    pub status: Option<BackendStatus>,
}

/// Resource usage of a backend process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendMonitorResponse {
    pub model: String,
    pub pid: Option<u32>,
    pub memory_rss_bytes: u64,
    pub memory_virtual_bytes: u64,
    pub cpu_percent: f32,
}

/// Partial update of the watchdog settings that may change at runtime.
///
/// Every field is optional; absent fields keep their current value.
/// Durations use humantime notation ("5m", "30s", "1h 30m").
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WatchdogSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watchdog_busy_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watchdog_idle_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watchdog_busy_timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watchdog_idle_timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watchdog_interval: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_active_backends: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub single_backend: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_reclaimer_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_reclaimer_threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force_eviction_when_busy: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lru_eviction_max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lru_eviction_retry_interval: Option<String>,
}

/// Body of the "load this model" call sent to a ready backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadModelRequest {
    pub model: String,
    pub model_file: String,
    pub model_path: String,
    #[serde(default)]
    pub context_size: Option<u32>,
    #[serde(default)]
    pub threads: Option<u32>,
    #[serde(default)]
    pub parallel: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadModelReply {
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watchdog_settings_partial_json() {
        let settings: WatchdogSettings =
            serde_json::from_str(r#"{"max_active_backends":2,"watchdog_idle_timeout":"10m"}"#).unwrap();
        assert_eq!(settings.max_active_backends, Some(2));
        assert_eq!(settings.watchdog_idle_timeout.as_deref(), Some("10m"));
        assert!(settings.memory_reclaimer_enabled.is_none());
    }

    #[test]
    fn test_watchdog_settings_skips_unset_fields() {
        let json = serde_json::to_string(&WatchdogSettings {
            single_backend: Some(true),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(json, r#"{"single_backend":true}"#);
    }

    #[test]
    fn test_load_backend_request_optional_fields() {
        let req: LoadBackendRequest = serde_json::from_str(r#"{"model":"phi-2"}"#).unwrap();
        assert_eq!(req.model, "phi-2");
        assert!(req.backend.is_none());
        assert!(req.model_file.is_none());
    }

    #[test]
    fn test_load_model_reply_defaults_message() {
        let reply: LoadModelReply = serde_json::from_str(r#"{"success":true}"#).unwrap();
        assert!(reply.success);
        assert!(reply.message.is_empty());
    }
}
