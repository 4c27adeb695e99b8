// Error taxonomy for backend lifecycle operations

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    /// No registry entry exists for the model name.
    #[error("model '{0}' is not loaded")]
    NotFound(String),

    #[error("backend '{0}' not found")]
    BackendNotFound(String),

    #[error("backend '{0}' is not supported")]
    UnsupportedBackend(String),

    #[error("failed to spawn backend '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("could not reach backend at {address}: {message}")]
    Connect { address: String, message: String },

    #[error("backend at {address} did not become ready after {attempts} attempts")]
    NotReady { address: String, attempts: u32 },

    #[error("backend failed to load model '{model}': {message}")]
    LoadFailed { model: String, message: String },

    #[error("health check failed for {address}: {message}")]
    HealthCheck { address: String, message: String },

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("address {address} is already owned by model '{owner}'")]
    AddressInUse { address: String, owner: String },

    /// One or more backends failed to stop during a bulk shutdown.
    #[error("failed to stop {} backend(s): {}", failures.len(), join_failures(failures))]
    Shutdown { failures: Vec<(String, String)> },

    #[error("all backends failed to load model '{model}': {}", errors.join("; "))]
    AllBackendsFailed { model: String, errors: Vec<String> },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BackendError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound(_))
    }
}

fn join_failures(failures: &[(String, String)]) -> String {
    failures
        .iter()
        .map(|(model, err)| format!("{model}: {err}"))
        .collect::<Vec<_>>()
        .join("; ")
}
