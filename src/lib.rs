//! llama gateway: manages the lifecycle of model-serving backend processes.

pub mod web;

pub use web::backend::{BackendError, LoadOptions, ModelLoader, Watchdog, WatchdogConfig};
pub use web::config::GatewayArgs;
