//! Backend lifecycle: spawning, loading, health, eviction.
//!
//! [`registry::ModelLoader`] owns the loaded backends. The
//! [`watchdog::Watchdog`] decides what to evict and hands that off to an
//! evictor task which calls back into the loader, so neither holds the
//! other's locks.

pub mod client;
pub mod error;
pub mod memory;
pub mod process;
pub mod registry;
pub mod selection;
pub mod watchdog;
pub mod watchdog_config;

#[cfg(test)]
pub(crate) mod test_support;

pub use client::{BackendClient, BackendModel, BusyGuard, ClientTimeouts};
pub use error::BackendError;
pub use registry::{BackendLauncher, LoaderOptions, ModelLoader};
pub use selection::{GrpcProcessLauncher, LoadOptions};
pub use watchdog::{spawn_evictor, EvictionReason, LruEnforcement, ProcessManager, Watchdog};
pub use watchdog_config::WatchdogConfig;
