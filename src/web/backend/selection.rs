//! Backend selection and dispatch.
//!
//! Resolves which backend binary serves a model (aliases, asset directory
//! scan, CPU/GPU variant detection, externally managed backends) and brings
//! it up through [`GrpcProcessLauncher`].

use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use lazy_static::lazy_static;
use log::{debug, error, info, warn};

use llama_gateway_types::LoadModelRequest;

use super::client::BackendModel;
use super::error::BackendError;
use super::process::{BackendProcess, ProcessSpec};
use super::registry::{BackendLauncher, LoaderOptions, ModelLoader};

pub const LLAMA_CPP: &str = "llama-cpp";
pub const LLAMA_GGML: &str = "llama-ggml";
pub const LLAMA_CPP_AVX2: &str = "llama-cpp-avx2";
pub const LLAMA_CPP_AVX: &str = "llama-cpp-avx";
pub const LLAMA_CPP_FALLBACK: &str = "llama-cpp-fallback";
pub const LLAMA_CPP_CUDA: &str = "llama-cpp-cuda";
pub const LLAMA_CPP_HIPBLAS: &str = "llama-cpp-hipblas";
pub const LLAMA_CPP_SYCL_16: &str = "llama-cpp-sycl_16";
pub const LLAMA_CPP_SYCL_32: &str = "llama-cpp-sycl_32";
pub const LLAMA_CPP_GRPC: &str = "llama-cpp-grpc";
pub const HUGGINGFACE: &str = "huggingface";
pub const TRANSFORMERS: &str = "transformers";
pub const LOCAL_STORE: &str = "local-store";

/// Variants folded into a single `llama-cpp` entry under autodetect.
const LLAMA_CPP_VARIANTS: &[&str] = &[
    LLAMA_CPP_AVX2,
    LLAMA_CPP_AVX,
    LLAMA_CPP_FALLBACK,
    LLAMA_CPP_GRPC,
    LLAMA_CPP_CUDA,
    LLAMA_CPP_HIPBLAS,
    LLAMA_CPP_SYCL_16,
    LLAMA_CPP_SYCL_32,
];

const MODEL_PATH_ENV: &[&str] = &["HF_HOME", "TRANSFORMERS_CACHE", "HUGGINGFACE_HUB_CACHE"];

lazy_static! {
    pub static ref BACKEND_ALIASES: HashMap<&'static str, &'static str> = HashMap::from([
        ("go-llama", LLAMA_CPP),
        ("llama", LLAMA_CPP),
        ("embedded-store", LOCAL_STORE),
        ("huggingface-embeddings", TRANSFORMERS),
        ("langchain-huggingface", HUGGINGFACE),
        ("transformers-musicgen", TRANSFORMERS),
        ("sentencetransformers", TRANSFORMERS),
        ("mamba", TRANSFORMERS),
        ("stablediffusion", "stablediffusion-ggml"),
    ]);
}

/// Lowercase a backend name and follow its alias, if any.
pub fn resolve_alias(backend: &str) -> String {
    let backend = backend.trim().to_lowercase();
    match BACKEND_ALIASES.get(backend.as_str()) {
        Some(real) => {
            debug!("[SELECT] '{backend}' is an alias of '{real}'");
            real.to_string()
        }
        None => backend,
    }
}

pub fn backend_path(assets: &Path, backend: &str) -> PathBuf {
    assets.join("backend-assets").join("grpc").join(backend)
}

/// Reject backend names that would resolve outside the asset directory.
fn verify_backend_name(backend: &str) -> Result<(), BackendError> {
    if backend.is_empty() || backend == "." || backend == ".." || backend.contains(['/', '\\']) {
        return Err(BackendError::UnsupportedBackend(backend.to_string()));
    }
    Ok(())
}

/// Model files are relative to the models directory and may not leave it.
fn verify_model_file(model: &str) -> Result<(), BackendError> {
    let path = Path::new(model);
    let contained = !model.trim().is_empty()
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_) | Component::CurDir));
    if !contained {
        return Err(BackendError::Config(format!(
            "model file '{model}' must be a relative path inside the models directory"
        )));
    }
    Ok(())
}

/// Scan the asset directory for backend binaries.
///
/// With `autodetect`, every llama-cpp build except the fallback collapses into
/// one `llama-cpp` entry listing the variants found.
pub fn backends_in_asset_dir(assets: &Path, autodetect: bool) -> std::io::Result<BTreeMap<String, Vec<String>>> {
    let mut names: Vec<String> = Vec::new();
    for entry in std::fs::read_dir(backend_path(assets, ""))? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == LOCAL_STORE || name.ends_with(".log") {
            continue;
        }
        names.push(name);
    }
    names.sort();

    let mut backends = BTreeMap::new();
    for name in &names {
        if autodetect && name.contains(LLAMA_CPP) && !name.contains(LLAMA_CPP_FALLBACK) {
            continue;
        }
        backends.insert(name.clone(), Vec::new());
    }

    if autodetect && !backends.contains_key(LLAMA_CPP) {
        let variants: Vec<String> = LLAMA_CPP_VARIANTS
            .iter()
            .filter(|variant| names.iter().any(|name| name == *variant))
            .map(|variant| variant.to_string())
            .collect();
        let native = names.iter().any(|name| name == LLAMA_CPP);
        if native || !variants.is_empty() {
            backends.insert(LLAMA_CPP.to_string(), variants);
        }
    }

    Ok(backends)
}

/// llama.cpp builds first, huggingface last, everything else by name.
pub fn order_backends(backends: &BTreeMap<String, Vec<String>>) -> Vec<String> {
    const PRIORITY: &[&str] = &[LLAMA_CPP, LLAMA_GGML, LLAMA_CPP_FALLBACK];
    const LAST: &[&str] = &[HUGGINGFACE];

    let mut ordered: Vec<String> = PRIORITY
        .iter()
        .filter(|name| backends.contains_key(**name))
        .map(|name| name.to_string())
        .collect();
    ordered.extend(
        backends
            .keys()
            .filter(|name| !PRIORITY.contains(&name.as_str()) && !LAST.contains(&name.as_str()))
            .cloned(),
    );
    ordered.extend(
        LAST.iter()
            .filter(|name| backends.contains_key(**name))
            .map(|name| name.to_string()),
    );
    ordered
}

pub fn list_available_backends(assets: &Path, autodetect: bool) -> Result<Vec<String>, BackendError> {
    Ok(order_backends(&backends_in_asset_dir(assets, autodetect)?))
}

/// What the host offers, as far as picking a llama-cpp build goes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostCapabilities {
    pub nvidia: bool,
    pub amd: bool,
    pub intel: bool,
    pub avx2: bool,
    pub avx: bool,
    /// Distributed inference requested through `LLAMACPP_GRPC_SERVERS`.
    pub grpc_servers: bool,
}

impl HostCapabilities {
    pub fn detect() -> Self {
        let mut caps = Self {
            grpc_servers: std::env::var("LLAMACPP_GRPC_SERVERS").is_ok_and(|v| !v.is_empty()),
            ..Default::default()
        };

        #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
        {
            caps.avx2 = std::arch::is_x86_feature_detected!("avx2");
            caps.avx = std::arch::is_x86_feature_detected!("avx");
        }

        // PCI vendor ids of every DRM device.
        if let Ok(entries) = std::fs::read_dir("/sys/class/drm") {
            for entry in entries.flatten() {
                let vendor = std::fs::read_to_string(entry.path().join("device").join("vendor")).unwrap_or_default();
                match vendor.trim() {
                    "0x10de" => caps.nvidia = true,
                    "0x1002" => caps.amd = true,
                    "0x8086" => caps.intel = true,
                    _ => {}
                }
            }
        }
        caps
    }
}

/// Pick the llama-cpp build matching the host. `None` for other backends or
/// when no suitable binary exists.
pub fn select_variant_by_host_capabilities(
    backend: &str,
    assets: &Path,
    caps: &HostCapabilities,
    f16: bool,
) -> Option<PathBuf> {
    if backend != LLAMA_CPP {
        return None;
    }
    if caps.grpc_servers {
        info!("[SELECT] [{LLAMA_CPP_GRPC}] attempting to load with GRPC variant");
        return Some(backend_path(assets, LLAMA_CPP_GRPC));
    }

    let present = |variant: &str| {
        let path = backend_path(assets, variant);
        path.exists().then_some(path)
    };

    let mut gpu = None;
    if caps.nvidia {
        match present(LLAMA_CPP_CUDA) {
            Some(path) => gpu = Some(path),
            None => debug!("[SELECT] NVIDIA GPU found but no CUDA build shipped"),
        }
    }
    if caps.amd {
        match present(LLAMA_CPP_HIPBLAS) {
            Some(path) => gpu = Some(path),
            None => debug!("[SELECT] AMD GPU found but no HIPBLAS build shipped"),
        }
    }
    if caps.intel {
        let variant = if f16 { LLAMA_CPP_SYCL_16 } else { LLAMA_CPP_SYCL_32 };
        match present(variant) {
            Some(path) => gpu = Some(path),
            None => debug!("[SELECT] Intel GPU found but no SYCL build shipped"),
        }
    }
    if let Some(path) = gpu {
        info!("[SELECT] [{backend}] attempting to load with {}", path.display());
        return Some(path);
    }

    let mut selected = present(LLAMA_CPP_FALLBACK);
    if let Some(native) = present(LLAMA_CPP) {
        selected = Some(native);
    }
    if caps.avx2 {
        if let Some(path) = present(LLAMA_CPP_AVX2) {
            selected = Some(path);
        }
    } else if caps.avx {
        if let Some(path) = present(LLAMA_CPP_AVX) {
            selected = Some(path);
        }
    }
    if let Some(ref path) = selected {
        info!("[SELECT] [{backend}] attempting to load with {}", path.display());
    }
    selected
}

/// A loopback address with a port the OS just reported free.
pub fn free_address() -> Result<String, BackendError> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.to_string())
}

/// Point model caches at the models directory unless the gateway's own
/// environment already does.
fn model_path_env(models_path: &Path) -> Vec<(String, String)> {
    MODEL_PATH_ENV
        .iter()
        .filter(|var| std::env::var_os(var).is_none())
        .map(|var| (var.to_string(), models_path.display().to_string()))
        .collect()
}

/// Per-request load parameters.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Registry key.
    pub model_id: String,
    /// Model file, relative to the models directory.
    pub model: String,
    pub backend: Option<String>,
    pub context_size: Option<u32>,
    pub threads: Option<u32>,
    pub f16: bool,
}

/// Starts (or connects to) one backend and asks it to load the model.
pub struct GrpcProcessLauncher<'a> {
    options: &'a LoaderOptions,
    backend: String,
    autodetect: bool,
    load: &'a LoadOptions,
}

impl<'a> GrpcProcessLauncher<'a> {
    pub fn new(options: &'a LoaderOptions, backend: &str, autodetect: bool, load: &'a LoadOptions) -> Self {
        Self {
            options,
            backend: backend.to_string(),
            autodetect,
            load,
        }
    }

    fn external_backend(&self) -> Option<&str> {
        self.options
            .external_backends
            .iter()
            .find(|(name, _)| *name == self.backend)
            .map(|(_, uri)| uri.as_str())
    }

    fn spawn(&self, model_id: &str, executable: PathBuf) -> Result<(String, BackendProcess), BackendError> {
        let address = free_address()?;
        let process = BackendProcess::spawn(&ProcessSpec {
            name: format!("{}-{model_id}", self.backend),
            executable,
            args: Vec::new(),
            env: model_path_env(&self.options.models_path),
            address: address.clone(),
        })?;
        Ok((address, process))
    }

    fn start(&self, model_id: &str) -> Result<(String, Option<BackendProcess>), BackendError> {
        if let Some(uri) = self.external_backend() {
            if Path::new(uri).is_file() {
                debug!("[SELECT] External backend '{}' is an executable: {uri}", self.backend);
                let (address, process) = self.spawn(model_id, PathBuf::from(uri))?;
                return Ok((address, Some(process)));
            }
            debug!("[SELECT] External backend '{}' is an address: {uri}", self.backend);
            return Ok((uri.to_string(), None));
        }

        verify_backend_name(&self.backend)?;
        let mut executable = backend_path(&self.options.assets_path, &self.backend);
        if self.autodetect {
            let caps = HostCapabilities::detect();
            if let Some(selected) =
                select_variant_by_host_capabilities(&self.backend, &self.options.assets_path, &caps, self.load.f16)
            {
                executable = selected;
            }
        }
        if !executable.exists() {
            return Err(BackendError::BackendNotFound(executable.display().to_string()));
        }
        let (address, process) = self.spawn(model_id, executable)?;
        Ok((address, Some(process)))
    }

    async fn wait_ready(&self, model: &BackendModel) -> Result<(), BackendError> {
        let attempts = self.options.grpc_attempts.max(1);
        for attempt in 1..=attempts {
            match model.client().health_check().await {
                Ok(true) => {
                    debug!("[SELECT] Backend at {} is ready", model.address());
                    return Ok(());
                }
                Ok(false) => debug!("[SELECT] Backend at {} not ready ({attempt}/{attempts})", model.address()),
                Err(e) if attempt == attempts => {
                    error!("[SELECT] Failed starting/connecting to backend at {}: {e}", model.address());
                }
                Err(e) => debug!("[SELECT] Backend at {} not ready ({attempt}/{attempts}): {e}", model.address()),
            }
            if attempt < attempts {
                tokio::time::sleep(self.options.grpc_attempts_delay).await;
            }
        }
        Err(BackendError::NotReady {
            address: model.address().to_string(),
            attempts,
        })
    }

    fn load_request(&self) -> LoadModelRequest {
        LoadModelRequest {
            model: self.load.model.clone(),
            model_file: self.options.models_path.join(&self.load.model).display().to_string(),
            model_path: self.options.models_path.display().to_string(),
            context_size: self.load.context_size,
            threads: self.load.threads,
            parallel: self.options.parallel_requests,
        }
    }
}

impl BackendLauncher for GrpcProcessLauncher<'_> {
    fn launch<'a>(&'a self, model_id: &'a str) -> BoxFuture<'a, Result<BackendModel, BackendError>> {
        Box::pin(async move {
            info!("[SELECT] Starting backend '{}' for model '{model_id}'", self.backend);
            verify_model_file(&self.load.model)?;
            let (address, process) = self.start(model_id)?;
            let model = BackendModel::new(model_id, &address, process)
                .with_parallel(self.options.parallel_requests)
                .with_timeouts(self.options.client_timeouts);

            let ready = match self.wait_ready(&model).await {
                Ok(()) => model.client().load_model(&self.load_request()).await,
                Err(e) => Err(e),
            };
            if let Err(e) = ready {
                if let Some(process) = model.process() {
                    if let Err(stop_err) = process.stop(self.options.stop_timeout).await {
                        warn!("[SELECT] Failed to stop backend after load failure: {stop_err}");
                    }
                }
                return Err(e);
            }
            Ok(model)
        })
    }
}

impl ModelLoader {
    /// Load with an explicit backend, retrying llama-cpp with its fallback build.
    pub async fn load_backend(&self, load: &LoadOptions) -> Result<Arc<BackendModel>, BackendError> {
        let requested = load
            .backend
            .as_deref()
            .ok_or_else(|| BackendError::Config("no backend given".into()))?;
        verify_model_file(&load.model)?;
        let backend = resolve_alias(requested);
        info!("[SELECT] Loading model '{}' with backend {backend}", load.model_id);

        let launcher = GrpcProcessLauncher::new(self.options(), &backend, self.options().autodetect, load);
        match self.load(&load.model_id, &launcher).await {
            Ok(model) => Ok(model),
            Err(e) if backend == LLAMA_CPP => {
                error!("[SELECT] [{backend}] Failed loading model, trying with fallback '{LLAMA_CPP_FALLBACK}': {e}");
                let fallback = GrpcProcessLauncher::new(self.options(), LLAMA_CPP_FALLBACK, false, load);
                self.load(&load.model_id, &fallback).await
            }
            Err(e) => Err(e),
        }
    }

    /// Load with the requested backend, or try every known backend in order.
    pub async fn load_auto(&self, load: &LoadOptions) -> Result<Arc<BackendModel>, BackendError> {
        if let Some(model) = self.check_is_loaded(&load.model_id).await {
            debug!("[SELECT] Model '{}' already loaded", load.model_id);
            return Ok(model);
        }
        if load.backend.is_some() {
            return self.load_backend(load).await;
        }
        verify_model_file(&load.model)?;

        let options = self.options();
        let mut candidates = list_available_backends(&options.assets_path, options.autodetect).unwrap_or_else(|e| {
            warn!("[SELECT] Cannot scan {}: {e}", options.assets_path.display());
            Vec::new()
        });
        for (name, _) in &options.external_backends {
            if !candidates.contains(name) {
                candidates.push(name.clone());
            }
        }
        if candidates.is_empty() {
            return Err(BackendError::BackendNotFound("no backends available".into()));
        }
        info!("[SELECT] Trying to load '{}' with backends {candidates:?}", load.model_id);

        let mut errors = Vec::new();
        for backend in candidates {
            let attempt = LoadOptions {
                backend: Some(backend.clone()),
                ..load.clone()
            };
            match self.load_backend(&attempt).await {
                Ok(model) => {
                    info!("[SELECT] [{backend}] Loads OK");
                    return Ok(model);
                }
                Err(e) => {
                    info!("[SELECT] [{backend}] Fails: {e}");
                    errors.push(format!("[{backend}]: {e}"));
                }
            }
        }
        Err(BackendError::AllBackendsFailed {
            model: load.model_id.clone(),
            errors,
        })
    }
}
