// Memory utilization sampling for the watchdog reclaimer.
//
// GPU memory comes from nvidia-smi (summed over every device), host RAM from
// sysinfo. GPU wins when present since that is where backends keep weights.

use std::process::Command;
use std::sync::Mutex;

use log::debug;
use sysinfo::System;

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    Gpu,
    Ram,
}

impl std::fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryKind::Gpu => write!(f, "GPU"),
            MemoryKind::Ram => write!(f, "RAM"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryUsage {
    pub kind: MemoryKind,
    pub used_bytes: u64,
    pub total_bytes: u64,
}

impl MemoryUsage {
    pub fn new(kind: MemoryKind, used_bytes: u64, total_bytes: u64) -> Self {
        Self {
            kind,
            used_bytes,
            total_bytes,
        }
    }

    /// Used / total in `[0, 1]`. Zero when total is unknown.
    pub fn ratio(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        (self.used_bytes as f64 / self.total_bytes as f64).clamp(0.0, 1.0)
    }
}

/// Source of memory utilization samples. Called from the blocking pool.
pub trait MemorySampler: Send + Sync {
    /// `None` when no memory source could be read.
    fn sample(&self) -> Option<MemoryUsage>;
}

/// Samples GPU memory through nvidia-smi, falling back to host RAM.
pub struct SystemMemorySampler {
    system: Mutex<System>,
    probe_gpu: bool,
}

impl SystemMemorySampler {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            probe_gpu: true,
        }
    }

    /// Host RAM only, never shells out to nvidia-smi.
    pub fn ram_only() -> Self {
        Self {
            system: Mutex::new(System::new()),
            probe_gpu: false,
        }
    }

    fn sample_ram(&self) -> Option<MemoryUsage> {
        let mut system = self.system.lock().ok()?;
        system.refresh_memory();
        let total = system.total_memory();
        if total == 0 {
            return None;
        }
        Some(MemoryUsage::new(MemoryKind::Ram, system.used_memory(), total))
    }
}

impl Default for SystemMemorySampler {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySampler for SystemMemorySampler {
    fn sample(&self) -> Option<MemoryUsage> {
        if self.probe_gpu {
            if let Some(gpu) = sample_nvidia_gpu() {
                return Some(gpu);
            }
        }
        self.sample_ram()
    }
}

fn sample_nvidia_gpu() -> Option<MemoryUsage> {
    let output = Command::new("nvidia-smi")
        .args(["--query-gpu=memory.used,memory.total", "--format=csv,noheader,nounits"])
        .output()
        .ok()?;
    if !output.status.success() {
        debug!("[MEMORY] nvidia-smi exited with {}", output.status);
        return None;
    }
    let text = String::from_utf8(output.stdout).ok()?;
    parse_nvidia_smi_memory(&text)
}

/// Parse `memory.used, memory.total` rows (MiB) and sum them across GPUs.
pub(crate) fn parse_nvidia_smi_memory(text: &str) -> Option<MemoryUsage> {
    let mut used_mib = 0u64;
    let mut total_mib = 0u64;
    let mut devices = 0;

    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let (used, total) = line.split_once(',')?;
        used_mib += used.trim().parse::<u64>().ok()?;
        total_mib += total.trim().parse::<u64>().ok()?;
        devices += 1;
    }

    if devices == 0 || total_mib == 0 {
        return None;
    }
    Some(MemoryUsage::new(MemoryKind::Gpu, used_mib * MIB, total_mib * MIB))
}
