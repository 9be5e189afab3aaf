use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    #[default]
    Auto,
    Cpu,
    Cuda,
    Metal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Cpu,
    Cuda,
    Metal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceHandle {
    pub kind: DeviceKind,
    pub ordinal: usize,
    pub threads: usize,
}

impl DeviceHandle {
    pub fn is_gpu(&self) -> bool {
        self.kind != DeviceKind::Cpu
    }
}

/// Chooses and prepares the accelerator a worker process runs on.
pub trait DeviceStrategy: Send + Sync {
    fn select(&self) -> DeviceHandle;
    fn prepare(&self, handle: &DeviceHandle) -> Result<()>;
}

/// Honors the configured preference when the backend is compiled in, otherwise falls back
/// through cuda, metal, cpu. GPU workers are spread across devices by slot index.
pub struct PreferenceStrategy {
    preference: DevicePreference,
    slot: usize,
    gpu_count: usize,
    threads: usize,
    available: Vec<DeviceKind>,
}

impl PreferenceStrategy {
    pub fn new(preference: DevicePreference, slot: usize, gpu_count: usize, threads: usize) -> Self {
        let mut available = Vec::new();
        if cfg!(feature = "cuda") {
            available.push(DeviceKind::Cuda);
        }
        if cfg!(feature = "metal") {
            available.push(DeviceKind::Metal);
        }
        available.push(DeviceKind::Cpu);
        Self::with_available(preference, slot, gpu_count, threads, available)
    }

    pub fn with_available(
        preference: DevicePreference,
        slot: usize,
        gpu_count: usize,
        threads: usize,
        available: Vec<DeviceKind>,
    ) -> Self {
        Self {
            preference,
            slot,
            gpu_count: gpu_count.max(1),
            threads: threads.max(1),
            available,
        }
    }

    fn wanted(&self) -> Option<DeviceKind> {
        match self.preference {
            DevicePreference::Auto => None,
            DevicePreference::Cpu => Some(DeviceKind::Cpu),
            DevicePreference::Cuda => Some(DeviceKind::Cuda),
            DevicePreference::Metal => Some(DeviceKind::Metal),
        }
    }
}

impl DeviceStrategy for PreferenceStrategy {
    fn select(&self) -> DeviceHandle {
        let kind = self
            .wanted()
            .filter(|k| self.available.contains(k))
            .or_else(|| self.available.first().copied())
            .unwrap_or(DeviceKind::Cpu);
        let ordinal = match kind {
            DeviceKind::Cuda => self.slot % self.gpu_count,
            _ => 0,
        };
        DeviceHandle {
            kind,
            ordinal,
            threads: self.threads,
        }
    }

    fn prepare(&self, handle: &DeviceHandle) -> Result<()> {
        // Worker processes are single-purpose, so process-wide env is safe to set before model load.
        match handle.kind {
            DeviceKind::Cuda => std::env::set_var("CUDA_VISIBLE_DEVICES", handle.ordinal.to_string()),
            DeviceKind::Cpu => std::env::set_var("OMP_NUM_THREADS", handle.threads.to_string()),
            DeviceKind::Metal => {}
        }
        info!("Worker slot {} using {:?} device {}", self.slot, handle.kind, handle.ordinal);
        Ok(())
    }
}
