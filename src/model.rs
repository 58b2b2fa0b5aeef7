use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{bail, ensure, Context, Result};
use ndarray::{Array1, Array2, Array3};
use serde::Deserialize;
use thiserror::Error;

fn default_min_coverage() -> usize {
    2
}

fn default_weights_file() -> String {
    "weights.pt".to_string()
}

/// Model configuration read from `config.toml` in the model directory.
/// The supported-column thresholds are model properties and live here
/// rather than in code.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub window_size: usize,
    #[serde(default = "default_min_coverage")]
    pub min_coverage: usize,
    #[serde(default = "default_weights_file")]
    pub weights_file: String,
}

/// A model directory on disk: parsed `config.toml` plus the verified path
/// of the weights file. Any failure here is fatal at startup.
#[derive(Debug, Clone)]
pub struct ModelDir {
    pub config: ModelConfig,
    pub weights: PathBuf,
}

impl ModelDir {
    pub fn load(dir: &Path) -> Result<Self> {
        let config_path = dir.join("config.toml");
        let raw = std::fs::read_to_string(&config_path)
            .with_context(|| format!("failed to read {}", config_path.display()))?;
        let config: ModelConfig = toml::from_str(&raw)
            .with_context(|| format!("failed to parse {}", config_path.display()))?;
        ensure!(
            config.window_size > 0,
            "{}: window_size must be positive",
            config_path.display()
        );

        let weights = dir.join(&config.weights_file);
        ensure!(
            weights.is_file(),
            "model weights not found at {}",
            weights.display()
        );

        Ok(Self { config, weights })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Cpu,
    Cuda(usize),
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(i) => write!(f, "cuda:{}", i),
        }
    }
}

/// Resolve a device specification (`"cpu"`, `"cuda:all"`, `"cuda:0,2"`)
/// against the number of visible GPUs. An empty resolved list is fatal.
pub fn parse_devices(spec: &str, visible_gpus: usize) -> Result<Vec<Device>> {
    if spec == "cpu" {
        return Ok(vec![Device::Cpu]);
    }

    let list = spec
        .strip_prefix("cuda:")
        .with_context(|| format!("unrecognised device specification: {}", spec))?;

    let devices: Vec<Device> = if list == "all" {
        (0..visible_gpus).map(Device::Cuda).collect()
    } else {
        list.split(',')
            .map(|part| {
                let idx = part
                    .trim()
                    .parse::<usize>()
                    .with_context(|| format!("invalid device index: {}", part))?;
                ensure!(
                    idx < visible_gpus,
                    "device cuda:{} requested but only {} devices are visible",
                    idx,
                    visible_gpus
                );
                Ok(Device::Cuda(idx))
            })
            .collect::<Result<_>>()?
    };

    if devices.is_empty() {
        bail!("device '{}' requested but no devices are available", spec);
    }
    Ok(devices)
}

/// A collated batch of windows ready for the backend. `bases` and `quals`
/// are right-padded to the batch maxima; `indices` holds each window's
/// supported-position tensor.
#[derive(Debug, Clone)]
pub struct InferenceBatch {
    pub bases: Array3<i8>,
    pub quals: Array3<f32>,
    pub lengths: Array1<i32>,
    pub indices: Vec<Array1<i64>>,
}

#[derive(Debug, Error)]
pub enum BackendError {
    /// Worth one retry after clearing the device allocator cache.
    #[error("transient backend failure: {0}")]
    Transient(String),
    #[error("backend failure: {0}")]
    Fatal(String),
}

/// The neural inference backend, treated as an opaque tensor functor. The
/// returned logits have one row per supported position across the whole
/// batch, in window order, with [`crate::consensus::CONSENSUS_BASES`] as
/// the class axis.
pub trait InferenceBackend: Send {
    fn run(&self, batch: &InferenceBatch) -> Result<Array2<f32>, BackendError>;

    /// Drop the device-side allocator cache; called between the two
    /// attempts of the transient-failure retry path.
    fn clear_cache(&self) {}

    /// Total device memory in bytes, when known. Used to auto-size batches.
    fn device_memory_bytes(&self) -> Option<u64> {
        None
    }
}

/// Empirical device-memory footprint of one batch slot.
pub const SLOT_MEM_BYTES: u64 = 256 * 1024 * 1024;
pub const DEFAULT_BATCH_SIZE: usize = 32;

/// Pick a batch size targeting 80% utilization of the device memory, or
/// fall back to [`DEFAULT_BATCH_SIZE`] when the backend cannot report it.
pub fn resolve_batch_size(requested: usize, backend: &dyn InferenceBackend) -> usize {
    if requested > 0 {
        return requested;
    }
    match backend.device_memory_bytes() {
        Some(bytes) => {
            let slots = (bytes / 10 * 8 / SLOT_MEM_BYTES).max(1) as usize;
            log::info!("auto-sized inference batch to {} slots", slots);
            slots
        }
        None => {
            log::warn!(
                "backend does not report device memory; using batch size {}",
                DEFAULT_BATCH_SIZE
            );
            DEFAULT_BATCH_SIZE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_parses_config_and_checks_weights() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            "window_size = 4096\nmin_coverage = 3\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("weights.pt"), b"").unwrap();

        let model = ModelDir::load(dir.path()).unwrap();
        assert_eq!(model.config.window_size, 4096);
        assert_eq!(model.config.min_coverage, 3);
        assert!(model.weights.ends_with("weights.pt"));
    }

    #[test]
    fn load_fails_without_weights() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.toml"), "window_size = 4096\n").unwrap();
        assert!(ModelDir::load(dir.path()).is_err());
    }

    #[test]
    fn load_fails_without_window_size() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.toml"), "min_coverage = 2\n").unwrap();
        assert!(ModelDir::load(dir.path()).is_err());
    }

    #[test]
    fn device_parsing() {
        assert_eq!(parse_devices("cpu", 0).unwrap(), vec![Device::Cpu]);
        assert_eq!(
            parse_devices("cuda:all", 2).unwrap(),
            vec![Device::Cuda(0), Device::Cuda(1)]
        );
        assert_eq!(
            parse_devices("cuda:1,3", 4).unwrap(),
            vec![Device::Cuda(1), Device::Cuda(3)]
        );
        assert!(parse_devices("cuda:all", 0).is_err());
        assert!(parse_devices("cuda:2", 2).is_err());
        assert!(parse_devices("tpu", 1).is_err());
    }
}
