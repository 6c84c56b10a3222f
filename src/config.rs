use std::fs::File;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Tiling granularity of the edit model. Output sides must be a multiple of it.
pub const PATCH_SIZE: u32 = 14;

/// Largest seed the edit graph accepts as a signed 64-bit scalar.
pub const MAX_SEED: u64 = i64::MAX as u64;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EditConfig {
    pub model_id: String,
    pub precision: Precision,
    pub device: Device,
    pub attention: AttentionBackend,
    pub resolution: u32,
    pub steps: usize,
    pub true_cfg_scale: f32,
    pub negative_prompt: String,
    pub default_prompt: String,
    pub seed: Option<u64>,
    pub max_sequence_length: usize,
    pub result_dir: PathBuf,
    pub bind: SocketAddr,
    pub title: String,
}

impl EditConfig {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let file = io::BufReader::new(File::open(path)?);
        let config: Self = serde_json::from_reader(file)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.resolution == 0 || self.resolution % PATCH_SIZE != 0 {
            return Err(ConfigError::UnalignedResolution(self.resolution));
        }
        if self.steps == 0 {
            return Err(ConfigError::ZeroSteps);
        }
        if !self.true_cfg_scale.is_finite() || self.true_cfg_scale <= 0. {
            return Err(ConfigError::InvalidGuidance(self.true_cfg_scale));
        }
        if self.max_sequence_length == 0 {
            return Err(ConfigError::ZeroSequenceLength);
        }
        if let Some(seed) = self.seed.filter(|&seed| seed > MAX_SEED) {
            return Err(ConfigError::SeedOutOfRange(seed));
        }
        Ok(())
    }
}

impl Default for EditConfig {
    fn default() -> Self {
        Self {
            model_id: "Qwen/Qwen-Image-Edit-2509".to_owned(),
            precision: Precision::Fp16,
            device: Device::Cuda(DeviceId::PRIMARY),
            attention: AttentionBackend::MemoryEfficient,
            resolution: 1008,
            steps: 30,
            true_cfg_scale: 4.0,
            negative_prompt: "low quality".to_owned(),
            default_prompt: "Change the background to a beach".to_owned(),
            seed: None,
            max_sequence_length: 1024,
            result_dir: PathBuf::from("static"),
            bind: SocketAddr::from(([0, 0, 0, 0], 8000)),
            title: "Qwen Image Edit".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    Fp32,
    #[default]
    Fp16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttentionBackend {
    Default,
    /// Fused multi-head attention graph, falls back to `Default` when unavailable.
    #[default]
    MemoryEfficient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(i32);

impl DeviceId {
    pub const PRIMARY: DeviceId = DeviceId(0);

    pub fn new(id: i32) -> Self {
        Self(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum Device {
    Cpu,
    Cuda(DeviceId),
    TensorRt(DeviceId),
    DirectMl(DeviceId),
    RocM(DeviceId),
}

impl Device {
    pub fn execution_providers(self) -> Vec<ort::ExecutionProvider> {
        match self {
            Self::Cpu => vec![self.into()],
            // keep the CPU provider around for ops the accelerator lacks
            _ => vec![self.into(), ort::ExecutionProvider::cpu()],
        }
    }
}

impl From<Device> for ort::ExecutionProvider {
    fn from(value: Device) -> Self {
        match value {
            Device::Cpu => ort::ExecutionProvider::cpu(),
            Device::Cuda(id) => ort::ExecutionProvider::cuda().with_device_id(id.0),
            Device::TensorRt(id) => ort::ExecutionProvider::tensorrt().with_device_id(id.0),
            Device::DirectMl(id) => ort::ExecutionProvider::directml().with_device_id(id.0),
            Device::RocM(id) => ort::ExecutionProvider::rocm().with_device_id(id.0),
        }
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("resolution {0} is not a non-zero multiple of the patch size ({})", PATCH_SIZE)]
    UnalignedResolution(u32),
    #[error("step count must be positive")]
    ZeroSteps,
    #[error("true CFG scale must be a positive finite number, got {0}")]
    InvalidGuidance(f32),
    #[error("max sequence length must be positive")]
    ZeroSequenceLength,
    #[error("seed {0} exceeds the largest supported seed ({})", MAX_SEED)]
    SeedOutOfRange(u64),
    #[error("failed to parse JSON config: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("I/O error when loading the config: {0}")]
    Io(#[from] io::Error),
}
