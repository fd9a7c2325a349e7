// src/config.rs
// Integrator configuration loaded from JSON with serde defaults and validation
// RELEVANT FILES:src/path_tracing/path_trace.rs,src/path_tracing/adaptive_sampling.rs,src/device.rs

use std::error::Error;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::path_tracing::adaptive_sampling::AdaptiveSampling;
use crate::path_tracing::kernel::KernelArch;

/// Path-state pool capacity used when nothing else is configured.
pub const DEFAULT_MAX_NUM_PATHS: usize = 1 << 20;
pub const DEFAULT_THREADS_PER_BLOCK: usize = 256;

#[derive(Debug, Clone)]
pub struct ConfigError {
    message: String,
}

impl ConfigError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IntegratorConfig validation failed: {}", self.message)
    }
}

impl Error for ConfigError {}

/// Where the wavefront queue runs its compaction pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactionBackend {
    #[default]
    Host,
    Wgpu,
}

impl CompactionBackend {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "host" | "cpu" => Some(Self::Host),
            "wgpu" | "gpu" => Some(Self::Wgpu),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegratorConfig {
    /// Path-state pool capacity per wavefront device. Not derived from device
    /// memory; callers size it for the occupancy they want.
    pub max_num_paths: usize,
    pub threads_per_block: usize,
    /// CPU worker threads, 0 = all available cores
    pub cpu_threads: usize,
    /// New tiles are only seeded while fewer than this fraction of slots are active.
    pub regenerate_threshold: f32,
    /// Finish the wavefront with the megakernel once this few paths remain (0 = never).
    pub megakernel_tail_threshold: usize,
    pub compaction: CompactionBackend,
    pub kernel_arch: Option<KernelArch>,
    pub adaptive_sampling: AdaptiveSampling,
    pub max_bounce: u32,
    /// 0 disables clamping
    pub sample_clamp_direct: f32,
    pub sample_clamp_indirect: f32,
    pub seed: u32,
}

impl Default for IntegratorConfig {
    fn default() -> Self {
        Self {
            max_num_paths: DEFAULT_MAX_NUM_PATHS,
            threads_per_block: DEFAULT_THREADS_PER_BLOCK,
            cpu_threads: 0,
            regenerate_threshold: 0.5,
            megakernel_tail_threshold: 0,
            compaction: CompactionBackend::Host,
            kernel_arch: None,
            adaptive_sampling: AdaptiveSampling::default(),
            max_bounce: 8,
            sample_clamp_direct: 0.0,
            sample_clamp_indirect: 0.0,
            seed: 0,
        }
    }
}

impl IntegratorConfig {
    pub fn from_json_str(json: &str) -> crate::error::RenderResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> crate::error::RenderResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_json_str(&text)?;
        log::info!(
            "Loaded integrator config from {} (max_num_paths={})",
            path.as_ref().display(),
            config.max_num_paths
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_num_paths == 0 {
            return Err(ConfigError::new("max_num_paths must be at least 1"));
        }
        if self.max_num_paths > u32::MAX as usize {
            return Err(ConfigError::new(format!(
                "max_num_paths {} does not fit a 32-bit path index",
                self.max_num_paths
            )));
        }
        if self.threads_per_block == 0 || !self.threads_per_block.is_power_of_two() {
            return Err(ConfigError::new(format!(
                "threads_per_block must be a power of two, got {}",
                self.threads_per_block
            )));
        }
        if !(0.0..=1.0).contains(&self.regenerate_threshold) {
            return Err(ConfigError::new(format!(
                "regenerate_threshold must be within [0, 1], got {}",
                self.regenerate_threshold
            )));
        }
        if self.sample_clamp_direct < 0.0 || self.sample_clamp_indirect < 0.0 {
            return Err(ConfigError::new("sample clamp limits must be non-negative"));
        }
        if cfg!(not(feature = "gpu")) && self.compaction == CompactionBackend::Wgpu {
            return Err(ConfigError::new(
                "compaction = \"wgpu\" requires the `gpu` feature",
            ));
        }
        self.adaptive_sampling.validate()
    }
}
