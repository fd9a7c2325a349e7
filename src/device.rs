// src/device.rs
// Compute device description shared by a work unit and its queue
// Holds the sticky error state that suppresses dispatch after a fatal failure

use std::sync::Arc;

use crate::config::IntegratorConfig;
use crate::error::DeviceErrorState;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceType {
    /// One path at a time per worker thread, no queue.
    Cpu,
    /// Queue-driven wavefront execution over a path-state pool.
    Wavefront,
}

impl DeviceType {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "cpu" => Some(Self::Cpu),
            "wavefront" | "gpu" => Some(Self::Wavefront),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct DeviceInfo {
    pub id: String,
    pub device_type: DeviceType,
    /// Worker threads for CPU devices, 0 = all cores
    pub cpu_threads: usize,
    pub threads_per_block: usize,
    pub max_num_paths: usize,
}

impl DeviceInfo {
    pub fn cpu(id: impl Into<String>, config: &IntegratorConfig) -> Self {
        Self {
            id: id.into(),
            device_type: DeviceType::Cpu,
            cpu_threads: config.cpu_threads,
            threads_per_block: config.threads_per_block,
            max_num_paths: config.max_num_paths,
        }
    }

    pub fn wavefront(id: impl Into<String>, config: &IntegratorConfig) -> Self {
        Self {
            id: id.into(),
            device_type: DeviceType::Wavefront,
            cpu_threads: 0,
            threads_per_block: config.threads_per_block,
            max_num_paths: config.max_num_paths,
        }
    }

    pub fn num_cpu_threads(&self) -> usize {
        if self.cpu_threads > 0 {
            self.cpu_threads
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }
}

#[derive(Debug)]
pub struct Device {
    pub info: DeviceInfo,
    error: DeviceErrorState,
}

impl Device {
    pub fn new(info: DeviceInfo) -> Arc<Self> {
        Arc::new(Self {
            info,
            error: DeviceErrorState::new(),
        })
    }

    pub fn set_error(&self, message: impl Into<String>) {
        self.error.set_error(format!("{}: {}", self.info.id, message.into()));
    }

    pub fn have_error(&self) -> bool {
        self.error.have_error()
    }

    pub fn error_message(&self) -> Option<String> {
        self.error.error_message()
    }
}
