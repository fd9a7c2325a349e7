//! Wavefront path-state scheduling core for the forge3d path tracer.
//!
//! Paths live in a structure-of-arrays pool and are advanced stage by stage
//! through device queues; a CPU work runs each pixel's samples start to finish
//! instead. `PathTrace` drives one or more devices through a render step.

pub mod config;
pub mod device;
pub mod error;
pub mod path_tracing;

pub use config::{CompactionBackend, ConfigError, IntegratorConfig};
pub use device::{Device, DeviceInfo, DeviceType};
pub use error::{RenderError, RenderResult};
