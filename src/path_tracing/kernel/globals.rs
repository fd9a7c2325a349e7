// src/path_tracing/kernel/globals.rs
// Read-only data every kernel sees, plus the per-thread context wrapping it

use std::any::Any;
use std::sync::Arc;

use crate::config::IntegratorConfig;
use crate::path_tracing::film::KernelFilm;
use crate::path_tracing::state::KernelFeatures;

use super::KernelFunctions;

#[derive(Clone, Copy, Debug)]
pub struct KernelIntegrator {
    pub max_bounce: u32,
    /// Clamp for camera-ray contributions, 0 = off
    pub sample_clamp_direct: f32,
    /// Clamp for everything after the first bounce, 0 = off
    pub sample_clamp_indirect: f32,
    pub seed: u32,
    /// Paths start from baked surface points instead of the camera
    pub use_baking: bool,
}

impl Default for KernelIntegrator {
    fn default() -> Self {
        Self {
            max_bounce: 8,
            sample_clamp_direct: 0.0,
            sample_clamp_indirect: 0.0,
            seed: 0,
            use_baking: false,
        }
    }
}

/// Scene-level constants uploaded once per reset.
#[derive(Clone)]
pub struct KernelData {
    pub film: KernelFilm,
    pub integrator: KernelIntegrator,
    pub features: KernelFeatures,
    /// Opaque scene payload for the shading and intersection kernels
    pub scene: Option<Arc<dyn Any + Send + Sync>>,
}

impl KernelData {
    pub fn new(film: KernelFilm, config: &IntegratorConfig) -> Self {
        Self {
            film,
            integrator: KernelIntegrator {
                max_bounce: config.max_bounce,
                sample_clamp_direct: config.sample_clamp_direct,
                sample_clamp_indirect: config.sample_clamp_indirect,
                seed: config.seed,
                use_baking: false,
            },
            features: KernelFeatures::NONE,
            scene: None,
        }
    }

    pub fn with_features(mut self, features: KernelFeatures) -> Self {
        self.features = features;
        self
    }

    pub fn with_scene(mut self, scene: Arc<dyn Any + Send + Sync>) -> Self {
        self.scene = Some(scene);
        self
    }

    pub fn scene<T: Any>(&self) -> Option<&T> {
        self.scene.as_deref().and_then(|s| s.downcast_ref::<T>())
    }
}

impl std::fmt::Debug for KernelData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelData")
            .field("film", &self.film)
            .field("integrator", &self.integrator)
            .field("features", &self.features)
            .field("scene", &self.scene.is_some())
            .finish()
    }
}

/// Per-thread kernel context. Created once per worker and reused for every
/// pixel that worker processes.
#[derive(Clone, Debug)]
pub struct KernelGlobals {
    pub data: Arc<KernelData>,
    pub kernels: KernelFunctions,
    pub thread_index: usize,
    /// Accumulate with atomic adds (several lanes may hit one pixel)
    pub atomic_pass_write: bool,
}

impl KernelGlobals {
    pub fn new(
        data: Arc<KernelData>,
        kernels: KernelFunctions,
        thread_index: usize,
        atomic_pass_write: bool,
    ) -> Self {
        Self {
            data,
            kernels,
            thread_index,
            atomic_pass_write,
        }
    }

    pub fn film(&self) -> &KernelFilm {
        &self.data.film
    }

    pub fn integrator(&self) -> &KernelIntegrator {
        &self.data.integrator
    }
}
