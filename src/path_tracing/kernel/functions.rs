// src/path_tracing/kernel/functions.rs
// Kernel function tables, one per CPU instruction set, picked once at startup
// Tables are plain structs of fn references handed to each work unit by value

use std::collections::BTreeMap;

use half::f16;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use super::{IntegratorStage, KernelGlobals};
use crate::path_tracing::buffers::RenderBuffers;
use crate::path_tracing::film::PassMode;
use crate::path_tracing::state::{IntegratorState, PathQueue};
use crate::path_tracing::work_tile::KernelWorkTile;

pub type Half4 = [f16; 4];

/// Seed one path from work item `tile_work_index` of a tile. Returns false when
/// the pixel needs no sample (e.g. already converged).
pub type IntegratorInitFunction = fn(
    &KernelGlobals,
    &mut IntegratorState,
    &PathQueue<'_>,
    &KernelWorkTile,
    u32,
    &RenderBuffers,
) -> bool;

pub type IntegratorFunction = fn(&KernelGlobals, &mut IntegratorState, &PathQueue<'_>);

pub type IntegratorShadeFunction =
    fn(&KernelGlobals, &mut IntegratorState, &PathQueue<'_>, &RenderBuffers);

/// `(kg, buffers, render_pixel_index, threshold, reset) -> converged`
pub type AdaptiveSamplingConvergenceCheckFunction =
    fn(&KernelGlobals, &RenderBuffers, usize, f32, bool) -> bool;

/// `(kg, buffers, line, start, length, offset, stride) -> any pixel still active`
pub type AdaptiveSamplingFilterFunction =
    fn(&KernelGlobals, &RenderBuffers, usize, usize, usize, i64, usize) -> bool;

/// `(kg, buffers, render_pixel_index)`
pub type CryptomattePostprocessFunction = fn(&KernelGlobals, &RenderBuffers, usize);

/// `(kg, buffers, render_pixel_index, scale, pass_mode) -> display pixel`
pub type ConvertToHalfFloatFunction = fn(&KernelGlobals, &RenderBuffers, usize, f32, PassMode) -> Half4;

#[derive(Clone, Copy, Debug)]
pub struct KernelFunctions {
    pub integrator_init_from_camera: IntegratorInitFunction,
    pub integrator_init_from_bake: IntegratorInitFunction,
    pub integrator_intersect_closest: IntegratorFunction,
    pub integrator_intersect_shadow: IntegratorFunction,
    pub integrator_intersect_subsurface: IntegratorFunction,
    pub integrator_intersect_volume_stack: IntegratorFunction,
    pub integrator_shade_background: IntegratorShadeFunction,
    pub integrator_shade_light: IntegratorShadeFunction,
    pub integrator_shade_shadow: IntegratorShadeFunction,
    pub integrator_shade_surface: IntegratorShadeFunction,
    pub integrator_shade_volume: IntegratorShadeFunction,
    pub integrator_megakernel: IntegratorShadeFunction,
    pub adaptive_sampling_convergence_check: AdaptiveSamplingConvergenceCheckFunction,
    pub adaptive_sampling_filter_x: AdaptiveSamplingFilterFunction,
    pub adaptive_sampling_filter_y: AdaptiveSamplingFilterFunction,
    pub cryptomatte_postprocess: CryptomattePostprocessFunction,
    pub film_convert_to_half_float: ConvertToHalfFloatFunction,
}

/// Arguments a stage kernel needs besides the state.
pub enum StageFunction {
    Intersect(IntegratorFunction),
    Shade(IntegratorShadeFunction),
}

impl KernelFunctions {
    pub fn stage_function(&self, stage: IntegratorStage) -> StageFunction {
        match stage {
            IntegratorStage::IntersectClosest => {
                StageFunction::Intersect(self.integrator_intersect_closest)
            }
            IntegratorStage::IntersectShadow => StageFunction::Intersect(self.integrator_intersect_shadow),
            IntegratorStage::IntersectSubsurface => {
                StageFunction::Intersect(self.integrator_intersect_subsurface)
            }
            IntegratorStage::IntersectVolumeStack => {
                StageFunction::Intersect(self.integrator_intersect_volume_stack)
            }
            IntegratorStage::ShadeBackground => StageFunction::Shade(self.integrator_shade_background),
            IntegratorStage::ShadeLight => StageFunction::Shade(self.integrator_shade_light),
            IntegratorStage::ShadeShadow => StageFunction::Shade(self.integrator_shade_shadow),
            IntegratorStage::ShadeSurface => StageFunction::Shade(self.integrator_shade_surface),
            IntegratorStage::ShadeVolume => StageFunction::Shade(self.integrator_shade_volume),
        }
    }

    pub fn init_function(&self, use_baking: bool) -> IntegratorInitFunction {
        if use_baking {
            self.integrator_init_from_bake
        } else {
            self.integrator_init_from_camera
        }
    }

    /// Run one stage on a path.
    pub fn run_stage(
        &self,
        stage: IntegratorStage,
        kg: &KernelGlobals,
        state: &mut IntegratorState,
        queue: &PathQueue<'_>,
        render_buffers: &RenderBuffers,
    ) {
        match self.stage_function(stage) {
            StageFunction::Intersect(f) => f(kg, state, queue),
            StageFunction::Shade(f) => f(kg, state, queue, render_buffers),
        }
    }
}

/// Instruction set a kernel table was compiled for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KernelArch {
    Generic,
    Sse2,
    Sse41,
    Avx2,
}

static DETECTED_ARCH: Lazy<KernelArch> = Lazy::new(detect_arch);

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
fn detect_arch() -> KernelArch {
    if is_x86_feature_detected!("avx2") {
        KernelArch::Avx2
    } else if is_x86_feature_detected!("sse4.1") {
        KernelArch::Sse41
    } else if is_x86_feature_detected!("sse2") {
        KernelArch::Sse2
    } else {
        KernelArch::Generic
    }
}

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
fn detect_arch() -> KernelArch {
    KernelArch::Generic
}

impl KernelArch {
    /// Best instruction set of the running CPU.
    pub fn detect() -> KernelArch {
        *DETECTED_ARCH
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "generic" | "cpu" => Some(Self::Generic),
            "sse2" => Some(Self::Sse2),
            "sse41" | "sse4.1" => Some(Self::Sse41),
            "avx2" => Some(Self::Avx2),
            _ => None,
        }
    }
}

/// Kernel tables by instruction set. The generic table is mandatory.
#[derive(Clone, Debug)]
pub struct KernelRegistry {
    tables: BTreeMap<KernelArch, KernelFunctions>,
}

impl KernelRegistry {
    pub fn new(generic: KernelFunctions) -> Self {
        let mut tables = BTreeMap::new();
        tables.insert(KernelArch::Generic, generic);
        Self { tables }
    }

    pub fn with_arch(mut self, arch: KernelArch, functions: KernelFunctions) -> Self {
        self.tables.insert(arch, functions);
        self
    }

    pub fn architectures(&self) -> impl Iterator<Item = KernelArch> + '_ {
        self.tables.keys().copied()
    }

    /// Pick the best table not exceeding the detected CPU (and `requested`, if any).
    pub fn select(&self, requested: Option<KernelArch>) -> (KernelArch, KernelFunctions) {
        self.select_for(KernelArch::detect(), requested)
    }

    pub fn select_for(
        &self,
        supported: KernelArch,
        requested: Option<KernelArch>,
    ) -> (KernelArch, KernelFunctions) {
        let limit = requested.map_or(supported, |r| r.min(supported));
        let (arch, functions) = self
            .tables
            .range(..=limit)
            .next_back()
            .map(|(arch, f)| (*arch, *f))
            .unwrap_or_else(|| (KernelArch::Generic, self.tables[&KernelArch::Generic]));
        if requested.is_some_and(|r| r != arch) {
            log::warn!("Requested {:?} kernels, using {:?}", requested, arch);
        } else {
            log::info!("Using {:?} kernels", arch);
        }
        (arch, functions)
    }
}
