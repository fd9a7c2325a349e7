// src/path_tracing/state/mod.rs
// Per-path integrator state records and the structure-of-arrays pool holding them
// RELEVANT FILES:src/path_tracing/state/layout.rs,src/path_tracing/state/pool.rs,src/path_tracing/wavefront/mod.rs

pub mod layout;
pub mod pool;
pub mod util;

pub use layout::{field_index, KernelFeatures, StateField, STATE_FIELDS};
pub use pool::PathStatePool;
pub use util::PathQueue;

use bytemuck::{Pod, Zeroable};

use crate::path_tracing::kernel::IntegratorStage;

pub const INTEGRATOR_VOLUME_STACK_SIZE: usize = 4;
pub const INTEGRATOR_SHADOW_ISECT_SIZE: usize = 4;

/// Ray visibility and path classification flags stored in `PathState::flag`.
pub const PATH_RAY_CAMERA: u32 = 1 << 0;
pub const PATH_RAY_REFLECT: u32 = 1 << 1;
pub const PATH_RAY_TRANSMIT: u32 = 1 << 2;
pub const PATH_RAY_DIFFUSE: u32 = 1 << 3;
pub const PATH_RAY_SHADOW: u32 = 1 << 4;
pub const PATH_RAY_VOLUME_PASS: u32 = 1 << 5;
pub const PATH_RAY_SUBSURFACE: u32 = 1 << 6;

/// Intersection type id for a miss.
pub const PRIMITIVE_NONE: i32 = -1;
pub const OBJECT_NONE: i32 = -1;

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct PathState {
    pub render_pixel_index: u32,
    pub sample: u32,
    pub bounce: u32,
    pub diffuse_bounce: u32,
    pub glossy_bounce: u32,
    pub transmission_bounce: u32,
    pub volume_bounce: u32,
    pub transparent_bounce: u32,
    pub queued_kernel: u32,        // 1 << stage, 0 when not queued
    pub rng_hash: u32,
    pub rng_offset: u32,
    pub flag: u32,                 // PATH_RAY_*
    pub mis_ray_pdf: f32,
    pub mis_ray_t: f32,
    pub min_ray_pdf: f32,
    pub throughput: [f32; 3],
    pub diffuse_glossy_ratio: [f32; 3],
    pub denoising_feature_throughput: [f32; 3],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct RayState {
    pub p: [f32; 3],
    pub d: [f32; 3],
    pub t: f32,
    pub time: f32,
    pub dp: f32,                   // position differential
    pub dd: f32,                   // direction differential
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct Intersection {
    pub t: f32,
    pub u: f32,
    pub v: f32,
    pub prim: i32,
    pub object: i32,
    pub kind: i32,
    pub ng: [f32; 3],              // geometric normal, optional column
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct SubsurfaceState {
    pub albedo: [f32; 3],
    pub radius: [f32; 3],
    pub roughness: f32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct VolumeStackEntry {
    pub object: i32,
    pub shader: i32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct ShadowPathState {
    pub render_pixel_index: u32,
    pub sample: u32,
    pub bounce: u32,
    pub transparent_bounce: u32,
    pub queued_kernel: u32,
    pub flag: u32,
    pub num_hits: u32,
    pub throughput: [f32; 3],
    pub diffuse_glossy_ratio: [f32; 3],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct ShadowRayState {
    pub p: [f32; 3],
    pub d: [f32; 3],
    pub t: f32,
    pub time: f32,
}

/// Complete state of one path slot. Kernels work on this record; the
/// wavefront pool stores it column by column.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct IntegratorState {
    pub path: PathState,
    pub ray: RayState,
    pub isect: Intersection,
    pub subsurface: SubsurfaceState,
    pub volume_stack: [VolumeStackEntry; INTEGRATOR_VOLUME_STACK_SIZE],
    pub shadow_path: ShadowPathState,
    pub shadow_ray: ShadowRayState,
    pub shadow_isect: [Intersection; INTEGRATOR_SHADOW_ISECT_SIZE],
    pub shadow_volume_stack: [VolumeStackEntry; INTEGRATOR_VOLUME_STACK_SIZE],
}

impl IntegratorState {
    pub fn new() -> Self {
        Self::zeroed()
    }

    pub fn path_stage(&self) -> Option<IntegratorStage> {
        IntegratorStage::from_flag(self.path.queued_kernel)
    }

    pub fn shadow_path_stage(&self) -> Option<IntegratorStage> {
        IntegratorStage::from_flag(self.shadow_path.queued_kernel)
    }

    /// Neither the main path nor its shadow sub-path is queued anywhere.
    pub fn is_terminated(&self) -> bool {
        self.path.queued_kernel == 0 && self.shadow_path.queued_kernel == 0
    }
}

impl Default for IntegratorState {
    fn default() -> Self {
        Self::zeroed()
    }
}
