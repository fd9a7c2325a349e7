// src/path_tracing/state/layout.rs
// Compile-time schema of the integrator state: one entry per stored member
// The pool allocates one column per entry (and per array element) and copies through this table only

use std::mem::{offset_of, size_of};
use std::ops::BitOr;

use super::{
    IntegratorState, Intersection, PathState, RayState, ShadowPathState, ShadowRayState,
    SubsurfaceState, VolumeStackEntry, INTEGRATOR_SHADOW_ISECT_SIZE, INTEGRATOR_VOLUME_STACK_SIZE,
};

/// Optional kernel features. Columns tied to a disabled feature are not allocated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct KernelFeatures(u32);

impl KernelFeatures {
    pub const NONE: Self = Self(0);
    pub const VOLUME: Self = Self(1 << 0);
    pub const SUBSURFACE: Self = Self(1 << 1);
    pub const GEOMETRIC_NORMAL: Self = Self(1 << 2);
    pub const DENOISING: Self = Self(1 << 3);
    pub const ALL: Self = Self(0b1111);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for KernelFeatures {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// One member of the state schema.
#[derive(Clone, Copy, Debug)]
pub struct StateField {
    pub name: &'static str,
    /// Offset of element 0 inside `IntegratorState`, in 32-bit words
    pub offset: usize,
    pub words: usize,
    /// 1 for plain members, N for members of fixed-size array records
    pub array_size: usize,
    /// Words between consecutive array elements
    pub array_stride: usize,
    /// Feature gating the column, NONE = always stored
    pub feature: KernelFeatures,
}

impl StateField {
    pub fn is_enabled(&self, features: KernelFeatures) -> bool {
        features.contains(self.feature)
    }

    /// Word offset of `element` inside the record.
    pub fn element_offset(&self, element: usize) -> usize {
        self.offset + element * self.array_stride
    }
}

macro_rules! state_field {
    ($record:ident : $rty:ty, $member:ident : $mty:ty, $feature:expr) => {
        StateField {
            name: concat!(stringify!($record), ".", stringify!($member)),
            offset: (offset_of!(IntegratorState, $record) + offset_of!($rty, $member)) / 4,
            words: size_of::<$mty>() / 4,
            array_size: 1,
            array_stride: 0,
            feature: $feature,
        }
    };
    ($record:ident [$size:expr] : $rty:ty, $member:ident : $mty:ty, $feature:expr) => {
        StateField {
            name: concat!(stringify!($record), "[].", stringify!($member)),
            offset: (offset_of!(IntegratorState, $record) + offset_of!($rty, $member)) / 4,
            words: size_of::<$mty>() / 4,
            array_size: $size,
            array_stride: size_of::<$rty>() / 4,
            feature: $feature,
        }
    };
}

const ALWAYS: KernelFeatures = KernelFeatures::NONE;
const VOLUME: KernelFeatures = KernelFeatures::VOLUME;
const SUBSURFACE: KernelFeatures = KernelFeatures::SUBSURFACE;
const NG: KernelFeatures = KernelFeatures::GEOMETRIC_NORMAL;
const DENOISING: KernelFeatures = KernelFeatures::DENOISING;
const VSS: usize = INTEGRATOR_VOLUME_STACK_SIZE;
const SIS: usize = INTEGRATOR_SHADOW_ISECT_SIZE;

pub const STATE_FIELDS: &[StateField] = &[
    state_field!(path: PathState, render_pixel_index: u32, ALWAYS),
    state_field!(path: PathState, sample: u32, ALWAYS),
    state_field!(path: PathState, bounce: u32, ALWAYS),
    state_field!(path: PathState, diffuse_bounce: u32, ALWAYS),
    state_field!(path: PathState, glossy_bounce: u32, ALWAYS),
    state_field!(path: PathState, transmission_bounce: u32, ALWAYS),
    state_field!(path: PathState, volume_bounce: u32, VOLUME),
    state_field!(path: PathState, transparent_bounce: u32, ALWAYS),
    state_field!(path: PathState, queued_kernel: u32, ALWAYS),
    state_field!(path: PathState, rng_hash: u32, ALWAYS),
    state_field!(path: PathState, rng_offset: u32, ALWAYS),
    state_field!(path: PathState, flag: u32, ALWAYS),
    state_field!(path: PathState, mis_ray_pdf: f32, ALWAYS),
    state_field!(path: PathState, mis_ray_t: f32, ALWAYS),
    state_field!(path: PathState, min_ray_pdf: f32, ALWAYS),
    state_field!(path: PathState, throughput: [f32; 3], ALWAYS),
    state_field!(path: PathState, diffuse_glossy_ratio: [f32; 3], DENOISING),
    state_field!(path: PathState, denoising_feature_throughput: [f32; 3], DENOISING),
    state_field!(ray: RayState, p: [f32; 3], ALWAYS),
    state_field!(ray: RayState, d: [f32; 3], ALWAYS),
    state_field!(ray: RayState, t: f32, ALWAYS),
    state_field!(ray: RayState, time: f32, ALWAYS),
    state_field!(ray: RayState, dp: f32, ALWAYS),
    state_field!(ray: RayState, dd: f32, ALWAYS),
    state_field!(isect: Intersection, t: f32, ALWAYS),
    state_field!(isect: Intersection, u: f32, ALWAYS),
    state_field!(isect: Intersection, v: f32, ALWAYS),
    state_field!(isect: Intersection, prim: i32, ALWAYS),
    state_field!(isect: Intersection, object: i32, ALWAYS),
    state_field!(isect: Intersection, kind: i32, ALWAYS),
    state_field!(isect: Intersection, ng: [f32; 3], NG),
    state_field!(subsurface: SubsurfaceState, albedo: [f32; 3], SUBSURFACE),
    state_field!(subsurface: SubsurfaceState, radius: [f32; 3], SUBSURFACE),
    state_field!(subsurface: SubsurfaceState, roughness: f32, SUBSURFACE),
    state_field!(volume_stack[VSS]: VolumeStackEntry, object: i32, VOLUME),
    state_field!(volume_stack[VSS]: VolumeStackEntry, shader: i32, VOLUME),
    state_field!(shadow_path: ShadowPathState, render_pixel_index: u32, ALWAYS),
    state_field!(shadow_path: ShadowPathState, sample: u32, ALWAYS),
    state_field!(shadow_path: ShadowPathState, bounce: u32, ALWAYS),
    state_field!(shadow_path: ShadowPathState, transparent_bounce: u32, ALWAYS),
    state_field!(shadow_path: ShadowPathState, queued_kernel: u32, ALWAYS),
    state_field!(shadow_path: ShadowPathState, flag: u32, ALWAYS),
    state_field!(shadow_path: ShadowPathState, num_hits: u32, ALWAYS),
    state_field!(shadow_path: ShadowPathState, throughput: [f32; 3], ALWAYS),
    state_field!(shadow_path: ShadowPathState, diffuse_glossy_ratio: [f32; 3], DENOISING),
    state_field!(shadow_ray: ShadowRayState, p: [f32; 3], ALWAYS),
    state_field!(shadow_ray: ShadowRayState, d: [f32; 3], ALWAYS),
    state_field!(shadow_ray: ShadowRayState, t: f32, ALWAYS),
    state_field!(shadow_ray: ShadowRayState, time: f32, ALWAYS),
    state_field!(shadow_isect[SIS]: Intersection, t: f32, ALWAYS),
    state_field!(shadow_isect[SIS]: Intersection, u: f32, ALWAYS),
    state_field!(shadow_isect[SIS]: Intersection, v: f32, ALWAYS),
    state_field!(shadow_isect[SIS]: Intersection, prim: i32, ALWAYS),
    state_field!(shadow_isect[SIS]: Intersection, object: i32, ALWAYS),
    state_field!(shadow_isect[SIS]: Intersection, kind: i32, ALWAYS),
    state_field!(shadow_isect[SIS]: Intersection, ng: [f32; 3], NG),
    state_field!(shadow_volume_stack[VSS]: VolumeStackEntry, object: i32, VOLUME),
    state_field!(shadow_volume_stack[VSS]: VolumeStackEntry, shader: i32, VOLUME),
];

/// Index of a schema entry by its name, e.g. `"path.queued_kernel"` or `"volume_stack[].object"`.
pub fn field_index(name: &str) -> Option<usize> {
    STATE_FIELDS.iter().position(|field| field.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_covers_every_word_once() {
        let total_words = size_of::<IntegratorState>() / 4;
        let mut covered = vec![0u32; total_words];
        for field in STATE_FIELDS {
            for element in 0..field.array_size {
                let start = field.element_offset(element);
                for word in &mut covered[start..start + field.words] {
                    *word += 1;
                }
            }
        }
        assert!(covered.iter().all(|count| *count == 1), "{covered:?}");
    }

    #[test]
    fn test_field_lookup() {
        let index = field_index("path.queued_kernel").unwrap();
        assert_eq!(STATE_FIELDS[index].words, 1);
        let stack = &STATE_FIELDS[field_index("volume_stack[].shader").unwrap()];
        assert_eq!(stack.array_size, INTEGRATOR_VOLUME_STACK_SIZE);
        assert_eq!(stack.array_stride, 2);
        assert!(field_index("path.nonexistent").is_none());
    }

    #[test]
    fn test_feature_gating() {
        let ng = &STATE_FIELDS[field_index("isect.ng").unwrap()];
        assert!(!ng.is_enabled(KernelFeatures::NONE));
        assert!(ng.is_enabled(KernelFeatures::GEOMETRIC_NORMAL | KernelFeatures::VOLUME));
        let tag = &STATE_FIELDS[field_index("path.queued_kernel").unwrap()];
        assert!(tag.is_enabled(KernelFeatures::NONE));
    }
}
