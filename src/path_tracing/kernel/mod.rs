// src/path_tracing/kernel/mod.rs
// Device kernel ids, integrator stages and the stage dispatch table
// RELEVANT FILES:src/path_tracing/kernel/functions.rs,src/path_tracing/wavefront/mod.rs

pub mod functions;
pub mod globals;
pub mod megakernel;
pub mod reference;

pub use functions::{KernelArch, KernelFunctions, KernelRegistry};
pub use globals::{KernelData, KernelGlobals, KernelIntegrator};
pub use megakernel::integrator_megakernel;

use serde::{Deserialize, Serialize};

/// Pipeline stages a path can be queued for. Each has its own queue counter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IntegratorStage {
    IntersectClosest = 0,
    IntersectShadow,
    IntersectSubsurface,
    IntersectVolumeStack,
    ShadeBackground,
    ShadeLight,
    ShadeShadow,
    ShadeSurface,
    ShadeVolume,
}

impl IntegratorStage {
    pub const NUM: usize = 9;

    pub const ALL: [IntegratorStage; Self::NUM] = [
        IntegratorStage::IntersectClosest,
        IntegratorStage::IntersectShadow,
        IntegratorStage::IntersectSubsurface,
        IntegratorStage::IntersectVolumeStack,
        IntegratorStage::ShadeBackground,
        IntegratorStage::ShadeLight,
        IntegratorStage::ShadeShadow,
        IntegratorStage::ShadeSurface,
        IntegratorStage::ShadeVolume,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }

    /// Tag stored in `queued_kernel` while a path waits for this stage.
    pub const fn flag(self) -> u32 {
        1 << (self as u32)
    }

    pub fn from_flag(flag: u32) -> Option<Self> {
        if flag == 0 {
            return None;
        }
        debug_assert!(flag.is_power_of_two(), "path queued for several stages: {flag:#x}");
        Self::ALL.get(flag.trailing_zeros() as usize).copied()
    }

    /// Stages that operate on the shadow sub-path.
    pub const fn is_shadow(self) -> bool {
        matches!(self, IntegratorStage::IntersectShadow | IntegratorStage::ShadeShadow)
    }

    pub const fn device_kernel(self) -> DeviceKernel {
        match self {
            IntegratorStage::IntersectClosest => DeviceKernel::IntegratorIntersectClosest,
            IntegratorStage::IntersectShadow => DeviceKernel::IntegratorIntersectShadow,
            IntegratorStage::IntersectSubsurface => DeviceKernel::IntegratorIntersectSubsurface,
            IntegratorStage::IntersectVolumeStack => DeviceKernel::IntegratorIntersectVolumeStack,
            IntegratorStage::ShadeBackground => DeviceKernel::IntegratorShadeBackground,
            IntegratorStage::ShadeLight => DeviceKernel::IntegratorShadeLight,
            IntegratorStage::ShadeShadow => DeviceKernel::IntegratorShadeShadow,
            IntegratorStage::ShadeSurface => DeviceKernel::IntegratorShadeSurface,
            IntegratorStage::ShadeVolume => DeviceKernel::IntegratorShadeVolume,
        }
    }
}

/// Kernels a device can launch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeviceKernel {
    IntegratorInitFromCamera = 0,
    IntegratorInitFromBake,
    IntegratorIntersectClosest,
    IntegratorIntersectShadow,
    IntegratorIntersectSubsurface,
    IntegratorIntersectVolumeStack,
    IntegratorShadeBackground,
    IntegratorShadeLight,
    IntegratorShadeShadow,
    IntegratorShadeSurface,
    IntegratorShadeVolume,
    IntegratorMegakernel,
    IntegratorQueuedPathsArray,
    IntegratorQueuedShadowPathsArray,
    IntegratorTerminatedPathsArray,
}

/// Predicate of a compaction pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompactionKind {
    /// Slots whose path tag matches the stage flag
    QueuedPaths,
    /// Slots whose shadow tag matches the stage flag
    QueuedShadowPaths,
    /// Slots with neither tag set
    TerminatedPaths,
}

/// How a kernel id is launched.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelDispatch {
    /// `(state, queue, path_index, work_size)`
    Intersect(IntegratorStage),
    /// Intersect arguments plus the render buffer
    Shade(IntegratorStage),
    /// Shade arguments, counted against the intersect-closest queue
    Megakernel,
    /// Seeds paths from work tiles, launched by `enqueue_work_tiles`
    Init,
    /// Helper pass producing an index array, launched by the queue itself
    Compaction(CompactionKind),
}

impl DeviceKernel {
    pub const NUM: usize = 15;

    pub const ALL: [DeviceKernel; Self::NUM] = [
        DeviceKernel::IntegratorInitFromCamera,
        DeviceKernel::IntegratorInitFromBake,
        DeviceKernel::IntegratorIntersectClosest,
        DeviceKernel::IntegratorIntersectShadow,
        DeviceKernel::IntegratorIntersectSubsurface,
        DeviceKernel::IntegratorIntersectVolumeStack,
        DeviceKernel::IntegratorShadeBackground,
        DeviceKernel::IntegratorShadeLight,
        DeviceKernel::IntegratorShadeShadow,
        DeviceKernel::IntegratorShadeSurface,
        DeviceKernel::IntegratorShadeVolume,
        DeviceKernel::IntegratorMegakernel,
        DeviceKernel::IntegratorQueuedPathsArray,
        DeviceKernel::IntegratorQueuedShadowPathsArray,
        DeviceKernel::IntegratorTerminatedPathsArray,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn dispatch(self) -> KernelDispatch {
        use IntegratorStage as S;
        match self {
            DeviceKernel::IntegratorInitFromCamera | DeviceKernel::IntegratorInitFromBake => {
                KernelDispatch::Init
            }
            DeviceKernel::IntegratorIntersectClosest => KernelDispatch::Intersect(S::IntersectClosest),
            DeviceKernel::IntegratorIntersectShadow => KernelDispatch::Intersect(S::IntersectShadow),
            DeviceKernel::IntegratorIntersectSubsurface => {
                KernelDispatch::Intersect(S::IntersectSubsurface)
            }
            DeviceKernel::IntegratorIntersectVolumeStack => {
                KernelDispatch::Intersect(S::IntersectVolumeStack)
            }
            DeviceKernel::IntegratorShadeBackground => KernelDispatch::Shade(S::ShadeBackground),
            DeviceKernel::IntegratorShadeLight => KernelDispatch::Shade(S::ShadeLight),
            DeviceKernel::IntegratorShadeShadow => KernelDispatch::Shade(S::ShadeShadow),
            DeviceKernel::IntegratorShadeSurface => KernelDispatch::Shade(S::ShadeSurface),
            DeviceKernel::IntegratorShadeVolume => KernelDispatch::Shade(S::ShadeVolume),
            DeviceKernel::IntegratorMegakernel => KernelDispatch::Megakernel,
            DeviceKernel::IntegratorQueuedPathsArray => {
                KernelDispatch::Compaction(CompactionKind::QueuedPaths)
            }
            DeviceKernel::IntegratorQueuedShadowPathsArray => {
                KernelDispatch::Compaction(CompactionKind::QueuedShadowPaths)
            }
            DeviceKernel::IntegratorTerminatedPathsArray => {
                KernelDispatch::Compaction(CompactionKind::TerminatedPaths)
            }
        }
    }

    /// Queue whose counter decides whether the kernel has work. `None` for the
    /// megakernel, which runs every live path whatever stage it is queued for,
    /// and for kernels that are not path stages.
    pub const fn integrator_stage(self) -> Option<IntegratorStage> {
        match self.dispatch() {
            KernelDispatch::Intersect(stage) | KernelDispatch::Shade(stage) => Some(stage),
            KernelDispatch::Megakernel | KernelDispatch::Init | KernelDispatch::Compaction(_) => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            DeviceKernel::IntegratorInitFromCamera => "integrator_init_from_camera",
            DeviceKernel::IntegratorInitFromBake => "integrator_init_from_bake",
            DeviceKernel::IntegratorIntersectClosest => "integrator_intersect_closest",
            DeviceKernel::IntegratorIntersectShadow => "integrator_intersect_shadow",
            DeviceKernel::IntegratorIntersectSubsurface => "integrator_intersect_subsurface",
            DeviceKernel::IntegratorIntersectVolumeStack => "integrator_intersect_volume_stack",
            DeviceKernel::IntegratorShadeBackground => "integrator_shade_background",
            DeviceKernel::IntegratorShadeLight => "integrator_shade_light",
            DeviceKernel::IntegratorShadeShadow => "integrator_shade_shadow",
            DeviceKernel::IntegratorShadeSurface => "integrator_shade_surface",
            DeviceKernel::IntegratorShadeVolume => "integrator_shade_volume",
            DeviceKernel::IntegratorMegakernel => "integrator_megakernel",
            DeviceKernel::IntegratorQueuedPathsArray => "integrator_queued_paths_array",
            DeviceKernel::IntegratorQueuedShadowPathsArray => "integrator_queued_shadow_paths_array",
            DeviceKernel::IntegratorTerminatedPathsArray => "integrator_terminated_paths_array",
        }
    }
}

impl std::fmt::Display for DeviceKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
