// src/path_tracing/wavefront/queues.rs
// Queue counters, launch geometry and the in-order command stream of a wavefront device
// Counters live "on the device" as atomics; the host reads a mirror refreshed at synchronize()

use std::sync::atomic::{AtomicU32, Ordering};

use crate::path_tracing::kernel::{CompactionKind, DeviceKernel, IntegratorStage};
use crate::path_tracing::work_tile::KernelWorkTile;

/// Per-stage number of queued paths, updated by kernels as they retag paths.
#[derive(Debug, Default)]
pub struct IntegratorQueueCounter {
    num_queued: [AtomicU32; IntegratorStage::NUM],
}

impl IntegratorQueueCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, stage: IntegratorStage) {
        self.num_queued[stage.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement(&self, stage: IntegratorStage) {
        let previous = self.num_queued[stage.index()].fetch_sub(1, Ordering::Relaxed);
        debug_assert!(previous > 0, "queue counter underflow for {stage:?}");
    }

    /// Count the tags of a path that appeared without going through init.
    pub fn count_tags(&self, path_tag: u32, shadow_tag: u32) {
        for tag in [path_tag, shadow_tag] {
            if let Some(stage) = IntegratorStage::from_flag(tag) {
                self.increment(stage);
            }
        }
    }

    pub fn get(&self, stage: IntegratorStage) -> u32 {
        self.num_queued[stage.index()].load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u32 {
        self.num_queued.iter().map(|c| c.load(Ordering::Relaxed)).sum()
    }

    pub fn zero(&self) {
        for counter in &self.num_queued {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> IntegratorQueueCounterHost {
        IntegratorQueueCounterHost {
            num_queued: std::array::from_fn(|i| self.num_queued[i].load(Ordering::Relaxed)),
        }
    }
}

/// Host-side copy of the queue counters.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct IntegratorQueueCounterHost {
    pub num_queued: [u32; IntegratorStage::NUM],
}

impl IntegratorQueueCounterHost {
    pub fn get(&self, stage: IntegratorStage) -> u32 {
        self.num_queued[stage.index()]
    }

    pub fn total(&self) -> u32 {
        self.num_queued.iter().sum()
    }

    /// Stage with the most queued paths; ties go to the earlier stage.
    pub fn max_queued(&self) -> Option<(IntegratorStage, u32)> {
        IntegratorStage::ALL
            .iter()
            .map(|stage| (*stage, self.get(*stage)))
            .filter(|(_, count)| *count > 0)
            .fold(None, |best, (stage, count)| match best {
                Some((_, best_count)) if best_count >= count => best,
                _ => Some((stage, count)),
            })
    }
}

/// Grid dimensions of a kernel launch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LaunchGeometry {
    pub num_blocks: usize,
    pub threads_per_block: usize,
}

impl LaunchGeometry {
    pub fn new(work_size: usize, threads_per_block: usize) -> Self {
        Self {
            num_blocks: work_size.div_ceil(threads_per_block),
            threads_per_block,
        }
    }

    pub fn num_threads(&self) -> usize {
        self.num_blocks * self.threads_per_block
    }
}

/// Work recorded on the stream, executed in order at the next synchronize.
#[derive(Clone, Copy, Debug)]
pub(crate) enum StreamCommand {
    /// Fill the queued-paths array for `flag` (or free slots) over `[0, work_size)`.
    ComputeQueuedPaths {
        kind: CompactionKind,
        flag: u32,
        work_size: usize,
    },
    /// Run a stage kernel over `work_size` items, indirected through the
    /// queued-paths array when `use_path_index` is set.
    Launch {
        kernel: DeviceKernel,
        work_size: usize,
        use_path_index: bool,
        geometry: LaunchGeometry,
    },
    /// Seed the paths of one tile. Slot of item i is `path_index[path_index_offset + i]`
    /// when reusing terminated slots, `path_index_offset + i` otherwise.
    InitFromTile {
        kernel: DeviceKernel,
        tile: KernelWorkTile,
        path_index_offset: usize,
        use_path_index: bool,
        geometry: LaunchGeometry,
    },
}

#[derive(Debug, Default)]
pub(crate) struct DeviceStream {
    pending: Vec<StreamCommand>,
}

impl DeviceStream {
    pub fn push(&mut self, command: StreamCommand) {
        self.pending.push(command);
    }

    pub fn take(&mut self) -> Vec<StreamCommand> {
        std::mem::take(&mut self.pending)
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_geometry_rounds_up() {
        let geometry = LaunchGeometry::new(1000, 256);
        assert_eq!(geometry.num_blocks, 4);
        assert_eq!(geometry.num_threads(), 1024);
        assert_eq!(LaunchGeometry::new(0, 256).num_blocks, 0);
        assert_eq!(LaunchGeometry::new(256, 256).num_blocks, 1);
    }

    #[test]
    fn test_counter_snapshot() {
        let counter = IntegratorQueueCounter::new();
        counter.increment(IntegratorStage::ShadeSurface);
        counter.increment(IntegratorStage::ShadeSurface);
        counter.increment(IntegratorStage::IntersectShadow);
        let host = counter.snapshot();
        assert_eq!(host.total(), 3);
        assert_eq!(host.max_queued(), Some((IntegratorStage::ShadeSurface, 2)));

        counter.zero();
        assert_eq!(counter.snapshot().max_queued(), None);
    }

    #[test]
    fn test_max_queued_prefers_earlier_stage_on_tie() {
        let mut host = IntegratorQueueCounterHost::default();
        host.num_queued[IntegratorStage::ShadeBackground.index()] = 5;
        host.num_queued[IntegratorStage::IntersectClosest.index()] = 5;
        assert_eq!(host.max_queued(), Some((IntegratorStage::IntersectClosest, 5)));
    }
}
