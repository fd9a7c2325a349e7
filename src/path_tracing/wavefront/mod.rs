// src/path_tracing/wavefront/mod.rs
// Wavefront device queue: compacts the slots queued for a stage and launches the stage over them
// Launches are recorded on an in-order stream and executed at synchronize()
// RELEVANT FILES:src/path_tracing/wavefront/queues.rs,src/path_tracing/wavefront/compact.rs,src/path_tracing/work/wavefront.rs

pub mod compact;
#[cfg(feature = "gpu")]
pub mod gpu_compact;
pub mod queues;

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use log::{debug, trace, warn};

use crate::config::CompactionBackend;
use crate::device::Device;
use crate::error::RenderResult;
use crate::path_tracing::buffers::RenderBuffers;
use crate::path_tracing::kernel::{
    CompactionKind, DeviceKernel, IntegratorStage, KernelData, KernelDispatch, KernelFunctions,
    KernelGlobals,
};
use crate::path_tracing::state::{IntegratorState, PathQueue, PathStatePool};
use crate::path_tracing::work_tile::KernelWorkTile;

pub use compact::{create_compactor, slot_matches, HostCompactor, PathCompactor};
pub use queues::{IntegratorQueueCounter, IntegratorQueueCounterHost, LaunchGeometry};
use queues::{DeviceStream, StreamCommand};

/// Launches of one kernel since the queue was created.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LaunchStats {
    pub num_launches: u64,
    pub num_work_items: u64,
    pub num_blocks: u64,
}

/// Owns the path-state pool of one device and schedules stage kernels over it.
pub struct IntegratorQueue {
    device: Arc<Device>,
    kg: KernelGlobals,
    render_buffers: Arc<RenderBuffers>,
    state: PathStatePool,
    /// Device-side counters, updated by kernels
    counter: IntegratorQueueCounter,
    /// Host mirror, refreshed at synchronize
    counter_host: IntegratorQueueCounterHost,
    /// Dense slot indices produced by the last compaction
    queued_paths: Vec<u32>,
    num_queued_paths: usize,
    compactor: Box<dyn PathCompactor>,
    /// One past the highest slot that may hold a live path
    max_active_path_index: usize,
    threads_per_block: usize,
    stream: DeviceStream,
    launch_stats: [LaunchStats; DeviceKernel::NUM],
}

impl IntegratorQueue {
    pub fn new(
        device: Arc<Device>,
        kernels: KernelFunctions,
        data: Arc<KernelData>,
        render_buffers: Arc<RenderBuffers>,
        compaction: CompactionBackend,
    ) -> RenderResult<Self> {
        let capacity = device.info.max_num_paths;
        let threads_per_block = device.info.threads_per_block.max(1);
        let state = PathStatePool::allocate(capacity, data.features);
        let compactor = create_compactor(compaction)?;

        debug!(
            "{}: integrator queue with {} path slots, {} threads per block, {} compaction",
            device.info.id,
            capacity,
            threads_per_block,
            compactor.name()
        );

        Ok(Self {
            kg: KernelGlobals::new(data, kernels, 0, true),
            device,
            render_buffers,
            state,
            counter: IntegratorQueueCounter::new(),
            counter_host: IntegratorQueueCounterHost::default(),
            queued_paths: Vec::with_capacity(capacity),
            num_queued_paths: 0,
            compactor,
            max_active_path_index: 0,
            threads_per_block,
            stream: DeviceStream::default(),
            launch_stats: [LaunchStats::default(); DeviceKernel::NUM],
        })
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn max_num_paths(&self) -> usize {
        self.state.capacity()
    }

    pub fn max_active_path_index(&self) -> usize {
        self.max_active_path_index
    }

    pub fn threads_per_block(&self) -> usize {
        self.threads_per_block
    }

    pub fn render_buffers(&self) -> &Arc<RenderBuffers> {
        &self.render_buffers
    }

    pub fn set_render_buffers(&mut self, render_buffers: Arc<RenderBuffers>) {
        self.synchronize();
        self.render_buffers = render_buffers;
    }

    /// Clear every slot and counter. Used before the first pass on new buffers.
    pub fn init_execution(&mut self) {
        self.stream.clear();
        self.state.zero();
        self.counter.zero();
        self.counter_host = IntegratorQueueCounterHost::default();
        self.queued_paths.clear();
        self.num_queued_paths = 0;
        self.max_active_path_index = 0;
    }

    /// Execute everything recorded on the stream and refresh the host counters.
    /// Returns false when the device is in an error state.
    pub fn synchronize(&mut self) -> bool {
        if self.device.have_error() {
            self.stream.clear();
            return false;
        }

        let commands = self.stream.take();
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            for command in commands {
                self.execute(command);
                if self.device.have_error() {
                    break;
                }
            }
        }));
        if let Err(payload) = result {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            self.device.set_error(format!("Kernel execution failed: {message}"));
        }

        self.counter_host = self.counter.snapshot();
        !self.device.have_error()
    }

    /// Host copy of the per-stage counters as of the last synchronize.
    pub fn queued_counts(&self) -> &IntegratorQueueCounterHost {
        &self.counter_host
    }

    pub fn num_queued(&self, stage: IntegratorStage) -> usize {
        self.counter_host.get(stage) as usize
    }

    /// Compact the slots queued for `stage` (or the free slots, for the
    /// terminated-paths kernel) and wait for the count.
    pub fn compute_queued_paths(&mut self, kernel: DeviceKernel, stage: IntegratorStage) -> usize {
        if self.device.have_error() {
            return 0;
        }
        let KernelDispatch::Compaction(kind) = kernel.dispatch() else {
            warn!("{kernel} is not a compaction kernel");
            return 0;
        };
        let work_size = match kind {
            CompactionKind::TerminatedPaths => self.state.capacity(),
            _ => self.max_active_path_index,
        };
        self.record_compaction(kind, stage.flag(), work_size);
        self.synchronize();
        self.num_queued_paths
    }

    /// Slot indices written by the last compaction.
    pub fn queued_paths(&self) -> &[u32] {
        &self.queued_paths[..self.num_queued_paths.min(self.queued_paths.len())]
    }

    fn record_compaction(&mut self, kind: CompactionKind, flag: u32, work_size: usize) {
        let kernel = match kind {
            CompactionKind::QueuedPaths => DeviceKernel::IntegratorQueuedPathsArray,
            CompactionKind::QueuedShadowPaths => DeviceKernel::IntegratorQueuedShadowPathsArray,
            CompactionKind::TerminatedPaths => DeviceKernel::IntegratorTerminatedPathsArray,
        };
        self.count_launch(kernel, work_size);
        self.stream.push(StreamCommand::ComputeQueuedPaths {
            kind,
            flag,
            work_size,
        });
    }

    fn count_launch(&mut self, kernel: DeviceKernel, work_size: usize) -> LaunchGeometry {
        let geometry = LaunchGeometry::new(work_size, self.threads_per_block);
        let stats = &mut self.launch_stats[kernel.index()];
        stats.num_launches += 1;
        stats.num_work_items += work_size as u64;
        stats.num_blocks += geometry.num_blocks as u64;
        geometry
    }

    /// Launch a stage kernel over the paths queued for it. No-op when nothing
    /// is queued or the device has failed.
    pub fn enqueue(&mut self, kernel: DeviceKernel) {
        if self.device.have_error() {
            return;
        }
        if matches!(kernel.dispatch(), KernelDispatch::Init | KernelDispatch::Compaction(_)) {
            warn!("{kernel} cannot be enqueued as a path stage");
            return;
        }
        // None: the megakernel, which covers every live path.
        let stage = kernel.integrator_stage();

        // Counts must include the effect of everything already submitted.
        if !self.stream.is_idle() && !self.synchronize() {
            return;
        }

        let num_queued = match stage {
            Some(stage) => self.counter_host.get(stage) as usize,
            None => self.counter_host.total() as usize,
        };
        if num_queued == 0 {
            trace!("{kernel}: nothing queued");
            return;
        }

        let (work_size, use_path_index) = match stage {
            Some(stage) if num_queued < self.max_active_path_index => {
                let kind = if stage.is_shadow() {
                    CompactionKind::QueuedShadowPaths
                } else {
                    CompactionKind::QueuedPaths
                };
                self.record_compaction(kind, stage.flag(), self.max_active_path_index);
                (num_queued, true)
            }
            _ => (self.max_active_path_index, false),
        };

        debug_assert!(
            work_size <= self.state.capacity(),
            "{kernel}: work size {work_size} exceeds {} path slots",
            self.state.capacity()
        );

        let geometry = self.count_launch(kernel, work_size);
        trace!(
            "{kernel}: {work_size} paths, {} blocks, compacted={use_path_index}",
            geometry.num_blocks
        );
        self.stream.push(StreamCommand::Launch {
            kernel,
            work_size,
            use_path_index,
            geometry,
        });
    }

    /// Seed paths from work tiles, reusing terminated slots when the pool is in use.
    pub fn enqueue_work_tiles(&mut self, kernel: DeviceKernel, tiles: &[KernelWorkTile]) {
        if self.device.have_error() || tiles.is_empty() {
            return;
        }
        if kernel.dispatch() != KernelDispatch::Init {
            warn!("{kernel} cannot seed work tiles");
            return;
        }

        let use_path_index = self.max_active_path_index != 0;
        let mut path_index_offset = if use_path_index {
            self.record_compaction(CompactionKind::TerminatedPaths, 0, self.state.capacity());
            0
        } else {
            self.max_active_path_index
        };

        let mut num_paths = 0;
        for tile in tiles {
            let work_size = tile.work_size();
            let geometry = self.count_launch(kernel, work_size);
            self.stream.push(StreamCommand::InitFromTile {
                kernel,
                tile: *tile,
                path_index_offset,
                use_path_index,
                geometry,
            });
            path_index_offset += work_size;
            num_paths += work_size;
        }

        debug_assert!(
            num_paths <= self.state.capacity(),
            "seeding {num_paths} paths into {} slots",
            self.state.capacity()
        );
        self.max_active_path_index = (self.max_active_path_index + num_paths).min(self.state.capacity());
        trace!(
            "{kernel}: {} tiles, {num_paths} paths, high-water mark {}",
            tiles.len(),
            self.max_active_path_index
        );
    }

    /// Wait for the device and count live paths. An idle pool restarts at slot 0.
    pub fn get_num_active_paths(&mut self) -> usize {
        if !self.synchronize() {
            return 0;
        }
        let num_active = self.counter_host.total() as usize;
        if num_active == 0 {
            self.max_active_path_index = 0;
        }
        num_active
    }

    pub fn launch_stats(&self, kernel: DeviceKernel) -> LaunchStats {
        self.launch_stats[kernel.index()]
    }

    pub fn num_launches(&self, kernel: DeviceKernel) -> u64 {
        self.launch_stats[kernel.index()].num_launches
    }

    /// Device-resident pool; read it after a synchronize.
    pub fn state_pool(&self) -> &PathStatePool {
        &self.state
    }

    /// Mirror the device pool into a host pool.
    pub fn copy_state_to_host(&mut self, host: &mut PathStatePool) {
        self.synchronize();
        self.state.copy_to(host);
    }

    /// Upload a host pool and recount the queue tags it carries.
    ///
    /// This is the only place counters are rebuilt by scanning the pool: the
    /// upload replaces the whole device store, so the counters kept by the
    /// kernels no longer describe it. Everywhere else they change only through
    /// `PathQueue` transitions.
    pub fn copy_state_from_host(&mut self, host: &PathStatePool) {
        self.synchronize();
        host.copy_to(&mut self.state);
        self.counter.zero();
        let mut max_active = 0;
        for (slot, (path_tag, shadow_tag)) in self
            .state
            .path_tags()
            .iter()
            .zip(self.state.shadow_tags())
            .enumerate()
        {
            if *path_tag != 0 || *shadow_tag != 0 {
                self.counter.count_tags(*path_tag, *shadow_tag);
                max_active = slot + 1;
            }
        }
        self.max_active_path_index = max_active;
        self.counter_host = self.counter.snapshot();
    }

    fn execute(&mut self, command: StreamCommand) {
        match command {
            StreamCommand::ComputeQueuedPaths {
                kind,
                flag,
                work_size,
            } => {
                let result = self.compactor.compact(
                    kind,
                    flag,
                    self.state.path_tags(),
                    self.state.shadow_tags(),
                    work_size,
                    self.threads_per_block,
                    &mut self.queued_paths,
                );
                match result {
                    Ok(count) => self.num_queued_paths = count,
                    Err(e) => {
                        self.num_queued_paths = 0;
                        self.device.set_error(e.to_string());
                    }
                }
            }
            StreamCommand::Launch {
                kernel,
                work_size,
                use_path_index,
                ..
            } => self.execute_launch(kernel, work_size, use_path_index),
            StreamCommand::InitFromTile {
                kernel,
                tile,
                path_index_offset,
                use_path_index,
                ..
            } => self.execute_init(kernel, &tile, path_index_offset, use_path_index),
        }
    }

    fn execute_launch(&mut self, kernel: DeviceKernel, work_size: usize, use_path_index: bool) {
        let queue = PathQueue::device(&self.counter);
        let kg = &self.kg;
        let render_buffers = self.render_buffers.as_ref();

        for work_index in 0..work_size {
            let slot = if use_path_index {
                match self.queued_paths.get(work_index) {
                    Some(slot) => *slot as usize,
                    None => break,
                }
            } else {
                work_index
            };

            let mut state = self.state.load(slot);
            match kernel.dispatch() {
                KernelDispatch::Intersect(stage) | KernelDispatch::Shade(stage) => {
                    let tag = if stage.is_shadow() {
                        state.shadow_path.queued_kernel
                    } else {
                        state.path.queued_kernel
                    };
                    if tag != stage.flag() {
                        continue;
                    }
                    kg.kernels.run_stage(stage, kg, &mut state, &queue, render_buffers);
                }
                KernelDispatch::Megakernel => {
                    if state.is_terminated() {
                        continue;
                    }
                    (kg.kernels.integrator_megakernel)(kg, &mut state, &queue, render_buffers);
                }
                KernelDispatch::Init | KernelDispatch::Compaction(_) => return,
            }
            self.state.store(slot, &state);
        }
    }

    fn execute_init(
        &mut self,
        kernel: DeviceKernel,
        tile: &KernelWorkTile,
        path_index_offset: usize,
        use_path_index: bool,
    ) {
        let queue = PathQueue::device(&self.counter);
        let kg = &self.kg;
        let render_buffers = self.render_buffers.as_ref();
        let init = match kernel {
            DeviceKernel::IntegratorInitFromBake => kg.kernels.integrator_init_from_bake,
            _ => kg.kernels.init_function(kg.integrator().use_baking),
        };

        for work_index in 0..tile.work_size() {
            let index = path_index_offset + work_index;
            let slot = if use_path_index {
                match self.queued_paths.get(index) {
                    Some(slot) if index < self.num_queued_paths => *slot as usize,
                    _ => {
                        self.device.set_error(format!(
                            "{kernel}: no free path slot for work item {index}"
                        ));
                        return;
                    }
                }
            } else {
                index
            };

            if slot >= self.state.capacity() || !self.state.is_slot_free(slot) {
                self.device
                    .set_error(format!("{kernel}: path slot {slot} is not free"));
                return;
            }

            let mut state = IntegratorState::new();
            if init(kg, &mut state, &queue, tile, work_index as u32, render_buffers) {
                self.state.store(slot, &state);
            }
        }
    }
}

impl std::fmt::Debug for IntegratorQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntegratorQueue")
            .field("device", &self.device.info.id)
            .field("capacity", &self.state.capacity())
            .field("max_active_path_index", &self.max_active_path_index)
            .field("queued", &self.counter_host)
            .field("compactor", &self.compactor.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IntegratorConfig;
    use crate::device::DeviceInfo;
    use crate::path_tracing::buffers::BufferParams;
    use crate::path_tracing::film::KernelFilm;
    use crate::path_tracing::kernel::reference;

    fn queue_with_capacity(capacity: usize) -> IntegratorQueue {
        let config = IntegratorConfig {
            max_num_paths: capacity,
            threads_per_block: 4,
            ..Default::default()
        };
        let film = KernelFilm::default();
        let data = Arc::new(KernelData::new(film, &config));
        let buffers = Arc::new(RenderBuffers::new(BufferParams::new(4, 4, film.pass_stride)));
        let device = Device::new(DeviceInfo::wavefront("test", &config));
        IntegratorQueue::new(
            device,
            reference::kernel_functions(),
            data,
            buffers,
            CompactionBackend::Host,
        )
        .unwrap()
    }

    fn tile(w: u32, h: u32, num_samples: u32) -> KernelWorkTile {
        KernelWorkTile {
            x: 0,
            y: 0,
            w,
            h,
            start_sample: 0,
            num_samples,
            offset: 0,
            stride: 4,
        }
    }

    #[test]
    fn test_enqueue_with_nothing_queued_launches_nothing() {
        let mut queue = queue_with_capacity(16);
        queue.enqueue(DeviceKernel::IntegratorIntersectClosest);
        queue.synchronize();
        assert_eq!(queue.num_launches(DeviceKernel::IntegratorIntersectClosest), 0);
    }

    #[test]
    fn test_seeding_advances_high_water_mark() {
        let mut queue = queue_with_capacity(64);
        queue.enqueue_work_tiles(DeviceKernel::IntegratorInitFromCamera, &[tile(2, 2, 2)]);
        assert_eq!(queue.max_active_path_index(), 8);
        assert_eq!(queue.get_num_active_paths(), 8);
        assert_eq!(queue.num_queued(IntegratorStage::IntersectClosest), 8);
    }

    #[test]
    fn test_init_kernels_are_not_stages() {
        let mut queue = queue_with_capacity(16);
        queue.enqueue(DeviceKernel::IntegratorInitFromCamera);
        queue.enqueue(DeviceKernel::IntegratorTerminatedPathsArray);
        queue.synchronize();
        assert_eq!(queue.num_launches(DeviceKernel::IntegratorInitFromCamera), 0);
        assert!(!queue.device().have_error());
    }

    #[test]
    fn test_compute_queued_paths_matches_scan() {
        let mut queue = queue_with_capacity(32);
        queue.enqueue_work_tiles(DeviceKernel::IntegratorInitFromCamera, &[tile(4, 4, 1)]);
        queue.enqueue(DeviceKernel::IntegratorIntersectClosest);
        queue.synchronize();

        let stage = IntegratorStage::ShadeSurface;
        let count = queue.compute_queued_paths(DeviceKernel::IntegratorQueuedPathsArray, stage);
        let expected: Vec<u32> = queue
            .state_pool()
            .path_tags()
            .iter()
            .enumerate()
            .filter(|(_, tag)| **tag == stage.flag())
            .map(|(slot, _)| slot as u32)
            .collect();
        assert_eq!(count, expected.len());
        assert_eq!(queue.queued_paths(), expected.as_slice());
        assert_eq!(count, queue.num_queued(stage));
    }

    #[test]
    fn test_error_state_suppresses_dispatch() {
        let mut queue = queue_with_capacity(16);
        queue.device().set_error("lost device");
        queue.enqueue_work_tiles(DeviceKernel::IntegratorInitFromCamera, &[tile(1, 1, 1)]);
        assert_eq!(queue.max_active_path_index(), 0);
        assert!(!queue.synchronize());
        assert_eq!(queue.get_num_active_paths(), 0);
    }
}
