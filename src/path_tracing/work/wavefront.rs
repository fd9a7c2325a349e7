// src/path_tracing/work/wavefront.rs
// Wavefront work: seeds tiles into the path-state pool and advances the fullest stage each step
// RELEVANT FILES:src/path_tracing/wavefront/mod.rs,src/path_tracing/work_tile.rs,src/path_tracing/work/mod.rs

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use log::{debug, trace};

use super::{
    adaptive_sampling_count_active, adaptive_sampling_filter, cryptomatte_postprocess,
    film_copy_to_display, PathTraceWork, WorkBase,
};
use crate::config::IntegratorConfig;
use crate::device::Device;
use crate::error::RenderResult;
use crate::path_tracing::buffers::{BufferParams, RenderBuffers};
use crate::path_tracing::film::PassMode;
use crate::path_tracing::kernel::functions::Half4;
use crate::path_tracing::kernel::{DeviceKernel, IntegratorStage, KernelData, KernelFunctions, KernelGlobals};
use crate::path_tracing::wavefront::IntegratorQueue;
use crate::path_tracing::work_tile::WorkTileScheduler;

pub struct PathTraceWorkWavefront {
    base: WorkBase,
    queue: IntegratorQueue,
    scheduler: WorkTileScheduler,
    /// Host-side context for display conversion and adaptive sampling
    kg: KernelGlobals,
    regenerate_threshold: f32,
    megakernel_tail_threshold: usize,
}

impl PathTraceWorkWavefront {
    pub fn new(
        device: Arc<Device>,
        kernels: KernelFunctions,
        kernel_data: Arc<KernelData>,
        cancel_requested: Arc<AtomicBool>,
        config: &IntegratorConfig,
    ) -> RenderResult<Self> {
        let base = WorkBase::new(device.clone(), &kernel_data, cancel_requested);
        let queue = IntegratorQueue::new(
            device,
            kernels,
            kernel_data.clone(),
            base.buffers.clone(),
            config.compaction,
        )?;
        let kg = KernelGlobals::new(kernel_data, kernels, 0, true);

        Ok(Self {
            base,
            queue,
            scheduler: WorkTileScheduler::new(),
            kg,
            regenerate_threshold: config.regenerate_threshold,
            megakernel_tail_threshold: config.megakernel_tail_threshold,
        })
    }

    pub fn queue(&self) -> &IntegratorQueue {
        &self.queue
    }

    fn init_kernel(&self) -> DeviceKernel {
        if self.kg.integrator().use_baking {
            DeviceKernel::IntegratorInitFromBake
        } else {
            DeviceKernel::IntegratorInitFromCamera
        }
    }

    /// Seed new tiles when the pool runs low. Returns `(seeded, finished)`;
    /// finished once no tiles are left and no path is alive.
    fn enqueue_work_tiles(&mut self) -> (bool, bool) {
        let num_active_paths = self.queue.get_num_active_paths();
        if self.base.is_cancel_requested() {
            return (false, num_active_paths == 0);
        }

        let max_num_paths = self.queue.max_num_paths();
        let mut num_paths = num_active_paths;
        let mut tiles = Vec::new();

        if num_paths == 0 || (num_paths as f32) < self.regenerate_threshold * max_num_paths as f32 {
            while num_paths < max_num_paths {
                match self.scheduler.get_work(max_num_paths - num_paths) {
                    Some(tile) => {
                        num_paths += tile.work_size();
                        tiles.push(tile);
                    }
                    None => break,
                }
            }
            if tiles.is_empty() && num_paths == 0 {
                return (false, true);
            }
        }

        if tiles.is_empty() {
            return (false, false);
        }
        self.queue.enqueue_work_tiles(self.init_kernel(), &tiles);
        (true, false)
    }

    /// Launch the stage with the most queued paths. Returns false when nothing is queued.
    fn enqueue_path_iteration(&mut self) -> bool {
        let counts = *self.queue.queued_counts();
        let Some((mut stage, num_queued)) = counts.max_queued() else {
            return false;
        };

        let num_active = counts.total() as usize;
        if num_active <= self.megakernel_tail_threshold && self.scheduler.remaining_tiles() == 0 {
            trace!("Finishing {num_active} paths with the megakernel");
            self.queue.enqueue(DeviceKernel::IntegratorMegakernel);
            return true;
        }

        // A path holds one shadow ray; finish pending ones before shading can spawn more.
        if matches!(stage, IntegratorStage::ShadeSurface | IntegratorStage::ShadeVolume) {
            if counts.get(IntegratorStage::IntersectShadow) > 0 {
                stage = IntegratorStage::IntersectShadow;
            } else if counts.get(IntegratorStage::ShadeShadow) > 0 {
                stage = IntegratorStage::ShadeShadow;
            }
        }

        trace!("Iteration {:?} ({} queued)", stage, num_queued);
        self.queue.enqueue(stage.device_kernel());
        true
    }
}

impl PathTraceWork for PathTraceWorkWavefront {
    fn device(&self) -> &Arc<Device> {
        &self.base.device
    }

    fn init_execution(&mut self) {
        self.queue.init_execution();
    }

    fn render_samples(&mut self, start_sample: usize, num_samples: usize) {
        let params = *self.base.buffers.params();
        self.queue.init_execution();
        self.scheduler
            .reset(&params, start_sample, num_samples, self.queue.max_num_paths());

        let mut num_iterations = 0usize;
        loop {
            let (seeded, finished) = self.enqueue_work_tiles();
            if seeded && !self.queue.synchronize() {
                break;
            }
            if self.base.is_cancel_requested() || finished || self.base.device.have_error() {
                break;
            }
            if self.enqueue_path_iteration() {
                num_iterations += 1;
                if !self.queue.synchronize() {
                    break;
                }
            }
        }

        debug!(
            "{}: samples {}..{} done in {} iterations",
            self.base.device.info.id,
            start_sample,
            start_sample + num_samples,
            num_iterations
        );
    }

    fn copy_to_display(
        &mut self,
        texture: &mut [Half4],
        texture_params: &BufferParams,
        scale: f32,
        pass_mode: PassMode,
    ) {
        self.queue.synchronize();
        film_copy_to_display(
            std::slice::from_ref(&self.kg),
            &self.base.buffers,
            texture,
            texture_params,
            scale,
            pass_mode,
        );
    }

    fn adaptive_sampling_converge_filter_count_active(&mut self, threshold: f32, reset: bool) -> usize {
        self.queue.synchronize();
        let num_active = adaptive_sampling_count_active(
            std::slice::from_ref(&self.kg),
            &self.base.buffers,
            threshold,
            reset,
        );
        if num_active > 0 {
            adaptive_sampling_filter(&self.kg, &self.base.buffers);
        }
        num_active
    }

    fn cryptomatte_postproces(&mut self) {
        self.queue.synchronize();
        cryptomatte_postprocess(std::slice::from_ref(&self.kg), &self.base.buffers);
    }

    fn get_num_active_paths(&mut self) -> usize {
        self.queue.get_num_active_paths()
    }

    fn render_buffers(&self) -> &Arc<RenderBuffers> {
        &self.base.buffers
    }

    fn set_effective_buffer_params(&mut self, params: BufferParams) {
        if self.base.update_buffer_params(params) {
            self.queue.set_render_buffers(self.base.buffers.clone());
        }
    }
}
