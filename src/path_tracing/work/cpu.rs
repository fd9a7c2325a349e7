// src/path_tracing/work/cpu.rs
// CPU work: every pixel runs its samples start to finish on one worker thread, no queue
// RELEVANT FILES:src/path_tracing/work/mod.rs,src/path_tracing/kernel/megakernel.rs

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

use super::{
    adaptive_sampling_count_active, adaptive_sampling_filter, cryptomatte_postprocess,
    film_copy_to_display, thread_globals, PathTraceWork, WorkBase,
};
use crate::device::Device;
use crate::error::{RenderError, RenderResult};
use crate::path_tracing::buffers::{BufferParams, RenderBuffers};
use crate::path_tracing::film::PassMode;
use crate::path_tracing::kernel::functions::Half4;
use crate::path_tracing::kernel::{KernelData, KernelFunctions, KernelGlobals};
use crate::path_tracing::state::{IntegratorState, PathQueue};
use crate::path_tracing::work_tile::KernelWorkTile;

pub struct PathTraceWorkCpu {
    base: WorkBase,
    pool: ThreadPool,
    /// One per pool thread, reused across passes
    kernel_globals: Vec<KernelGlobals>,
}

impl PathTraceWorkCpu {
    pub fn new(
        device: Arc<Device>,
        kernels: KernelFunctions,
        kernel_data: Arc<KernelData>,
        cancel_requested: Arc<AtomicBool>,
    ) -> RenderResult<Self> {
        let num_threads = device.info.num_cpu_threads();
        let pool = ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("pt-cpu-{i}"))
            .build()
            .map_err(|e| RenderError::device(format!("Failed to create CPU thread pool: {e}")))?;

        let base = WorkBase::new(device, &kernel_data, cancel_requested);
        // Each thread owns its pixels for the whole batch, plain adds are enough.
        let kernel_globals = (0..num_threads)
            .map(|thread_index| KernelGlobals::new(kernel_data.clone(), kernels, thread_index, false))
            .collect();

        log::info!("{}: CPU work with {} threads", base.device.info.id, num_threads);

        Ok(Self {
            base,
            pool,
            kernel_globals,
        })
    }

    pub fn num_threads(&self) -> usize {
        self.kernel_globals.len()
    }

    /// Dilation sweeps over the convergence flags. Returns whether any pixel is still active.
    pub fn adaptive_filter(&self) -> bool {
        adaptive_sampling_filter(&self.kernel_globals[0], &self.base.buffers)
    }
}

/// Render every sample of one pixel with a path state living on this thread's stack.
fn render_pixel(
    kg: &KernelGlobals,
    buffers: &RenderBuffers,
    mut tile: KernelWorkTile,
    start_sample: usize,
    num_samples: usize,
    cancel_requested: &AtomicBool,
) {
    let queue = PathQueue::host();
    let init = kg.kernels.init_function(kg.integrator().use_baking);

    for sample in 0..num_samples {
        if cancel_requested.load(Ordering::Relaxed) {
            break;
        }
        tile.start_sample = (start_sample + sample) as u32;
        let mut state = IntegratorState::new();
        if !init(kg, &mut state, &queue, &tile, 0, buffers) {
            // Pixel converged.
            break;
        }
        (kg.kernels.integrator_megakernel)(kg, &mut state, &queue, buffers);
    }
}

impl PathTraceWork for PathTraceWorkCpu {
    fn device(&self) -> &Arc<Device> {
        &self.base.device
    }

    fn init_execution(&mut self) {}

    fn render_samples(&mut self, start_sample: usize, num_samples: usize) {
        let params = *self.base.buffers.params();
        let (offset, stride) = params.get_offset_stride();
        let buffers = self.base.buffers.as_ref();
        let kernel_globals = self.kernel_globals.as_slice();
        let cancel_requested = self.base.cancel_requested.as_ref();
        let device = self.base.device.as_ref();

        let result = self.pool.install(|| {
            panic::catch_unwind(AssertUnwindSafe(|| {
                (0..params.num_pixels()).into_par_iter().for_each(|pixel| {
                    if cancel_requested.load(Ordering::Relaxed) || device.have_error() {
                        return;
                    }
                    let tile = KernelWorkTile {
                        x: (params.full_x + pixel % params.width) as u32,
                        y: (params.full_y + pixel / params.width) as u32,
                        w: 1,
                        h: 1,
                        start_sample: start_sample as u32,
                        num_samples: 1,
                        offset: offset as i32,
                        stride: stride as u32,
                    };
                    render_pixel(
                        thread_globals(kernel_globals),
                        buffers,
                        tile,
                        start_sample,
                        num_samples,
                        cancel_requested,
                    );
                });
            }))
        });

        if let Err(payload) = result {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            device.set_error(format!("CPU kernel failed: {message}"));
        }
    }

    fn copy_to_display(
        &mut self,
        texture: &mut [Half4],
        texture_params: &BufferParams,
        scale: f32,
        pass_mode: PassMode,
    ) {
        let buffers = self.base.buffers.as_ref();
        let kernel_globals = self.kernel_globals.as_slice();
        self.pool.install(|| {
            film_copy_to_display(kernel_globals, buffers, texture, texture_params, scale, pass_mode)
        });
    }

    fn adaptive_sampling_converge_filter_count_active(&mut self, threshold: f32, reset: bool) -> usize {
        let buffers = self.base.buffers.as_ref();
        let kernel_globals = self.kernel_globals.as_slice();
        let num_active = self
            .pool
            .install(|| adaptive_sampling_count_active(kernel_globals, buffers, threshold, reset));
        if num_active > 0 {
            self.adaptive_filter();
        }
        num_active
    }

    fn cryptomatte_postproces(&mut self) {
        let buffers = self.base.buffers.as_ref();
        let kernel_globals = self.kernel_globals.as_slice();
        self.pool
            .install(|| cryptomatte_postprocess(kernel_globals, buffers));
    }

    fn get_num_active_paths(&mut self) -> usize {
        0
    }

    fn render_buffers(&self) -> &Arc<RenderBuffers> {
        &self.base.buffers
    }

    fn set_effective_buffer_params(&mut self, params: BufferParams) {
        self.base.update_buffer_params(params);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IntegratorConfig;
    use crate::device::DeviceInfo;
    use crate::path_tracing::film::KernelFilm;
    use crate::path_tracing::kernel::reference;

    fn cpu_work(threads: usize) -> PathTraceWorkCpu {
        let config = IntegratorConfig {
            cpu_threads: threads,
            ..Default::default()
        };
        let data = Arc::new(KernelData::new(KernelFilm::default(), &config));
        let device = Device::new(DeviceInfo::cpu("cpu0", &config));
        PathTraceWorkCpu::new(
            device,
            reference::kernel_functions(),
            data,
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap()
    }

    #[test]
    fn test_every_pixel_gets_every_sample() {
        let mut work = cpu_work(2);
        let film = KernelFilm::default();
        work.set_effective_buffer_params(BufferParams::new(5, 3, film.pass_stride));
        work.render_samples(0, 6);

        let buffers = work.render_buffers();
        let sample_count = film.pass_sample_count.unwrap();
        for pixel in 0..15 {
            assert_eq!(buffers.read_u32(pixel * film.pass_stride + sample_count), 6);
        }
        assert!(!work.device().have_error());
        assert_eq!(work.get_num_active_paths(), 0);
    }

    #[test]
    fn test_cancel_stops_before_rendering() {
        let mut work = cpu_work(1);
        work.set_effective_buffer_params(BufferParams::new(2, 2, KernelFilm::default().pass_stride));
        work.base.cancel_requested.store(true, Ordering::Relaxed);
        work.render_samples(0, 4);
        assert!(work.render_buffers().to_vec().iter().all(|v| *v == 0.0));
    }
}
