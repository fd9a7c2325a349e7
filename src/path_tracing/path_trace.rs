// src/path_tracing/path_trace.rs
// Path trace orchestrator: drives every device's work through one render step at a time
// Steps run in a fixed order and each is preceded by a cancellation check
// RELEVANT FILES:src/path_tracing/work/mod.rs,src/path_tracing/work_balancer.rs,src/path_tracing/render_work.rs

use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use rayon::prelude::*;

use crate::config::IntegratorConfig;
use crate::device::Device;
use crate::error::{RenderError, RenderResult};
use crate::path_tracing::adaptive_sampling::AdaptiveSampling;
use crate::path_tracing::buffers::{BufferParams, RenderBuffers};
use crate::path_tracing::denoiser::Denoiser;
use crate::path_tracing::display::Display;
use crate::path_tracing::film::PassMode;
use crate::path_tracing::kernel::{KernelData, KernelFunctions};
use crate::path_tracing::render_work::RenderWork;
use crate::path_tracing::work::{create_path_trace_work, PathTraceWork};
use crate::path_tracing::work_balancer::{
    slice_big_tile, work_balance_do_initial, work_balance_do_rebalance, WorkBalanceInfo,
};

/// Progress snapshot or final result: the big-tile buffer and its sample count.
pub type BufferCallback = Box<dyn FnMut(&RenderBuffers, usize) + Send>;
/// Fills the big-tile buffer before the first sample. Returns false to keep it zeroed.
pub type BufferReadCallback = Box<dyn FnMut(&RenderBuffers) -> bool + Send>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PathTraceState {
    Idle,
    Resetting,
    Rendering,
    AdaptiveSampling,
    Denoising,
    DisplayUpdate,
    Finished,
    Canceled,
    /// A device error aborted the last render step
    Failed,
}

#[derive(Debug, Default)]
struct RenderCancelState {
    is_rendering: bool,
}

/// Shared between the rendering thread and whoever cancels it.
#[derive(Debug, Default)]
struct RenderCancel {
    state: Mutex<RenderCancelState>,
    condition: Condvar,
    /// Polled by the works once per sample
    requested: Arc<AtomicBool>,
}

impl RenderCancel {
    fn cancel(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.requested.store(true, Ordering::Relaxed);
        while state.is_rendering {
            state = self
                .condition
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        self.requested.store(false, Ordering::Relaxed);
    }

    /// A cancel with no render in flight has already returned, so there is
    /// never a pending request here.
    fn begin(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.is_rendering = true;
    }

    fn end(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.is_rendering = false;
        self.condition.notify_all();
    }

    fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Relaxed)
    }
}

/// Cancels the render in flight from another thread.
#[derive(Clone, Debug)]
pub struct CancelHandle {
    inner: Arc<RenderCancel>,
}

impl CancelHandle {
    /// Blocks until the running `render()` call (if any) has returned.
    pub fn cancel(&self) {
        self.inner.cancel();
    }
}

#[derive(Debug, Default)]
struct RenderState {
    need_reset_params: bool,
    /// Divider the effective params were built for, 0 before the first render
    resolution_divider: usize,
    effective_big_tile_params: BufferParams,
    has_denoised_result: bool,
    adaptive_sampling_converged: bool,
    num_samples_in_buffer: usize,
}

#[derive(Debug, Default, Clone, Copy)]
struct RenderStats {
    num_render_calls: usize,
    num_rebalances: usize,
    path_trace: Duration,
    adaptive_sampling: Duration,
    denoise: Duration,
    display: Duration,
}

pub struct PathTrace {
    works: Vec<Box<dyn PathTraceWork>>,
    work_balance_infos: Vec<WorkBalanceInfo>,
    kernel_data: Arc<KernelData>,
    adaptive_sampling: AdaptiveSampling,

    big_tile_params: BufferParams,
    render_state: RenderState,
    state: PathTraceState,
    stats: RenderStats,
    cancel: Arc<RenderCancel>,

    display: Option<Box<dyn Display>>,
    denoiser: Option<Box<dyn Denoiser>>,

    buffer_update_cb: Option<BufferCallback>,
    buffer_write_cb: Option<BufferCallback>,
    buffer_read_cb: Option<BufferReadCallback>,
}

impl PathTrace {
    pub fn new(
        devices: Vec<Arc<Device>>,
        kernels: KernelFunctions,
        kernel_data: Arc<KernelData>,
        config: &IntegratorConfig,
    ) -> RenderResult<Self> {
        if devices.is_empty() {
            return Err(RenderError::render("PathTrace needs at least one device"));
        }
        config.validate()?;

        let cancel = Arc::new(RenderCancel::default());
        let works = devices
            .into_iter()
            .map(|device| {
                create_path_trace_work(
                    device,
                    kernels,
                    kernel_data.clone(),
                    cancel.requested.clone(),
                    config,
                )
            })
            .collect::<RenderResult<Vec<_>>>()?;

        let mut work_balance_infos = vec![WorkBalanceInfo::default(); works.len()];
        work_balance_do_initial(&mut work_balance_infos);

        info!(
            "PathTrace created with {} device(s): {}",
            works.len(),
            works
                .iter()
                .map(|work| work.device().info.id.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );

        Ok(Self {
            works,
            work_balance_infos,
            kernel_data,
            adaptive_sampling: config.adaptive_sampling,
            big_tile_params: BufferParams::default(),
            render_state: RenderState::default(),
            state: PathTraceState::Idle,
            stats: RenderStats::default(),
            cancel,
            display: None,
            denoiser: None,
            buffer_update_cb: None,
            buffer_write_cb: None,
            buffer_read_cb: None,
        })
    }

    pub fn state(&self) -> PathTraceState {
        self.state
    }

    pub fn num_works(&self) -> usize {
        self.works.len()
    }

    pub fn works(&self) -> &[Box<dyn PathTraceWork>] {
        &self.works
    }

    pub fn work_balance_infos(&self) -> &[WorkBalanceInfo] {
        &self.work_balance_infos
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            inner: self.cancel.clone(),
        }
    }

    pub fn set_display(&mut self, display: Box<dyn Display>) {
        self.display = Some(display);
    }

    pub fn set_denoiser(&mut self, denoiser: Box<dyn Denoiser>) {
        self.denoiser = Some(denoiser);
    }

    pub fn set_adaptive_sampling(&mut self, adaptive_sampling: AdaptiveSampling) {
        self.adaptive_sampling = adaptive_sampling;
    }

    pub fn set_buffer_update_callback(&mut self, cb: impl FnMut(&RenderBuffers, usize) + Send + 'static) {
        self.buffer_update_cb = Some(Box::new(cb));
    }

    pub fn set_buffer_write_callback(&mut self, cb: impl FnMut(&RenderBuffers, usize) + Send + 'static) {
        self.buffer_write_cb = Some(Box::new(cb));
    }

    pub fn set_buffer_read_callback(&mut self, cb: impl FnMut(&RenderBuffers) -> bool + Send + 'static) {
        self.buffer_read_cb = Some(Box::new(cb));
    }

    /// Start over with a new big tile. Per-device buffers are re-sliced on the next render.
    pub fn reset(&mut self, big_tile_params: BufferParams) {
        debug!(
            "PathTrace reset to {}x{} at ({}, {})",
            big_tile_params.width, big_tile_params.height, big_tile_params.full_x, big_tile_params.full_y
        );
        self.big_tile_params = big_tile_params;
        self.render_state.need_reset_params = true;
        self.render_state.has_denoised_result = false;
        self.render_state.adaptive_sampling_converged = false;
        self.render_state.num_samples_in_buffer = 0;
        self.state = PathTraceState::Resetting;
    }

    /// Cancel the render in flight. Blocks until `render()` returns.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Run one render step. Blocks until it is done or canceled.
    ///
    /// Cancellation is not an error: the call returns `Ok` and the state is
    /// `Canceled`. A device error returns `Err` and leaves the state `Failed`.
    pub fn render(&mut self, render_work: &RenderWork) -> RenderResult<()> {
        self.cancel.begin();
        let result = self.render_pipeline(render_work);
        self.cancel.end();

        if let Err(err) = &result {
            warn!("Render step failed: {err}");
            self.state = PathTraceState::Failed;
        }
        result
    }

    fn render_pipeline(&mut self, render_work: &RenderWork) -> RenderResult<()> {
        if self.big_tile_params.num_pixels() == 0 {
            return Err(RenderError::render("render() called before reset() with a non-empty big tile"));
        }
        self.stats.num_render_calls += 1;
        self.state = PathTraceState::Rendering;

        self.update_work_buffer_params_if_needed(render_work);

        if render_work.init_render_buffers {
            self.init_render_buffers();
        }
        if self.check_canceled() {
            return Ok(());
        }

        self.path_trace(render_work)?;
        if self.check_canceled() {
            return Ok(());
        }

        self.adaptive_sample(render_work);
        if self.check_canceled() {
            return Ok(());
        }

        self.denoise(render_work);
        if self.check_canceled() {
            return Ok(());
        }

        self.update_display(render_work);
        if self.check_canceled() {
            return Ok(());
        }

        self.cryptomatte_postprocess(render_work);
        if self.check_canceled() {
            return Ok(());
        }

        if render_work.full.write {
            self.buffer_write();
        }

        self.rebalance();
        self.state = PathTraceState::Finished;
        Ok(())
    }

    fn check_canceled(&mut self) -> bool {
        if self.cancel.is_requested() {
            debug!("Render canceled");
            self.state = PathTraceState::Canceled;
            return true;
        }
        false
    }

    fn update_work_buffer_params_if_needed(&mut self, render_work: &RenderWork) {
        let resolution_divider = render_work.resolution_divider.max(1);
        if !self.render_state.need_reset_params
            && resolution_divider == self.render_state.resolution_divider
        {
            return;
        }

        let effective = if resolution_divider > 1 {
            self.big_tile_params.with_resolution_divider(resolution_divider)
        } else {
            self.big_tile_params
        };
        self.render_state.effective_big_tile_params = effective;
        self.render_state.resolution_divider = resolution_divider;
        self.render_state.need_reset_params = false;
        self.apply_slices();
    }

    /// Give every work its slice of the effective big tile for the current weights.
    fn apply_slices(&mut self) {
        let slices = slice_big_tile(&self.render_state.effective_big_tile_params, &self.work_balance_infos);
        for (work, params) in self.works.iter_mut().zip(slices) {
            work.set_effective_buffer_params(params);
        }
    }

    fn init_render_buffers(&mut self) {
        for work in self.works.iter_mut() {
            work.init_execution();
            work.zero_render_buffers();
        }
        self.render_state.num_samples_in_buffer = 0;
        self.render_state.has_denoised_result = false;
        self.render_state.adaptive_sampling_converged = false;

        if let Some(cb) = self.buffer_read_cb.as_mut() {
            let big_tile = RenderBuffers::new(self.render_state.effective_big_tile_params);
            if cb(&big_tile) {
                for work in self.works.iter_mut() {
                    work.copy_from_render_buffers(&big_tile);
                }
            }
        }
    }

    fn path_trace(&mut self, render_work: &RenderWork) -> RenderResult<()> {
        let range = render_work.path_trace;
        if range.num_samples == 0 {
            return Ok(());
        }
        debug!(
            "Path trace samples {}..{}",
            range.start_sample,
            range.start_sample + range.num_samples
        );

        let start = Instant::now();
        self.works
            .par_iter_mut()
            .zip(self.work_balance_infos.par_iter_mut())
            .for_each(|(work, balance_info)| {
                let work_start = Instant::now();
                work.render_samples(range.start_sample, range.num_samples);
                balance_info.time_spent += work_start.elapsed();
            });
        self.stats.path_trace += start.elapsed();

        if let Some(message) = self.works.iter().find_map(|work| work.device().error_message()) {
            return Err(RenderError::Device(message));
        }

        if !self.cancel.is_requested() {
            self.render_state.num_samples_in_buffer = range.start_sample + range.num_samples;
            self.render_state.has_denoised_result = false;
        }
        Ok(())
    }

    fn adaptive_sample(&mut self, render_work: &RenderWork) {
        let range = render_work.path_trace;
        let scheduled = self.adaptive_sampling.enabled
            && self
                .adaptive_sampling
                .need_filter_in_range(range.start_sample, range.num_samples);
        if !render_work.adaptive_sampling.filter && !scheduled {
            return;
        }
        if self.kernel_data.film.pass_adaptive_aux_buffer.is_none() {
            warn!("Adaptive sampling requested without the adaptive auxiliary pass");
            return;
        }

        self.state = PathTraceState::AdaptiveSampling;
        let start = Instant::now();
        let threshold = render_work
            .adaptive_sampling
            .threshold
            .unwrap_or(self.adaptive_sampling.threshold);
        let reset = render_work.adaptive_sampling.reset;

        let num_active_pixels: usize = self
            .works
            .par_iter_mut()
            .map(|work| work.adaptive_sampling_converge_filter_count_active(threshold, reset))
            .sum();

        self.render_state.adaptive_sampling_converged = num_active_pixels == 0;
        if num_active_pixels == 0 {
            info!("Adaptive sampling converged after {} samples", self.render_state.num_samples_in_buffer);
        } else {
            debug!("Adaptive sampling: {num_active_pixels} pixels still active");
        }
        self.stats.adaptive_sampling += start.elapsed();
    }

    fn denoise(&mut self, render_work: &RenderWork) {
        if !render_work.tile.denoise {
            return;
        }
        if self.denoiser.is_none() {
            debug!("Denoise requested but no denoiser is set");
            return;
        }

        self.state = PathTraceState::Denoising;
        let start = Instant::now();
        let big_tile = self.gather_big_tile();
        let params = self.render_state.effective_big_tile_params;
        let num_samples = self.render_state.num_samples_in_buffer;
        let film = self.kernel_data.film;

        let Some(denoiser) = self.denoiser.as_mut() else {
            return;
        };
        match denoiser.denoise_buffer(&params, &film, &big_tile, num_samples) {
            Ok(()) => {
                // Each work keeps its own slice, so the denoised pass goes back to all of them.
                for work in self.works.iter_mut() {
                    work.copy_from_render_buffers(&big_tile);
                }
                self.render_state.has_denoised_result = true;
            }
            Err(err) => {
                warn!("Denoiser {} failed: {err}", denoiser.name());
                self.render_state.has_denoised_result = false;
            }
        }
        self.stats.denoise += start.elapsed();
    }

    fn update_display(&mut self, render_work: &RenderWork) {
        if !render_work.update_display {
            return;
        }
        self.state = PathTraceState::DisplayUpdate;
        let start = Instant::now();
        let params = self.render_state.effective_big_tile_params;
        let num_samples = self.render_state.num_samples_in_buffer;
        let scale = if num_samples > 0 { 1.0 / num_samples as f32 } else { 0.0 };
        let pass_mode = if self.render_state.has_denoised_result {
            PassMode::Denoised
        } else {
            PassMode::Noisy
        };

        if let Some(display) = self.display.as_mut() {
            if display.update_begin(params.width, params.height) {
                match display.map_texture_buffer() {
                    Some(texture) => {
                        for work in self.works.iter_mut() {
                            work.copy_to_display(texture, &params, scale, pass_mode);
                        }
                    }
                    None => warn!("Failed to map display texture"),
                }
                display.update_end();
            }
        }

        if self.buffer_update_cb.is_some() {
            let big_tile = self.gather_big_tile();
            if let Some(cb) = self.buffer_update_cb.as_mut() {
                cb(&big_tile, num_samples);
            }
        }
        self.stats.display += start.elapsed();
    }

    fn cryptomatte_postprocess(&mut self, render_work: &RenderWork) {
        if !render_work.cryptomatte.postprocess {
            return;
        }
        self.works
            .par_iter_mut()
            .for_each(|work| work.cryptomatte_postproces());
    }

    fn buffer_write(&mut self) {
        if self.buffer_write_cb.is_none() {
            return;
        }
        let big_tile = self.gather_big_tile();
        let num_samples = self.render_state.num_samples_in_buffer;
        if let Some(cb) = self.buffer_write_cb.as_mut() {
            cb(&big_tile, num_samples);
        }
    }

    /// Reslice the frame when the devices' throughput diverged. Pixels move
    /// through a big-tile buffer so nothing rendered so far is lost.
    fn rebalance(&mut self) {
        if self.works.len() < 2 {
            return;
        }
        if !work_balance_do_rebalance(&mut self.work_balance_infos) {
            return;
        }

        let big_tile = self.gather_big_tile();
        self.apply_slices();
        for work in self.works.iter_mut() {
            work.copy_from_render_buffers(&big_tile);
        }
        self.stats.num_rebalances += 1;
    }

    fn gather_big_tile(&self) -> RenderBuffers {
        let big_tile = RenderBuffers::new(self.render_state.effective_big_tile_params);
        for work in &self.works {
            work.copy_to_render_buffers(&big_tile);
        }
        big_tile
    }

    /// Write every device's pixels into `dst`, which may cover any part of the frame.
    pub fn copy_to_render_buffers(&self, dst: &RenderBuffers) {
        for work in &self.works {
            work.copy_to_render_buffers(dst);
        }
    }

    /// Load every device's pixels from `src`.
    pub fn copy_from_render_buffers(&mut self, src: &RenderBuffers) {
        for work in self.works.iter_mut() {
            work.copy_from_render_buffers(src);
        }
    }

    /// Paths still alive on all devices.
    pub fn get_num_active_paths(&mut self) -> usize {
        self.works
            .iter_mut()
            .map(|work| work.get_num_active_paths())
            .sum()
    }

    pub fn num_samples_in_buffer(&self) -> usize {
        self.render_state.num_samples_in_buffer
    }

    pub fn has_denoised_result(&self) -> bool {
        self.render_state.has_denoised_result
    }

    pub fn is_adaptive_sampling_converged(&self) -> bool {
        self.render_state.adaptive_sampling_converged
    }

    pub fn effective_big_tile_params(&self) -> &BufferParams {
        &self.render_state.effective_big_tile_params
    }

    /// Multi-line summary of devices, slices and time per step.
    pub fn full_report(&self) -> String {
        let mut report = String::new();
        let params = &self.render_state.effective_big_tile_params;
        let _ = writeln!(report, "Path trace: {}x{}", params.width, params.height);
        let _ = writeln!(report, "  State: {:?}", self.state);
        let _ = writeln!(report, "  Samples in buffer: {}", self.render_state.num_samples_in_buffer);
        let _ = writeln!(report, "  Render calls: {}", self.stats.num_render_calls);
        let _ = writeln!(report, "  Rebalances: {}", self.stats.num_rebalances);
        let _ = writeln!(report, "  Devices:");
        for (work, balance_info) in self.works.iter().zip(&self.work_balance_infos) {
            let slice = work.effective_buffer_params();
            let _ = writeln!(
                report,
                "    {:<12} {:?} weight {:.3} rows {}..{}",
                work.device().info.id,
                work.device().info.device_type,
                balance_info.weight,
                slice.full_y,
                slice.full_y + slice.height
            );
        }
        let _ = writeln!(report, "  Time:");
        let _ = writeln!(report, "    Path trace        {:.3}s", self.stats.path_trace.as_secs_f64());
        let _ = writeln!(report, "    Adaptive sampling {:.3}s", self.stats.adaptive_sampling.as_secs_f64());
        let _ = writeln!(report, "    Denoise           {:.3}s", self.stats.denoise.as_secs_f64());
        let _ = writeln!(report, "    Display           {:.3}s", self.stats.display.as_secs_f64());
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceInfo;
    use crate::path_tracing::film::KernelFilm;
    use crate::path_tracing::kernel::reference;

    fn path_trace(config: &IntegratorConfig) -> PathTrace {
        let data = Arc::new(KernelData::new(KernelFilm::default(), config));
        let device = Device::new(DeviceInfo::cpu("cpu0", config));
        PathTrace::new(vec![device], reference::kernel_functions(), data, config).unwrap()
    }

    #[test]
    fn test_render_before_reset_fails() {
        let config = IntegratorConfig {
            cpu_threads: 1,
            ..Default::default()
        };
        let mut pt = path_trace(&config);
        assert!(pt.render(&RenderWork::samples(0, 1)).is_err());
        assert_eq!(pt.state(), PathTraceState::Failed);
    }

    #[test]
    fn test_state_moves_through_reset_and_render() {
        let config = IntegratorConfig {
            cpu_threads: 2,
            ..Default::default()
        };
        let mut pt = path_trace(&config);
        assert_eq!(pt.state(), PathTraceState::Idle);

        pt.reset(BufferParams::new(4, 4, KernelFilm::default().pass_stride));
        assert_eq!(pt.state(), PathTraceState::Resetting);

        pt.render(&RenderWork::samples(0, 2)).unwrap();
        assert_eq!(pt.state(), PathTraceState::Finished);
        assert_eq!(pt.num_samples_in_buffer(), 2);

        pt.render(&RenderWork::samples(2, 3)).unwrap();
        assert_eq!(pt.num_samples_in_buffer(), 5);
        assert!(pt.full_report().contains("cpu0"));
    }

    #[test]
    fn test_resolution_divider_shrinks_effective_tile() {
        let config = IntegratorConfig {
            cpu_threads: 1,
            ..Default::default()
        };
        let mut pt = path_trace(&config);
        pt.reset(BufferParams::new(16, 8, KernelFilm::default().pass_stride));

        let work = RenderWork {
            resolution_divider: 4,
            ..RenderWork::samples(0, 1)
        };
        pt.render(&work).unwrap();
        assert_eq!(pt.effective_big_tile_params().width, 4);
        assert_eq!(pt.effective_big_tile_params().height, 2);

        pt.render(&RenderWork::samples(0, 1)).unwrap();
        assert_eq!(pt.effective_big_tile_params().width, 16);
    }

    #[test]
    fn test_cancel_without_render_does_not_block() {
        let config = IntegratorConfig {
            cpu_threads: 1,
            ..Default::default()
        };
        let pt = path_trace(&config);
        pt.cancel_handle().cancel();
        assert_eq!(pt.state(), PathTraceState::Idle);
    }
}
