// src/path_tracing/work/mod.rs
// Per-device render work: owns the device's slice of the render buffer and renders samples into it
// RELEVANT FILES:src/path_tracing/work/cpu.rs,src/path_tracing/work/wavefront.rs,src/path_tracing/path_trace.rs

pub mod cpu;
pub mod wavefront;

pub use cpu::PathTraceWorkCpu;
pub use wavefront::PathTraceWorkWavefront;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rayon::prelude::*;

use crate::config::IntegratorConfig;
use crate::device::{Device, DeviceType};
use crate::error::RenderResult;
use crate::path_tracing::buffers::{BufferParams, RenderBuffers};
use crate::path_tracing::film::PassMode;
use crate::path_tracing::kernel::functions::Half4;
use crate::path_tracing::kernel::{KernelData, KernelFunctions, KernelGlobals};

/// Rendering on one device.
///
/// Each work renders into its own buffer covering `effective_buffer_params()`,
/// a region of the full frame. The orchestrator gathers these regions into a
/// combined buffer when it needs the whole image.
pub trait PathTraceWork: Send {
    fn device(&self) -> &Arc<Device>;

    /// Prepare for a new render: clear any in-flight state.
    fn init_execution(&mut self);

    /// Render `num_samples` samples per pixel starting at `start_sample`.
    /// Failures are recorded on the device.
    fn render_samples(&mut self, start_sample: usize, num_samples: usize);

    /// Convert accumulated radiance into `texture`, which covers `texture_params`.
    fn copy_to_display(
        &mut self,
        texture: &mut [Half4],
        texture_params: &BufferParams,
        scale: f32,
        pass_mode: PassMode,
    );

    /// Run the convergence check and, when pixels remain, the dilation filter.
    /// Returns the number of pixels that did not converge.
    fn adaptive_sampling_converge_filter_count_active(&mut self, threshold: f32, reset: bool) -> usize;

    fn cryptomatte_postproces(&mut self);

    /// Paths alive on the device. Always 0 for devices without persistent paths.
    fn get_num_active_paths(&mut self) -> usize;

    fn render_buffers(&self) -> &Arc<RenderBuffers>;

    fn effective_buffer_params(&self) -> &BufferParams {
        self.render_buffers().params()
    }

    /// Reallocate the buffer when the region changes.
    fn set_effective_buffer_params(&mut self, params: BufferParams);

    fn zero_render_buffers(&mut self) {
        self.render_buffers().zero();
    }

    /// Write this work's pixels into a buffer covering (part of) the full frame.
    fn copy_to_render_buffers(&self, dst: &RenderBuffers) {
        copy_region(self.render_buffers(), dst);
    }

    /// Read this work's pixels from a buffer covering (part of) the full frame.
    fn copy_from_render_buffers(&mut self, src: &RenderBuffers) {
        copy_region(src, self.render_buffers());
    }
}

/// Create the work for a device.
pub fn create_path_trace_work(
    device: Arc<Device>,
    kernels: KernelFunctions,
    data: Arc<KernelData>,
    cancel_requested: Arc<AtomicBool>,
    config: &IntegratorConfig,
) -> RenderResult<Box<dyn PathTraceWork>> {
    let work: Box<dyn PathTraceWork> = match device.info.device_type {
        DeviceType::Cpu => Box::new(PathTraceWorkCpu::new(device, kernels, data, cancel_requested)?),
        DeviceType::Wavefront => Box::new(PathTraceWorkWavefront::new(
            device,
            kernels,
            data,
            cancel_requested,
            config,
        )?),
    };
    Ok(work)
}

/// State every work kind carries.
pub(crate) struct WorkBase {
    pub device: Arc<Device>,
    pub buffers: Arc<RenderBuffers>,
    pub cancel_requested: Arc<AtomicBool>,
}

impl WorkBase {
    pub fn new(device: Arc<Device>, kernel_data: &KernelData, cancel_requested: Arc<AtomicBool>) -> Self {
        let empty = BufferParams::new(0, 0, kernel_data.film.pass_stride);
        Self {
            device,
            buffers: Arc::new(RenderBuffers::new(empty)),
            cancel_requested,
        }
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::Relaxed)
    }

    /// Returns true when the buffer was reallocated.
    pub fn update_buffer_params(&mut self, params: BufferParams) -> bool {
        if !self.buffers.params().modified(&params) {
            return false;
        }
        self.buffers = Arc::new(RenderBuffers::new(params));
        true
    }
}

/// Copy the pixels both buffers cover, matched by full-frame position.
pub(crate) fn copy_region(src: &RenderBuffers, dst: &RenderBuffers) {
    let s = *src.params();
    let d = *dst.params();
    let x0 = s.full_x.max(d.full_x);
    let y0 = s.full_y.max(d.full_y);
    let x1 = (s.full_x + s.width).min(d.full_x + d.width);
    let y1 = (s.full_y + s.height).min(d.full_y + d.height);
    if x0 >= x1 || y0 >= y1 {
        return;
    }
    for y in y0..y1 {
        for x in x0..x1 {
            src.copy_pixel_to(s.pixel_index(x, y), dst, d.pixel_index(x, y));
        }
    }
}

/// Kernel context of the calling rayon worker.
#[inline]
pub(crate) fn thread_globals(kernel_globals: &[KernelGlobals]) -> &KernelGlobals {
    let index = rayon::current_thread_index().unwrap_or(0);
    &kernel_globals[index % kernel_globals.len()]
}

pub(crate) fn film_copy_to_display(
    kernel_globals: &[KernelGlobals],
    buffers: &RenderBuffers,
    texture: &mut [Half4],
    texture_params: &BufferParams,
    scale: f32,
    pass_mode: PassMode,
) {
    let params = *buffers.params();
    if params.num_pixels() == 0 || texture_params.width == 0 {
        return;
    }
    debug_assert!(params.full_x >= texture_params.full_x && params.full_y >= texture_params.full_y);
    let row_offset = params.full_y - texture_params.full_y;
    let column_offset = params.full_x - texture_params.full_x;
    let width = params.width.min(texture_params.width.saturating_sub(column_offset));

    texture
        .par_chunks_mut(texture_params.width)
        .skip(row_offset)
        .take(params.height)
        .enumerate()
        .for_each(|(y, row)| {
            let kg = thread_globals(kernel_globals);
            for x in 0..width {
                let pixel = y * params.width + x;
                row[column_offset + x] = (kg.kernels.film_convert_to_half_float)(kg, buffers, pixel, scale, pass_mode);
            }
        });
}

pub(crate) fn adaptive_sampling_count_active(
    kernel_globals: &[KernelGlobals],
    buffers: &RenderBuffers,
    threshold: f32,
    reset: bool,
) -> usize {
    (0..buffers.params().num_pixels())
        .into_par_iter()
        .filter(|pixel| {
            let kg = thread_globals(kernel_globals);
            !(kg.kernels.adaptive_sampling_convergence_check)(kg, buffers, *pixel, threshold, reset)
        })
        .count()
}

/// Row sweeps then column sweeps over the local buffer. Returns whether any
/// pixel is still active. Single-threaded: the sweeps read their neighbours.
pub(crate) fn adaptive_sampling_filter(kg: &KernelGlobals, buffers: &RenderBuffers) -> bool {
    let params = buffers.params();
    let (width, height) = (params.width, params.height);
    let mut any_active = false;
    for y in 0..height {
        any_active |= (kg.kernels.adaptive_sampling_filter_x)(kg, buffers, y, 0, width, 0, width);
    }
    for x in 0..width {
        any_active |= (kg.kernels.adaptive_sampling_filter_y)(kg, buffers, x, 0, height, 0, width);
    }
    any_active
}

pub(crate) fn cryptomatte_postprocess(kernel_globals: &[KernelGlobals], buffers: &RenderBuffers) {
    (0..buffers.params().num_pixels())
        .into_par_iter()
        .for_each(|pixel| {
            let kg = thread_globals(kernel_globals);
            (kg.kernels.cryptomatte_postprocess)(kg, buffers, pixel);
        });
}
