// src/path_tracing/adaptive_sampling.rs
// Adaptive sampling: per-pixel convergence test and the dilation sweeps around unconverged pixels
// RELEVANT FILES:src/path_tracing/accumulate.rs,src/path_tracing/work/mod.rs,src/path_tracing/path_trace.rs

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::path_tracing::buffers::RenderBuffers;
use crate::path_tracing::kernel::KernelGlobals;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveSampling {
    pub enabled: bool,
    /// Noise level below which a pixel stops receiving samples
    pub threshold: f32,
    /// No pixel converges before this many samples
    pub min_samples: usize,
    /// Check interval in samples, power of two
    pub adaptive_step: usize,
}

impl Default for AdaptiveSampling {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold: 0.01,
            min_samples: 16,
            adaptive_step: 4,
        }
    }
}

impl AdaptiveSampling {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.adaptive_step == 0 || !self.adaptive_step.is_power_of_two() {
            return Err(ConfigError::new(format!(
                "adaptive_sampling.adaptive_step must be a power of two, got {}",
                self.adaptive_step
            )));
        }
        if !(self.threshold >= 0.0) {
            return Err(ConfigError::new("adaptive_sampling.threshold must be non-negative"));
        }
        Ok(())
    }

    /// Whether the filter runs after `sample` has been rendered.
    pub fn need_filter(&self, sample: usize) -> bool {
        if !self.enabled || sample < self.min_samples {
            return false;
        }
        sample & (self.adaptive_step - 1) == self.adaptive_step - 1
    }

    /// Whether any sample of `[start_sample, start_sample + num_samples)` hits a check.
    pub fn need_filter_in_range(&self, start_sample: usize, num_samples: usize) -> bool {
        (start_sample..start_sample + num_samples).any(|sample| self.need_filter(sample))
    }
}

#[inline]
fn pixel_index(offset: i64, x: usize, y: usize, stride: usize) -> usize {
    (offset + (x + y * stride) as i64) as usize
}

/// A converged pixel receives no new samples.
pub fn kernel_need_sample_pixel(
    kg: &KernelGlobals,
    render_buffers: &RenderBuffers,
    render_pixel_index: usize,
) -> bool {
    let film = kg.film();
    match film.pass_adaptive_aux_buffer {
        Some(aux) => {
            let index = render_pixel_index * film.pass_stride + aux + 3;
            render_buffers.read(index) == 0.0
        }
        None => true,
    }
}

/// Compare the full estimate with the even-sample estimate and store the
/// converged flag in aux.w. `reset` re-tests pixels that already converged.
pub fn kernel_adaptive_sampling_convergence_check(
    kg: &KernelGlobals,
    render_buffers: &RenderBuffers,
    render_pixel_index: usize,
    threshold: f32,
    reset: bool,
) -> bool {
    let film = kg.film();
    let (Some(aux), Some(combined), Some(sample_count)) = (
        film.pass_adaptive_aux_buffer,
        film.pass_combined,
        film.pass_sample_count,
    ) else {
        return false;
    };

    let base = render_pixel_index * film.pass_stride;
    let aux_w = base + aux + 3;
    if !reset && render_buffers.read(aux_w) != 0.0 {
        return true;
    }

    let num_samples = render_buffers.read_u32(base + sample_count);
    if num_samples == 0 {
        return false;
    }
    let inv_samples = 1.0 / num_samples as f32;

    let i = [0, 1, 2].map(|c| render_buffers.read(base + combined + c));
    let a = [0, 1, 2].map(|c| render_buffers.read(base + aux + c));

    let error_difference =
        ((i[0] - a[0]).abs() + (i[1] - a[1]).abs() + (i[2] - a[2]).abs()) * inv_samples;
    let error_normalize = ((i[0] + i[1] + i[2]) * inv_samples).max(0.0).sqrt();
    let error = error_difference / (0.0001 + error_normalize);
    let did_converge = error < threshold;

    render_buffers.write(aux_w, if did_converge { 1.0 } else { 0.0 });
    did_converge
}

/// Row sweep: un-converge the horizontal neighbours of every active pixel.
pub fn kernel_adaptive_sampling_filter_x(
    kg: &KernelGlobals,
    render_buffers: &RenderBuffers,
    y: usize,
    start_x: usize,
    width: usize,
    offset: i64,
    stride: usize,
) -> bool {
    let film = kg.film();
    let Some(aux) = film.pass_adaptive_aux_buffer else {
        return false;
    };
    let aux_w = |x: usize| pixel_index(offset, x, y, stride) * film.pass_stride + aux + 3;

    let mut any = false;
    let mut prev = false;
    for x in start_x..start_x + width {
        if render_buffers.read(aux_w(x)) == 0.0 {
            any = true;
            if x > start_x && !prev {
                render_buffers.write(aux_w(x - 1), 0.0);
            }
            prev = true;
        } else {
            if prev {
                render_buffers.write(aux_w(x), 0.0);
            }
            prev = false;
        }
    }
    any
}

/// Column sweep, same as the row sweep along y.
pub fn kernel_adaptive_sampling_filter_y(
    kg: &KernelGlobals,
    render_buffers: &RenderBuffers,
    x: usize,
    start_y: usize,
    height: usize,
    offset: i64,
    stride: usize,
) -> bool {
    let film = kg.film();
    let Some(aux) = film.pass_adaptive_aux_buffer else {
        return false;
    };
    let aux_w = |y: usize| pixel_index(offset, x, y, stride) * film.pass_stride + aux + 3;

    let mut any = false;
    let mut prev = false;
    for y in start_y..start_y + height {
        if render_buffers.read(aux_w(y)) == 0.0 {
            any = true;
            if y > start_y && !prev {
                render_buffers.write(aux_w(y - 1), 0.0);
            }
            prev = true;
        } else {
            if prev {
                render_buffers.write(aux_w(y), 0.0);
            }
            prev = false;
        }
    }
    any
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IntegratorConfig;
    use crate::path_tracing::buffers::BufferParams;
    use crate::path_tracing::film::{FilmPasses, KernelFilm};
    use crate::path_tracing::kernel::{reference, KernelData};
    use std::sync::Arc;

    fn setup(width: usize) -> (KernelGlobals, RenderBuffers) {
        let film = KernelFilm::new(FilmPasses {
            adaptive_sampling: true,
            ..Default::default()
        });
        let data = KernelData::new(film, &IntegratorConfig::default());
        let kg = KernelGlobals::new(Arc::new(data), reference::kernel_functions(), 0, false);
        let buffers = RenderBuffers::new(BufferParams::new(width, 1, film.pass_stride));
        (kg, buffers)
    }

    fn set_converged(kg: &KernelGlobals, buffers: &RenderBuffers, pixel: usize, converged: bool) {
        let film = kg.film();
        let index = pixel * film.pass_stride + film.pass_adaptive_aux_buffer.unwrap() + 3;
        buffers.write(index, if converged { 1.0 } else { 0.0 });
    }

    #[test]
    fn test_need_filter_interval() {
        let adaptive = AdaptiveSampling {
            enabled: true,
            min_samples: 8,
            adaptive_step: 4,
            ..Default::default()
        };
        assert!(!adaptive.need_filter(3));
        assert!(adaptive.need_filter(11));
        assert!(!adaptive.need_filter(12));
        assert!(adaptive.need_filter_in_range(8, 4));
        assert!(!adaptive.need_filter_in_range(12, 3));
        assert!(!AdaptiveSampling::default().need_filter(63));
    }

    #[test]
    fn test_identical_estimates_converge() {
        let (kg, buffers) = setup(1);
        let film = *kg.film();
        for c in 0..3 {
            buffers.write(film.pass_combined.unwrap() + c, 8.0);
            buffers.write(film.pass_adaptive_aux_buffer.unwrap() + c, 8.0);
        }
        buffers.write_u32(film.pass_sample_count.unwrap(), 8);

        assert!(kernel_adaptive_sampling_convergence_check(&kg, &buffers, 0, 0.01, false));
        assert!(!kernel_need_sample_pixel(&kg, &buffers, 0));
    }

    #[test]
    fn test_noisy_pixel_stays_active() {
        let (kg, buffers) = setup(1);
        let film = *kg.film();
        buffers.write(film.pass_combined.unwrap(), 8.0);
        buffers.write_u32(film.pass_sample_count.unwrap(), 8);
        assert!(!kernel_adaptive_sampling_convergence_check(&kg, &buffers, 0, 0.01, false));
        assert!(kernel_need_sample_pixel(&kg, &buffers, 0));
    }

    #[test]
    fn test_filter_x_dilates_active_pixels() {
        let (kg, buffers) = setup(5);
        for pixel in 0..5 {
            set_converged(&kg, &buffers, pixel, pixel != 2);
        }
        assert!(kernel_adaptive_sampling_filter_x(&kg, &buffers, 0, 0, 5, 0, 5));
        let active: Vec<bool> = (0..5).map(|p| kernel_need_sample_pixel(&kg, &buffers, p)).collect();
        assert_eq!(active, vec![false, true, true, true, false]);
    }

    #[test]
    fn test_filter_reports_all_converged() {
        let (kg, buffers) = setup(3);
        for pixel in 0..3 {
            set_converged(&kg, &buffers, pixel, true);
        }
        assert!(!kernel_adaptive_sampling_filter_x(&kg, &buffers, 0, 0, 3, 0, 3));
        assert!(!kernel_adaptive_sampling_filter_y(&kg, &buffers, 1, 0, 1, 0, 3));
    }
}
