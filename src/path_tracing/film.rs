// src/path_tracing/film.rs
// Film pass layout and the read-side pixel operations: display conversion and cryptomatte sorting
// RELEVANT FILES:src/path_tracing/buffers.rs,src/path_tracing/accumulate.rs,src/path_tracing/work/mod.rs

use half::f16;

use crate::path_tracing::buffers::RenderBuffers;
use crate::path_tracing::kernel::functions::Half4;
use crate::path_tracing::kernel::KernelGlobals;

/// Passes requested for a render.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FilmPasses {
    pub sample_count: bool,
    pub adaptive_sampling: bool,
    /// Number of (id, weight) pairs, 0 = no cryptomatte pass
    pub cryptomatte_depth: usize,
    /// Reserve a pass the denoiser writes its result into
    pub denoising: bool,
}

impl Default for FilmPasses {
    fn default() -> Self {
        Self {
            sample_count: true,
            adaptive_sampling: false,
            cryptomatte_depth: 0,
            denoising: false,
        }
    }
}

/// Pass offsets inside one pixel, `None` when a pass is not rendered.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct KernelFilm {
    pub pass_stride: usize,
    pub pass_combined: Option<usize>,            // rgb + transparency
    pub pass_sample_count: Option<usize>,        // integer bits
    pub pass_adaptive_aux_buffer: Option<usize>, // even-sample rgb, w = converged
    pub pass_cryptomatte: Option<usize>,
    pub pass_denoised: Option<usize>, // rgb, same scale as the combined pass
    pub cryptomatte_depth: usize,
    pub exposure: f32,
}

/// Which combined result the display conversion reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PassMode {
    Noisy,
    Denoised,
}

impl KernelFilm {
    pub fn new(passes: FilmPasses) -> Self {
        let mut stride = 0;
        let mut take = |size: usize| {
            let offset = stride;
            stride += size;
            offset
        };

        let pass_combined = Some(take(4));
        let pass_sample_count = passes.sample_count.then(|| take(1));
        let pass_adaptive_aux_buffer = passes.adaptive_sampling.then(|| take(4));
        let pass_cryptomatte = (passes.cryptomatte_depth > 0).then(|| take(passes.cryptomatte_depth * 2));
        let pass_denoised = passes.denoising.then(|| take(3));

        Self {
            pass_stride: stride,
            pass_combined,
            pass_sample_count,
            pass_adaptive_aux_buffer,
            pass_cryptomatte,
            pass_denoised,
            cryptomatte_depth: passes.cryptomatte_depth,
            exposure: 1.0,
        }
    }

    pub fn with_exposure(mut self, exposure: f32) -> Self {
        self.exposure = exposure;
        self
    }
}

impl Default for KernelFilm {
    fn default() -> Self {
        Self::new(FilmPasses::default())
    }
}

/// Scale turning accumulated values into an average. Uses the per-pixel sample
/// count when it is rendered, `default_scale` otherwise.
pub fn film_get_scale(
    film: &KernelFilm,
    render_buffers: &RenderBuffers,
    buffer_index: usize,
    default_scale: f32,
) -> f32 {
    match film.pass_sample_count {
        Some(pass) => {
            let num_samples = render_buffers.read_u32(buffer_index + pass);
            if num_samples == 0 {
                0.0
            } else {
                1.0 / num_samples as f32
            }
        }
        None => default_scale,
    }
}

pub fn film_get_pass_pixel_float4(
    render_buffers: &RenderBuffers,
    buffer_index: usize,
    scale: f32,
) -> [f32; 4] {
    [
        render_buffers.read(buffer_index) * scale,
        render_buffers.read(buffer_index + 1) * scale,
        render_buffers.read(buffer_index + 2) * scale,
        render_buffers.read(buffer_index + 3) * scale,
    ]
}

/// Denoised rgb falls back to the noisy one when the film has no denoised
/// pass. Alpha always comes from the combined transparency.
pub fn film_convert_to_half_float(
    kg: &KernelGlobals,
    render_buffers: &RenderBuffers,
    render_pixel_index: usize,
    scale: f32,
    pass_mode: PassMode,
) -> Half4 {
    let film = kg.film();
    let buffer_index = render_pixel_index * film.pass_stride;
    let Some(pass_combined) = film.pass_combined else {
        return [f16::ZERO; 4];
    };

    let scale = film_get_scale(film, render_buffers, buffer_index, scale);
    let [mut r, mut g, mut b, transparency] =
        film_get_pass_pixel_float4(render_buffers, buffer_index + pass_combined, scale);
    if let (PassMode::Denoised, Some(pass_denoised)) = (pass_mode, film.pass_denoised) {
        let index = buffer_index + pass_denoised;
        r = render_buffers.read(index) * scale;
        g = render_buffers.read(index + 1) * scale;
        b = render_buffers.read(index + 2) * scale;
    }
    let alpha = (1.0 - transparency).clamp(0.0, 1.0);
    let exposure = film.exposure;

    [
        f16::from_f32(r * exposure),
        f16::from_f32(g * exposure),
        f16::from_f32(b * exposure),
        f16::from_f32(alpha),
    ]
}

/// Order the (id, weight) slots of a pixel by decreasing weight.
pub fn film_cryptomatte_post(
    kg: &KernelGlobals,
    render_buffers: &RenderBuffers,
    render_pixel_index: usize,
) {
    let film = kg.film();
    let Some(pass) = film.pass_cryptomatte else {
        return;
    };
    let base = render_pixel_index * film.pass_stride + pass;

    let mut slots: Vec<(f32, f32)> = (0..film.cryptomatte_depth)
        .map(|i| {
            (
                render_buffers.read(base + 2 * i),
                render_buffers.read(base + 2 * i + 1),
            )
        })
        .collect();
    slots.sort_by(|a, b| b.1.total_cmp(&a.1));

    for (i, (id, weight)) in slots.into_iter().enumerate() {
        render_buffers.write(base + 2 * i, id);
        render_buffers.write(base + 2 * i + 1, weight);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IntegratorConfig;
    use crate::path_tracing::buffers::BufferParams;
    use crate::path_tracing::kernel::{reference, KernelData};
    use std::sync::Arc;

    fn globals(film: KernelFilm) -> KernelGlobals {
        let data = KernelData::new(film, &IntegratorConfig::default());
        KernelGlobals::new(Arc::new(data), reference::kernel_functions(), 0, false)
    }

    #[test]
    fn test_pass_layout() {
        let film = KernelFilm::new(FilmPasses {
            sample_count: true,
            adaptive_sampling: true,
            cryptomatte_depth: 2,
            denoising: true,
        });
        assert_eq!(film.pass_combined, Some(0));
        assert_eq!(film.pass_sample_count, Some(4));
        assert_eq!(film.pass_adaptive_aux_buffer, Some(5));
        assert_eq!(film.pass_cryptomatte, Some(9));
        assert_eq!(film.pass_denoised, Some(13));
        assert_eq!(film.pass_stride, 16);
    }

    #[test]
    fn test_convert_uses_sample_count() {
        let film = KernelFilm::default();
        let kg = globals(film);
        let buffers = RenderBuffers::new(BufferParams::new(2, 1, film.pass_stride));
        let base = film.pass_stride;
        buffers.write(base, 2.0);
        buffers.write(base + 1, 4.0);
        buffers.write(base + 2, 8.0);
        buffers.write(base + 3, 0.0);
        buffers.write_u32(base + 4, 4);

        let pixel = film_convert_to_half_float(&kg, &buffers, 1, 1.0, PassMode::Noisy);
        assert_eq!(pixel[0].to_f32(), 0.5);
        assert_eq!(pixel[1].to_f32(), 1.0);
        assert_eq!(pixel[2].to_f32(), 2.0);
        assert_eq!(pixel[3].to_f32(), 1.0);

        // No denoised pass in this film: the noisy values are shown.
        let pixel = film_convert_to_half_float(&kg, &buffers, 1, 1.0, PassMode::Denoised);
        assert_eq!(pixel[0].to_f32(), 0.5);
    }

    #[test]
    fn test_convert_prefers_denoised_pass() {
        let film = KernelFilm::new(FilmPasses {
            denoising: true,
            ..Default::default()
        });
        let kg = globals(film);
        let buffers = RenderBuffers::new(BufferParams::new(1, 1, film.pass_stride));
        let combined = film.pass_combined.unwrap();
        let denoised = film.pass_denoised.unwrap();
        buffers.write(combined, 4.0);
        buffers.write(combined + 3, 2.0);
        buffers.write_u32(film.pass_sample_count.unwrap(), 4);
        buffers.write(denoised, 2.0);
        buffers.write(denoised + 1, 2.0);
        buffers.write(denoised + 2, 2.0);

        let noisy = film_convert_to_half_float(&kg, &buffers, 0, 1.0, PassMode::Noisy);
        let pixel = film_convert_to_half_float(&kg, &buffers, 0, 1.0, PassMode::Denoised);
        assert_eq!(noisy[0].to_f32(), 1.0);
        assert_eq!(pixel[0].to_f32(), 0.5);
        assert_eq!(pixel[1].to_f32(), 0.5);
        assert_eq!(pixel[2].to_f32(), 0.5);
        assert_eq!(pixel[3].to_f32(), 0.5);
    }

    #[test]
    fn test_cryptomatte_slots_sorted_by_weight() {
        let film = KernelFilm::new(FilmPasses {
            cryptomatte_depth: 3,
            ..Default::default()
        });
        let kg = globals(film);
        let buffers = RenderBuffers::new(BufferParams::new(1, 1, film.pass_stride));
        let base = film.pass_cryptomatte.unwrap();
        for (i, (id, weight)) in [(1.0, 0.2), (2.0, 0.5), (3.0, 0.3)].iter().enumerate() {
            buffers.write(base + 2 * i, *id);
            buffers.write(base + 2 * i + 1, *weight);
        }
        film_cryptomatte_post(&kg, &buffers, 0);
        let ids: Vec<f32> = (0..3).map(|i| buffers.read(base + 2 * i)).collect();
        assert_eq!(ids, vec![2.0, 3.0, 1.0]);
    }
}
