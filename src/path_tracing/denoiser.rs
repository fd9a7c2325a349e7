// src/path_tracing/denoiser.rs
// Denoiser hook run on the combined big-tile buffer, writing the denoised pass
// RELEVANT FILES:src/path_tracing/path_trace.rs,src/path_tracing/film.rs

use crate::error::{RenderError, RenderResult};
use crate::path_tracing::buffers::{BufferParams, RenderBuffers};
use crate::path_tracing::film::{film_get_pass_pixel_float4, film_get_scale, KernelFilm};

/// Denoises the combined pass of a render buffer into its denoised pass. The
/// combined pass itself keeps the noisy samples so rendering can continue.
pub trait Denoiser: Send {
    fn name(&self) -> &'static str;

    fn denoise_buffer(
        &mut self,
        params: &BufferParams,
        film: &KernelFilm,
        render_buffers: &RenderBuffers,
        num_samples: usize,
    ) -> RenderResult<()>;
}

/// Box filter over the normalized combined pass. Mostly useful headless and
/// as a stand-in when no learned denoiser is available.
#[derive(Debug, Clone)]
pub struct BoxFilterDenoiser {
    radius: usize,
}

impl BoxFilterDenoiser {
    pub fn new(radius: usize) -> Self {
        Self { radius }
    }
}

impl Default for BoxFilterDenoiser {
    fn default() -> Self {
        Self::new(1)
    }
}

impl Denoiser for BoxFilterDenoiser {
    fn name(&self) -> &'static str {
        "box"
    }

    fn denoise_buffer(
        &mut self,
        params: &BufferParams,
        film: &KernelFilm,
        render_buffers: &RenderBuffers,
        num_samples: usize,
    ) -> RenderResult<()> {
        let pass_combined = film
            .pass_combined
            .ok_or_else(|| RenderError::render("Denoising requires the combined pass"))?;
        let pass_denoised = film
            .pass_denoised
            .ok_or_else(|| RenderError::render("Film has no denoised pass to write into"))?;
        let (width, height) = (params.width, params.height);
        let default_scale = if num_samples > 0 { 1.0 / num_samples as f32 } else { 0.0 };

        let scales: Vec<f32> = (0..width * height)
            .map(|pixel| film_get_scale(film, render_buffers, pixel * film.pass_stride, default_scale))
            .collect();
        let noisy: Vec<[f32; 4]> = scales
            .iter()
            .enumerate()
            .map(|(pixel, &scale)| {
                film_get_pass_pixel_float4(render_buffers, pixel * film.pass_stride + pass_combined, scale)
            })
            .collect();

        let r = self.radius as isize;
        for (pixel, &scale) in scales.iter().enumerate() {
            let (x, y) = ((pixel % width) as isize, (pixel / width) as isize);
            let mut sum = [0.0f32; 3];
            let mut n = 0.0f32;
            for ny in (y - r).max(0)..=(y + r).min(height as isize - 1) {
                for nx in (x - r).max(0)..=(x + r).min(width as isize - 1) {
                    let v = noisy[ny as usize * width + nx as usize];
                    for c in 0..3 {
                        sum[c] += v[c];
                    }
                    n += 1.0;
                }
            }
            // Stored unnormalized so display conversion applies the pixel's own scale.
            let index = pixel * film.pass_stride + pass_denoised;
            for (c, s) in sum.iter().enumerate() {
                let value = if scale > 0.0 { s / n / scale } else { 0.0 };
                render_buffers.write(index + c, value);
            }
        }

        log::debug!("Denoised {}x{} at {} spp with radius {}", width, height, num_samples, self.radius);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path_tracing::film::FilmPasses;

    fn denoising_film() -> KernelFilm {
        KernelFilm::new(FilmPasses {
            denoising: true,
            ..Default::default()
        })
    }

    #[test]
    fn test_box_filter_averages_neighbours() {
        let film = denoising_film();
        let params = BufferParams::new(3, 1, film.pass_stride);
        let buffers = RenderBuffers::new(params);
        let combined = film.pass_combined.unwrap();
        let denoised = film.pass_denoised.unwrap();
        let sample_count = film.pass_sample_count.unwrap();
        for pixel in 0..3 {
            buffers.write_u32(pixel * film.pass_stride + sample_count, 1);
        }
        // Middle pixel has twice the samples, so its stored value is scaled up.
        buffers.write_u32(film.pass_stride + sample_count, 2);
        buffers.write(film.pass_stride + combined, 6.0);

        let mut denoiser = BoxFilterDenoiser::new(1);
        denoiser.denoise_buffer(&params, &film, &buffers, 1).unwrap();

        let read = |pixel: usize| buffers.read(pixel * film.pass_stride + denoised);
        assert!((read(0) - 1.5).abs() < 1e-6);
        assert!((read(1) - 2.0).abs() < 1e-6);
        assert!((read(2) - 1.5).abs() < 1e-6);
        // The noisy pass is left alone.
        assert_eq!(buffers.read(film.pass_stride + combined), 6.0);
    }

    #[test]
    fn test_missing_denoised_pass_is_an_error() {
        let film = KernelFilm::default();
        let params = BufferParams::new(1, 1, film.pass_stride);
        let buffers = RenderBuffers::new(params);
        let err = BoxFilterDenoiser::default()
            .denoise_buffer(&params, &film, &buffers, 1)
            .unwrap_err();
        assert_eq!(err.category(), "Render");
    }

    #[test]
    fn test_missing_combined_pass_is_an_error() {
        let mut film = denoising_film();
        film.pass_combined = None;
        let params = BufferParams::new(1, 1, film.pass_stride);
        let buffers = RenderBuffers::new(params);
        let err = BoxFilterDenoiser::default()
            .denoise_buffer(&params, &film, &buffers, 1)
            .unwrap_err();
        assert_eq!(err.category(), "Render");
    }
}
