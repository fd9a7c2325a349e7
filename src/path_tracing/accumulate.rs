// src/path_tracing/accumulate.rs
// Writing shading results into the render buffer
// Contributions are made finite and optionally clamped before they touch a pass

use glam::Vec3;

use crate::path_tracing::buffers::RenderBuffers;
use crate::path_tracing::kernel::KernelGlobals;
use crate::path_tracing::state::IntegratorState;

/// Replace NaN and infinities with zero.
#[inline]
pub fn ensure_finite(v: f32) -> f32 {
    if v.is_finite() {
        v
    } else {
        0.0
    }
}

#[inline]
pub fn ensure_finite3(v: Vec3) -> Vec3 {
    Vec3::new(ensure_finite(v.x), ensure_finite(v.y), ensure_finite(v.z))
}

/// Make a contribution safe to accumulate: finite, and scaled down to the
/// direct or indirect clamp limit when its component sum exceeds it.
pub fn accum_clamp(kg: &KernelGlobals, l: Vec3, bounce: u32) -> Vec3 {
    let l = ensure_finite3(l);
    let integrator = kg.integrator();
    let limit = if bounce == 0 {
        integrator.sample_clamp_direct
    } else {
        integrator.sample_clamp_indirect
    };
    if limit > 0.0 {
        let sum = l.x.abs() + l.y.abs() + l.z.abs();
        if sum > limit {
            return l * (limit / sum);
        }
    }
    l
}

/// First float of this path's pixel.
#[inline]
pub fn pixel_render_buffer_index(kg: &KernelGlobals, state: &IntegratorState) -> usize {
    state.path.render_pixel_index as usize * kg.film().pass_stride
}

#[inline]
pub fn write_pass_float(kg: &KernelGlobals, render_buffers: &RenderBuffers, index: usize, value: f32) {
    if kg.atomic_pass_write {
        render_buffers.add_atomic(index, value);
    } else {
        render_buffers.add_plain(index, value);
    }
}

pub fn write_pass_float3(kg: &KernelGlobals, render_buffers: &RenderBuffers, index: usize, value: Vec3) {
    write_pass_float(kg, render_buffers, index, value.x);
    write_pass_float(kg, render_buffers, index + 1, value.y);
    write_pass_float(kg, render_buffers, index + 2, value.z);
}

/// Count one more sample for the pixel. Returns the sample index to render:
/// the pixel's running count when the pass exists, `sample` otherwise.
pub fn accum_sample(
    kg: &KernelGlobals,
    render_buffers: &RenderBuffers,
    render_pixel_index: usize,
    sample: u32,
) -> u32 {
    let film = kg.film();
    match film.pass_sample_count {
        Some(pass) => {
            let index = render_pixel_index * film.pass_stride + pass;
            render_buffers.fetch_add_u32(index, 1)
        }
        None => sample,
    }
}

/// Even samples go into the adaptive aux pass (twice weighted) so the
/// convergence check can compare two half-estimates.
#[inline]
pub fn sample_is_even(sample: u32) -> bool {
    sample & 1 == 0
}

pub fn accum_combined_pass(
    kg: &KernelGlobals,
    state: &IntegratorState,
    contribution: Vec3,
    render_buffers: &RenderBuffers,
) {
    let film = kg.film();
    let base = pixel_render_buffer_index(kg, state);
    let contribution = accum_clamp(kg, contribution, state.path.bounce);

    if let Some(pass) = film.pass_combined {
        write_pass_float3(kg, render_buffers, base + pass, contribution);
    }
    if let Some(pass) = film.pass_adaptive_aux_buffer {
        if sample_is_even(state.path.sample) {
            write_pass_float3(kg, render_buffers, base + pass, contribution * 2.0);
        }
    }
}

/// Light that reached the pixel through a shadow ray.
pub fn accum_light(
    kg: &KernelGlobals,
    state: &IntegratorState,
    contribution: Vec3,
    render_buffers: &RenderBuffers,
) {
    let film = kg.film();
    let base = state.shadow_path.render_pixel_index as usize * film.pass_stride;
    let contribution = accum_clamp(kg, contribution, state.shadow_path.bounce);

    if let Some(pass) = film.pass_combined {
        write_pass_float3(kg, render_buffers, base + pass, contribution);
    }
    if let Some(pass) = film.pass_adaptive_aux_buffer {
        if sample_is_even(state.shadow_path.sample) {
            write_pass_float3(kg, render_buffers, base + pass, contribution * 2.0);
        }
    }
}

/// Background seen directly through the camera counts as transparency.
pub fn accum_transparent(
    kg: &KernelGlobals,
    state: &IntegratorState,
    transparent: f32,
    render_buffers: &RenderBuffers,
) {
    if let Some(pass) = kg.film().pass_combined {
        let index = pixel_render_buffer_index(kg, state) + pass + 3;
        write_pass_float(kg, render_buffers, index, ensure_finite(transparent));
    }
}
