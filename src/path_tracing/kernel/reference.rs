// src/path_tracing/kernel/reference.rs
// Reference kernel table: a procedural furnace scene with a fixed hit probability and albedo
// Used by the benchmark binary and by tests that need paths to bounce and terminate
// RELEVANT FILES:src/path_tracing/kernel/functions.rs,src/path_tracing/accumulate.rs

use glam::Vec3;

use super::{integrator_megakernel, IntegratorStage, KernelFunctions, KernelGlobals};
use crate::path_tracing::accumulate::{accum_combined_pass, accum_light, accum_sample, accum_transparent};
use crate::path_tracing::adaptive_sampling::{
    kernel_adaptive_sampling_convergence_check, kernel_adaptive_sampling_filter_x,
    kernel_adaptive_sampling_filter_y, kernel_need_sample_pixel,
};
use crate::path_tracing::buffers::RenderBuffers;
use crate::path_tracing::film::{film_convert_to_half_float, film_cryptomatte_post};
use crate::path_tracing::state::util::{
    copy_volume_stack_to_shadow, path_throughput, read_ray, shadow_throughput, write_ray,
    write_shadow_ray,
};
use crate::path_tracing::state::{
    IntegratorState, PathQueue, OBJECT_NONE, PATH_RAY_CAMERA, PATH_RAY_DIFFUSE, PATH_RAY_REFLECT,
    PATH_RAY_SHADOW, PRIMITIVE_NONE,
};
use crate::path_tracing::work_tile::KernelWorkTile;

pub const SURFACE_ALBEDO: f32 = 0.5;
pub const HIT_PROBABILITY: f32 = 0.5;
pub const SHADOW_VISIBILITY: f32 = 0.5;
pub const BACKGROUND_RADIANCE: Vec3 = Vec3::ONE;
pub const LIGHT_RADIANCE: Vec3 = Vec3::ONE;

const RNG_DIMENSIONS_PER_BOUNCE: u32 = 4;
const RNG_DIMENSIONS_PER_SAMPLE: u32 = 256;
const DIM_HIT: u32 = 0;
const DIM_SHADOW: u32 = 1;

#[inline]
pub fn hash_u32(mut x: u32) -> u32 {
    x ^= x >> 16;
    x = x.wrapping_mul(0x7feb_352d);
    x ^= x >> 15;
    x = x.wrapping_mul(0x846c_a68b);
    x ^= x >> 16;
    x
}

#[inline]
pub fn hash_uint2(a: u32, b: u32) -> u32 {
    hash_u32(a ^ hash_u32(b))
}

/// Uniform in [0, 1) from 24 hash bits.
#[inline]
fn hash_to_float(h: u32) -> f32 {
    (h >> 8) as f32 * (1.0 / (1u32 << 24) as f32)
}

fn path_rng(state: &IntegratorState, bounce: u32, dimension: u32) -> f32 {
    let offset = state
        .path
        .rng_offset
        .wrapping_add(bounce * RNG_DIMENSIONS_PER_BOUNCE + dimension);
    hash_to_float(hash_uint2(state.path.rng_hash, offset))
}

/// Set up pixel, sample and rng of a new path. `None` when the pixel needs no more samples.
fn init_path(
    kg: &KernelGlobals,
    state: &mut IntegratorState,
    tile: &KernelWorkTile,
    tile_work_index: u32,
    render_buffers: &RenderBuffers,
) -> Option<(u32, u32)> {
    let (x, y, tile_sample) = tile.work_pixel(tile_work_index);
    let render_pixel_index = tile.render_pixel_index(x, y);
    if !kernel_need_sample_pixel(kg, render_buffers, render_pixel_index) {
        return None;
    }
    let sample = accum_sample(kg, render_buffers, render_pixel_index, tile_sample);

    let path = &mut state.path;
    path.render_pixel_index = render_pixel_index as u32;
    path.sample = sample;
    path.bounce = 0;
    path.diffuse_bounce = 0;
    path.glossy_bounce = 0;
    path.transmission_bounce = 0;
    path.volume_bounce = 0;
    path.transparent_bounce = 0;
    path.rng_hash = hash_uint2(hash_uint2(x, y), kg.integrator().seed);
    path.rng_offset = sample.wrapping_mul(RNG_DIMENSIONS_PER_SAMPLE);
    path.mis_ray_pdf = 0.0;
    path.mis_ray_t = 0.0;
    path.min_ray_pdf = f32::MAX;
    path.throughput = [1.0; 3];
    path.diffuse_glossy_ratio = [1.0; 3];
    path.denoising_feature_throughput = [1.0; 3];
    state.shadow_path.queued_kernel = 0;
    Some((x, y))
}

pub fn integrator_init_from_camera(
    kg: &KernelGlobals,
    state: &mut IntegratorState,
    queue: &PathQueue<'_>,
    tile: &KernelWorkTile,
    tile_work_index: u32,
    render_buffers: &RenderBuffers,
) -> bool {
    let Some((x, y)) = init_path(kg, state, tile, tile_work_index, render_buffers) else {
        return false;
    };
    state.path.flag = PATH_RAY_CAMERA;
    write_ray(
        state,
        Vec3::new(x as f32 + 0.5, y as f32 + 0.5, 0.0),
        Vec3::Z,
        f32::MAX,
        0.0,
    );
    state.isect.prim = PRIMITIVE_NONE;
    state.isect.object = OBJECT_NONE;
    queue.path_init(state, IntegratorStage::IntersectClosest);
    true
}

/// Bake paths start on the surface point of the pixel and go straight to shading.
pub fn integrator_init_from_bake(
    kg: &KernelGlobals,
    state: &mut IntegratorState,
    queue: &PathQueue<'_>,
    tile: &KernelWorkTile,
    tile_work_index: u32,
    render_buffers: &RenderBuffers,
) -> bool {
    let Some((x, y)) = init_path(kg, state, tile, tile_work_index, render_buffers) else {
        return false;
    };
    state.path.flag = 0;
    write_ray(
        state,
        Vec3::new(x as f32 + 0.5, y as f32 + 0.5, 1.0),
        -Vec3::Z,
        0.0,
        0.0,
    );
    state.isect.t = 0.0;
    state.isect.prim = 0;
    state.isect.object = 0;
    state.isect.ng = [0.0, 0.0, -1.0];
    queue.path_init(state, IntegratorStage::ShadeSurface);
    true
}

pub fn integrator_intersect_closest(kg: &KernelGlobals, state: &mut IntegratorState, queue: &PathQueue<'_>) {
    let bounce = state.path.bounce;
    let hit = bounce < kg.integrator().max_bounce && path_rng(state, bounce, DIM_HIT) < HIT_PROBABILITY;

    let next = if hit {
        state.isect.t = 1.0;
        state.isect.u = 0.0;
        state.isect.v = 0.0;
        state.isect.prim = 0;
        state.isect.object = 0;
        state.isect.kind = 1;
        state.isect.ng = [0.0, 0.0, -1.0];
        IntegratorStage::ShadeSurface
    } else {
        state.isect.prim = PRIMITIVE_NONE;
        state.isect.object = OBJECT_NONE;
        IntegratorStage::ShadeBackground
    };
    queue.path_next(state, IntegratorStage::IntersectClosest, next);
}

pub fn integrator_intersect_shadow(_kg: &KernelGlobals, state: &mut IntegratorState, queue: &PathQueue<'_>) {
    let offset = state
        .path
        .rng_offset
        .wrapping_add(state.shadow_path.bounce * RNG_DIMENSIONS_PER_BOUNCE + DIM_SHADOW);
    let visible = hash_to_float(hash_uint2(state.path.rng_hash, offset)) < SHADOW_VISIBILITY;
    if visible {
        queue.shadow_path_next(
            state,
            IntegratorStage::IntersectShadow,
            IntegratorStage::ShadeShadow,
        );
    } else {
        state.shadow_path.num_hits += 1;
        queue.shadow_path_terminate(state, IntegratorStage::IntersectShadow);
    }
}

pub fn integrator_intersect_subsurface(_kg: &KernelGlobals, state: &mut IntegratorState, queue: &PathQueue<'_>) {
    queue.path_next(
        state,
        IntegratorStage::IntersectSubsurface,
        IntegratorStage::ShadeSurface,
    );
}

pub fn integrator_intersect_volume_stack(_kg: &KernelGlobals, state: &mut IntegratorState, queue: &PathQueue<'_>) {
    queue.path_next(
        state,
        IntegratorStage::IntersectVolumeStack,
        IntegratorStage::IntersectClosest,
    );
}

pub fn integrator_shade_background(
    kg: &KernelGlobals,
    state: &mut IntegratorState,
    queue: &PathQueue<'_>,
    render_buffers: &RenderBuffers,
) {
    let contribution = BACKGROUND_RADIANCE * path_throughput(state);
    accum_combined_pass(kg, state, contribution, render_buffers);
    if state.path.flag & PATH_RAY_CAMERA != 0 {
        accum_transparent(kg, state, 1.0, render_buffers);
    }
    queue.path_terminate(state, IntegratorStage::ShadeBackground);
}

pub fn integrator_shade_light(
    _kg: &KernelGlobals,
    state: &mut IntegratorState,
    queue: &PathQueue<'_>,
    _render_buffers: &RenderBuffers,
) {
    queue.path_next(state, IntegratorStage::ShadeLight, IntegratorStage::IntersectClosest);
}

pub fn integrator_shade_shadow(
    kg: &KernelGlobals,
    state: &mut IntegratorState,
    queue: &PathQueue<'_>,
    render_buffers: &RenderBuffers,
) {
    accum_light(kg, state, shadow_throughput(state), render_buffers);
    queue.shadow_path_terminate(state, IntegratorStage::ShadeShadow);
}

pub fn integrator_shade_surface(
    _kg: &KernelGlobals,
    state: &mut IntegratorState,
    queue: &PathQueue<'_>,
    _render_buffers: &RenderBuffers,
) {
    let throughput = path_throughput(state);
    let (origin, direction, _) = read_ray(state);
    let hit = origin + direction * state.isect.t;

    // One shadow ray per path at a time.
    if state.shadow_path.queued_kernel == 0 {
        let shadow = &mut state.shadow_path;
        shadow.render_pixel_index = state.path.render_pixel_index;
        shadow.sample = state.path.sample;
        shadow.bounce = state.path.bounce;
        shadow.transparent_bounce = state.path.transparent_bounce;
        shadow.flag = PATH_RAY_SHADOW;
        shadow.num_hits = 0;
        shadow.throughput = (throughput * SURFACE_ALBEDO * LIGHT_RADIANCE).to_array();
        shadow.diffuse_glossy_ratio = [1.0; 3];
        write_shadow_ray(state, hit, Vec3::Z, 1.0);
        copy_volume_stack_to_shadow(state);
        queue.shadow_path_init(state, IntegratorStage::IntersectShadow);
    }

    let time = state.ray.time;
    let path = &mut state.path;
    path.throughput = (throughput * SURFACE_ALBEDO).to_array();
    path.bounce += 1;
    path.diffuse_bounce += 1;
    path.flag = (path.flag & !PATH_RAY_CAMERA) | PATH_RAY_REFLECT | PATH_RAY_DIFFUSE;
    write_ray(state, hit, -direction, f32::MAX, time);
    queue.path_next(state, IntegratorStage::ShadeSurface, IntegratorStage::IntersectClosest);
}

pub fn integrator_shade_volume(
    _kg: &KernelGlobals,
    state: &mut IntegratorState,
    queue: &PathQueue<'_>,
    _render_buffers: &RenderBuffers,
) {
    let next = if state.isect.prim == PRIMITIVE_NONE {
        IntegratorStage::ShadeBackground
    } else {
        IntegratorStage::ShadeSurface
    };
    queue.path_next(state, IntegratorStage::ShadeVolume, next);
}

/// Expected pixel value of the scene for `max_bounce`, ignoring clamping.
pub fn expected_radiance(max_bounce: u32) -> f32 {
    // Each bounce: miss adds background, hit adds the visible part of the light
    // and continues with the albedo.
    let mut throughput = 1.0;
    let mut radiance = 0.0;
    for _ in 0..max_bounce {
        radiance += throughput * (1.0 - HIT_PROBABILITY);
        radiance += throughput * HIT_PROBABILITY * SURFACE_ALBEDO * SHADOW_VISIBILITY;
        throughput *= HIT_PROBABILITY * SURFACE_ALBEDO;
    }
    radiance + throughput
}

pub fn kernel_functions() -> KernelFunctions {
    KernelFunctions {
        integrator_init_from_camera,
        integrator_init_from_bake,
        integrator_intersect_closest,
        integrator_intersect_shadow,
        integrator_intersect_subsurface,
        integrator_intersect_volume_stack,
        integrator_shade_background,
        integrator_shade_light,
        integrator_shade_shadow,
        integrator_shade_surface,
        integrator_shade_volume,
        integrator_megakernel,
        adaptive_sampling_convergence_check: kernel_adaptive_sampling_convergence_check,
        adaptive_sampling_filter_x: kernel_adaptive_sampling_filter_x,
        adaptive_sampling_filter_y: kernel_adaptive_sampling_filter_y,
        cryptomatte_postprocess: film_cryptomatte_post,
        film_convert_to_half_float,
    }
}
