// src/path_tracing/kernel/megakernel.rs
// Runs a single path through every queued stage until it and its shadow ray terminate

use log::error;

use super::KernelGlobals;
use crate::path_tracing::buffers::RenderBuffers;
use crate::path_tracing::state::{IntegratorState, PathQueue};

/// Upper bound on stage executions for one path; a kernel that never retires
/// its path would otherwise hang the worker.
const MAX_MEGAKERNEL_ITERATIONS: usize = 1 << 16;

pub fn integrator_megakernel(
    kg: &KernelGlobals,
    state: &mut IntegratorState,
    queue: &PathQueue<'_>,
    render_buffers: &RenderBuffers,
) {
    let kernels = &kg.kernels;
    for _ in 0..MAX_MEGAKERNEL_ITERATIONS {
        // Shadow rays first, the main path may overwrite shadow state on its next bounce.
        if let Some(stage) = state.shadow_path_stage() {
            kernels.run_stage(stage, kg, state, queue, render_buffers);
            continue;
        }
        match state.path_stage() {
            Some(stage) => kernels.run_stage(stage, kg, state, queue, render_buffers),
            None => return,
        }
    }

    error!(
        "Path for pixel {} did not terminate after {} stages",
        state.path.render_pixel_index, MAX_MEGAKERNEL_ITERATIONS
    );
    if let Some(stage) = state.shadow_path_stage() {
        queue.shadow_path_terminate(state, stage);
    }
    if let Some(stage) = state.path_stage() {
        queue.path_terminate(state, stage);
    }
}
