// src/path_tracing/state/util.rs
// Queue-tag transitions and small state accessors used by kernels
// Tag changes go through PathQueue so device counters always match the tags

use glam::Vec3;

use super::{IntegratorState, INTEGRATOR_VOLUME_STACK_SIZE};
use crate::path_tracing::kernel::IntegratorStage;
use crate::path_tracing::wavefront::queues::IntegratorQueueCounter;

/// Handle kernels use to move a path between stages.
///
/// On the CPU there is no queue and only the tag changes; on a wavefront
/// device every transition also updates the per-stage atomic counters.
#[derive(Clone, Copy, Debug)]
pub struct PathQueue<'a> {
    counter: Option<&'a IntegratorQueueCounter>,
}

impl<'a> PathQueue<'a> {
    pub const fn host() -> Self {
        Self { counter: None }
    }

    pub fn device(counter: &'a IntegratorQueueCounter) -> Self {
        Self {
            counter: Some(counter),
        }
    }

    pub fn path_init(&self, state: &mut IntegratorState, next: IntegratorStage) {
        debug_assert!(!next.is_shadow());
        if let Some(counter) = self.counter {
            counter.increment(next);
        }
        state.path.queued_kernel = next.flag();
    }

    pub fn path_next(
        &self,
        state: &mut IntegratorState,
        current: IntegratorStage,
        next: IntegratorStage,
    ) {
        debug_assert_eq!(state.path.queued_kernel, current.flag());
        if let Some(counter) = self.counter {
            counter.decrement(current);
            counter.increment(next);
        }
        state.path.queued_kernel = next.flag();
    }

    pub fn path_terminate(&self, state: &mut IntegratorState, current: IntegratorStage) {
        debug_assert_eq!(state.path.queued_kernel, current.flag());
        if let Some(counter) = self.counter {
            counter.decrement(current);
        }
        state.path.queued_kernel = 0;
    }

    pub fn shadow_path_init(&self, state: &mut IntegratorState, next: IntegratorStage) {
        debug_assert!(next.is_shadow());
        debug_assert_eq!(state.shadow_path.queued_kernel, 0);
        if let Some(counter) = self.counter {
            counter.increment(next);
        }
        state.shadow_path.queued_kernel = next.flag();
    }

    pub fn shadow_path_next(
        &self,
        state: &mut IntegratorState,
        current: IntegratorStage,
        next: IntegratorStage,
    ) {
        debug_assert_eq!(state.shadow_path.queued_kernel, current.flag());
        if let Some(counter) = self.counter {
            counter.decrement(current);
            counter.increment(next);
        }
        state.shadow_path.queued_kernel = next.flag();
    }

    pub fn shadow_path_terminate(&self, state: &mut IntegratorState, current: IntegratorStage) {
        debug_assert_eq!(state.shadow_path.queued_kernel, current.flag());
        if let Some(counter) = self.counter {
            counter.decrement(current);
        }
        state.shadow_path.queued_kernel = 0;
    }
}

pub fn write_ray(state: &mut IntegratorState, p: Vec3, d: Vec3, t: f32, time: f32) {
    state.ray.p = p.to_array();
    state.ray.d = d.to_array();
    state.ray.t = t;
    state.ray.time = time;
}

pub fn read_ray(state: &IntegratorState) -> (Vec3, Vec3, f32) {
    (
        Vec3::from_array(state.ray.p),
        Vec3::from_array(state.ray.d),
        state.ray.t,
    )
}

pub fn write_shadow_ray(state: &mut IntegratorState, p: Vec3, d: Vec3, t: f32) {
    state.shadow_ray.p = p.to_array();
    state.shadow_ray.d = d.to_array();
    state.shadow_ray.t = t;
    state.shadow_ray.time = state.ray.time;
}

pub fn path_throughput(state: &IntegratorState) -> Vec3 {
    Vec3::from_array(state.path.throughput)
}

pub fn shadow_throughput(state: &IntegratorState) -> Vec3 {
    Vec3::from_array(state.shadow_path.throughput)
}

/// Shadow rays start inside the same volumes as the path that spawned them.
pub fn copy_volume_stack_to_shadow(state: &mut IntegratorState) {
    state.shadow_volume_stack = state.volume_stack;
}

/// Entries in use, up to the first empty shader.
pub fn volume_stack_len(state: &IntegratorState) -> usize {
    state
        .volume_stack
        .iter()
        .take_while(|entry| entry.shader != 0)
        .count()
        .min(INTEGRATOR_VOLUME_STACK_SIZE)
}
