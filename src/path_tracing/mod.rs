// src/path_tracing/mod.rs
// Path-state scheduling for the integrator: tiles, the state pool, device queues, per-device work and the orchestrator.
// Kernels are supplied by the caller as a function table; the reference table drives tests and the bench.
// RELEVANT FILES:src/path_tracing/path_trace.rs,src/path_tracing/wavefront/mod.rs,src/path_tracing/work/mod.rs,src/lib.rs

pub mod accumulate;
pub mod adaptive_sampling;
pub mod buffers;
pub mod denoiser;
pub mod display;
pub mod film;
pub mod kernel;
pub mod path_trace;
pub mod render_work;
pub mod state;
pub mod tile;
pub mod wavefront;
pub mod work;
pub mod work_balancer;
pub mod work_tile;

pub use buffers::{BufferParams, RenderBuffers};
pub use path_trace::{CancelHandle, PathTrace, PathTraceState};
pub use render_work::RenderWork;
pub use tile::{tile_calculate_best_size, TileSize};
pub use work_tile::{KernelWorkTile, WorkTileScheduler};
