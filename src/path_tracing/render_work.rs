// src/path_tracing/render_work.rs
// What one `PathTrace::render()` call is asked to do, as decided by the outer scheduler

/// Sample range to path trace in this step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PathTraceWorkRange {
    pub start_sample: usize,
    pub num_samples: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AdaptiveSamplingWork {
    pub filter: bool,
    /// Overrides the configured threshold, e.g. a looser one for early passes
    pub threshold: Option<f32>,
    /// Re-open converged pixels before the check
    pub reset: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CryptomatteWork {
    pub postprocess: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TileWork {
    pub denoise: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FullWork {
    /// Hand the finished buffer to the write callback
    pub write: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RenderWork {
    /// 0 or 1 renders at full resolution
    pub resolution_divider: usize,
    /// Zero (or read through the buffer-read callback) before the first sample
    pub init_render_buffers: bool,
    pub path_trace: PathTraceWorkRange,
    pub adaptive_sampling: AdaptiveSamplingWork,
    pub cryptomatte: CryptomatteWork,
    pub tile: TileWork,
    pub full: FullWork,
    pub update_display: bool,
}

impl RenderWork {
    /// Render `num_samples` samples starting at `start_sample`, nothing else.
    pub fn samples(start_sample: usize, num_samples: usize) -> Self {
        Self {
            init_render_buffers: start_sample == 0,
            path_trace: PathTraceWorkRange {
                start_sample,
                num_samples,
            },
            ..Default::default()
        }
    }

    pub fn with_display_update(mut self) -> Self {
        self.update_display = true;
        self
    }

    pub fn with_denoise(mut self) -> Self {
        self.tile.denoise = true;
        self
    }

    pub fn with_adaptive_filter(mut self, threshold: Option<f32>, reset: bool) -> Self {
        self.adaptive_sampling = AdaptiveSamplingWork {
            filter: true,
            threshold,
            reset,
        };
        self
    }

    pub fn with_write(mut self) -> Self {
        self.full.write = true;
        self
    }

    /// True when there is nothing to do.
    pub fn is_empty(&self) -> bool {
        !self.init_render_buffers
            && self.path_trace.num_samples == 0
            && !self.adaptive_sampling.filter
            && !self.cryptomatte.postprocess
            && !self.tile.denoise
            && !self.full.write
            && !self.update_display
    }
}
