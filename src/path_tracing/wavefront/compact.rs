// src/path_tracing/wavefront/compact.rs
// Stream compaction of path slots into a dense index array
// RELEVANT FILES:src/path_tracing/wavefront/mod.rs,src/path_tracing/wavefront/gpu_compact.rs

use rayon::prelude::*;

use crate::config::CompactionBackend;
use crate::error::RenderResult;
use crate::path_tracing::kernel::CompactionKind;

/// Whether a slot belongs to the compacted set.
#[inline]
pub fn slot_matches(kind: CompactionKind, flag: u32, path_tag: u32, shadow_tag: u32) -> bool {
    match kind {
        CompactionKind::QueuedPaths => path_tag == flag,
        CompactionKind::QueuedShadowPaths => shadow_tag == flag,
        CompactionKind::TerminatedPaths => path_tag == 0 && shadow_tag == 0,
    }
}

/// Produces the indices of matching slots in `[0, work_size)`, ascending.
pub trait PathCompactor: Send {
    fn name(&self) -> &'static str;

    /// Fill `queued_paths` and return how many slots matched.
    #[allow(clippy::too_many_arguments)]
    fn compact(
        &mut self,
        kind: CompactionKind,
        flag: u32,
        path_tags: &[u32],
        shadow_tags: &[u32],
        work_size: usize,
        threads_per_block: usize,
        queued_paths: &mut Vec<u32>,
    ) -> RenderResult<usize>;
}

/// Block-wise compaction on the rayon pool: every block of `threads_per_block`
/// slots collects its matches locally, blocks are concatenated in order.
#[derive(Debug, Default)]
pub struct HostCompactor;

impl PathCompactor for HostCompactor {
    fn name(&self) -> &'static str {
        "host"
    }

    fn compact(
        &mut self,
        kind: CompactionKind,
        flag: u32,
        path_tags: &[u32],
        shadow_tags: &[u32],
        work_size: usize,
        threads_per_block: usize,
        queued_paths: &mut Vec<u32>,
    ) -> RenderResult<usize> {
        let work_size = work_size.min(path_tags.len()).min(shadow_tags.len());
        let block = threads_per_block.max(1);

        let blocks: Vec<Vec<u32>> = path_tags[..work_size]
            .par_chunks(block)
            .zip(shadow_tags[..work_size].par_chunks(block))
            .enumerate()
            .map(|(block_index, (paths, shadows))| {
                let base = block_index * block;
                paths
                    .iter()
                    .zip(shadows)
                    .enumerate()
                    .filter(|(_, (p, s))| slot_matches(kind, flag, **p, **s))
                    .map(|(i, _)| (base + i) as u32)
                    .collect()
            })
            .collect();

        queued_paths.clear();
        for indices in blocks {
            queued_paths.extend_from_slice(&indices);
        }
        Ok(queued_paths.len())
    }
}

pub fn create_compactor(backend: CompactionBackend) -> RenderResult<Box<dyn PathCompactor>> {
    match backend {
        CompactionBackend::Host => Ok(Box::new(HostCompactor)),
        #[cfg(feature = "gpu")]
        CompactionBackend::Wgpu => Ok(Box::new(super::gpu_compact::WgpuCompactor::new()?)),
        #[cfg(not(feature = "gpu"))]
        CompactionBackend::Wgpu => Err(crate::config::ConfigError::new(
            "compaction = \"wgpu\" requires the `gpu` feature",
        )
        .into()),
    }
}
