// src/path_tracing/work_tile.rs
// Work tiles and the scheduler that hands them out tile by tile, sample range by sample range
// RELEVANT FILES:src/path_tracing/tile.rs,src/path_tracing/work/wavefront.rs,src/path_tracing/wavefront/mod.rs

use glam::UVec2;

use crate::path_tracing::buffers::BufferParams;
use crate::path_tracing::tile::{tile_calculate_best_size, TileSize};

/// A rectangle of pixels and the samples to render for each of them.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct KernelWorkTile {
    pub x: u32,            // full-frame position
    pub y: u32,
    pub w: u32,
    pub h: u32,
    pub start_sample: u32,
    pub num_samples: u32,
    pub offset: i32,       // render_pixel_index = offset + x + y * stride
    pub stride: u32,
}

impl KernelWorkTile {
    /// Paths this tile seeds.
    pub fn work_size(&self) -> usize {
        self.w as usize * self.h as usize * self.num_samples as usize
    }

    /// Full-frame pixel and sample of a work item. Samples of one pixel are adjacent.
    pub fn work_pixel(&self, work_index: u32) -> (u32, u32, u32) {
        let pixel = work_index / self.num_samples;
        let sample_offset = work_index - pixel * self.num_samples;
        let y = pixel / self.w;
        let x = pixel - y * self.w;
        (self.x + x, self.y + y, self.start_sample + sample_offset)
    }

    pub fn render_pixel_index(&self, x: u32, y: u32) -> usize {
        (self.offset as i64 + x as i64 + y as i64 * self.stride as i64) as usize
    }
}

/// Splits a buffer into tiles sized for the path-state pool and iterates them
/// for every sample batch in turn.
#[derive(Debug, Clone, Default)]
pub struct WorkTileScheduler {
    full_x: u32,
    full_y: u32,
    image_size: UVec2,
    offset: i32,
    stride: u32,
    start_sample: u32,
    num_samples: u32,
    tile_size: Option<TileSize>,
    num_tiles_x: u32,
    num_tiles_per_sample_range: u32,
    total_work_size: u32,
    next_work_index: u32,
}

impl WorkTileScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(
        &mut self,
        buffer_params: &BufferParams,
        start_sample: usize,
        num_samples: usize,
        max_num_path_states: usize,
    ) {
        let (offset, stride) = buffer_params.get_offset_stride();
        self.full_x = buffer_params.full_x as u32;
        self.full_y = buffer_params.full_y as u32;
        self.image_size = UVec2::new(buffer_params.width as u32, buffer_params.height as u32);
        self.offset = offset as i32;
        self.stride = stride as u32;
        self.start_sample = start_sample as u32;
        self.num_samples = num_samples as u32;
        self.next_work_index = 0;

        if self.image_size.x == 0 || self.image_size.y == 0 || num_samples == 0 {
            self.tile_size = None;
            self.total_work_size = 0;
            return;
        }

        let tile_size = tile_calculate_best_size(
            self.image_size,
            self.num_samples,
            max_num_path_states as u32,
        );
        self.num_tiles_x = self.image_size.x.div_ceil(tile_size.width);
        let num_tiles_y = self.image_size.y.div_ceil(tile_size.height);
        self.num_tiles_per_sample_range = self.num_tiles_x * num_tiles_y;
        let num_sample_ranges = self.num_samples.div_ceil(tile_size.num_samples);
        self.total_work_size = self.num_tiles_per_sample_range * num_sample_ranges;
        self.tile_size = Some(tile_size);

        log::debug!(
            "Work tiles {}x{}x{} for {}x{} pixels, {} tiles",
            tile_size.width,
            tile_size.height,
            tile_size.num_samples,
            self.image_size.x,
            self.image_size.y,
            self.total_work_size
        );
    }

    pub fn tile_size(&self) -> Option<TileSize> {
        self.tile_size
    }

    pub fn total_tiles(&self) -> usize {
        self.total_work_size as usize
    }

    pub fn remaining_tiles(&self) -> usize {
        (self.total_work_size - self.next_work_index) as usize
    }

    fn tile_at(&self, work_index: u32, tile_size: TileSize) -> KernelWorkTile {
        let sample_range_index = work_index / self.num_tiles_per_sample_range;
        let tile_index = work_index - sample_range_index * self.num_tiles_per_sample_range;
        let tile_y = tile_index / self.num_tiles_x;
        let tile_x = tile_index - tile_y * self.num_tiles_x;

        let x = tile_x * tile_size.width;
        let y = tile_y * tile_size.height;
        let start_sample = sample_range_index * tile_size.num_samples;

        KernelWorkTile {
            x: self.full_x + x,
            y: self.full_y + y,
            // Clip at the image edge and at the end of the sample range.
            w: tile_size.width.min(self.image_size.x - x),
            h: tile_size.height.min(self.image_size.y - y),
            start_sample: self.start_sample + start_sample,
            num_samples: tile_size.num_samples.min(self.num_samples - start_sample),
            offset: self.offset,
            stride: self.stride,
        }
    }

    /// Next tile, unless exhausted or it would need more than `max_work_size`
    /// paths (0 = no limit). A tile that does not fit is handed out later.
    pub fn get_work(&mut self, max_work_size: usize) -> Option<KernelWorkTile> {
        let tile_size = self.tile_size?;
        if self.next_work_index >= self.total_work_size {
            return None;
        }
        let tile = self.tile_at(self.next_work_index, tile_size);
        if max_work_size > 0 && tile.work_size() > max_work_size {
            return None;
        }
        self.next_work_index += 1;
        Some(tile)
    }
}

impl Iterator for WorkTileScheduler {
    type Item = KernelWorkTile;

    fn next(&mut self) -> Option<Self::Item> {
        self.get_work(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(width: usize, height: usize) -> BufferParams {
        BufferParams::new(width, height, 4)
    }

    #[test]
    fn test_whole_image_single_tile() {
        let mut scheduler = WorkTileScheduler::new();
        scheduler.reset(&params(4, 4), 0, 16, 1 << 20);
        let tiles: Vec<_> = scheduler.collect();
        assert_eq!(tiles.len(), 1);
        assert_eq!((tiles[0].w, tiles[0].h, tiles[0].num_samples), (4, 4, 16));
    }

    #[test]
    fn test_edge_tiles_are_clipped() {
        let mut scheduler = WorkTileScheduler::new();
        // 64 paths, 1 sample: 8x8 tiles over a 20x10 image.
        scheduler.reset(&params(20, 10), 0, 1, 64);
        let tiles: Vec<_> = scheduler.collect();
        assert_eq!(tiles.len(), 6);
        assert_eq!((tiles[2].x, tiles[2].w), (16, 4));
        assert_eq!((tiles[5].y, tiles[5].h), (8, 2));
        let covered: usize = tiles.iter().map(|t| t.work_size()).sum();
        assert_eq!(covered, 200);
    }

    #[test]
    fn test_sample_ranges_cover_all_samples() {
        let mut scheduler = WorkTileScheduler::new();
        scheduler.reset(&params(8, 8), 10, 50, 256);
        let tile_size = scheduler.tile_size().unwrap();
        let tiles: Vec<_> = scheduler.collect();
        let per_pixel: usize = tiles
            .iter()
            .filter(|t| t.x == 0 && t.y == 0)
            .map(|t| t.num_samples as usize)
            .sum();
        assert_eq!(per_pixel, 50);
        assert!(tiles.iter().all(|t| t.work_size() as u64 <= tile_size.num_paths()));
        assert_eq!(tiles.first().unwrap().start_sample, 10);
    }

    #[test]
    fn test_work_pixel_mapping() {
        let tile = KernelWorkTile {
            x: 4,
            y: 2,
            w: 2,
            h: 2,
            start_sample: 8,
            num_samples: 3,
            offset: 0,
            stride: 16,
        };
        assert_eq!(tile.work_pixel(0), (4, 2, 8));
        assert_eq!(tile.work_pixel(2), (4, 2, 10));
        assert_eq!(tile.work_pixel(3), (5, 2, 8));
        assert_eq!(tile.work_pixel(11), (5, 3, 10));
        assert_eq!(tile.render_pixel_index(5, 3), 53);
    }

    #[test]
    fn test_tile_too_large_is_retried() {
        let mut scheduler = WorkTileScheduler::new();
        scheduler.reset(&params(4, 4), 0, 1, 16);
        assert!(scheduler.get_work(8).is_none());
        assert_eq!(scheduler.remaining_tiles(), 1);
        assert!(scheduler.get_work(16).is_some());
        assert!(scheduler.get_work(16).is_none());
    }
}
