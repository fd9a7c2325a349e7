// src/path_tracing/tile.rs
// Tile sizing against the path-state budget of a device
// Picks power-of-two tiles with a moderate sample batch so many pixels are in flight at once
// RELEVANT FILES:src/path_tracing/work_tile.rs,src/path_tracing/wavefront/mod.rs

use glam::UVec2;

/// Tile dimensions plus the number of samples each pixel of the tile carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileSize {
    pub width: u32,
    pub height: u32,
    pub num_samples: u32,
}

impl TileSize {
    pub const fn new(width: u32, height: u32, num_samples: u32) -> Self {
        Self {
            width,
            height,
            num_samples,
        }
    }

    /// Number of path states the tile occupies when fully seeded.
    pub fn num_paths(&self) -> u64 {
        self.width as u64 * self.height as u64 * self.num_samples as u64
    }
}

fn round_down_to_power_of_two(x: u64) -> u64 {
    if x == 0 {
        return 0;
    }
    1 << (63 - x.leading_zeros())
}

fn round_up_to_power_of_two(x: u64) -> u64 {
    x.max(1).next_power_of_two()
}

fn round_sqrt(x: u64) -> u64 {
    (x as f64).sqrt().round() as u64
}

/// Compute the tile size that keeps `max_num_path_states` as busy as possible.
///
/// Prefers square power-of-two tiles with `~sqrt(spp / 2)` samples each over a
/// few huge tiles with deep sample ranges, since neighbouring pixels at nearby
/// samples execute more coherently.
pub fn tile_calculate_best_size(
    image_size: UVec2,
    num_samples: u32,
    max_num_path_states: u32,
) -> TileSize {
    if max_num_path_states == 1 {
        // Avoid rounding artifacts in the general path below.
        return TileSize::new(1, 1, 1);
    }

    let num_samples = num_samples.max(1);
    let capacity = max_num_path_states as u64;
    let num_pixels = image_size.x as u64 * image_size.y as u64;
    let num_pixel_samples = num_pixels * num_samples as u64;

    if capacity >= num_pixel_samples {
        // Whole image fits, schedule it at once.
        return TileSize::new(image_size.x, image_size.y, num_samples);
    }

    let num_path_states_per_sample = capacity / num_samples as u64;

    let mut tile_size = TileSize::new(1, 1, 1);

    if num_samples > 1 {
        let samples = round_up_to_power_of_two(round_sqrt(num_samples as u64 / 2));
        tile_size.num_samples = samples.min(num_samples as u64) as u32;
    }

    if num_path_states_per_sample == 0 {
        // Not even one pixel worth of samples fits: single pixel, as many samples as possible.
        tile_size.num_samples = tile_size.num_samples.min(max_num_path_states);
    } else {
        let mut side = round_down_to_power_of_two(round_sqrt(num_path_states_per_sample)).max(1);
        // round() can push the side past the budget (3 states -> 2x2), step back down.
        while side > 1 && side * side * tile_size.num_samples as u64 > capacity {
            side /= 2;
        }
        tile_size.width = side as u32;
        tile_size.height = side as u32;
    }

    debug_assert!(
        tile_size.num_paths() <= capacity,
        "tile {:?} exceeds path capacity {}",
        tile_size,
        capacity
    );

    tile_size
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_path_capacity() {
        assert_eq!(
            tile_calculate_best_size(UVec2::new(1920, 1080), 128, 1),
            TileSize::new(1, 1, 1)
        );
    }

    #[test]
    fn test_whole_image_fits() {
        assert_eq!(
            tile_calculate_best_size(UVec2::new(4, 4), 16, 1_048_576),
            TileSize::new(4, 4, 16)
        );
    }

    #[test]
    fn test_large_render() {
        let tile = tile_calculate_best_size(UVec2::new(4096, 4096), 4096, 1_048_576);
        assert_eq!(tile, TileSize::new(16, 16, 64));
        assert!(tile.num_paths() <= 1_048_576);
    }

    #[test]
    fn test_single_sample_uses_one_sample_tiles() {
        let tile = tile_calculate_best_size(UVec2::new(4096, 4096), 1, 65_536);
        assert_eq!(tile, TileSize::new(256, 256, 1));
    }

    #[test]
    fn test_more_samples_than_capacity() {
        let tile = tile_calculate_best_size(UVec2::new(64, 64), 4096, 16);
        assert_eq!((tile.width, tile.height), (1, 1));
        assert_eq!(tile.num_samples, 16);
    }

    #[test]
    fn test_power_of_two_helpers() {
        assert_eq!(round_down_to_power_of_two(0), 0);
        assert_eq!(round_down_to_power_of_two(1), 1);
        assert_eq!(round_down_to_power_of_two(3), 2);
        assert_eq!(round_down_to_power_of_two(1024), 1024);
        assert_eq!(round_up_to_power_of_two(0), 1);
        assert_eq!(round_up_to_power_of_two(5), 8);
        assert_eq!(round_up_to_power_of_two(64), 64);
        assert_eq!(round_sqrt(3), 2);
        assert_eq!(round_sqrt(1 << 40), 1 << 20);
    }

    #[test]
    fn test_odd_capacity_stays_within_budget() {
        let tile = tile_calculate_best_size(UVec2::new(100, 100), 1, 3);
        assert_eq!(tile, TileSize::new(1, 1, 1));
    }

    #[test]
    fn test_rounded_side_kept_when_it_fits() {
        // sqrt(255) rounds to 16: 16x16x64 paths fit well inside the budget.
        let tile = tile_calculate_best_size(UVec2::new(4096, 4096), 4096, 255 * 4096);
        assert_eq!(tile, TileSize::new(16, 16, 64));

        // sqrt(3) rounds to 2: 2x2 fits with one sample per tile, not with a bare 3-state pool.
        let tile = tile_calculate_best_size(UVec2::new(64, 64), 2, 7);
        assert_eq!(tile, TileSize::new(2, 2, 1));
        let tile = tile_calculate_best_size(UVec2::new(64, 64), 1, 3);
        assert_eq!(tile, TileSize::new(1, 1, 1));
        let tile = tile_calculate_best_size(UVec2::new(64, 64), 1, 4);
        assert_eq!(tile, TileSize::new(2, 2, 1));
    }
}
