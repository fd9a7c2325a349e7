// src/path_tracing/work_balancer.rs
// Splits the frame between devices in proportion to their measured throughput
// RELEVANT FILES:src/path_tracing/path_trace.rs,src/path_tracing/buffers.rs

use std::time::Duration;

use crate::path_tracing::buffers::BufferParams;

/// Weights closer than this are not worth a reslice.
const WEIGHT_CHANGE_THRESHOLD: f64 = 0.02;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WorkBalanceInfo {
    /// Time spent on path tracing since the last rebalance
    pub time_spent: Duration,
    /// Share of the frame, all weights sum to 1
    pub weight: f64,
}

impl Default for WorkBalanceInfo {
    fn default() -> Self {
        Self {
            time_spent: Duration::ZERO,
            weight: 1.0,
        }
    }
}

/// Equal share for every device.
pub fn work_balance_do_initial(infos: &mut [WorkBalanceInfo]) {
    if infos.is_empty() {
        return;
    }
    let weight = 1.0 / infos.len() as f64;
    for info in infos.iter_mut() {
        info.weight = weight;
        info.time_spent = Duration::ZERO;
    }
}

/// Move work towards devices which finished their share faster. Returns true
/// when any weight changed enough to reslice the frame. Times are reset either way.
pub fn work_balance_do_rebalance(infos: &mut [WorkBalanceInfo]) -> bool {
    if infos.len() < 2 {
        for info in infos.iter_mut() {
            info.time_spent = Duration::ZERO;
        }
        return false;
    }
    // Nothing measured yet.
    if infos.iter().any(|info| info.time_spent.is_zero()) {
        return false;
    }

    let throughput: Vec<f64> = infos
        .iter()
        .map(|info| info.weight / info.time_spent.as_secs_f64())
        .collect();
    let total: f64 = throughput.iter().sum();
    if !total.is_finite() || total <= 0.0 {
        return false;
    }

    let mut changed = false;
    for (info, t) in infos.iter_mut().zip(throughput) {
        let weight = t / total;
        changed |= (weight - info.weight).abs() > WEIGHT_CHANGE_THRESHOLD;
        info.weight = weight;
        info.time_spent = Duration::ZERO;
    }

    if changed {
        log::debug!(
            "Rebalanced work weights: {:?}",
            infos.iter().map(|info| info.weight).collect::<Vec<_>>()
        );
    }
    changed
}

/// Horizontal slices of `big_tile`, one per weight. Every slice but the last
/// is at least one row tall while rows remain; the last takes what is left.
pub fn slice_big_tile(big_tile: &BufferParams, infos: &[WorkBalanceInfo]) -> Vec<BufferParams> {
    let mut slices = Vec::with_capacity(infos.len());
    let mut current_y = 0;

    for (i, info) in infos.iter().enumerate() {
        let remaining = big_tile.height - current_y;
        let height = if i + 1 == infos.len() {
            remaining
        } else {
            let rows = (big_tile.height as f64 * info.weight).round() as usize;
            rows.max(1).min(remaining)
        };

        let mut params = *big_tile;
        params.full_y = big_tile.full_y + current_y;
        params.height = height;
        slices.push(params);
        current_y += height;
    }

    slices
}

#[cfg(test)]
mod tests {
    use super::*;

    fn infos(n: usize) -> Vec<WorkBalanceInfo> {
        let mut infos = vec![WorkBalanceInfo::default(); n];
        work_balance_do_initial(&mut infos);
        infos
    }

    #[test]
    fn test_initial_weights_are_equal() {
        let infos = infos(4);
        for info in &infos {
            assert!((info.weight - 0.25).abs() < 1e-12);
        }
    }

    #[test]
    fn test_rebalance_favours_faster_device() {
        let mut infos = infos(2);
        infos[0].time_spent = Duration::from_millis(100);
        infos[1].time_spent = Duration::from_millis(300);

        assert!(work_balance_do_rebalance(&mut infos));
        assert!((infos[0].weight - 0.75).abs() < 1e-9);
        assert!((infos[1].weight - 0.25).abs() < 1e-9);
        assert!(infos.iter().all(|info| info.time_spent.is_zero()));
    }

    #[test]
    fn test_small_change_is_not_reported() {
        let mut infos = infos(2);
        infos[0].time_spent = Duration::from_millis(100);
        infos[1].time_spent = Duration::from_millis(101);
        assert!(!work_balance_do_rebalance(&mut infos));
    }

    #[test]
    fn test_slices_cover_the_big_tile() {
        let big_tile = BufferParams::new(8, 10, 4);
        let mut infos = infos(3);
        infos[0].weight = 0.5;
        infos[1].weight = 0.3;
        infos[2].weight = 0.2;

        let slices = slice_big_tile(&big_tile, &infos);
        assert_eq!(slices.iter().map(|s| s.height).collect::<Vec<_>>(), vec![5, 3, 2]);
        assert_eq!(slices[1].full_y, 5);
        assert_eq!(slices[2].full_y, 8);
        assert!(slices.iter().all(|s| s.width == 8));
    }

    #[test]
    fn test_more_devices_than_rows() {
        let big_tile = BufferParams::new(4, 1, 4);
        let slices = slice_big_tile(&big_tile, &infos(3));
        assert_eq!(slices.iter().map(|s| s.height).sum::<usize>(), 1);
        assert_eq!(slices[0].height, 1);
        assert_eq!(slices[2].height, 0);
    }
}
