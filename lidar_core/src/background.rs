//! Per-cell background model and foreground extraction (spec §4.2).
//!
//! A dense polar grid of exponentially-smoothed range cells. Classifies
//! each point in a frame as background (static scene) or foreground
//! (moving/new) while updating the grid in place.

use crate::config::PipelineConfig;
use crate::error::BackgroundError;
use crate::types::PolarPoint;

const ONE_MS_NS: u64 = 1_000_000;
const ACCEPTANCE_BUCKET_WIDTH_M: f64 = 2.0;
const ACCEPTANCE_BUCKETS: usize = 32;

/// One entry of the polar grid, indexed by `(ring, azimuth_bin)` (spec §3).
#[derive(Debug, Clone, Copy, Default)]
pub struct BackgroundCell {
    /// `None` iff `times_seen_count == 0`.
    pub average_range_m: Option<f64>,
    pub range_spread_m: f64,
    pub times_seen_count: u32,
    pub recent_foreground_count: u16,
    /// `0` means not frozen.
    pub frozen_until_ns: u64,
    pub locked_baseline_m: Option<f64>,
    pub locked_spread_m: f64,
    pub locked_at_count: u32,
    pub last_update_ns: u64,
}

impl BackgroundCell {
    fn is_frozen(&self, now_ns: u64) -> bool {
        self.frozen_until_ns != 0 && now_ns < self.frozen_until_ns
    }

    fn has_valid_locked_baseline(&self, threshold: u32) -> bool {
        self.locked_baseline_m.is_some() && self.locked_at_count >= threshold
    }
}

/// A dense polar grid of [`BackgroundCell`]s, one per sensor (spec §3).
#[derive(Debug, Clone)]
pub struct BackgroundGrid {
    rings: usize,
    azimuth_bins: usize,
    cells: Vec<BackgroundCell>,
    ring_elevations_deg: Vec<Option<f64>>,
    acceptance_histograms: Vec<[u32; ACCEPTANCE_BUCKETS]>,
    settling_complete: bool,
    warmup_frames_remaining: u32,
    start_time_ns: Option<u64>,
    change_counter: u64,
}

impl BackgroundGrid {
    pub fn new(rings: usize, azimuth_bins: usize, config: &PipelineConfig) -> Result<Self, BackgroundError> {
        if rings == 0 || azimuth_bins == 0 {
            return Err(BackgroundError::EmptyGrid);
        }
        Ok(Self {
            rings,
            azimuth_bins,
            cells: vec![BackgroundCell::default(); rings * azimuth_bins],
            ring_elevations_deg: vec![None; rings],
            acceptance_histograms: vec![[0u32; ACCEPTANCE_BUCKETS]; rings],
            settling_complete: false,
            // Open question (spec §9): the source only initialises the
            // warmup counter on the first frame. We initialise it eagerly
            // at construction so `warmup_min_frames == 0` and
            // `warmup_duration_nanos == 0` both behave predictably (no
            // warmup at all) instead of depending on frame-callback order.
            warmup_frames_remaining: config.warmup_min_frames,
            start_time_ns: None,
            change_counter: 0,
        })
    }

    pub fn dimensions(&self) -> (usize, usize) {
        (self.rings, self.azimuth_bins)
    }

    pub fn settling_complete(&self) -> bool {
        self.settling_complete
    }

    pub fn change_counter(&self) -> u64 {
        self.change_counter
    }

    pub fn cell(&self, ring: usize, azimuth_bin: usize) -> Option<&BackgroundCell> {
        self.cells.get(ring * self.azimuth_bins + azimuth_bin)
    }

    pub fn ring_elevation_deg(&self, ring: usize) -> Option<f64> {
        self.ring_elevations_deg.get(ring).copied().flatten()
    }

    pub fn acceptance_histogram(&self, ring: usize) -> Option<&[u32; ACCEPTANCE_BUCKETS]> {
        self.acceptance_histograms.get(ring)
    }

    /// Iterates cells in deterministic `(ring, azimuth_bin)` order, for
    /// snapshot export.
    pub fn cells_in_order(&self) -> impl Iterator<Item = ((usize, usize), &BackgroundCell)> {
        let azimuth_bins = self.azimuth_bins;
        self.cells.iter().enumerate().map(move |(idx, cell)| {
            ((idx / azimuth_bins, idx % azimuth_bins), cell)
        })
    }

    /// Rehydrates a single cell's learned baseline from a persisted
    /// snapshot. Used only during snapshot load, never on the hot path.
    pub fn restore_cell(
        &mut self,
        ring: usize,
        azimuth_bin: usize,
        average_range_m: f64,
        times_seen_count: u32,
    ) {
        let idx = ring * self.azimuth_bins + azimuth_bin;
        if let Some(cell) = self.cells.get_mut(idx) {
            cell.average_range_m = Some(average_range_m);
            cell.times_seen_count = times_seen_count;
        }
    }

    /// Sets a ring's fixed elevation directly. Used during snapshot load.
    pub fn set_ring_elevation(&mut self, ring: usize, elevation_deg: f64) {
        if let Some(slot) = self.ring_elevations_deg.get_mut(ring) {
            *slot = Some(elevation_deg);
        }
    }

    fn azimuth_bin(&self, azimuth_deg: f64) -> usize {
        let normalized = azimuth_deg.rem_euclid(360.0);
        let bin = (normalized / 360.0 * self.azimuth_bins as f64).floor() as usize;
        bin.min(self.azimuth_bins - 1)
    }

    fn cell_index(&self, ring: usize, azimuth_deg: f64) -> usize {
        ring * self.azimuth_bins + self.azimuth_bin(azimuth_deg)
    }

    fn in_warmup(&self, now_ns: u64, config: &PipelineConfig) -> bool {
        let by_frame_count = self.warmup_frames_remaining > 0;
        let by_duration = match self.start_time_ns {
            Some(start) => now_ns.saturating_sub(start) < config.warmup_duration_nanos,
            None => config.warmup_duration_nanos > 0,
        };
        by_frame_count || by_duration
    }

    fn warmup_mult(times_seen_count: u32) -> f64 {
        if times_seen_count >= 100 {
            1.0
        } else {
            4.0 - 3.0 * (times_seen_count as f64 / 100.0)
        }
    }

    fn closeness_threshold(cell: &BackgroundCell, observed_range: f64, config: &PipelineConfig) -> f64 {
        config.closeness_sensitivity_multiplier
            * (cell.range_spread_m + config.noise_relative_fraction * observed_range + 0.01)
            * Self::warmup_mult(cell.times_seen_count)
            + config.safety_margin_meters
    }

    /// Checks whether `confirmation_count` neighbouring bins on the same
    /// ring have settled averages within their own closeness threshold of
    /// `observed_range` (spec §4.2 step 4, third bullet).
    fn neighbor_confirms(
        &self,
        ring: usize,
        azimuth_bin: usize,
        observed_range: f64,
        config: &PipelineConfig,
    ) -> bool {
        let confirmation_count = config.neighbor_confirmation_count;
        if confirmation_count == 0 {
            return false;
        }
        let radius = confirmation_count.min(10) as i64;
        let mut confirmations = 0u32;
        for delta in -radius..=radius {
            if delta == 0 {
                continue;
            }
            let neighbor_bin =
                (azimuth_bin as i64 + delta).rem_euclid(self.azimuth_bins as i64) as usize;
            let idx = ring * self.azimuth_bins + neighbor_bin;
            let Some(neighbor) = self.cells.get(idx) else {
                continue;
            };
            if let Some(avg) = neighbor.average_range_m {
                let thr = Self::closeness_threshold(neighbor, observed_range, config);
                if (observed_range - avg).abs() <= thr {
                    confirmations += 1;
                    if confirmations >= confirmation_count {
                        return true;
                    }
                }
            }
        }
        false
    }

    /// Runs foreground extraction over one frame's points, returning a
    /// boolean mask of equal length (spec §4.2). The mask buffer is reused
    /// frame-to-frame; it only reallocates when `points.len()` grows.
    pub fn extract_foreground(
        &mut self,
        points: &[PolarPoint],
        config: &PipelineConfig,
        now_ns: u64,
        mask: &mut Vec<bool>,
    ) -> Result<(), BackgroundError> {
        if self.rings == 0 || self.azimuth_bins == 0 {
            return Err(BackgroundError::EmptyGrid);
        }

        if mask.len() < points.len() {
            mask.resize(points.len(), false);
        }
        mask.truncate(points.len());
        for m in mask.iter_mut() {
            *m = false;
        }

        if self.start_time_ns.is_none() {
            self.start_time_ns = Some(now_ns);
        }
        let warming_up = self.in_warmup(now_ns, config);

        for (i, point) in points.iter().enumerate() {
            let ring = point.ring as usize;
            if ring >= self.rings {
                mask[i] = true;
                continue;
            }
            if self.ring_elevations_deg[ring].is_none() {
                self.ring_elevations_deg[ring] = Some(point.elevation_deg);
            }

            let azimuth_bin = self.azimuth_bin(point.azimuth_deg);
            let is_foreground = self.classify_and_update(ring, azimuth_bin, point, config, now_ns);
            mask[i] = is_foreground;
        }

        if warming_up {
            if self.warmup_frames_remaining > 0 {
                self.warmup_frames_remaining -= 1;
            }
            let still_warming = self.in_warmup(now_ns, config);
            if !still_warming {
                self.settling_complete = true;
            }
            for m in mask.iter_mut() {
                *m = false;
            }
        }

        Ok(())
    }

    /// Classifies and updates a single cell; returns `true` if the point
    /// is foreground. Isolated from [`extract_foreground`] so the freeze/
    /// thaw/deadlock-breaker logic can be unit tested directly.
    fn classify_and_update(
        &mut self,
        ring: usize,
        azimuth_bin: usize,
        point: &PolarPoint,
        config: &PipelineConfig,
        now_ns: u64,
    ) -> bool {
        let idx = ring * self.azimuth_bins + azimuth_bin;
        let observed_range = point.range_m;

        // Thaw rule: expired frozen window, idle for >= 1ms.
        {
            let cell = &mut self.cells[idx];
            if cell.frozen_until_ns != 0 && now_ns >= cell.frozen_until_ns.saturating_add(ONE_MS_NS) {
                cell.recent_foreground_count = 0;
                cell.frozen_until_ns = 0;
                self.change_counter += 1;
            }
        }

        if self.cells[idx].is_frozen(now_ns) {
            return true;
        }

        let is_first_observation = self.cells[idx].times_seen_count == 0;
        let background_like = if is_first_observation && config.seed_from_first_observation {
            true
        } else {
            let thr = Self::closeness_threshold(&self.cells[idx], observed_range, config);
            let cell = self.cells[idx];

            let locked_ok = cell.has_valid_locked_baseline(config.locked_baseline_threshold)
                && {
                    let window = (config.locked_baseline_multiplier * cell.locked_spread_m
                        + config.noise_relative_fraction * observed_range
                        + config.safety_margin_meters)
                        .max(0.1);
                    (observed_range - cell.locked_baseline_m.unwrap()).abs() <= window
                };

            let average_ok = cell
                .average_range_m
                .map(|avg| (observed_range - avg).abs() <= thr)
                .unwrap_or(false);

            let neighbor_ok = !locked_ok
                && !average_ok
                && self.neighbor_confirms(ring, azimuth_bin, observed_range, config);

            let mut like = locked_ok || average_ok || neighbor_ok;

            // Deadlock breaker (spec §4.2 step 5): the model is stale.
            if !like {
                let cell = self.cells[idx];
                let divergence = cell
                    .average_range_m
                    .map(|avg| (observed_range - avg).abs())
                    .unwrap_or(f64::INFINITY);
                if cell.times_seen_count <= config.min_confidence_floor
                    && cell.recent_foreground_count > 4
                    && divergence < 3.0 * thr
                {
                    like = true;
                }
            }

            like
        };

        if background_like {
            self.update_background_like(idx, ring, observed_range, config, now_ns);
            false
        } else {
            self.update_foreground(idx, observed_range, config, now_ns);
            true
        }
    }

    fn update_background_like(
        &mut self,
        idx: usize,
        ring: usize,
        observed_range: f64,
        config: &PipelineConfig,
        now_ns: u64,
    ) {
        let cell = &mut self.cells[idx];

        match cell.average_range_m {
            None => {
                cell.average_range_m = Some(observed_range);
                cell.range_spread_m = 0.0;
                cell.times_seen_count = 1;
            }
            Some(avg) => {
                let post_settle = !self.in_warmup(now_ns, config);
                let mut alpha = if post_settle {
                    config.post_settle_update_fraction
                } else {
                    config.background_update_fraction
                };
                if cell.recent_foreground_count > 0 {
                    alpha = (alpha * config.reacquisition_boost_multiplier).min(0.5);
                }

                let deviation = (observed_range - avg).abs();
                cell.average_range_m = Some(avg + alpha * (observed_range - avg));
                cell.range_spread_m += alpha * (deviation - cell.range_spread_m);
                cell.times_seen_count = cell.times_seen_count.saturating_add(1);

                if cell.times_seen_count >= config.locked_baseline_threshold
                    && cell.locked_baseline_m.is_none()
                {
                    cell.locked_baseline_m = cell.average_range_m;
                    cell.locked_spread_m = cell.range_spread_m;
                    cell.locked_at_count = cell.times_seen_count;
                } else if cell.locked_baseline_m.is_some() && cell.recent_foreground_count == 0 {
                    const LOCKED_ALPHA: f64 = 0.001;
                    let locked = cell.locked_baseline_m.unwrap();
                    cell.locked_baseline_m = Some(locked + LOCKED_ALPHA * (observed_range - locked));
                    cell.locked_spread_m += LOCKED_ALPHA * (deviation - cell.locked_spread_m);
                }
            }
        }

        cell.recent_foreground_count = cell.recent_foreground_count.saturating_sub(1);
        cell.last_update_ns = now_ns;
        self.change_counter += 1;

        let bucket = ((observed_range / ACCEPTANCE_BUCKET_WIDTH_M) as usize).min(ACCEPTANCE_BUCKETS - 1);
        self.acceptance_histograms[ring][bucket] += 1;
    }

    fn update_foreground(&mut self, idx: usize, observed_range: f64, config: &PipelineConfig, now_ns: u64) {
        let cell = &mut self.cells[idx];

        cell.recent_foreground_count = cell.recent_foreground_count.saturating_add(1);
        cell.times_seen_count = cell.times_seen_count.saturating_sub(1).max(config.min_confidence_floor);

        if cell.times_seen_count < 100 {
            let thr = Self::closeness_threshold(cell, observed_range, config);
            let divergence = cell
                .average_range_m
                .map(|avg| (observed_range - avg).abs())
                .unwrap_or(f64::INFINITY);
            if divergence > 3.0 * thr {
                cell.frozen_until_ns = now_ns.saturating_add(config.freeze_duration_nanos);
            }
        }

        cell.last_update_ns = now_ns;
        self.change_counter += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(ring: u16, azimuth_deg: f64, range_m: f64, timestamp_ns: u64) -> PolarPoint {
        PolarPoint {
            ring,
            azimuth_deg,
            elevation_deg: 0.0,
            range_m,
            intensity: 50,
            timestamp_ns,
            packet_seq: None,
        }
    }

    fn no_warmup_config() -> PipelineConfig {
        PipelineConfig {
            warmup_duration_nanos: 0,
            warmup_min_frames: 0,
            ..Default::default()
        }
    }

    #[test]
    fn test_empty_grid_rejected() {
        let config = PipelineConfig::default();
        assert!(BackgroundGrid::new(0, 10, &config).is_err());
        assert!(BackgroundGrid::new(10, 0, &config).is_err());
    }

    #[test]
    fn test_mask_length_matches_points() {
        let config = no_warmup_config();
        let mut grid = BackgroundGrid::new(4, 360, &config).unwrap();
        let pts: Vec<_> = (0..20).map(|i| point(0, i as f64, 10.0, i as u64)).collect();
        let mut mask = Vec::new();
        grid.extract_foreground(&pts, &config, 0, &mut mask).unwrap();
        assert_eq!(mask.len(), pts.len());
    }

    #[test]
    fn test_invalid_ring_is_foreground_and_not_updated() {
        let config = no_warmup_config();
        let mut grid = BackgroundGrid::new(4, 360, &config).unwrap();
        let pts = vec![point(99, 0.0, 10.0, 0)];
        let mut mask = Vec::new();
        grid.extract_foreground(&pts, &config, 0, &mut mask).unwrap();
        assert_eq!(mask, vec![true]);
        assert_eq!(grid.change_counter(), 0);
    }

    #[test]
    fn test_first_observation_seeds_background() {
        let config = no_warmup_config();
        let mut grid = BackgroundGrid::new(4, 360, &config).unwrap();
        let pts = vec![point(0, 10.0, 20.0, 0)];
        let mut mask = Vec::new();
        grid.extract_foreground(&pts, &config, 0, &mut mask).unwrap();
        assert_eq!(mask, vec![false]);
        let cell = grid.cell(0, grid.azimuth_bin(10.0)).unwrap();
        assert_eq!(cell.average_range_m, Some(20.0));
        assert_eq!(cell.times_seen_count, 1);
    }

    #[test]
    fn test_background_like_moves_toward_observation() {
        let config = no_warmup_config();
        let mut grid = BackgroundGrid::new(4, 360, &config).unwrap();
        let bin = 10.0;
        let mut mask = Vec::new();
        for r in [20.0, 20.1, 19.9, 20.05] {
            let pts = vec![point(0, bin, r, 0)];
            grid.extract_foreground(&pts, &config, 0, &mut mask).unwrap();
        }
        let cell = grid.cell(0, grid.azimuth_bin(bin)).unwrap();
        assert!(cell.average_range_m.unwrap() > 19.5 && cell.average_range_m.unwrap() < 20.5);
        assert_eq!(cell.times_seen_count, 4);
    }

    #[test]
    fn test_times_seen_never_decreases_below_floor() {
        let mut config = no_warmup_config();
        config.min_confidence_floor = 5;
        let mut grid = BackgroundGrid::new(4, 360, &config).unwrap();

        // Seed the cell, then hammer it with foreground-triggering ranges.
        let mut mask = Vec::new();
        grid.extract_foreground(&[point(0, 0.0, 10.0, 0)], &config, 0, &mut mask)
            .unwrap();
        for t in 1..20u64 {
            grid.extract_foreground(&[point(0, 0.0, 500.0, t)], &config, t, &mut mask)
                .unwrap();
            let cell = grid.cell(0, 0).unwrap();
            assert!(cell.times_seen_count >= config.min_confidence_floor);
        }
    }

    #[test]
    fn test_freeze_then_thaw_scenario_s1() {
        // S1: cell learned to average=10.0, spread=0.05, times_seen=30.
        let config = no_warmup_config();
        let mut grid = BackgroundGrid::new(1, 360, &config).unwrap();
        let idx = 0usize;
        grid.cells[idx].average_range_m = Some(10.0);
        grid.cells[idx].range_spread_m = 0.05;
        grid.cells[idx].times_seen_count = 30;

        let mut mask = Vec::new();
        let mut t = 1_000_000_000u64;
        for _ in 0..5 {
            grid.extract_foreground(&[point(0, 0.0, 20.0, t)], &config, t, &mut mask)
                .unwrap();
            assert_eq!(mask, vec![true]);
            t += 1_000_000; // 1ms apart
        }

        let cell = *grid.cell(0, 0).unwrap();
        assert!(cell.frozen_until_ns > t);
        assert_eq!(cell.recent_foreground_count, 5);
        assert_eq!(cell.times_seen_count, 25);

        // Idle past freeze_duration + 1ms, then a background observation.
        let resume_t = cell.frozen_until_ns + 1_000_000 + 1;
        grid.extract_foreground(&[point(0, 0.0, 10.02, resume_t)], &config, resume_t, &mut mask)
            .unwrap();
        let cell_after = grid.cell(0, 0).unwrap();
        assert_eq!(cell_after.recent_foreground_count, 0);
        assert_eq!(mask, vec![false]);
    }

    #[test]
    fn test_warmup_zeroes_mask() {
        let mut config = PipelineConfig::default();
        config.warmup_min_frames = 2;
        config.warmup_duration_nanos = 0;
        let mut grid = BackgroundGrid::new(4, 360, &config).unwrap();
        assert!(!grid.settling_complete());

        let mut mask = Vec::new();
        grid.extract_foreground(&[point(0, 0.0, 10.0, 0)], &config, 0, &mut mask)
            .unwrap();
        assert_eq!(mask, vec![false]);
        assert!(!grid.settling_complete());

        grid.extract_foreground(&[point(0, 0.0, 500.0, 1)], &config, 1, &mut mask)
            .unwrap();
        assert_eq!(mask, vec![false]);
        assert!(grid.settling_complete());
    }

    #[test]
    fn test_idempotent_on_empty_input() {
        let config = no_warmup_config();
        let mut grid = BackgroundGrid::new(4, 360, &config).unwrap();
        let before = grid.change_counter();
        let mut mask = Vec::new();
        grid.extract_foreground(&[], &config, 0, &mut mask).unwrap();
        assert_eq!(grid.change_counter(), before);
        assert!(mask.is_empty());
    }
}
