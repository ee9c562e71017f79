//! Flat, typed configuration record (spec §6).
//!
//! Mirrors the shape of the teacher's `TrackingConfig`: one struct, a
//! `Default` impl carrying the documented defaults, and plain field
//! access rather than a free-form key/value map (spec §9 design note).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    // --- Background model (§4.2) ---
    pub background_update_fraction: f64,
    pub closeness_sensitivity_multiplier: f64,
    pub safety_margin_meters: f64,
    pub freeze_duration_nanos: u64,
    pub neighbor_confirmation_count: u32,
    pub warmup_duration_nanos: u64,
    pub warmup_min_frames: u32,
    pub post_settle_update_fraction: f64,
    pub noise_relative_fraction: f64,
    pub seed_from_first_observation: bool,
    pub reacquisition_boost_multiplier: f64,
    pub min_confidence_floor: u32,
    pub locked_baseline_threshold: u32,
    pub locked_baseline_multiplier: f64,

    // --- Clustering (§4.4) ---
    pub foreground_min_cluster_points: usize,
    pub foreground_dbscan_eps: f64,

    // --- Tracker (§4.5) ---
    pub max_tracks: usize,
    /// Consecutive misses a Confirmed track tolerates before deletion.
    /// Tentative tracks have no tolerance: any miss deletes them, so
    /// there is no corresponding `max_misses_tentative` field.
    pub max_misses_confirmed: u32,
    pub hits_to_confirm: u32,
    pub gating_distance_squared: f64,
    pub process_noise_pos: f64,
    pub process_noise_vel: f64,
    pub measurement_noise: f64,
    pub max_predict_dt_s: f64,
    pub max_position_jump_meters: f64,
    pub max_implied_speed_mps: f64,
    pub deleted_grace_nanos: u64,

    // --- Frame builder (§4.1) ---
    pub azimuth_tolerance_deg: f64,
    pub min_frame_points: usize,
    pub frame_buffer_size: usize,
    pub buffer_timeout_nanos: u64,
    /// Non-zero enables the time-based completion mode.
    pub motor_rpm: f64,

    // --- Transform / height filter (§4.3) ---
    pub height_floor_m: f64,
    pub height_ceiling_m: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            background_update_fraction: 0.02,
            closeness_sensitivity_multiplier: 3.0,
            safety_margin_meters: 0.03,
            freeze_duration_nanos: 2_000_000_000,
            neighbor_confirmation_count: 3,
            warmup_duration_nanos: 5_000_000_000,
            warmup_min_frames: 30,
            post_settle_update_fraction: 0.005,
            noise_relative_fraction: 0.01,
            seed_from_first_observation: true,
            reacquisition_boost_multiplier: 4.0,
            min_confidence_floor: 5,
            locked_baseline_threshold: 200,
            locked_baseline_multiplier: 3.0,

            foreground_min_cluster_points: 12,
            foreground_dbscan_eps: 0.5,

            max_tracks: 256,
            max_misses_confirmed: 3,
            hits_to_confirm: 3,
            gating_distance_squared: 9.21, // chi^2, 2 DOF, 99%
            process_noise_pos: 0.25,
            process_noise_vel: 1.0,
            measurement_noise: 0.1,
            max_predict_dt_s: 0.5,
            max_position_jump_meters: 15.0,
            max_implied_speed_mps: 45.0,
            deleted_grace_nanos: 1_000_000_000,

            azimuth_tolerance_deg: 10.0,
            min_frame_points: 1_000,
            frame_buffer_size: 10,
            buffer_timeout_nanos: 1_000_000_000,
            motor_rpm: 0.0,

            height_floor_m: -2.8,
            height_ceiling_m: 1.5,
        }
    }
}

impl PipelineConfig {
    /// Effective point-count floor for spin-completion: `max(config, 10_000)`
    /// (spec §4.1).
    pub fn effective_min_frame_points(&self) -> usize {
        self.min_frame_points.max(10_000)
    }

    /// Validates construction-time invariants (spec §7: configuration
    /// errors are fatal at construction, never mid-stream).
    pub fn validate(&self) -> Result<(), crate::error::ConfigError> {
        if self.foreground_dbscan_eps <= 0.0 {
            return Err(crate::error::ConfigError::InvalidEps(
                self.foreground_dbscan_eps,
            ));
        }
        if self.height_floor_m > self.height_ceiling_m {
            return Err(crate::error::ConfigError::InvalidHeightBand {
                floor: self.height_floor_m,
                ceiling: self.height_ceiling_m,
            });
        }
        Ok(())
    }
}
