//! Multi-object tracking: constant-velocity Kalman filter, Mahalanobis
//! gating, Hungarian assignment, and the tentative/confirmed/deleted
//! lifecycle (spec §4.5, §4.6).

use crate::config::PipelineConfig;
use crate::error::TrackingError;
use crate::hungarian;
use crate::types::{
    BoundingBox, Classification, HistoryPoint, TrackAggregates, TrackState, TrackedObject,
    WorldCluster,
};
use nalgebra::{Matrix2, Matrix2x4, Matrix4, Matrix4x2, Vector2, Vector4};
use uuid::Uuid;

const HISTORY_CAP: usize = 100;
const AGGREGATE_ALPHA: f64 = 0.3;

fn state_to_vector(state: &[f64; 4]) -> Vector4<f64> {
    Vector4::new(state[0], state[1], state[2], state[3])
}

fn covariance_to_matrix(flat: &[f64; 16]) -> Matrix4<f64> {
    Matrix4::from_row_slice(flat)
}

fn matrix_to_covariance(m: &Matrix4<f64>) -> [f64; 16] {
    let mut out = [0.0; 16];
    for row in 0..4 {
        for col in 0..4 {
            out[row * 4 + col] = m[(row, col)];
        }
    }
    out
}

fn initial_covariance(config: &PipelineConfig) -> Matrix4<f64> {
    Matrix4::from_diagonal(&Vector4::new(
        config.process_noise_pos,
        config.process_noise_pos,
        config.process_noise_vel,
        config.process_noise_vel,
    ))
}

fn process_noise(config: &PipelineConfig, dt: f64) -> Matrix4<f64> {
    Matrix4::from_diagonal(&Vector4::new(
        config.process_noise_pos * dt,
        config.process_noise_pos * dt,
        config.process_noise_vel * dt,
        config.process_noise_vel * dt,
    ))
}

fn measurement_matrix() -> Matrix2x4<f64> {
    Matrix2x4::new(1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0)
}

fn measurement_noise(config: &PipelineConfig) -> Matrix2<f64> {
    Matrix2::from_diagonal(&Vector2::new(config.measurement_noise, config.measurement_noise))
}

/// Advances a track's state vector and covariance by `dt` seconds under
/// the constant-velocity model, clamping `dt` to `max_predict_dt_s` (spec
/// §4.5: a track that hasn't been seen in a while should not be allowed
/// to extrapolate arbitrarily far).
fn predict(track: &mut TrackedObject, config: &PipelineConfig, dt_s: f64) {
    let dt = dt_s.min(config.max_predict_dt_s).max(0.0);
    let f = Matrix4::new(
        1.0, 0.0, dt, 0.0, //
        0.0, 1.0, 0.0, dt, //
        0.0, 0.0, 1.0, 0.0, //
        0.0, 0.0, 0.0, 1.0,
    );

    let x = f * state_to_vector(&track.state_vector);
    let p = f * covariance_to_matrix(&track.covariance) * f.transpose() + process_noise(config, dt);

    track.state_vector = [x[0], x[1], x[2], x[3]];
    track.covariance = matrix_to_covariance(&p);
}

struct GatingOutcome {
    cost: f64,
    innovation_covariance: Matrix2<f64>,
    innovation: Vector2<f64>,
}

fn evaluate_pairing(
    track: &TrackedObject,
    cluster: &WorldCluster,
    config: &PipelineConfig,
    dt_s: f64,
) -> Option<GatingOutcome> {
    let h = measurement_matrix();
    let p = covariance_to_matrix(&track.covariance);
    let r = measurement_noise(config);
    let z = Vector2::new(cluster.centroid[0], cluster.centroid[1]);
    let hx = Vector2::new(track.x(), track.y());
    let innovation = z - hx;

    let s = h * p * h.transpose() + r;
    let s_inv = s.try_inverse()?;
    let mahalanobis_sq = (innovation.transpose() * s_inv * innovation)[(0, 0)];

    if mahalanobis_sq > config.gating_distance_squared {
        return None;
    }

    let position_jump = innovation.norm();
    if position_jump > config.max_position_jump_meters {
        return None;
    }

    if dt_s > 0.0 {
        let implied_speed = position_jump / dt_s;
        if implied_speed > config.max_implied_speed_mps {
            return None;
        }
    }

    Some(GatingOutcome {
        cost: mahalanobis_sq,
        innovation_covariance: s,
        innovation,
    })
}

fn apply_update(track: &mut TrackedObject, outcome: &GatingOutcome, config: &PipelineConfig) {
    let h = measurement_matrix();
    let p = covariance_to_matrix(&track.covariance);
    let s_inv = match outcome.innovation_covariance.try_inverse() {
        Some(inv) => inv,
        None => return,
    };

    let k: Matrix4x2<f64> = p * h.transpose() * s_inv;
    let x = state_to_vector(&track.state_vector) + k * outcome.innovation;
    let identity = Matrix4::identity();
    let p_new = (identity - k * h) * p;

    track.state_vector = [x[0], x[1], x[2], x[3]];
    track.covariance = matrix_to_covariance(&p_new);
    let _ = config;
}

fn push_history(track: &mut TrackedObject, now_ns: u64) {
    track.history.push(HistoryPoint {
        x: track.x(),
        y: track.y(),
        timestamp_ns: now_ns,
    });
    if track.history.len() > HISTORY_CAP {
        let excess = track.history.len() - HISTORY_CAP;
        track.history.drain(0..excess);
    }
}

fn update_aggregates(track: &mut TrackedObject, cluster: &WorldCluster) {
    let agg = &mut track.aggregates;
    let speed = track.state_vector[2].hypot(track.state_vector[3]);
    let n = agg.observation_count;

    if n == 0 {
        agg.avg_speed_mps = speed;
        agg.avg_bbox = cluster.bbox;
        agg.mean_intensity = cluster.mean_intensity;
    } else {
        agg.avg_speed_mps = AGGREGATE_ALPHA * speed + (1.0 - AGGREGATE_ALPHA) * agg.avg_speed_mps;
        let weight = n as f64;
        agg.avg_bbox = BoundingBox {
            length: (agg.avg_bbox.length * weight + cluster.bbox.length) / (weight + 1.0),
            width: (agg.avg_bbox.width * weight + cluster.bbox.width) / (weight + 1.0),
            height: (agg.avg_bbox.height * weight + cluster.bbox.height) / (weight + 1.0),
        };
        agg.mean_intensity =
            (agg.mean_intensity * weight + cluster.mean_intensity) / (weight + 1.0);
    }

    agg.peak_speed_mps = agg.peak_speed_mps.max(speed);
    agg.max_height_m = agg.max_height_m.max(cluster.centroid[2] + cluster.bbox.height / 2.0);
    agg.observation_count += 1;

    // p50/p85/p95 are maintained as exponentially-smoothed quantile
    // trackers rather than a full history scan: O(1) per observation,
    // bounded memory.
    nudge_quantile(&mut agg.p50_speed_mps, speed, 0.50);
    nudge_quantile(&mut agg.p85_speed_mps, speed, 0.85);
    nudge_quantile(&mut agg.p95_speed_mps, speed, 0.95);
}

fn nudge_quantile(estimate: &mut f64, observation: f64, quantile: f64) {
    let step = 0.05;
    if observation > *estimate {
        *estimate += step * quantile;
    } else if observation < *estimate {
        *estimate -= step * (1.0 - quantile);
    }
}

fn new_track(cluster: &WorldCluster, now_ns: u64, config: &PipelineConfig) -> TrackedObject {
    let mut track = TrackedObject {
        id: Uuid::new_v4(),
        sensor_id: cluster.sensor_id,
        state: TrackState::Tentative,
        state_vector: [cluster.centroid[0], cluster.centroid[1], 0.0, 0.0],
        covariance: matrix_to_covariance(&initial_covariance(config)),
        hits: 1,
        misses: 0,
        first_observed_ns: now_ns,
        last_observed_ns: now_ns,
        history: Vec::new(),
        aggregates: TrackAggregates::default(),
        classification: None,
    };
    push_history(&mut track, now_ns);
    update_aggregates(&mut track, cluster);
    track
}

/// Owns the full set of tracked objects and steps them forward one frame
/// at a time.
pub struct TrackManager {
    tracks: Vec<TrackedObject>,
    config: PipelineConfig,
}

impl TrackManager {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            tracks: Vec::new(),
            config,
        }
    }

    pub fn tracks(&self) -> &[TrackedObject] {
        &self.tracks
    }

    pub fn get(&self, id: Uuid) -> Result<&TrackedObject, TrackingError> {
        self.tracks
            .iter()
            .find(|t| t.id == id)
            .ok_or(TrackingError::TrackNotFound(id))
    }

    /// Runs one tracking cycle: predicts every live track forward by
    /// `dt_s`, gates and optimally assigns detections, updates matched
    /// tracks, spawns new tentative tracks for unmatched detections,
    /// advances the lifecycle state machine, and purges tracks that have
    /// sat `Deleted` past `deleted_grace_nanos`.
    pub fn step(&mut self, clusters: &[WorldCluster], now_ns: u64, dt_s: f64) {
        for track in self.tracks.iter_mut() {
            if track.state != TrackState::Deleted {
                predict(track, &self.config, dt_s);
            }
        }

        let live_idxs: Vec<usize> = self
            .tracks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.state != TrackState::Deleted)
            .map(|(i, _)| i)
            .collect();

        let mut cost = vec![vec![f64::MAX / 4.0; clusters.len()]; live_idxs.len()];
        let mut outcomes: Vec<Vec<Option<GatingOutcome>>> =
            (0..live_idxs.len()).map(|_| Vec::new()).collect();

        for (row, &track_idx) in live_idxs.iter().enumerate() {
            let mut row_outcomes = Vec::with_capacity(clusters.len());
            for cluster in clusters {
                let outcome = evaluate_pairing(&self.tracks[track_idx], cluster, &self.config, dt_s);
                if let Some(o) = &outcome {
                    cost[row][row_outcomes.len()] = o.cost;
                }
                row_outcomes.push(outcome);
            }
            outcomes[row] = row_outcomes;
        }

        let assignment = if live_idxs.is_empty() || clusters.is_empty() {
            vec![None; live_idxs.len()]
        } else {
            hungarian::solve(&cost)
        };

        let mut cluster_claimed = vec![false; clusters.len()];

        for (row, &track_idx) in live_idxs.iter().enumerate() {
            match assignment[row] {
                Some(col) if outcomes[row][col].is_some() => {
                    let outcome = outcomes[row][col].take().unwrap();
                    apply_update(&mut self.tracks[track_idx], &outcome, &self.config);
                    let track = &mut self.tracks[track_idx];
                    track.hits = track.hits.saturating_add(1);
                    track.misses = 0;
                    track.last_observed_ns = now_ns;
                    push_history(track, now_ns);
                    update_aggregates(track, &clusters[col]);
                    cluster_claimed[col] = true;

                    if track.state == TrackState::Tentative
                        && track.hits >= self.config.hits_to_confirm
                    {
                        track.state = TrackState::Confirmed;
                    }
                }
                _ => {
                    let track = &mut self.tracks[track_idx];
                    track.misses = track.misses.saturating_add(1);
                    // Confirmed tracks tolerate `max_misses_confirmed`
                    // consecutive misses before deletion; every other
                    // state (Tentative) deletes on the very first miss.
                    let deleted = match track.state {
                        TrackState::Confirmed => track.misses >= self.config.max_misses_confirmed,
                        _ => true,
                    };
                    if deleted {
                        track.state = TrackState::Deleted;
                    }
                }
            }
        }

        for (col, cluster) in clusters.iter().enumerate() {
            if cluster_claimed[col] {
                continue;
            }
            let live_count = self
                .tracks
                .iter()
                .filter(|t| t.state != TrackState::Deleted)
                .count();
            if live_count >= self.config.max_tracks {
                continue;
            }
            self.tracks.push(new_track(cluster, now_ns, &self.config));
        }

        let deleted_grace_nanos = self.config.deleted_grace_nanos;
        self.tracks.retain(|t| {
            t.state != TrackState::Deleted
                || now_ns.saturating_sub(t.last_observed_ns) < deleted_grace_nanos
        });
    }
}
