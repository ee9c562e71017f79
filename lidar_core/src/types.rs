//! Core data types shared across the perception pipeline (spec §3).

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// A single polar measurement produced by the packet decoder.
///
/// `ring` is 0-based internally; the external wire format is 1-based and
/// the decoder is responsible for the conversion before points reach the
/// core.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PolarPoint {
    /// Laser channel, 0-based.
    pub ring: u16,
    /// Azimuth in degrees, `[0, 360)`.
    pub azimuth_deg: f64,
    /// Elevation in degrees (fixed per ring on a rotating multi-beam sensor).
    pub elevation_deg: f64,
    /// Range in metres.
    pub range_m: f64,
    /// Return intensity, 0-255.
    pub intensity: u8,
    /// Monotonic capture time, nanoseconds.
    pub timestamp_ns: u64,
    /// Originating UDP packet sequence number, if the decoder tracks one.
    pub packet_seq: Option<u32>,
}

/// One (approximately) full rotation's worth of points, assembled by the
/// frame builder (spec §4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LidarFrame {
    /// Monotonically increasing frame id, per sensor.
    pub frame_id: u64,
    pub sensor_id: u32,
    pub points: Vec<PolarPoint>,
    pub start_ts_ns: u64,
    pub end_ts_ns: u64,
    pub min_azimuth_deg: f64,
    pub max_azimuth_deg: f64,
    /// True when the frame satisfies the spin-complete predicate (spec §4.1).
    pub spin_complete: bool,
    /// Packet sequence numbers observed while assembling this frame.
    pub packet_sequences: BTreeSet<u32>,
    /// Number of packet-sequence gaps detected (diagnostics only).
    pub gap_count: Option<u32>,
}

impl LidarFrame {
    pub fn azimuth_coverage_deg(&self) -> f64 {
        let span = self.max_azimuth_deg - self.min_azimuth_deg;
        if span < 0.0 {
            span + 360.0
        } else {
            span
        }
    }
}

/// A sensor's pose in the site-local world frame. Identity by default
/// (spec §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub translation: [f64; 3],
    /// Rotation about the +Z (up) axis, radians. Sufficient for a
    /// rigidly-mounted, non-tilted sensor; richer orientation is out of
    /// scope (spec §1 Non-goals: 3-D bounding-box orientation estimation).
    pub yaw_rad: f64,
}

impl Default for Pose {
    fn default() -> Self {
        Self {
            translation: [0.0, 0.0, 0.0],
            yaw_rad: 0.0,
        }
    }
}

/// A point transformed into the site-local world frame (spec §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorldPoint {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub intensity: u8,
    pub timestamp_ns: u64,
    pub sensor_id: u32,
}

/// An axis-aligned bounding box, metres.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub length: f64,
    pub width: f64,
    pub height: f64,
}

/// A density-connected component of foreground world points (spec §4.4).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldCluster {
    pub centroid: [f64; 3],
    pub bbox: BoundingBox,
    pub point_count: usize,
    /// 95th-percentile point height within the cluster.
    pub height_p95: f64,
    pub mean_intensity: f64,
    pub timestamp_ns: u64,
    pub sensor_id: u32,
}

impl WorldCluster {
    /// Invariant check used by tests (spec §8 item 2): the cluster is
    /// non-empty, `member_points` is exactly this cluster's membership,
    /// the centroid lies inside the axis-aligned extent of those points,
    /// and `bbox` matches that extent.
    pub fn is_well_formed(&self, member_points: &[WorldPoint]) -> bool {
        if member_points.is_empty() || member_points.len() != self.point_count {
            return false;
        }

        let mut min = [f64::MAX; 3];
        let mut max = [f64::MIN; 3];
        for p in member_points {
            for (axis, v) in [p.x, p.y, p.z].into_iter().enumerate() {
                min[axis] = min[axis].min(v);
                max[axis] = max[axis].max(v);
            }
        }

        let centroid_inside = (0..3).all(|axis| {
            self.centroid[axis] >= min[axis] - f64::EPSILON
                && self.centroid[axis] <= max[axis] + f64::EPSILON
        });

        const TOL: f64 = 1e-6;
        let bbox_matches = (max[0] - min[0] - self.bbox.width).abs() < TOL
            && (max[1] - min[1] - self.bbox.length).abs() < TOL
            && (max[2] - min[2] - self.bbox.height).abs() < TOL;

        centroid_inside && bbox_matches
    }
}

/// Lifecycle state of a tracked object (spec §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackState {
    Tentative,
    Confirmed,
    Deleted,
}

/// A classification label attached to a track, if a downstream classifier
/// has supplied one. The core does not compute this itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub label: String,
    pub confidence: f64,
}

/// Running aggregates maintained per track (spec §3, §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackAggregates {
    pub avg_speed_mps: f64,
    pub peak_speed_mps: f64,
    pub p50_speed_mps: f64,
    pub p85_speed_mps: f64,
    pub p95_speed_mps: f64,
    pub avg_bbox: BoundingBox,
    pub max_height_m: f64,
    pub mean_intensity: f64,
    pub observation_count: u64,
}

impl Default for TrackAggregates {
    fn default() -> Self {
        Self {
            avg_speed_mps: 0.0,
            peak_speed_mps: 0.0,
            p50_speed_mps: 0.0,
            p85_speed_mps: 0.0,
            p95_speed_mps: 0.0,
            avg_bbox: BoundingBox {
                length: 0.0,
                width: 0.0,
                height: 0.0,
            },
            max_height_m: 0.0,
            mean_intensity: 0.0,
            observation_count: 0,
        }
    }
}

/// One historical `(x, y, t)` sample, bounded to the last 100 per track.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistoryPoint {
    pub x: f64,
    pub y: f64,
    pub timestamp_ns: u64,
}

/// A persistent object track, owned exclusively by the tracker. External
/// consumers only ever see `.clone()`s of this (spec §3: "deep copies").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedObject {
    pub id: Uuid,
    pub sensor_id: u32,
    pub state: TrackState,
    /// Kalman state `(x, y, vx, vy)`.
    pub state_vector: [f64; 4],
    /// Row-major flattened 4x4 covariance, matching spec §9's "flat
    /// 16-element block" guidance.
    pub covariance: [f64; 16],
    pub hits: u32,
    pub misses: u32,
    pub first_observed_ns: u64,
    pub last_observed_ns: u64,
    pub history: Vec<HistoryPoint>,
    pub aggregates: TrackAggregates,
    pub classification: Option<Classification>,
}

impl TrackedObject {
    pub fn x(&self) -> f64 {
        self.state_vector[0]
    }
    pub fn y(&self) -> f64 {
        self.state_vector[1]
    }
    pub fn vx(&self) -> f64 {
        self.state_vector[2]
    }
    pub fn vy(&self) -> f64 {
        self.state_vector[3]
    }
    pub fn speed_mps(&self) -> f64 {
        (self.vx().powi(2) + self.vy().powi(2)).sqrt()
    }
}
