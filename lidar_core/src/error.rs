//! Per-subsystem error types (spec §7).
//!
//! Following the teacher's `TrackingError`/`EnvError` style: small
//! `thiserror` enums, one per subsystem, with per-point/per-cluster
//! failures recovered locally by the pipeline (never propagated) and
//! only construction-time invariants escaping as `Result`.

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("grid dimensions must be positive")]
    InvalidGridDimensions,
    #[error("dbscan eps must be positive, got {0}")]
    InvalidEps(f64),
    #[error("height band floor ({floor}) must be <= ceiling ({ceiling})")]
    InvalidHeightBand { floor: f64, ceiling: f64 },
}

#[derive(Debug, Clone, Error)]
pub enum BackgroundError {
    #[error("background grid has zero dimensions")]
    EmptyGrid,
    #[error("mask length {mask_len} does not match point count {point_len}")]
    MaskLengthMismatch { mask_len: usize, point_len: usize },
}

#[derive(Debug, Clone, Error)]
pub enum FrameBuilderError {
    #[error("unknown ring {0}, point dropped")]
    UnknownRing(u16),
}

#[derive(Debug, Clone, Error)]
pub enum ClusterError {
    #[error("eps must be positive, got {0}")]
    InvalidEps(f64),
    #[error("min_pts must be at least 1, got {0}")]
    InvalidMinPts(usize),
}

#[derive(Debug, Clone, Error)]
pub enum TrackingError {
    #[error("track not found: {0}")]
    TrackNotFound(uuid::Uuid),
    #[error("innovation covariance is singular")]
    SingularCovariance,
    #[error("maximum track capacity ({0}) reached")]
    CapacityReached(usize),
}

#[derive(Debug, Clone, Error)]
pub enum SnapshotError {
    #[error("io error: {0}")]
    Io(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}
