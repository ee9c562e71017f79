//! Real-time perception pipeline for a rotating multi-beam LiDAR sensor.
//!
//! Packets arrive as discrete polar points; [`frame_builder`] assembles
//! them into full-rotation [`types::LidarFrame`]s, [`background`]
//! separates moving foreground from the learned static scene,
//! [`transform`] lifts surviving points into the site-local world frame,
//! [`cluster`] groups them into [`types::WorldCluster`]s, and
//! [`tracker`] maintains persistent [`types::TrackedObject`]s across
//! frames. [`pipeline`] wires the whole thing into the long-lived tasks
//! described in the design notes; [`snapshot`] persists and restores the
//! background model.

pub mod background;
pub mod cluster;
pub mod config;
pub mod error;
pub mod frame_builder;
pub mod hungarian;
pub mod pipeline;
pub mod snapshot;
pub mod tracker;
pub mod transform;
pub mod types;

pub use background::{BackgroundCell, BackgroundGrid};
pub use cluster::cluster_points;
pub use config::PipelineConfig;
pub use error::{
    BackgroundError, ClusterError, ConfigError, FrameBuilderError, SnapshotError, TrackingError,
};
pub use frame_builder::{FeedResult, FrameBuilder};
pub use pipeline::{spawn_pipeline, Forwarder, PacketSource, PipelineShared, PipelineStats};
pub use tracker::TrackManager;
pub use transform::{filter_height_band, polar_to_world, world_to_polar, HeightFilterCounters};
pub use types::{
    BoundingBox, Classification, HistoryPoint, LidarFrame, PolarPoint, Pose, TrackAggregates,
    TrackState, TrackedObject, WorldCluster, WorldPoint,
};
