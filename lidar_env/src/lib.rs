//! Sans-IO runtime abstraction for the LiDAR perception pipeline.
//!
//! The pipeline (`lidar_core`) runs a small number of long-lived tasks
//! (ingest, per-frame pipeline, stats, forwarder — see spec §5) that all
//! need the same three things: a clock, a way to spawn, and a way to be
//! told to stop. This crate factors those out behind [`RuntimeContext`] so
//! the scheduling logic in `lidar_core` can be tested without a live
//! `tokio` runtime driving real sockets.

mod context;
mod error;
mod tokio_impl;

pub use context::RuntimeContext;
pub use error::EnvError;
pub use tokio_impl::TokioRuntimeContext;
