//! Core runtime context trait for the pipeline's long-lived tasks.

use async_trait::async_trait;
use std::future::Future;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;

/// The central interface the ingest, pipeline, stats, and forwarder tasks
/// (spec §5) use instead of talking to `tokio` directly.
///
/// This abstraction exists so the pipeline's scheduling logic (deadlines,
/// periodic ticks, cooperative shutdown) can be exercised in tests without
/// spinning up a full `tokio` runtime, and so a deterministic-simulation
/// implementation could be substituted later without touching the pipeline
/// itself.
#[async_trait]
pub trait RuntimeContext: Send + Sync + 'static {
    /// Monotonic time since context creation.
    fn now(&self) -> Duration;

    /// Wall-clock time, used for packet and frame timestamps.
    fn system_time(&self) -> SystemTime;

    /// Suspends execution for the given duration.
    async fn sleep(&self, duration: Duration);

    /// Spawns a named background task.
    fn spawn<F>(&self, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static;

    /// The cancellation token shared by every long-lived task spawned
    /// through this context. Cloned tokens observe the same cancellation.
    fn cancellation_token(&self) -> CancellationToken;
}
