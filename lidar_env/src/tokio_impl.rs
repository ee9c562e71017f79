//! Production implementation of `RuntimeContext` using Tokio.

use crate::RuntimeContext;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Production context backed by Tokio's multi-threaded runtime.
pub struct TokioRuntimeContext {
    start: Instant,
    cancel: CancellationToken,
}

impl TokioRuntimeContext {
    /// Creates a new context with a fresh cancellation token.
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            cancel: CancellationToken::new(),
        }
    }

    /// Creates an Arc-wrapped context for sharing across tasks.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl Default for TokioRuntimeContext {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RuntimeContext for TokioRuntimeContext {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }

    fn system_time(&self) -> SystemTime {
        SystemTime::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn spawn<F>(&self, name: &str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let name = name.to_string();
        tokio::spawn(async move {
            future.await;
            tracing::debug!(task = %name, "task exited");
        });
    }

    fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for TokioRuntimeContext {
    fn drop(&mut self) {
        if !self.cancel.is_cancelled() {
            warn!("TokioRuntimeContext dropped without explicit cancellation");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tokio_context_time_advances() {
        let ctx = TokioRuntimeContext::new();
        let t1 = ctx.now();
        ctx.sleep(Duration::from_millis(10)).await;
        let t2 = ctx.now();

        assert!(t2 > t1);
        assert!(t2 - t1 >= Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_cancellation_propagates_to_clones() {
        let ctx = TokioRuntimeContext::new();
        let token = ctx.cancellation_token();
        assert!(!token.is_cancelled());
        ctx.cancellation_token().cancel();
        assert!(token.is_cancelled());
    }
}
