//! Error types for the runtime abstraction layer.

use thiserror::Error;

/// Errors that can occur in the runtime abstraction layer.
#[derive(Debug, Error)]
pub enum EnvError {
    /// A long-lived task could not be spawned.
    #[error("spawn failed: {0}")]
    SpawnFailed(String),

    /// Operation timed out.
    #[error("timeout after {0:?}")]
    Timeout(std::time::Duration),
}
