//! Error types for the orchestration runtime

use crate::types::ModelTier;
use thiserror::Error;

/// Result type for orchestrator operations
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Error taxonomy for the fleet runtime
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// Unknown tier, missing required key, malformed value
    #[error("configuration error: {0}")]
    Config(String),

    /// HTTP connect/read/timeout failures
    #[error("transport error: {0}")]
    Transport(String),

    /// Non-2xx response or unparseable body
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Slot acquisition exhausted its deadline
    #[error("no capacity on {tier} (fallback: {fallback:?})")]
    Capacity {
        tier: ModelTier,
        fallback: Option<ModelTier>,
    },

    /// Spawn failed or stop timed out
    #[error("lifecycle error: {0}")]
    Lifecycle(String),

    /// Dependency cycle left tasks unreachable
    #[error("dependency cycle: {0}")]
    Cycle(String),

    /// Decomposition response unusable
    #[error("plan error: {0}")]
    Plan(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<reqwest::Error> for OrchestratorError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            OrchestratorError::Transport(err.to_string())
        } else if err.is_decode() {
            OrchestratorError::Protocol(err.to_string())
        } else {
            OrchestratorError::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        OrchestratorError::Protocol(err.to_string())
    }
}

impl From<std::io::Error> for OrchestratorError {
    fn from(err: std::io::Error) -> Self {
        OrchestratorError::Lifecycle(err.to_string())
    }
}
