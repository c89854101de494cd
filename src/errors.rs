use thiserror::Error;

use crate::models::ResultStatus;

pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced by the verification engine.
///
/// None of these are retried by the engine itself; callers decide what to do
/// with the ids and states carried in each variant.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed submission or missing mandatory reason.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Lost a race or would demote an independently verified result.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Transition attempted from a terminal state.
    #[error("result {id} is {status} and cannot be {attempted}")]
    State {
        id: String,
        status: ResultStatus,
        attempted: &'static str,
    },

    #[error("actor {actor_id} is not allowed to {action}")]
    Forbidden { actor_id: String, action: &'static str },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl EngineError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        EngineError::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Stable machine-readable code for transports.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation_error",
            EngineError::Conflict(_) => "conflict_error",
            EngineError::NotFound { .. } => "not_found",
            EngineError::State { .. } => "state_error",
            EngineError::Forbidden { .. } => "forbidden",
            EngineError::Config(_) => "config_error",
            EngineError::Storage(_) | EngineError::Database(_) => "storage_error",
        }
    }

    /// Conflicts need a human re-decision but the request itself may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Conflict(_))
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Storage(format!("json: {}", e))
    }
}
