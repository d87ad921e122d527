//! Error taxonomy for lifecycle operations and job processing.

use mailforge_queue::QueueError;
use mailforge_registry::RegistryError;
use mailforge_state::StateError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("permission denied: {0}")]
    Permission(String),

    /// The upload already has a batch that is actively processing.
    #[error("batch is already processing")]
    BatchBusy,

    #[error("scheduled time must be in the future")]
    InvalidSchedule,

    /// Per-recipient delivery failure; the queue's retry policy applies.
    #[error("transport failure: {0}")]
    Transport(String),

    /// Runtime state contradicts the registry. Fatal for the affected job
    /// only; the batch itself is left for an operator.
    #[error("runtime state inconsistent: {0}")]
    StateInconsistency(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl DispatchError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn permission(msg: impl Into<String>) -> Self {
        Self::Permission(msg.into())
    }

    pub fn transport(msg: impl std::fmt::Display) -> Self {
        Self::Transport(msg.to_string())
    }

    pub fn state_inconsistency(msg: impl Into<String>) -> Self {
        Self::StateInconsistency(msg.into())
    }
}

pub type DispatchResult<T> = Result<T, DispatchError>;
