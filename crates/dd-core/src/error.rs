//! Unified error types for deaddrop

use thiserror::Error;

use crate::types::{TaskId, TaskStatus};

/// Validation errors for task records and operation inputs
///
/// These are terminal: the input is wrong, not the timing. Retrying the same
/// call cannot succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("prompt is required")]
    PromptRequired,
    #[error("assigned_to is required")]
    AssignedToRequired,
    #[error("assigned_by is required")]
    AssignedByRequired,
    #[error("deliverable kind is required")]
    DeliverableKindRequired,
    #[error("deliverable location is required")]
    DeliverableLocationRequired,
    #[error("invalid task id: {0}")]
    InvalidTaskId(String),
    #[error("invalid status: {0}")]
    InvalidStatus(String),
    #[error("record must be pending, got {0}")]
    NotPending(TaskStatus),
    #[error("{0} record must carry claimed_by and claimed_at")]
    ClaimFieldsMissing(TaskStatus),
    #[error("{0} record cannot carry claimed_by or claimed_at")]
    ClaimFieldsForbidden(TaskStatus),
    #[error("deliverables are frozen once a task is {0}")]
    DeliverablesFrozen(TaskStatus),
    #[error("record says {status} but lives in the {partition} partition")]
    PartitionMismatch {
        status: TaskStatus,
        partition: String,
    },
}

/// Unified error type for all queue operations
#[derive(Error, Debug)]
pub enum QueueError {
    // Record errors
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("task {0} already exists")]
    DuplicateId(TaskId),

    #[error("illegal transition: {from} -> {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("not found: {0}")]
    NotFound(String),

    // Publish errors
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("publish gave up after {attempts} attempts: {reason}")]
    PublishTimeout { attempts: u32, reason: String },

    // VCS errors
    #[error("git command failed: {0}")]
    GitCommand(String),

    #[error("remote denied access: {0}")]
    AuthDenied(String),

    #[error("remote unreachable: {0}")]
    RemoteUnreachable(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(String),
}

impl QueueError {
    /// Stable failure kind for scripting: printed to stderr by the CLI so
    /// callers can branch without parsing messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::DuplicateId(_) => "duplicate_id",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::PublishTimeout { .. } => "publish_timeout",
            Self::GitCommand(_) => "git_command",
            Self::AuthDenied(_) => "auth_denied",
            Self::RemoteUnreachable(_) => "remote_unreachable",
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
            Self::Other(_) => "other",
        }
    }

    /// Whether the publish loop may spend another attempt on this error.
    ///
    /// Divergence is handled separately (it is an outcome, not an error);
    /// only transient network failures earn a retry. Auth rejections and
    /// everything else abort immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RemoteUnreachable(_))
    }
}

/// Result type alias using QueueError
pub type Result<T> = std::result::Result<T, QueueError>;
