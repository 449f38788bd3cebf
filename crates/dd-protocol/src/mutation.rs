//! The unit of change a publish makes durable
//!
//! A mutation carries everything needed to apply it, re-validate it against
//! a freshly synchronized tree, and re-apply it after a lost push.
//! Timestamps are fixed at construction so a re-applied attempt writes
//! byte-identical content to the first one.

use chrono::{DateTime, Utc};
use dd_core::{Deliverable, TaskId, TaskRecord, TaskStatus};

/// One local change on its way to the shared store
#[derive(Debug, Clone)]
pub enum Mutation {
    /// A new record entering the `pending` partition.
    Create { record: TaskRecord },

    /// The `pending -> in_progress` edge, stamping the claim fields.
    Claim {
        task_id: TaskId,
        claimant: String,
        at: DateTime<Utc>,
    },

    /// Any other lifecycle edge. `actor` is the claimant performing a
    /// terminal transition; withdrawal carries none because a cancelled
    /// record names nobody.
    Transition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
        actor: Option<String>,
    },

    /// A deliverable appended to an open record.
    Amend {
        task_id: TaskId,
        deliverable: Deliverable,
    },
}

impl Mutation {
    pub fn create(record: TaskRecord) -> Self {
        Self::Create { record }
    }

    pub fn claim(task_id: TaskId, claimant: impl Into<String>) -> Self {
        Self::Claim {
            task_id,
            claimant: claimant.into(),
            at: Utc::now(),
        }
    }

    pub fn complete(task_id: TaskId, claimant: impl Into<String>) -> Self {
        Self::Transition {
            task_id,
            from: TaskStatus::InProgress,
            to: TaskStatus::Completed,
            actor: Some(claimant.into()),
        }
    }

    pub fn fail(task_id: TaskId, claimant: impl Into<String>) -> Self {
        Self::Transition {
            task_id,
            from: TaskStatus::InProgress,
            to: TaskStatus::Failed,
            actor: Some(claimant.into()),
        }
    }

    pub fn withdraw(task_id: TaskId) -> Self {
        Self::Transition {
            task_id,
            from: TaskStatus::Pending,
            to: TaskStatus::Cancelled,
            actor: None,
        }
    }

    pub fn amend(task_id: TaskId, deliverable: Deliverable) -> Self {
        Self::Amend {
            task_id,
            deliverable,
        }
    }

    pub fn task_id(&self) -> TaskId {
        match self {
            Self::Create { record } => record.task_id,
            Self::Claim { task_id, .. }
            | Self::Transition { task_id, .. }
            | Self::Amend { task_id, .. } => *task_id,
        }
    }

    /// One-line commit message for the history log.
    pub fn message(&self) -> String {
        match self {
            Self::Create { record } => format!("create task {}", record.task_id),
            Self::Claim {
                task_id, claimant, ..
            } => format!("claim task {} for {}", task_id, claimant),
            Self::Transition { task_id, to, .. } => match to {
                TaskStatus::Completed => format!("complete task {}", task_id),
                TaskStatus::Failed => format!("fail task {}", task_id),
                TaskStatus::Cancelled => format!("withdraw task {}", task_id),
                _ => format!("move task {} to {}", task_id, to),
            },
            Self::Amend { task_id, .. } => format!("amend task {} deliverables", task_id),
        }
    }
}
