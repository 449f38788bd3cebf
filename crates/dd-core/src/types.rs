//! Core type definitions for the deaddrop task queue

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::ValidationError;

/// Unique task identifier
///
/// UUID v4, generated locally. Randomness keeps ids collision-resistant
/// across agents that never coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| ValidationError::InvalidTaskId(s.to_string()))
    }
}

/// Task lifecycle state
///
/// The lifecycle is a one-way street:
///
/// ```text
/// pending -> in_progress -> {completed, failed}
/// pending -> cancelled
/// ```
///
/// Nothing re-enters `pending`, nothing skips `in_progress`, and terminal
/// states accept no further edges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Every status, in partition-scan order.
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::InProgress,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    /// Legal out-edges from this state.
    pub fn successors(&self) -> &'static [TaskStatus] {
        match self {
            Self::Pending => &[Self::InProgress, Self::Cancelled],
            Self::InProgress => &[Self::Completed, Self::Failed],
            Self::Completed | Self::Failed | Self::Cancelled => &[],
        }
    }

    pub fn can_transition_to(&self, to: TaskStatus) -> bool {
        self.successors().contains(&to)
    }

    /// Terminal states are immutable once reached.
    pub fn is_terminal(&self) -> bool {
        self.successors().is_empty()
    }

    /// Directory name of the queue partition holding records in this state.
    pub fn partition(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.partition())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "in_progress" | "inprogress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(ValidationError::InvalidStatus(s.to_string())),
        }
    }
}

/// An expected output of a task: what kind of artifact, and where it lands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deliverable {
    pub kind: String,
    pub location: String,
}

impl Deliverable {
    pub fn new(kind: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            location: location.into(),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.kind.is_empty() {
            return Err(ValidationError::DeliverableKindRequired);
        }
        if self.location.is_empty() {
            return Err(ValidationError::DeliverableLocationRequired);
        }
        Ok(())
    }
}

/// A task record exchanged through the shared repository
///
/// Field order is load-bearing: serde_json emits struct fields in
/// declaration order, so every agent serializing the same logical record
/// produces byte-identical JSON. Reordering fields changes published bytes.
///
/// Identity fields (`task_id`, `assigned_to`, `assigned_by`, `created_at`,
/// `prompt`, `deliverables`) never change after publication. `status`,
/// `claimed_by` and `claimed_at` mutate only through the lifecycle edges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub assigned_to: String,
    pub assigned_by: String,
    pub created_at: DateTime<Utc>,
    pub prompt: String,
    #[serde(default)]
    pub deliverables: Vec<Deliverable>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    /// Create a fresh pending record with a generated id.
    pub fn new(
        prompt: impl Into<String>,
        assigned_to: impl Into<String>,
        assigned_by: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        let record = Self {
            task_id: TaskId::generate(),
            status: TaskStatus::Pending,
            assigned_to: assigned_to.into(),
            assigned_by: assigned_by.into(),
            created_at: Utc::now(),
            prompt: prompt.into(),
            deliverables: Vec::new(),
            claimed_by: None,
            claimed_at: None,
        };
        record.validate()?;
        Ok(record)
    }

    pub fn with_deliverables(mut self, deliverables: Vec<Deliverable>) -> Self {
        self.deliverables = deliverables;
        self
    }

    /// File name of this record inside its partition directory.
    pub fn file_name(&self) -> String {
        format!("{}.json", self.task_id)
    }

    /// Whether the claim metadata is filled in.
    pub fn is_claimed(&self) -> bool {
        self.claimed_by.is_some() && self.claimed_at.is_some()
    }

    /// Check cross-field invariants.
    ///
    /// Claim fields track the `pending -> in_progress` edge exactly: absent
    /// before it, present after it. `cancelled` is reachable only from
    /// `pending`, so a cancelled record never carries them.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.prompt.is_empty() {
            return Err(ValidationError::PromptRequired);
        }
        if self.assigned_to.is_empty() {
            return Err(ValidationError::AssignedToRequired);
        }
        if self.assigned_by.is_empty() {
            return Err(ValidationError::AssignedByRequired);
        }
        for deliverable in &self.deliverables {
            deliverable.validate()?;
        }
        match self.status {
            TaskStatus::Pending | TaskStatus::Cancelled => {
                if self.claimed_by.is_some() || self.claimed_at.is_some() {
                    return Err(ValidationError::ClaimFieldsForbidden(self.status));
                }
            }
            TaskStatus::InProgress | TaskStatus::Completed | TaskStatus::Failed => {
                if !self.is_claimed() {
                    return Err(ValidationError::ClaimFieldsMissing(self.status));
                }
            }
        }
        Ok(())
    }

    /// Deterministic hash of the identity-defining fields.
    ///
    /// Two records with equal hashes are the same publication. The
    /// idempotent-create check compares these instead of raw bytes so that
    /// claim metadata added after publication does not defeat the match.
    pub fn identity_hash(&self) -> String {
        let mut hasher = Sha256::new();
        Self::hash_str(&mut hasher, &self.task_id.to_string());
        Self::hash_str(&mut hasher, &self.assigned_to);
        Self::hash_str(&mut hasher, &self.assigned_by);
        Self::hash_str(&mut hasher, &self.created_at.to_rfc3339());
        Self::hash_str(&mut hasher, &self.prompt);
        for deliverable in &self.deliverables {
            Self::hash_str(&mut hasher, &deliverable.kind);
            Self::hash_str(&mut hasher, &deliverable.location);
        }
        format!("{:x}", hasher.finalize())
    }

    fn hash_str(hasher: &mut Sha256, s: &str) {
        hasher.update(s.as_bytes());
        hasher.update([0]);
    }
}
