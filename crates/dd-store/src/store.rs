//! The partitioned queue store
//!
//! One `QueueStore` manages the partition directories of a single queue
//! inside a working copy. Every operation is a local filesystem effect; the
//! store enforces the lifecycle edges and the partition/status agreement
//! invariant, and leaves visibility to the publish protocol.

use chrono::{DateTime, Utc};
use dd_core::{
    Deliverable, QueueError, Result, TaskId, TaskRecord, TaskStatus, ValidationError,
};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, instrument};

use crate::record_io;

/// Partitioned record storage rooted at `<repo>/<queue root>`
#[derive(Debug, Clone)]
pub struct QueueStore {
    root: PathBuf,
}

impl QueueStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Queue root directory holding the partitions.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding records in the given state.
    pub fn partition_dir(&self, status: TaskStatus) -> PathBuf {
        self.root.join(status.partition())
    }

    /// Create the partition directories, each with a `.gitkeep` so git
    /// tracks them while empty. Returns the `.gitkeep` paths for staging.
    pub async fn init_partitions(&self) -> Result<Vec<PathBuf>> {
        let mut keep_files = Vec::new();
        for status in TaskStatus::ALL {
            let dir = self.partition_dir(status);
            fs::create_dir_all(&dir).await?;

            let keep = dir.join(".gitkeep");
            if !keep.exists() {
                fs::write(&keep, []).await?;
            }
            keep_files.push(keep);
        }
        Ok(keep_files)
    }

    /// Write a fresh record into the `pending` partition.
    ///
    /// The record must be pending, and its id must not exist in any
    /// partition. Ids are never reused, so the duplicate scan covers the
    /// terminal partitions too.
    #[instrument(skip(self, record), fields(task_id = %record.task_id))]
    pub async fn create(&self, record: &TaskRecord) -> Result<PathBuf> {
        if record.status != TaskStatus::Pending {
            return Err(ValidationError::NotPending(record.status).into());
        }
        if self.locate(record.task_id).await?.is_some() {
            return Err(QueueError::DuplicateId(record.task_id));
        }

        record_io::write_record(&self.partition_dir(TaskStatus::Pending), record).await
    }

    /// Read the record at `path`, enforcing that the partition it lives in
    /// matches its `status` field.
    pub async fn read(&self, path: &Path) -> Result<TaskRecord> {
        let record = self.read_at(path).await?;

        let partition = path
            .parent()
            .and_then(|dir| dir.file_name())
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        if partition != record.status.partition() {
            return Err(ValidationError::PartitionMismatch {
                status: record.status,
                partition,
            }
            .into());
        }

        Ok(record)
    }

    /// Find a record by id across all partitions.
    pub async fn locate(&self, task_id: TaskId) -> Result<Option<(PathBuf, TaskStatus)>> {
        let file_name = format!("{}.json", task_id);
        for status in TaskStatus::ALL {
            let candidate = self.partition_dir(status).join(&file_name);
            if fs::try_exists(&candidate).await? {
                return Ok(Some((candidate, status)));
            }
        }
        Ok(None)
    }

    /// Move the record at `path` to the `to` partition, rewriting its
    /// status. Fails with `InvalidTransition` when `to` is not a legal
    /// successor and `NotFound` when the source no longer exists.
    #[instrument(skip(self, path), fields(path = %path.display()))]
    pub async fn transition(&self, path: &Path, to: TaskStatus) -> Result<PathBuf> {
        let record = self.read(path).await?;
        if !record.status.can_transition_to(to) {
            return Err(QueueError::InvalidTransition {
                from: record.status,
                to,
            });
        }

        let mut updated = record;
        updated.status = to;
        self.move_record(path, updated).await
    }

    /// The `pending -> in_progress` transition, stamping the claim fields
    /// exactly once.
    #[instrument(skip(self, path, claimed_at), fields(path = %path.display()))]
    pub async fn claim(
        &self,
        path: &Path,
        claimant: &str,
        claimed_at: DateTime<Utc>,
    ) -> Result<PathBuf> {
        let record = self.read(path).await?;
        if !record.status.can_transition_to(TaskStatus::InProgress) {
            return Err(QueueError::InvalidTransition {
                from: record.status,
                to: TaskStatus::InProgress,
            });
        }

        let mut updated = record;
        updated.status = TaskStatus::InProgress;
        updated.claimed_by = Some(claimant.to_string());
        updated.claimed_at = Some(claimed_at);
        self.move_record(path, updated).await
    }

    /// Append a deliverable to the record at `path`, in place.
    ///
    /// Deliverables are frozen once a task reaches a terminal state.
    pub async fn append_deliverable(
        &self,
        path: &Path,
        deliverable: Deliverable,
    ) -> Result<PathBuf> {
        deliverable.validate()?;

        let mut record = self.read(path).await?;
        if record.status.is_terminal() {
            return Err(ValidationError::DeliverablesFrozen(record.status).into());
        }
        record.deliverables.push(deliverable);

        record_io::write_record(&self.partition_dir(record.status), &record).await
    }

    /// Record paths in one partition, sorted by file name.
    pub async fn list(&self, status: TaskStatus) -> Result<Vec<PathBuf>> {
        record_io::list_record_paths(&self.partition_dir(status)).await
    }

    /// All readable records in one partition; invalid files are skipped
    /// with a warning.
    pub async fn list_records(&self, status: TaskStatus) -> Result<Vec<TaskRecord>> {
        record_io::read_all_records(&self.partition_dir(status)).await
    }

    /// Write the updated record into its new partition, then remove the old
    /// file. If the removal fails, the new file is taken back out so no
    /// record is ever reachable from two partitions.
    async fn move_record(&self, old_path: &Path, updated: TaskRecord) -> Result<PathBuf> {
        let new_path =
            record_io::write_record(&self.partition_dir(updated.status), &updated).await?;

        if let Err(e) = fs::remove_file(old_path).await {
            record_io::remove_record(&new_path).await?;
            return Err(e.into());
        }

        debug!(
            "Moved {} -> {}",
            old_path.display(),
            new_path.display()
        );
        Ok(new_path)
    }

    /// A vanished file reads as `NotFound` rather than a raw I/O error:
    /// another process moving the record out from under us is an expected
    /// outcome, not a filesystem fault.
    async fn read_at(&self, path: &Path) -> Result<TaskRecord> {
        match record_io::read_record(path).await {
            Err(QueueError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Err(
                QueueError::NotFound(format!("record {} no longer exists", path.display())),
            ),
            other => other,
        }
    }
}
