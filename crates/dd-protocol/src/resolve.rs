//! Claiming and finishing work
//!
//! One `ClaimResolver` per agent. A `Conflict` from any operation means
//! another agent got there first; the right response is to pick different
//! work, never to retry the same claim against stale state.

use dd_core::{Deliverable, QueueError, Result, TaskId, TaskRecord, TaskStatus};
use dd_vcs::VersionControl;
use tracing::{debug, info, instrument};

use crate::mutation::Mutation;
use crate::publish::PublishProtocol;

/// Claims tasks and drives them to a terminal state
pub struct ClaimResolver<'a, V: VersionControl> {
    protocol: &'a PublishProtocol<V>,
    claimant: String,
}

impl<'a, V: VersionControl> ClaimResolver<'a, V> {
    pub fn new(protocol: &'a PublishProtocol<V>, claimant: impl Into<String>) -> Self {
        Self {
            protocol,
            claimant: claimant.into(),
        }
    }

    pub fn claimant(&self) -> &str {
        &self.claimant
    }

    /// Claim a pending task. On success the returned record carries this
    /// agent's claim; `Conflict` means someone else holds it.
    #[instrument(skip(self), fields(claimant = %self.claimant))]
    pub async fn claim(&self, task_id: TaskId) -> Result<TaskRecord> {
        let store = self.protocol.store();
        let (_, status) = store.locate(task_id).await?.ok_or_else(|| {
            QueueError::NotFound(format!("task {} is not in any partition", task_id))
        })?;
        if status != TaskStatus::Pending {
            return Err(QueueError::Conflict(format!(
                "task {} is {} and cannot be claimed",
                task_id, status
            )));
        }

        let receipt = self
            .protocol
            .publish(&Mutation::claim(task_id, self.claimant.clone()))
            .await?;
        info!(%task_id, attempts = receipt.attempts, "Claimed task");
        store.read(&receipt.path).await
    }

    /// Claim the oldest available pending task, skipping any lost to other
    /// agents along the way. Returns `None` when the queue holds nothing
    /// claimable.
    #[instrument(skip(self), fields(claimant = %self.claimant))]
    pub async fn claim_next(&self) -> Result<Option<TaskRecord>> {
        let mut candidates = self
            .protocol
            .store()
            .list_records(TaskStatus::Pending)
            .await?;
        candidates.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.task_id.to_string().cmp(&b.task_id.to_string()))
        });

        for candidate in candidates {
            match self.claim(candidate.task_id).await {
                Ok(record) => return Ok(Some(record)),
                Err(QueueError::Conflict(reason)) => {
                    debug!(task_id = %candidate.task_id, "Skipping lost claim: {}", reason);
                }
                Err(QueueError::NotFound(_)) => {
                    // Gone entirely since the listing; same as a lost race
                    debug!(task_id = %candidate.task_id, "Record vanished before claim");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Mark a task this agent claimed as completed.
    pub async fn complete(&self, task_id: TaskId) -> Result<()> {
        self.finish(task_id, TaskStatus::Completed).await
    }

    /// Mark a task this agent claimed as failed.
    pub async fn fail(&self, task_id: TaskId) -> Result<()> {
        self.finish(task_id, TaskStatus::Failed).await
    }

    /// Append a deliverable to an open task.
    #[instrument(skip(self, deliverable))]
    pub async fn add_deliverable(&self, task_id: TaskId, deliverable: Deliverable) -> Result<()> {
        self.protocol
            .publish(&Mutation::amend(task_id, deliverable))
            .await?;
        Ok(())
    }

    #[instrument(skip(self, to), fields(claimant = %self.claimant, to = %to))]
    async fn finish(&self, task_id: TaskId, to: TaskStatus) -> Result<()> {
        let store = self.protocol.store();
        let (path, status) = store.locate(task_id).await?.ok_or_else(|| {
            QueueError::NotFound(format!("task {} is not in any partition", task_id))
        })?;

        // Only the claimant may finish a task. Anything not in progress
        // falls through to the transition check.
        if status == TaskStatus::InProgress {
            let record = store.read(&path).await?;
            if record.claimed_by.as_deref() != Some(self.claimant.as_str()) {
                return Err(QueueError::Conflict(format!(
                    "task {} is claimed by {}, not {}",
                    task_id,
                    record.claimed_by.unwrap_or_default(),
                    self.claimant
                )));
            }
        }

        let mutation = match to {
            TaskStatus::Completed => Mutation::complete(task_id, self.claimant.clone()),
            TaskStatus::Failed => Mutation::fail(task_id, self.claimant.clone()),
            other => {
                return Err(QueueError::InvalidTransition {
                    from: status,
                    to: other,
                })
            }
        };
        let receipt = self.protocol.publish(&mutation).await?;
        info!(%task_id, attempts = receipt.attempts, "Task is now {}", to);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assign::TaskAssigner;
    use dd_core::RetryPolicy;
    use dd_store::QueueStore;
    use dd_vcs::{InMemoryVcs, SharedRemote};
    use std::time::Duration;
    use tempfile::TempDir;

    fn agent(remote: &SharedRemote, label: &str) -> (TempDir, PublishProtocol<InMemoryVcs>) {
        let dir = TempDir::new().unwrap();
        let vcs = remote.clone_into(label, dir.path()).unwrap();
        let store = QueueStore::new(dir.path().join("queue"));
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        };
        (dir, PublishProtocol::new(vcs, store, policy))
    }

    async fn seed_task(remote: &SharedRemote, prompt: &str) -> TaskId {
        let (_dir, protocol) = agent(remote, "assigner");
        TaskAssigner::new(&protocol)
            .assign(prompt, "agent-b", "agent-a", Vec::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_claim_stamps_the_claimant() {
        let remote = SharedRemote::new();
        let task_id = seed_task(&remote, "audit logs").await;

        let (_dir, protocol) = agent(&remote, "b");
        let resolver = ClaimResolver::new(&protocol, "agent-b");

        let record = resolver.claim(task_id).await.unwrap();
        assert_eq!(record.status, TaskStatus::InProgress);
        assert_eq!(record.claimed_by.as_deref(), Some("agent-b"));
        assert!(record.claimed_at.is_some());
    }

    #[tokio::test]
    async fn test_claiming_an_unknown_task_is_not_found() {
        let remote = SharedRemote::new();
        let (_dir, protocol) = agent(&remote, "b");
        let resolver = ClaimResolver::new(&protocol, "agent-b");

        let err = resolver.claim(TaskId::generate()).await.unwrap_err();
        assert!(matches!(err, QueueError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_second_claimant_gets_conflict() {
        let remote = SharedRemote::new();
        let task_id = seed_task(&remote, "audit logs").await;

        let (_dir_b, proto_b) = agent(&remote, "b");
        let (_dir_c, proto_c) = agent(&remote, "c");
        let b = ClaimResolver::new(&proto_b, "agent-b");
        let c = ClaimResolver::new(&proto_c, "agent-c");

        b.claim(task_id).await.unwrap();
        let err = c.claim(task_id).await.unwrap_err();
        assert!(matches!(err, QueueError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_claim_next_takes_the_oldest_pending_task() {
        let remote = SharedRemote::new();
        let first = seed_task(&remote, "first").await;
        let _second = seed_task(&remote, "second").await;

        let (_dir, protocol) = agent(&remote, "b");
        let resolver = ClaimResolver::new(&protocol, "agent-b");

        let record = resolver.claim_next().await.unwrap().unwrap();
        assert_eq!(record.task_id, first);
        assert_eq!(record.prompt, "first");
    }

    #[tokio::test]
    async fn test_claim_next_skips_tasks_lost_to_others() {
        let remote = SharedRemote::new();
        let first = seed_task(&remote, "first").await;
        let second = seed_task(&remote, "second").await;

        // c clones while both tasks look pending, then b snatches the first
        let (_dir_c, proto_c) = agent(&remote, "c");
        let (_dir_b, proto_b) = agent(&remote, "b");
        ClaimResolver::new(&proto_b, "agent-b")
            .claim(first)
            .await
            .unwrap();

        let record = ClaimResolver::new(&proto_c, "agent-c")
            .claim_next()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.task_id, second);
    }

    #[tokio::test]
    async fn test_claim_next_on_an_empty_queue() {
        let remote = SharedRemote::new();
        let (_dir, protocol) = agent(&remote, "b");
        let resolver = ClaimResolver::new(&protocol, "agent-b");
        assert!(resolver.claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_complete_requires_the_claimant() {
        let remote = SharedRemote::new();
        let task_id = seed_task(&remote, "audit logs").await;

        let (_dir_b, proto_b) = agent(&remote, "b");
        ClaimResolver::new(&proto_b, "agent-b")
            .claim(task_id)
            .await
            .unwrap();

        // A different agent cannot finish b's task
        let (_dir_c, proto_c) = agent(&remote, "c");
        let err = ClaimResolver::new(&proto_c, "agent-c")
            .complete(task_id)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Conflict(_)));

        // The claimant can
        ClaimResolver::new(&proto_b, "agent-b")
            .complete(task_id)
            .await
            .unwrap();
        let (_, status) = proto_b.store().locate(task_id).await.unwrap().unwrap();
        assert_eq!(status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_completing_an_unclaimed_task_is_invalid() {
        let remote = SharedRemote::new();
        let task_id = seed_task(&remote, "audit logs").await;

        let (_dir, protocol) = agent(&remote, "b");
        let err = ClaimResolver::new(&protocol, "agent-b")
            .complete(task_id)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            QueueError::InvalidTransition {
                from: TaskStatus::Pending,
                to: TaskStatus::Completed
            }
        ));
    }

    #[tokio::test]
    async fn test_add_deliverable_to_claimed_task() {
        let remote = SharedRemote::new();
        let task_id = seed_task(&remote, "audit logs").await;

        let (_dir, protocol) = agent(&remote, "b");
        let resolver = ClaimResolver::new(&protocol, "agent-b");
        resolver.claim(task_id).await.unwrap();
        resolver
            .add_deliverable(task_id, Deliverable::new("report", "out/audit.md"))
            .await
            .unwrap();

        let (path, _) = protocol.store().locate(task_id).await.unwrap().unwrap();
        let record = protocol.store().read(&path).await.unwrap();
        assert_eq!(record.deliverables.len(), 1);
        assert_eq!(record.deliverables[0].kind, "report");
    }
}
