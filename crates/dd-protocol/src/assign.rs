//! Task assignment
//!
//! Builds a record, places it in `pending`, and publishes it. All the
//! rollback guarantees come from the publish protocol: a failed assignment
//! leaves nothing local that could later be mistaken for a pending task.

use dd_core::{Deliverable, Result, TaskId, TaskRecord};
use dd_vcs::VersionControl;
use tracing::{info, instrument};

use crate::mutation::Mutation;
use crate::publish::PublishProtocol;

/// Creates and publishes new tasks
pub struct TaskAssigner<'a, V: VersionControl> {
    protocol: &'a PublishProtocol<V>,
}

impl<'a, V: VersionControl> TaskAssigner<'a, V> {
    pub fn new(protocol: &'a PublishProtocol<V>) -> Self {
        Self { protocol }
    }

    /// Publish a new pending task and return its id.
    #[instrument(skip(self, prompt, deliverables))]
    pub async fn assign(
        &self,
        prompt: impl Into<String>,
        assigned_to: &str,
        assigned_by: &str,
        deliverables: Vec<Deliverable>,
    ) -> Result<TaskId> {
        let record =
            TaskRecord::new(prompt, assigned_to, assigned_by)?.with_deliverables(deliverables);
        record.validate()?;

        let task_id = record.task_id;
        let receipt = self.protocol.publish(&Mutation::create(record)).await?;
        info!(
            %task_id,
            attempts = receipt.attempts,
            "Assigned task to {}", assigned_to
        );
        Ok(task_id)
    }

    /// Withdraw a still-pending task. Fails with `Conflict` if another
    /// agent claimed it first, and `InvalidTransition` if it already left
    /// `pending` in our own working copy.
    #[instrument(skip(self))]
    pub async fn withdraw(&self, task_id: TaskId) -> Result<()> {
        self.protocol.publish(&Mutation::withdraw(task_id)).await?;
        info!(%task_id, "Withdrew task");
        Ok(())
    }
}
