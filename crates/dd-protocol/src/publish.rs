//! The optimistic publish loop
//!
//! The shared remote rejects any push whose base has diverged, and accepts
//! pushes one at a time. `PublishProtocol` turns that into a compare-and-swap
//! over the queue tree: apply locally, commit, push; on rejection synchronize
//! with the remote, decide whether the mutation still makes sense, and either
//! re-apply on top of the new state or report the lost race. Nothing reaches
//! the remote until a push is accepted, so abandoning an attempt at any retry
//! boundary leaves the shared state untouched.

use dd_core::{QueueError, Result, RetryPolicy, TaskId, TaskStatus};
use dd_store::QueueStore;
use dd_vcs::{PushOutcome, VersionControl};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::mutation::Mutation;

/// Proof that a mutation is visible in the shared store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub task_id: TaskId,
    /// Where the record lives in the working copy after publication.
    pub path: PathBuf,
    /// Push attempts spent, successful one included.
    pub attempts: u32,
}

/// A mutation applied to the working copy, with the paths it touched
struct Applied {
    path: PathBuf,
    staged: Vec<PathBuf>,
}

/// What a synchronized tree says about a pending mutation
enum Revalidation {
    /// The remote already shows this exact mutation; an earlier push of
    /// ours landed without us learning of it. Success, nothing to redo.
    AlreadyApplied(PathBuf),
    /// The mutation still applies cleanly on top of the new state.
    Reapply,
}

/// Publishes local mutations to the shared remote
pub struct PublishProtocol<V: VersionControl> {
    vcs: V,
    store: QueueStore,
    policy: RetryPolicy,
}

impl<V: VersionControl> PublishProtocol<V> {
    pub fn new(vcs: V, store: QueueStore, policy: RetryPolicy) -> Self {
        Self { vcs, store, policy }
    }

    /// Local store this protocol applies mutations through.
    pub fn store(&self) -> &QueueStore {
        &self.store
    }

    /// The version control capability carrying the queue. Exposed so agents
    /// can refresh their view of the remote between operations; publishing
    /// itself never needs outside access.
    pub fn vcs(&self) -> &V {
        &self.vcs
    }

    /// Make `mutation` durable and visible in the shared store.
    ///
    /// Terminal failures (`Validation`, `DuplicateId`, `InvalidTransition`,
    /// `NotFound`, `Conflict`, `AuthDenied`) leave no local residue: either
    /// the apply never touched the tree, or the working copy is rolled back
    /// to the last synchronized remote state. Transient transport failures
    /// and divergence both consume attempts from the same retry budget;
    /// exhausting it fails with `PublishTimeout` after rollback.
    #[instrument(skip(self, mutation), fields(task_id = %mutation.task_id()))]
    pub async fn publish(&self, mutation: &Mutation) -> Result<PublishReceipt> {
        let mut applied = self.apply(mutation).await?;
        if let Err(e) = self.record(mutation, &applied).await {
            self.rollback().await;
            return Err(e);
        }

        let mut attempts = 0u32;
        let mut backoff = self.policy.initial_backoff;
        let mut last_reason = String::from("no push attempted");

        while attempts < self.policy.max_attempts {
            attempts += 1;

            match self.vcs.push().await {
                Ok(PushOutcome::Accepted) => {
                    info!(attempts, "Published {}", mutation.message());
                    return Ok(PublishReceipt {
                        task_id: mutation.task_id(),
                        path: applied.path,
                        attempts,
                    });
                }

                Ok(PushOutcome::Rejected { reason }) => {
                    debug!(attempts, "Push rejected: {}", reason);
                    last_reason = reason;
                    if attempts >= self.policy.max_attempts {
                        break;
                    }
                    backoff = self.wait(backoff).await;

                    match self.synchronize().await {
                        Ok(()) => {}
                        Err(e) if e.is_retryable() => {
                            // The remote vanished mid-synchronize; spend
                            // another attempt on the whole cycle.
                            last_reason = e.to_string();
                            continue;
                        }
                        Err(e) => {
                            self.rollback().await;
                            return Err(e);
                        }
                    }

                    match self.revalidate(mutation).await? {
                        Revalidation::AlreadyApplied(path) => {
                            info!(attempts, "Remote already holds {}", mutation.message());
                            return Ok(PublishReceipt {
                                task_id: mutation.task_id(),
                                path,
                                attempts,
                            });
                        }
                        Revalidation::Reapply => {
                            applied = match self.apply(mutation).await {
                                Ok(applied) => applied,
                                Err(e) => {
                                    self.rollback().await;
                                    return Err(e);
                                }
                            };
                            if let Err(e) = self.record(mutation, &applied).await {
                                self.rollback().await;
                                return Err(e);
                            }
                        }
                    }
                }

                Err(e) if e.is_retryable() => {
                    warn!(attempts, "Push failed on transport: {}", e);
                    last_reason = e.to_string();
                    if attempts >= self.policy.max_attempts {
                        break;
                    }
                    // The commit is intact; only the push needs repeating.
                    backoff = self.wait(backoff).await;
                }

                Err(e) => {
                    self.rollback().await;
                    return Err(e);
                }
            }
        }

        self.rollback().await;
        Err(QueueError::PublishTimeout {
            attempts,
            reason: last_reason,
        })
    }

    /// Apply the mutation to the working copy. Failures here are terminal
    /// and leave the tree untouched.
    async fn apply(&self, mutation: &Mutation) -> Result<Applied> {
        match mutation {
            Mutation::Create { record } => {
                let path = self.store.create(record).await?;
                Ok(Applied {
                    staged: vec![path.clone()],
                    path,
                })
            }
            Mutation::Claim {
                task_id,
                claimant,
                at,
            } => {
                let (src, _) = self.require(*task_id).await?;
                let path = self.store.claim(&src, claimant, *at).await?;
                Ok(Applied {
                    staged: vec![src, path.clone()],
                    path,
                })
            }
            Mutation::Transition { task_id, to, .. } => {
                let (src, _) = self.require(*task_id).await?;
                let path = self.store.transition(&src, *to).await?;
                Ok(Applied {
                    staged: vec![src, path.clone()],
                    path,
                })
            }
            Mutation::Amend {
                task_id,
                deliverable,
            } => {
                let (src, _) = self.require(*task_id).await?;
                let path = self.store.append_deliverable(&src, deliverable.clone()).await?;
                Ok(Applied {
                    staged: vec![path.clone()],
                    path,
                })
            }
        }
    }

    /// Stage the touched paths and commit them as one atomic unit.
    async fn record(&self, mutation: &Mutation, applied: &Applied) -> Result<()> {
        self.vcs.stage(&applied.staged).await?;
        self.vcs.commit(&mutation.message()).await
    }

    /// Fetch the remote's current state and make the working copy match it,
    /// discarding our rejected commit.
    async fn synchronize(&self) -> Result<()> {
        self.vcs.fetch().await?;
        self.vcs.integrate().await
    }

    /// Decide what a rejected mutation means against the synchronized tree.
    async fn revalidate(&self, mutation: &Mutation) -> Result<Revalidation> {
        match mutation {
            Mutation::Create { record } => match self.store.locate(record.task_id).await? {
                None => Ok(Revalidation::Reapply),
                Some((path, _)) => {
                    let existing = self.store.read(&path).await?;
                    if existing.identity_hash() == record.identity_hash() {
                        Ok(Revalidation::AlreadyApplied(path))
                    } else {
                        Err(QueueError::DuplicateId(record.task_id))
                    }
                }
            },

            Mutation::Claim {
                task_id, claimant, ..
            } => {
                let (path, status) = self.require(*task_id).await?;
                match status {
                    TaskStatus::Pending => Ok(Revalidation::Reapply),
                    TaskStatus::InProgress => {
                        let record = self.store.read(&path).await?;
                        if record.claimed_by.as_deref() == Some(claimant.as_str()) {
                            Ok(Revalidation::AlreadyApplied(path))
                        } else {
                            Err(QueueError::Conflict(format!(
                                "task {} already claimed by {}",
                                task_id,
                                record.claimed_by.unwrap_or_default()
                            )))
                        }
                    }
                    other => Err(QueueError::Conflict(format!(
                        "task {} is already {}",
                        task_id, other
                    ))),
                }
            }

            Mutation::Transition {
                task_id,
                from,
                to,
                actor,
            } => {
                let (path, status) = self.require(*task_id).await?;
                if status == *from {
                    return Ok(Revalidation::Reapply);
                }
                if status == *to {
                    let record = self.store.read(&path).await?;
                    // Claim fields are stamped exactly once, so a terminal
                    // record naming our claimant can only be our own doing.
                    let ours = match actor {
                        Some(actor) => record.claimed_by.as_deref() == Some(actor.as_str()),
                        None => true,
                    };
                    if ours {
                        return Ok(Revalidation::AlreadyApplied(path));
                    }
                }
                Err(QueueError::Conflict(format!(
                    "task {} moved to {} under us",
                    task_id, status
                )))
            }

            Mutation::Amend {
                task_id,
                deliverable,
            } => {
                let (path, status) = self.require(*task_id).await?;
                if status.is_terminal() {
                    return Err(QueueError::Conflict(format!(
                        "task {} is already {}; deliverables are frozen",
                        task_id, status
                    )));
                }
                let record = self.store.read(&path).await?;
                if record.deliverables.contains(deliverable) {
                    Ok(Revalidation::AlreadyApplied(path))
                } else {
                    Ok(Revalidation::Reapply)
                }
            }
        }
    }

    async fn require(&self, task_id: TaskId) -> Result<(PathBuf, TaskStatus)> {
        self.store.locate(task_id).await?.ok_or_else(|| {
            QueueError::NotFound(format!("task {} is not in any partition", task_id))
        })
    }

    /// Sleep out the current backoff and return the next one.
    async fn wait(&self, backoff: Duration) -> Duration {
        tokio::time::sleep(backoff).await;
        self.policy.next_backoff(backoff)
    }

    /// Discard everything the remote never accepted. Best-effort: a failed
    /// rollback is logged, not surfaced, because the caller is already
    /// handling the original failure.
    async fn rollback(&self) {
        if let Err(e) = self.vcs.fetch().await {
            debug!("Rollback fetch failed, integrating last-known state: {}", e);
        }
        if let Err(e) = self.vcs.integrate().await {
            warn!("Rollback failed, working copy may hold unpublished state: {}", e);
        }
    }
}
