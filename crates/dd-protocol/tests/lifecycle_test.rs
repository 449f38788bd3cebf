//! End-to-end lifecycle scenarios over the in-memory remote
//!
//! Each agent gets its own working copy cloned from one shared remote, so
//! these tests exercise the same divergence and race handling the real git
//! backend sees, deterministically.

use dd_core::{Deliverable, QueueError, RetryPolicy, TaskStatus};
use dd_protocol::{ClaimResolver, Mutation, PublishProtocol, TaskAssigner};
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

/// The walkthrough from assignment to completion, with a losing claimant
/// in the middle and immutability at the end.
#[tokio::test]
async fn test_full_task_lifecycle_with_a_lost_race() {
    let remote = SharedRemote::new();

    // Agent A assigns a task for B
    let (_dir_a, proto_a) = agent(&remote, "a");
    let task_id = TaskAssigner::new(&proto_a)
        .assign("audit logs", "B", "A", Vec::new())
        .await
        .unwrap();

    let (path, status) = proto_a.store().locate(task_id).await.unwrap().unwrap();
    assert_eq!(status, TaskStatus::Pending);
    let record = proto_a.store().read(&path).await.unwrap();
    assert_eq!(record.assigned_by, "A");
    assert!(!record.is_claimed());

    // B and C both see the pending task
    let (_dir_b, proto_b) = agent(&remote, "b");
    let (_dir_c, proto_c) = agent(&remote, "c");
    let b = ClaimResolver::new(&proto_b, "B");
    let c = ClaimResolver::new(&proto_c, "C");

    // B claims first
    let claimed = b.claim(task_id).await.unwrap();
    assert_eq!(claimed.status, TaskStatus::InProgress);
    assert_eq!(claimed.claimed_by.as_deref(), Some("B"));

    // C's concurrent claim loses
    let err = c.claim(task_id).await.unwrap_err();
    assert!(matches!(err, QueueError::Conflict(_)));

    // B finishes the task
    b.complete(task_id).await.unwrap();
    let (done, status) = proto_b.store().locate(task_id).await.unwrap().unwrap();
    assert_eq!(status, TaskStatus::Completed);
    let record = proto_b.store().read(&done).await.unwrap();
    assert_eq!(record.claimed_by.as_deref(), Some("B"));

    // Completed records are immutable: no further move is accepted
    for to in TaskStatus::ALL {
        let err = proto_b
            .store()
            .transition(&done, to)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidTransition { .. }));
    }

    // And the remote shows exactly one record, in completed/
    let files = remote.file_names();
    assert_eq!(files.len(), 1);
    assert!(files[0].starts_with("queue/completed"));
}

/// N agents race for the same task; exactly one wins.
#[tokio::test]
async fn test_exactly_one_of_n_claimants_succeeds() {
    let remote = SharedRemote::new();
    let (_dir_a, proto_a) = agent(&remote, "assigner");
    let task_id = TaskAssigner::new(&proto_a)
        .assign("audit logs", "anyone", "A", Vec::new())
        .await
        .unwrap();

    // All claimants clone while the task is pending, so every one of them
    // believes it can win
    let n = 5;
    let agents: Vec<_> = (0..n)
        .map(|i| agent(&remote, &format!("claimant-{}", i)))
        .collect();

    let mut winners = 0;
    let mut conflicts = 0;
    for (i, (_dir, protocol)) in agents.iter().enumerate() {
        let resolver = ClaimResolver::new(protocol, format!("agent-{}", i));
        match resolver.claim(task_id).await {
            Ok(record) => {
                assert_eq!(record.claimed_by.as_deref(), Some(format!("agent-{}", i).as_str()));
                winners += 1;
            }
            Err(QueueError::Conflict(_)) => conflicts += 1,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    assert_eq!(winners, 1);
    assert_eq!(conflicts, n - 1);
}

/// Competing claim_next calls spread agents across the queue instead of
/// failing the losers outright.
#[tokio::test]
async fn test_claim_next_distributes_tasks_across_agents() {
    let remote = SharedRemote::new();
    let (_dir_a, proto_a) = agent(&remote, "assigner");
    let assigner = TaskAssigner::new(&proto_a);
    for i in 0..3 {
        assigner
            .assign(format!("task {}", i), "anyone", "A", Vec::new())
            .await
            .unwrap();
    }

    // Three agents, all starting from the same snapshot
    let agents: Vec<_> = (0..3)
        .map(|i| agent(&remote, &format!("worker-{}", i)))
        .collect();

    let mut claimed_ids = Vec::new();
    for (i, (_dir, protocol)) in agents.iter().enumerate() {
        let resolver = ClaimResolver::new(protocol, format!("worker-{}", i));
        let record = resolver.claim_next().await.unwrap().unwrap();
        claimed_ids.push(record.task_id);
    }

    // Three distinct tasks went to three distinct workers
    claimed_ids.sort_by_key(|id| id.to_string());
    claimed_ids.dedup();
    assert_eq!(claimed_ids.len(), 3);
}

/// A persistent outage exhausts the budget and leaves both sides clean.
#[tokio::test]
async fn test_unreachable_remote_times_out_with_full_rollback() {
    let remote = SharedRemote::new();
    let (_dir, protocol) = agent(&remote, "a");
    remote.fail_next_pushes(5);

    let err = TaskAssigner::new(&protocol)
        .assign("audit logs", "B", "A", Vec::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        QueueError::PublishTimeout { attempts: 5, .. }
    ));

    assert!(remote.file_names().is_empty());
    assert!(protocol
        .store()
        .list(TaskStatus::Pending)
        .await
        .unwrap()
        .is_empty());

    // The same process can assign again once the outage clears
    let task_id = TaskAssigner::new(&protocol)
        .assign("audit logs", "B", "A", Vec::new())
        .await
        .unwrap();
    let (_, status) = protocol.store().locate(task_id).await.unwrap().unwrap();
    assert_eq!(status, TaskStatus::Pending);
}

/// Deliverables accumulate while the task is open and freeze at the end.
#[tokio::test]
async fn test_deliverables_flow_through_the_lifecycle() {
    let remote = SharedRemote::new();
    let (_dir_a, proto_a) = agent(&remote, "a");
    let task_id = TaskAssigner::new(&proto_a)
        .assign(
            "audit logs",
            "B",
            "A",
            vec![Deliverable::new("report", "out/audit.md")],
        )
        .await
        .unwrap();

    let (_dir_b, proto_b) = agent(&remote, "b");
    let b = ClaimResolver::new(&proto_b, "B");
    b.claim(task_id).await.unwrap();
    b.add_deliverable(task_id, Deliverable::new("log", "out/audit.log"))
        .await
        .unwrap();
    b.complete(task_id).await.unwrap();

    let (path, _) = proto_b.store().locate(task_id).await.unwrap().unwrap();
    let record = proto_b.store().read(&path).await.unwrap();
    assert_eq!(record.deliverables.len(), 2);

    // Frozen now
    let err = b
        .add_deliverable(task_id, Deliverable::new("extra", "out/late.md"))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::Validation(_)));
}

/// Partition location and status field agree after every publish, on every
/// agent's copy of the tree.
#[tokio::test]
async fn test_partition_and_status_agree_everywhere() {
    let remote = SharedRemote::new();
    let (_dir_a, proto_a) = agent(&remote, "a");
    let task_id = TaskAssigner::new(&proto_a)
        .assign("audit logs", "B", "A", Vec::new())
        .await
        .unwrap();

    let (_dir_b, proto_b) = agent(&remote, "b");
    let b = ClaimResolver::new(&proto_b, "B");
    b.claim(task_id).await.unwrap();
    b.complete(task_id).await.unwrap();

    // A late observer clones and reads through the store, which enforces
    // partition/status agreement on every read
    let (_dir_o, proto_o) = agent(&remote, "observer");
    let (path, status) = proto_o.store().locate(task_id).await.unwrap().unwrap();
    assert_eq!(status, TaskStatus::Completed);
    let record = proto_o.store().read(&path).await.unwrap();
    assert_eq!(record.status, TaskStatus::Completed);

    // Exactly one partition holds the record
    let mut holders = 0;
    for status in TaskStatus::ALL {
        let paths = proto_o.store().list(status).await.unwrap();
        holders += paths
            .iter()
            .filter(|p| p.ends_with(record.file_name()))
            .count();
    }
    assert_eq!(holders, 1);
}

/// Publishing through raw mutations respects the same state machine as the
/// high-level surfaces.
#[tokio::test]
async fn test_raw_mutations_cannot_skip_states() {
    let remote = SharedRemote::new();
    let (_dir, protocol) = agent(&remote, "a");
    let task_id = TaskAssigner::new(&protocol)
        .assign("audit logs", "B", "A", Vec::new())
        .await
        .unwrap();

    // pending -> failed skips the claim
    let err = protocol
        .publish(&Mutation::Transition {
            task_id,
            from: TaskStatus::Pending,
            to: TaskStatus::Failed,
            actor: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::InvalidTransition { .. }));
}
