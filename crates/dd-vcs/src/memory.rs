//! In-memory stand-in for a git remote and its clones
//!
//! Protocol tests need the one property the real remote provides: pushes are
//! strictly serialized, and a push from a stale base is rejected. This
//! module models that with a versioned file snapshot behind a mutex. Handles
//! cloned from the same [`SharedRemote`] race each other exactly the way
//! clones of one repository do, minus the subprocesses, plus deterministic
//! fault injection.

use async_trait::async_trait;
use dd_core::{QueueError, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::capability::{relative_to_work_dir, PushOutcome, VersionControl};

/// Authoritative remote state: tracked files as of the latest accepted push
#[derive(Debug, Default)]
struct RemoteState {
    /// Bumped by every accepted push
    version: u64,
    files: BTreeMap<PathBuf, Vec<u8>>,
    push_outages: u32,
    fetch_outages: u32,
    deny_auth: bool,
}

/// One agent's view: clone base, remote-tracking snapshot, index, and
/// committed-but-unpushed changes
#[derive(Debug, Default)]
struct LocalState {
    /// Remote version this working copy last integrated
    base_version: u64,
    fetched_version: u64,
    fetched_files: BTreeMap<PathBuf, Vec<u8>>,
    staged: BTreeSet<PathBuf>,
    /// Changes recorded by `commit`, in order; `None` is a deletion
    pending: Vec<(PathBuf, Option<Vec<u8>>)>,
    /// Paths the local history knows about; `integrate` removes these when
    /// the fetched snapshot lacks them, and leaves untracked files alone
    tracked: BTreeSet<PathBuf>,
}

/// The shared remote repository
#[derive(Clone, Default)]
pub struct SharedRemote {
    inner: Arc<Mutex<RemoteState>>,
}

impl SharedRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clone the remote into `work_dir`, returning a handle that behaves
    /// like a fresh checkout: tracked files materialized on disk, base
    /// pointing at the current remote version.
    pub fn clone_into(&self, label: impl Into<String>, work_dir: impl Into<PathBuf>) -> Result<InMemoryVcs> {
        let work_dir = work_dir.into();
        let remote = self.inner.lock().unwrap();

        let mut tracked = BTreeSet::new();
        for (path, bytes) in &remote.files {
            let target = work_dir.join(path);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&target, bytes)?;
            tracked.insert(path.clone());
        }

        Ok(InMemoryVcs {
            label: label.into(),
            remote: Arc::clone(&self.inner),
            work_dir,
            local: Mutex::new(LocalState {
                base_version: remote.version,
                fetched_version: remote.version,
                fetched_files: remote.files.clone(),
                staged: BTreeSet::new(),
                pending: Vec::new(),
                tracked,
            }),
        })
    }

    /// Make the next `n` pushes fail with a transport error.
    pub fn fail_next_pushes(&self, n: u32) {
        self.inner.lock().unwrap().push_outages = n;
    }

    /// Make the next `n` fetches fail with a transport error.
    pub fn fail_next_fetches(&self, n: u32) {
        self.inner.lock().unwrap().fetch_outages = n;
    }

    /// Reject every push and fetch with a credential failure.
    pub fn deny_auth(&self, deny: bool) {
        self.inner.lock().unwrap().deny_auth = deny;
    }

    /// Version of the latest accepted push.
    pub fn version(&self) -> u64 {
        self.inner.lock().unwrap().version
    }

    /// Tracked paths in the remote, sorted.
    pub fn file_names(&self) -> Vec<PathBuf> {
        self.inner.lock().unwrap().files.keys().cloned().collect()
    }

    /// Bytes of one tracked file, if present.
    pub fn read_file(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().files.get(path.as_ref()).cloned()
    }
}

/// One clone of a [`SharedRemote`]
pub struct InMemoryVcs {
    label: String,
    remote: Arc<Mutex<RemoteState>>,
    work_dir: PathBuf,
    local: Mutex<LocalState>,
}

impl InMemoryVcs {
    pub fn label(&self) -> &str {
        &self.label
    }
}

#[async_trait]
impl VersionControl for InMemoryVcs {
    async fn stage(&self, paths: &[PathBuf]) -> Result<()> {
        let mut local = self.local.lock().unwrap();
        for path in paths {
            let relative = relative_to_work_dir(&self.work_dir, path)?;
            local.staged.insert(relative);
        }
        Ok(())
    }

    async fn commit(&self, message: &str) -> Result<()> {
        let mut local = self.local.lock().unwrap();
        if local.staged.is_empty() {
            return Err(QueueError::GitCommand(
                "nothing staged to commit".to_string(),
            ));
        }
        debug!("[{}] commit: {}", self.label, message);

        let staged: Vec<PathBuf> = local.staged.iter().cloned().collect();
        for path in staged {
            let on_disk = self.work_dir.join(&path);
            if on_disk.exists() {
                let bytes = std::fs::read(&on_disk)?;
                local.pending.push((path.clone(), Some(bytes)));
                local.tracked.insert(path);
            } else {
                local.pending.push((path.clone(), None));
                local.tracked.remove(&path);
            }
        }
        local.staged.clear();
        Ok(())
    }

    async fn push(&self) -> Result<PushOutcome> {
        let mut remote = self.remote.lock().unwrap();

        if remote.push_outages > 0 {
            remote.push_outages -= 1;
            return Err(QueueError::RemoteUnreachable(
                "injected network outage".to_string(),
            ));
        }
        if remote.deny_auth {
            return Err(QueueError::AuthDenied(
                "injected credential rejection".to_string(),
            ));
        }

        let mut local = self.local.lock().unwrap();
        if local.pending.is_empty() {
            return Ok(PushOutcome::Accepted);
        }
        if local.base_version != remote.version {
            debug!(
                "[{}] push rejected: base {} behind remote {}",
                self.label, local.base_version, remote.version
            );
            return Ok(PushOutcome::Rejected {
                reason: format!(
                    "non-fast-forward: base {} behind remote {}",
                    local.base_version, remote.version
                ),
            });
        }

        for (path, change) in local.pending.drain(..) {
            match change {
                Some(bytes) => {
                    remote.files.insert(path, bytes);
                }
                None => {
                    remote.files.remove(&path);
                }
            }
        }
        remote.version += 1;
        local.base_version = remote.version;
        // A successful push also advances the remote-tracking snapshot,
        // like git updating refs/remotes after push.
        local.fetched_version = remote.version;
        local.fetched_files = remote.files.clone();

        debug!("[{}] push accepted at version {}", self.label, remote.version);
        Ok(PushOutcome::Accepted)
    }

    async fn fetch(&self) -> Result<()> {
        let mut remote = self.remote.lock().unwrap();

        if remote.fetch_outages > 0 {
            remote.fetch_outages -= 1;
            return Err(QueueError::RemoteUnreachable(
                "injected network outage".to_string(),
            ));
        }
        if remote.deny_auth {
            return Err(QueueError::AuthDenied(
                "injected credential rejection".to_string(),
            ));
        }

        let mut local = self.local.lock().unwrap();
        local.fetched_version = remote.version;
        local.fetched_files = remote.files.clone();
        Ok(())
    }

    async fn integrate(&self) -> Result<()> {
        let mut local = self.local.lock().unwrap();

        // Everything local history or the index knows about that the
        // fetched snapshot lacks gets removed; untracked files survive,
        // like `reset --hard`.
        let known: BTreeSet<PathBuf> = local
            .tracked
            .iter()
            .chain(local.staged.iter())
            .chain(local.pending.iter().map(|(path, _)| path))
            .cloned()
            .collect();
        for path in known {
            if !local.fetched_files.contains_key(&path) {
                let on_disk = self.work_dir.join(&path);
                match std::fs::remove_file(&on_disk) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }

        for (path, bytes) in &local.fetched_files {
            let target = self.work_dir.join(path);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&target, bytes)?;
        }

        let tracked_now: BTreeSet<PathBuf> = local.fetched_files.keys().cloned().collect();
        local.tracked = tracked_now;
        local.staged.clear();
        local.pending.clear();
        local.base_version = local.fetched_version;

        debug!(
            "[{}] integrated remote version {}",
            self.label, local.base_version
        );
        Ok(())
    }

    fn work_dir(&self) -> &Path {
        &self.work_dir
    }
}
