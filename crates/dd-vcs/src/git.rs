//! Git-backed implementation of the version control capability
//!
//! Drives a real working copy through the `git` CLI. Each queue instance is
//! expected to own its clone outright: `integrate` moves the working copy to
//! the remote-tracking ref with `reset --hard`, which is only safe when no
//! unrelated work shares the tree.

use async_trait::async_trait;
use dd_core::{QueueError, RemoteConfig, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::capability::{relative_to_work_dir, PushOutcome, VersionControl};
use crate::command::GitExecutor;

const DEFAULT_NETWORK_TIMEOUT: Duration = Duration::from_secs(30);

/// Remote coordinates for one queue
///
/// Always passed explicitly; nothing in the crates assumes `origin/main`
/// beyond this type's `Default`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteHandle {
    /// Remote name as known to git
    pub name: String,
    /// Branch carrying the queue
    pub branch: String,
}

impl RemoteHandle {
    pub fn new(name: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            branch: branch.into(),
        }
    }

    pub fn from_config(config: &RemoteConfig) -> Self {
        Self::new(config.name.clone(), config.branch.clone())
    }

    /// Remote-tracking ref, the target of `integrate`.
    pub fn tracking_ref(&self) -> String {
        format!("{}/{}", self.name, self.branch)
    }
}

impl Default for RemoteHandle {
    fn default() -> Self {
        Self::new("origin", "main")
    }
}

/// What a failed remote interaction means for the retry loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteFailure {
    /// The remote moved past our base. Synchronize and re-apply.
    Diverged,
    /// Credentials rejected. Retrying cannot help.
    Auth,
    /// Transport failure. Retrying may help.
    Network,
    /// Anything else git said no to.
    Other,
}

/// Classify git's stderr after a failed push or fetch.
///
/// The CLI exposes no structured failure reasons, so this matches the stable
/// phrases git has printed for years. Divergence markers are checked first;
/// they never co-occur with credential or transport noise.
pub fn classify_remote_failure(stderr: &str) -> RemoteFailure {
    let lower = stderr.to_lowercase();

    if lower.contains("non-fast-forward")
        || lower.contains("fetch first")
        || lower.contains("[rejected]")
        || lower.contains("[remote rejected]")
    {
        return RemoteFailure::Diverged;
    }

    if lower.contains("authentication failed")
        || lower.contains("permission denied")
        || lower.contains("could not read username")
        || lower.contains("could not read password")
        || lower.contains("permission to")
        || lower.contains("returned error: 403")
        || lower.contains("invalid credentials")
    {
        return RemoteFailure::Auth;
    }

    if lower.contains("could not resolve host")
        || lower.contains("connection refused")
        || lower.contains("connection timed out")
        || lower.contains("operation timed out")
        || lower.contains("network is unreachable")
        || lower.contains("failed to connect")
        || lower.contains("could not connect")
        || lower.contains("early eof")
        || lower.contains("remote end hung up")
    {
        return RemoteFailure::Network;
    }

    RemoteFailure::Other
}

/// First line of a stderr blob, for compact error messages.
fn first_line(stderr: &str) -> String {
    stderr.lines().next().unwrap_or("").trim().to_string()
}

/// Git CLI implementation of [`VersionControl`]
pub struct GitBackend<E: GitExecutor> {
    executor: E,
    remote: RemoteHandle,
    network_timeout: Duration,
}

impl<E: GitExecutor> GitBackend<E> {
    pub fn new(executor: E, remote: RemoteHandle) -> Self {
        Self {
            executor,
            remote,
            network_timeout: DEFAULT_NETWORK_TIMEOUT,
        }
    }

    pub fn with_network_timeout(mut self, timeout: Duration) -> Self {
        self.network_timeout = timeout;
        self
    }

    pub fn remote(&self) -> &RemoteHandle {
        &self.remote
    }

    /// Run a command that talks to the network, bounding how long git may
    /// sit on a dead connection.
    async fn exec_remote(&self, args: &[&str], op: &str) -> Result<crate::command::GitOutput> {
        match tokio::time::timeout(self.network_timeout, self.executor.exec(args)).await {
            Ok(result) => result,
            Err(_) => Err(QueueError::RemoteUnreachable(format!(
                "{} timed out after {:?}",
                op, self.network_timeout
            ))),
        }
    }
}

#[async_trait]
impl<E: GitExecutor> VersionControl for GitBackend<E> {
    #[instrument(skip(self, paths))]
    async fn stage(&self, paths: &[PathBuf]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }

        // `git add` records deletions as well as new and changed content.
        let mut args: Vec<String> = vec!["add".to_string(), "--".to_string()];
        for path in paths {
            let relative = relative_to_work_dir(self.executor.repo_root(), path)?;
            args.push(relative.to_string_lossy().into_owned());
        }
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();

        let output = self.executor.exec(&arg_refs).await?;
        if !output.success {
            return Err(QueueError::GitCommand(format!(
                "Failed to stage {} paths: {}",
                paths.len(),
                output.stderr
            )));
        }

        Ok(())
    }

    #[instrument(skip(self))]
    async fn commit(&self, message: &str) -> Result<()> {
        debug!("Committing: {}", message);

        let output = self.executor.exec(&["commit", "-m", message]).await?;
        if !output.success {
            return Err(QueueError::GitCommand(format!(
                "Failed to commit: {}",
                output.stderr
            )));
        }

        Ok(())
    }

    #[instrument(skip(self), fields(remote = %self.remote.tracking_ref()))]
    async fn push(&self) -> Result<PushOutcome> {
        let output = self
            .exec_remote(&["push", &self.remote.name, &self.remote.branch], "push")
            .await?;

        if output.success {
            return Ok(PushOutcome::Accepted);
        }

        match classify_remote_failure(&output.stderr) {
            RemoteFailure::Diverged => {
                debug!("Push rejected, remote has diverged");
                Ok(PushOutcome::Rejected {
                    reason: first_line(&output.stderr),
                })
            }
            RemoteFailure::Auth => Err(QueueError::AuthDenied(first_line(&output.stderr))),
            RemoteFailure::Network => {
                warn!("Push failed on transport: {}", first_line(&output.stderr));
                Err(QueueError::RemoteUnreachable(first_line(&output.stderr)))
            }
            RemoteFailure::Other => Err(QueueError::GitCommand(format!(
                "Failed to push: {}",
                output.stderr
            ))),
        }
    }

    #[instrument(skip(self), fields(remote = %self.remote.tracking_ref()))]
    async fn fetch(&self) -> Result<()> {
        let output = self
            .exec_remote(&["fetch", &self.remote.name, &self.remote.branch], "fetch")
            .await?;

        if output.success {
            return Ok(());
        }

        match classify_remote_failure(&output.stderr) {
            RemoteFailure::Auth => Err(QueueError::AuthDenied(first_line(&output.stderr))),
            RemoteFailure::Network => {
                warn!("Fetch failed on transport: {}", first_line(&output.stderr));
                Err(QueueError::RemoteUnreachable(first_line(&output.stderr)))
            }
            _ => Err(QueueError::GitCommand(format!(
                "Failed to fetch: {}",
                output.stderr
            ))),
        }
    }

    #[instrument(skip(self), fields(remote = %self.remote.tracking_ref()))]
    async fn integrate(&self) -> Result<()> {
        let tracking = self.remote.tracking_ref();
        let output = self
            .executor
            .exec(&["reset", "--hard", &tracking])
            .await?;

        if !output.success {
            return Err(QueueError::GitCommand(format!(
                "Failed to integrate {}: {}",
                tracking, output.stderr
            )));
        }

        Ok(())
    }

    fn work_dir(&self) -> &Path {
        self.executor.repo_root()
    }
}
