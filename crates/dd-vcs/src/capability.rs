//! The version control capability the queue is built on
//!
//! The queue core never talks to git directly. Everything it needs from a
//! version control system is five operations; anything implementing them can
//! carry the protocol, which is what lets the tests swap the real subprocess
//! backend for an in-memory fake.

use async_trait::async_trait;
use dd_core::{QueueError, Result};
use std::path::{Path, PathBuf};

/// Outcome of a push attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// The remote accepted our history.
    Accepted,
    /// The remote holds commits we have not integrated. Someone else
    /// published first; synchronize and re-apply before pushing again.
    Rejected { reason: String },
}

/// Version control operations required by the publish protocol
///
/// The remote to coordinate against is fixed when an implementation is
/// constructed. There is no ambient default, so two queues or two tests
/// never share a remote by accident.
///
/// Failure contract: credential rejections surface as
/// [`QueueError::AuthDenied`], transport failures and timeouts as
/// [`QueueError::RemoteUnreachable`], and anything else as
/// [`QueueError::GitCommand`]. Divergence is not an error; `push` reports it
/// as [`PushOutcome::Rejected`].
#[async_trait]
pub trait VersionControl: Send + Sync {
    /// Stage creations, modifications and deletions at the given paths.
    async fn stage(&self, paths: &[PathBuf]) -> Result<()>;

    /// Record staged changes as one atomic unit of history.
    async fn commit(&self, message: &str) -> Result<()>;

    /// Offer local history to the remote.
    async fn push(&self) -> Result<PushOutcome>;

    /// Update the local view of the remote's state.
    async fn fetch(&self) -> Result<()>;

    /// Make the working copy exactly match the last-fetched remote state,
    /// discarding local commits and tracked changes that were never
    /// accepted. This is both the synchronize step of the publish loop and
    /// its rollback primitive.
    async fn integrate(&self) -> Result<()>;

    /// Working copy root that queue paths are relative to.
    fn work_dir(&self) -> &Path;
}

/// Express `path` relative to `work_dir`, rejecting paths outside it.
pub(crate) fn relative_to_work_dir(work_dir: &Path, path: &Path) -> Result<PathBuf> {
    let relative = if path.is_absolute() {
        path.strip_prefix(work_dir).map_err(|_| {
            QueueError::Other(format!(
                "path {} is outside the repository {}",
                path.display(),
                work_dir.display()
            ))
        })?
    } else {
        path
    };
    Ok(relative.to_path_buf())
}
