//! # dd-vcs
//!
//! Version control capability layer for deaddrop.
//!
//! This crate provides:
//! - Git command execution abstraction
//! - The five-operation `VersionControl` trait the protocol depends on
//! - A git CLI backend with typed push-failure classification
//! - An in-memory remote for deterministic concurrency tests

mod capability;
mod command;
mod git;
mod memory;

pub use capability::{PushOutcome, VersionControl};
pub use command::{GitCommand, GitExecutor, GitOutput, MockGitExecutor};
pub use git::{classify_remote_failure, GitBackend, RemoteFailure, RemoteHandle};
pub use memory::{InMemoryVcs, SharedRemote};
