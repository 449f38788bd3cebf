//! # dd-core
//!
//! Core types for deaddrop, a git-mediated task queue for autonomous agents.
//!
//! Agents in a deaddrop deployment share no memory and no RPC channel. They
//! coordinate through a repository both can reach: task records are plain
//! JSON files sorted into state-partition directories, and every mutation
//! becomes durable by being pushed. The remote's refusal to accept a
//! non-fast-forward push is the only synchronization primitive in the
//! system.
//!
//! This crate holds what every other layer agrees on:
//!
//! - The task record and its lifecycle state machine
//! - The error taxonomy separating recoverable races from terminal failures
//! - Repository-level configuration

mod config;
mod error;
mod types;

pub use config::{QueueConfig, QueueLayout, RemoteConfig, RetryConfig, RetryPolicy};
pub use error::{QueueError, Result, ValidationError};
pub use types::*;
