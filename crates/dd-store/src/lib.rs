//! # dd-store
//!
//! Partitioned task record storage for the deaddrop queue.
//!
//! Records live as JSON files under one directory per lifecycle state:
//! `pending/`, `in_progress/`, `completed/`, `failed/`, `cancelled/`. A
//! record's partition and its `status` field always agree; moving a record
//! between partitions is the only way its status changes.
//!
//! Everything in this crate touches the local working copy only. Making a
//! mutation visible to other agents is the publish protocol's job.

pub mod record_io;
mod store;

pub use store::QueueStore;
