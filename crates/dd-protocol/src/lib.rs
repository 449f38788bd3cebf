//! # dd-protocol
//!
//! The publish protocol that lets agents sharing only a git remote
//! coordinate a task queue without a lock server.
//!
//! A mutation (create, claim, transition, amend) is applied to the local
//! working copy, committed, and pushed. The remote accepts pushes one at a
//! time and rejects any push from a stale base, which makes every publish a
//! compare-and-swap over the queue tree: the loser of a race synchronizes,
//! re-validates, and either re-applies or learns it lost. At most one agent
//! ever holds a claim.
//!
//! [`TaskAssigner`] and [`ClaimResolver`] are the two agent-facing surfaces
//! on top of [`PublishProtocol`].

mod assign;
mod mutation;
mod publish;
mod resolve;

pub use assign::TaskAssigner;
pub use mutation::Mutation;
pub use publish::{PublishProtocol, PublishReceipt};
pub use resolve::ClaimResolver;
