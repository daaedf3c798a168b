//! Run-level cooperative cancellation.
//!
//! One [`CancellationToken`] is threaded through every suspension point of a
//! run: the collaborator call, the retry backoff wait, and approval or
//! escalation pauses.

mod token;

pub use token::CancellationToken;
