//! A cache for a single object that is expensive to compute.
//!
//! The [`SingleObjectCache`] holds at most one committed value, identified by a key, and at most
//! one computation in progress. Concurrent requests for the same key share a computation, requests
//! for a different key supersede it, and superseded computations are cancelled cooperatively
//! through a [`CancellationCheck`].
//!
//! The actual computation is supplied by a [`RefreshDriver`], or by a [`ComputationDriver`]
//! wrapped in [`Spawned`] to run it on a tokio runtime. Outcomes are delivered through
//! [`CompletionHandle`]s.

#![warn(missing_docs)]

mod cache;
mod cancellation;
mod completion;
mod driver;
mod error;
pub mod metrics;

pub use cache::*;
pub use cancellation::*;
pub use completion::*;
pub use driver::*;
pub use error::*;
