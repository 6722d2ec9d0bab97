//! Osc Core
//!
//! Reconciliation machinery for an Outscale resource provider: bounded retries,
//! polling for eventual consistency, set diffs applied as minimal add/remove calls,
//! and the create/read/update/delete loop that composes them.

pub mod differ;
pub mod effect;
pub mod lock;
pub mod provider;
pub mod reconcile;
pub mod resource;
pub mod retry;
pub mod schema;
pub mod timeouts;
pub mod waiter;

pub use differ::{ApplyOrder, DiffPolicy, DiffSet, apply_diff};
pub use provider::{ErrorClass, Operation, Provider, ProviderError, ProviderResult};
pub use reconcile::{
    GroupOutcome, Reconciler, ResourceHandler, UpdateError, UpdateGroup, UpdateOutcome,
};
pub use retry::{RetryPolicy, retry};
pub use waiter::{Observation, WaitSpec, wait_for_state};
