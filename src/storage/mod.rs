//! The persistence gateway for checkpoints and the storage gateway for results.
//!
//! [`CoordinatorStorage`] keeps the latest
//! [`Checkpoint`](crate::state_machine::coordinator::Checkpoint) of the round, from which the
//! coordinator resumes after a restart. [`ModelStorage`] keeps the results of the finished rounds.
//! A [`Store`] combines both into a single [`Storage`].

pub mod fs;
pub mod memory;
pub mod redis;
pub mod retry;
pub mod store;
pub mod traits;

pub use self::{
    retry::{retry, RetryPolicy},
    store::Store,
    traits::{CoordinatorStorage, ModelStorage, Storage, StorageError, StorageResult},
};
