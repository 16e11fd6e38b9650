//! # Round coordination and secure aggregation for federated learning
//!
//! This crate drives federated learning rounds across many untrusted, intermittently connected
//! participants. The coordinator never sees an individual model update in the clear: the cohort
//! selected for a round exchanges key material, submits pairwise-masked updates and, if some of
//! its members drop out, helps the coordinator cancel the masks of the dropped members from the
//! running sum.
//!
//! The building blocks, leaves first:
//!
//! - [`registry`]: the canonical participant table and the participant lifecycle.
//! - [`heartbeat`]: liveness tracking and the periodic timeout scan.
//! - [`selector`]: cohort selection from the eligible participants.
//! - [`mask`] and [`protocol`]: the masking primitive and the per-round masking session.
//! - [`state_machine`]: the round phases, a single-writer actor fed by a request channel.
//! - [`storage`]: the persistence gateway for checkpoints and the storage gateway for results.
//! - [`services`]: the coordinator facade which wires everything together.
//!
//! Transport, model training and the metrics backend are external collaborators. Outbound
//! messages leave the crate through the [`notifier::Notifier`] trait and measurements through the
//! [`metrics`] hook.

pub mod heartbeat;
pub mod mask;
pub mod metrics;
pub mod notifier;
pub mod protocol;
pub mod registry;
pub mod selector;
pub mod services;
pub mod settings;
pub mod state_machine;
pub mod storage;
