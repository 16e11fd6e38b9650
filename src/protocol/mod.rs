//! The masked-aggregation protocol.
//!
//! Each round runs one [`RoundSession`] through three stages:
//!
//! 1. **Key exchange**: every cohort member submits its public key together with the shares of
//!    its secret key, sealed for each other member. The coordinator never opens the sealed shares;
//!    it relays them along with the public keys of the peers once the stage closes.
//! 2. **Submission**: every member masks its update against all peers and submits it. The session
//!    only ever keeps the running sum of the masked updates.
//! 3. **Recovery**: the masks of members which dropped after the key exchange do not cancel. The
//!    surviving contributors open the shares of the dropped members and hand them back, so that
//!    their secret keys can be rebuilt and their masks removed from the sum.
//!
//! [`RoundSession::finalize()`] then yields the [`Aggregate`] of the round.

mod combiner;
mod session;

use std::collections::BTreeMap;

use derive_more::Display;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use self::{
    combiner::{CombineError, Combination, Combiner, Mean, Sum, WeightedMean},
    session::{MemberRecord, RoundSession, SessionParams},
};
use crate::{
    mask::{PublicKey, SecretShare},
    registry::ParticipantId,
};

/// The stage of a masking session.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    KeyExchange,
    Submission,
    Recovery,
}

/// Errors of the masking session.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("participant {0} is not an active member of the cohort")]
    NotInCohort(ParticipantId),
    #[error("participant {0} already submitted this message")]
    AlreadySubmitted(ParticipantId),
    #[error("message not expected during the {0} stage")]
    UnexpectedMessage(Stage),
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    #[error("aggregation failed: {0}")]
    AggregationFailed(String),
}

/// The key material of a cohort member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMaterial {
    pub public_key: PublicKey,
    /// The shares of the member's secret key, sealed for and keyed by their recipient.
    pub sealed_shares: BTreeMap<ParticipantId, Vec<u8>>,
}

/// The key material relayed to a cohort member at the end of the key exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRelay {
    /// The public keys of the peers, sorted by id.
    pub peers: Vec<(ParticipantId, PublicKey)>,
    /// The shares sealed for the recipient, keyed by the peer which sealed them.
    pub sealed_shares: BTreeMap<ParticipantId, Vec<u8>>,
}

/// A share of the secret key of a dropped member, opened by a surviving contributor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropoutShare {
    pub dropped: ParticipantId,
    pub share: SecretShare,
}

/// The result of a round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    pub round_id: u64,
    pub values: Vec<f64>,
    /// The number of updates in the aggregate.
    pub contributors: usize,
}
