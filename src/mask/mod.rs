//! The masking primitive.
//!
//! A [`MaskingScheme`] hides the update of a participant behind masks which cancel out in the sum
//! of all updates of the round. If a participant drops out after the other members masked their
//! updates against it, its secret key is rebuilt from the secret shares held by the survivors and
//! its masks are removed from the sum.
//!
//! The scheme is object safe, so the protocol engine works with any implementation. The default
//! one is [`PairwiseMasking`].

mod object;
mod pairwise;
mod seed;
mod shamir;

use std::fmt;

use derive_more::{AsRef, From};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use self::{
    object::{Aggregation, AggregationError, FixedPoint, MaskObject},
    pairwise::PairwiseMasking,
    seed::MaskSeed,
    shamir::MERSENNE_EXPONENT,
};
use crate::registry::ParticipantId;

/// The public key of a participant for the current round.
#[derive(AsRef, From, Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey(pub [u8; 32]);

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// The secret key of a participant for the current round.
#[derive(AsRef, From, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretKey([u8; 32]);

impl SecretKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

#[derive(Clone, Debug)]
pub struct KeyPair {
    pub public: PublicKey,
    pub secret: SecretKey,
}

/// A share of a secret key. `index` is the 1-based cohort position of the holder.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretShare {
    pub index: u32,
    pub value: Vec<u8>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MaskError {
    #[error("the threshold {threshold} is not between 1 and the {shares} share(s)")]
    InvalidThreshold { threshold: usize, shares: usize },
    #[error("{available} share(s) available but {threshold} required")]
    NotEnoughShares { available: usize, threshold: usize },
    #[error("share index {0} is invalid or appears more than once")]
    InvalidShareIndex(u32),
    #[error("the shares do not combine to a secret key")]
    InvalidShares,
}

/// A dropout-tolerant masking scheme.
pub trait MaskingScheme: fmt::Debug + Send + Sync {
    /// Generates a fresh key pair for one round.
    fn generate_keypair(&self, rng: &mut dyn RngCore) -> KeyPair;

    /// Derives the public key of a secret key.
    fn public_key(&self, secret: &SecretKey) -> PublicKey;

    /// Splits a secret key into one share per index, any `threshold` of which rebuild it.
    fn generate_shares(
        &self,
        secret: &SecretKey,
        threshold: usize,
        indices: &[u32],
        rng: &mut dyn RngCore,
    ) -> Result<Vec<SecretShare>, MaskError>;

    /// Rebuilds a secret key from at least `threshold` shares with distinct indices.
    fn combine_shares(
        &self,
        shares: &[SecretShare],
        threshold: usize,
    ) -> Result<SecretKey, MaskError>;

    /// Masks the object of participant `own` against each of its `peers`.
    fn apply_mask(
        &self,
        round_id: u64,
        own: (&ParticipantId, &SecretKey),
        peers: &[(ParticipantId, PublicKey)],
        object: &mut MaskObject,
    );

    /// Removes from `sum` the masks which the `contributors` applied against the `dropped`
    /// participant, given its rebuilt secret key.
    fn remove_mask(
        &self,
        round_id: u64,
        dropped: (&ParticipantId, &SecretKey),
        contributors: &[(ParticipantId, PublicKey)],
        sum: &mut MaskObject,
    );
}
