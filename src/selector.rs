//! Cohort selection.
//!
//! [`select()`] is a pure function of the eligible participants and the [`SelectionPolicy`]: it
//! never touches the registry. Uniform random selection draws from a generator seeded by the
//! policy, so the same seed and the same eligible set always yield the same cohort.

use std::{slice, time::Duration};

use rand::{seq::SliceRandom, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::{
    registry::{ParticipantHandle, ParticipantId},
    settings::SelectionSettings,
};

/// Errors of the cohort selection.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SelectionError {
    #[error("insufficient participants: {eligible} eligible but at least {minimum} required")]
    InsufficientParticipants { eligible: usize, minimum: usize },
}

/// How the cohort is drawn from the eligible participants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Draws uniformly at random from a seeded generator.
    UniformRandom,
    /// Prefers the participants which were least recently selected, tie-broken by id.
    RoundRobinFair,
}

/// The selection policy of a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionPolicy {
    /// A round is not started with fewer participants.
    pub min_cohort: usize,
    /// The desired cohort size.
    pub target_cohort: usize,
    pub strategy: SelectionStrategy,
    /// Only participants which heartbeated within this window are eligible.
    pub liveness_window: Duration,
    pub seed: u64,
}

impl SelectionPolicy {
    /// Derives the policy for a round: the seed is mixed with the round number so that every
    /// round draws a different but reproducible cohort.
    pub fn for_round(&self, round_id: u64) -> Self {
        let digest = Sha256::new()
            .chain_update(self.seed.to_le_bytes())
            .chain_update(round_id.to_le_bytes())
            .finalize();
        let mut seed = [0_u8; 8];
        seed.copy_from_slice(&digest[..8]);
        Self {
            seed: u64::from_le_bytes(seed),
            ..*self
        }
    }
}

impl From<&SelectionSettings> for SelectionPolicy {
    fn from(settings: &SelectionSettings) -> Self {
        Self {
            min_cohort: settings.min_cohort,
            target_cohort: settings.target_cohort,
            strategy: settings.strategy,
            liveness_window: Duration::from_secs(settings.liveness_window),
            seed: settings.seed,
        }
    }
}

/// The members of a round, ordered by id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cohort(Vec<ParticipantId>);

impl Cohort {
    /// Creates a cohort from any collection of ids. Duplicates are removed.
    pub fn new(members: impl IntoIterator<Item = ParticipantId>) -> Self {
        let mut members = members.into_iter().collect::<Vec<_>>();
        members.sort();
        members.dedup();
        Self(members)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.0.binary_search(id).is_ok()
    }

    /// The 1-based position of a member, used as its secret share index.
    pub fn index_of(&self, id: &ParticipantId) -> Option<u32> {
        self.0
            .binary_search(id)
            .ok()
            .map(|position| position as u32 + 1)
    }

    pub fn iter(&self) -> slice::Iter<'_, ParticipantId> {
        self.0.iter()
    }

    pub fn members(&self) -> &[ParticipantId] {
        &self.0
    }
}

impl<'a> IntoIterator for &'a Cohort {
    type Item = &'a ParticipantId;
    type IntoIter = slice::Iter<'a, ParticipantId>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// A selection strategy.
pub trait Selector {
    /// Picks `count` participants. `candidates` are sorted by id and `count` never exceeds their
    /// number.
    fn pick(&self, candidates: Vec<ParticipantHandle>, count: usize) -> Vec<ParticipantId>;
}

/// Uniform random selection from a seeded generator.
pub struct UniformRandom {
    pub seed: u64,
}

impl Selector for UniformRandom {
    fn pick(&self, candidates: Vec<ParticipantHandle>, count: usize) -> Vec<ParticipantId> {
        let mut rng = ChaCha20Rng::seed_from_u64(self.seed);
        candidates
            .choose_multiple(&mut rng, count)
            .map(|handle| handle.id)
            .collect()
    }
}

/// Least recently selected first, never selected before anything else.
pub struct RoundRobinFair;

impl Selector for RoundRobinFair {
    fn pick(&self, mut candidates: Vec<ParticipantHandle>, count: usize) -> Vec<ParticipantId> {
        // `None < Some(_)` and the sort is stable, so ties keep the id order
        candidates.sort_by_key(|handle| handle.last_selected);
        candidates
            .into_iter()
            .take(count)
            .map(|handle| handle.id)
            .collect()
    }
}

/// Selects the cohort of a round.
///
/// # Errors
/// Fails with [`SelectionError::InsufficientParticipants`] if fewer than `policy.min_cohort`
/// participants are eligible.
pub fn select<I>(eligible: I, policy: &SelectionPolicy) -> Result<Cohort, SelectionError>
where
    I: IntoIterator<Item = ParticipantHandle>,
{
    let mut candidates = eligible.into_iter().collect::<Vec<_>>();
    candidates.sort_by_key(|handle| handle.id);
    candidates.dedup_by_key(|handle| handle.id);

    if candidates.len() < policy.min_cohort {
        return Err(SelectionError::InsufficientParticipants {
            eligible: candidates.len(),
            minimum: policy.min_cohort,
        });
    }

    let count = policy.target_cohort.min(candidates.len());
    let picked = match policy.strategy {
        SelectionStrategy::UniformRandom => {
            UniformRandom { seed: policy.seed }.pick(candidates, count)
        }
        SelectionStrategy::RoundRobinFair => RoundRobinFair.pick(candidates, count),
    };
    Ok(Cohort::new(picked))
}

#[cfg(test)]
mod tests {
    use tokio::time::Instant;

    use super::*;
    use crate::registry::ParticipantState;

    fn handle(n: u128, last_selected: Option<u64>) -> ParticipantHandle {
        ParticipantHandle {
            id: ParticipantId::from_u128(n),
            state: ParticipantState::Eligible,
            last_heartbeat: Instant::now(),
            last_selected,
        }
    }

    fn handles(n: u128) -> Vec<ParticipantHandle> {
        (1..=n).map(|i| handle(i, None)).collect()
    }

    fn policy(
        min_cohort: usize,
        target_cohort: usize,
        strategy: SelectionStrategy,
    ) -> SelectionPolicy {
        SelectionPolicy {
            min_cohort,
            target_cohort,
            strategy,
            liveness_window: Duration::from_secs(30),
            seed: 7,
        }
    }

    #[test]
    fn test_insufficient_participants_for_every_minimum() {
        for minimum in 1..10 {
            let eligible = handles(minimum as u128 - 1);
            let err = select(
                eligible,
                &policy(minimum, minimum, SelectionStrategy::UniformRandom),
            )
            .unwrap_err();
            assert_eq!(
                err,
                SelectionError::InsufficientParticipants {
                    eligible: minimum - 1,
                    minimum,
                }
            );
            assert!(select(
                handles(minimum as u128),
                &policy(minimum, minimum, SelectionStrategy::RoundRobinFair),
            )
            .is_ok());
        }
    }

    #[test]
    fn test_uniform_random_draws_target() {
        let cohort = select(handles(5), &policy(3, 4, SelectionStrategy::UniformRandom)).unwrap();
        assert_eq!(cohort.len(), 4);

        let cohort = select(handles(3), &policy(3, 4, SelectionStrategy::UniformRandom)).unwrap();
        assert_eq!(cohort.len(), 3);
    }

    #[test]
    fn test_uniform_random_is_reproducible() {
        let policy = policy(3, 5, SelectionStrategy::UniformRandom);
        let mut shuffled = handles(20);
        shuffled.reverse();
        let first = select(handles(20), &policy).unwrap();
        let second = select(shuffled, &policy).unwrap();
        assert_eq!(first, second);

        let other_round = select(handles(20), &policy.for_round(2)).unwrap();
        let same_round = select(handles(20), &policy.for_round(2)).unwrap();
        assert_eq!(other_round, same_round);
    }

    #[test]
    fn test_round_robin_fair_prefers_least_recently_selected() {
        let eligible = vec![
            handle(1, Some(3)),
            handle(2, Some(1)),
            handle(3, None),
            handle(4, Some(1)),
            handle(5, Some(2)),
        ];
        let cohort = select(eligible, &policy(2, 3, SelectionStrategy::RoundRobinFair)).unwrap();
        let expected = Cohort::new(vec![
            ParticipantId::from_u128(3),
            ParticipantId::from_u128(2),
            ParticipantId::from_u128(4),
        ]);
        assert_eq!(cohort, expected);
    }

    #[test]
    fn test_cohort_indices() {
        let cohort = Cohort::new(vec![
            ParticipantId::from_u128(9),
            ParticipantId::from_u128(2),
            ParticipantId::from_u128(2),
        ]);
        assert_eq!(cohort.len(), 2);
        assert_eq!(cohort.index_of(&ParticipantId::from_u128(2)), Some(1));
        assert_eq!(cohort.index_of(&ParticipantId::from_u128(9)), Some(2));
        assert_eq!(cohort.index_of(&ParticipantId::from_u128(5)), None);
    }
}
