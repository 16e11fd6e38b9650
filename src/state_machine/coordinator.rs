//! Coordinator state and round parameter types.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    mask::FixedPoint,
    protocol::{Aggregate, Combination, RoundSession, SessionParams},
    selector::{Cohort, SelectionPolicy},
    settings::Settings,
    state_machine::phases::PhaseName,
    storage::RetryPolicy,
};

/// The phase time parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeParameters {
    /// If set, a new round is attempted this long after the coordinator became idle.
    pub round_interval: Option<Duration>,
    /// The time the cohort has to submit its key material.
    pub key_exchange: Duration,
    /// The time the cohort has to submit its masked updates.
    pub collect: Duration,
    /// The time the survivors have to submit their dropout shares.
    pub aggregate: Duration,
}

/// The round parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RoundParameters {
    /// The number of shares needed to rebuild a secret key.
    pub threshold: usize,
    /// The number of elements of a model update.
    pub model_length: usize,
    pub combination: Combination,
    pub fixed_point: FixedPoint,
}

impl RoundParameters {
    /// The parameters of the masking session of a round.
    ///
    /// A masked update carries the extra elements of the combination in addition to the model.
    pub fn session_params(&self) -> SessionParams {
        SessionParams {
            threshold: self.threshold,
            object_length: self.model_length + self.combination.combiner().extra_elements(),
            fixed_point: self.fixed_point,
        }
    }
}

/// The coordinator state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CoordinatorState {
    /// Internal ID used to identify a round
    pub round_id: u64,
    /// The cohort of the current round. Empty while idle.
    pub cohort: Cohort,
    /// The cohort selection policy.
    pub selection: SelectionPolicy,
    /// The round parameters.
    pub round_params: RoundParameters,
    /// The phase time parameters.
    pub time: TimeParameters,
    /// The retry policy of checkpoint and result writes.
    pub retry: RetryPolicy,
}

impl CoordinatorState {
    pub fn new(settings: &Settings) -> Self {
        let round = settings.round;
        Self {
            round_id: 0,
            cohort: Cohort::default(),
            selection: SelectionPolicy::from(&settings.selection),
            round_params: RoundParameters {
                threshold: settings.threshold(),
                model_length: settings.model.length,
                combination: settings.model.combination,
                fixed_point: FixedPoint::new(settings.mask.fractional_bits),
            },
            time: TimeParameters {
                round_interval: round.interval.map(Duration::from_secs),
                key_exchange: Duration::from_secs(round.key_exchange_timeout),
                collect: Duration::from_secs(round.collect_timeout),
                aggregate: Duration::from_secs(round.aggregate_timeout),
            },
            retry: RetryPolicy::from(&settings.persistence),
        }
    }
}

/// The persisted progress of a round.
///
/// Checkpoints of `Selecting`, `Collecting` and `Aggregating` describe a round in progress, from
/// which the coordinator resumes after a restart. Checkpoints of the terminal phases carry no
/// session data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub round_id: u64,
    /// The phase the round resumes in.
    pub phase: PhaseName,
    pub cohort: Cohort,
    /// The masking session of a round in `Collecting` or `Aggregating`.
    pub session: Option<RoundSession>,
    /// A computed result which could not be stored yet.
    pub unstored_result: Option<Aggregate>,
}

impl Checkpoint {
    /// Checks whether the checkpointed round has ended.
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self.phase,
            PhaseName::Selecting | PhaseName::Collecting | PhaseName::Aggregating
        )
    }
}
