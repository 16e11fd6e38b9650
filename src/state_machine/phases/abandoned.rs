use async_trait::async_trait;
use tracing::{info, warn};

use crate::{
    notifier::Notification,
    registry::ParticipantState,
    state_machine::{
        events::RoundOutcome,
        phases::{Idle, Phase, PhaseError, PhaseName, PhaseState, Shared},
        StateMachine,
    },
    storage::Storage,
};

/// The abandoned state.
///
/// A round is abandoned when it can't reach its quorum anymore, when it is cancelled or when its
/// progress can't be persisted.
#[derive(Debug)]
pub struct Abandoned {
    pub(in crate::state_machine) reason: String,
}

#[async_trait]
impl<T> Phase<T> for PhaseState<Abandoned, T>
where
    T: Storage,
{
    const NAME: PhaseName = PhaseName::Abandoned;

    async fn process(&mut self) -> Result<(), PhaseError> {
        warn!(
            "round {} abandoned: {}",
            self.shared.round_id(),
            self.private.reason
        );
        self.end_round(PhaseName::Abandoned).await;
        Ok(())
    }

    fn broadcast(&mut self) {
        info!("broadcasting the round outcome");
        self.shared.events.broadcast_outcome(RoundOutcome::Abandoned {
            reason: self.private.reason.clone(),
        });
    }

    async fn next(self) -> Option<StateMachine<T>> {
        Some(PhaseState::<Idle, _>::new(self.shared).into())
    }
}

impl<T> PhaseState<Abandoned, T> {
    /// Creates a new abandoned state.
    pub fn new(shared: Shared<T>, reason: String) -> Self {
        Self {
            private: Abandoned { reason },
            shared,
        }
    }
}

impl<S, T> PhaseState<S, T>
where
    S: Send,
    T: Storage,
{
    /// Ends a round without a result: releases the cohort, saves the terminal checkpoint and
    /// tells the cohort that everything sent for the round is void.
    ///
    /// The terminal checkpoint is best effort. A failure is logged and the next round still
    /// starts from a fresh round id.
    pub(in crate::state_machine) async fn end_round(&mut self, phase: PhaseName) {
        self.release_cohort();

        if let Err(err) = self.shared.checkpoint(phase, None).await {
            warn!("failed to save the terminal checkpoint: {}", err);
        }

        let round_id = self.shared.round_id();
        self.shared
            .notify(
                self.shared.state.cohort.iter().copied(),
                Notification::RoundAbandoned { round_id },
            )
            .await;
    }
}

impl<S, T> PhaseState<S, T> {
    /// Releases the members of the ended round: those which did not submit are dropped, the
    /// others are done.
    pub(in crate::state_machine) fn release_cohort(&self) {
        let registry = &self.shared.registry;
        for id in self.shared.state.cohort.iter() {
            let to = match registry.get_state(id) {
                Ok(ParticipantState::Selected) => ParticipantState::Dropped,
                Ok(ParticipantState::Submitted) => ParticipantState::Done,
                _ => continue,
            };
            if let Err(err) = registry.set_state(id, to) {
                warn!("failed to release participant {}: {}", id, err);
            }
        }
    }
}
