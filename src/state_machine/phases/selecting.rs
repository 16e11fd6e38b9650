use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::{
    metric,
    metrics::Measurement,
    notifier::Notification,
    protocol::RoundSession,
    registry::ParticipantId,
    state_machine::{
        coordinator::CoordinatorState,
        phases::{Collecting, Phase, PhaseError, PhaseName, PhaseState, Shared},
        StateMachine,
    },
    storage::Storage,
};

/// The selecting state.
///
/// The selected participants join the round and are asked for their key material.
#[derive(Debug)]
pub struct Selecting {
    session: RoundSession,
}

impl Selecting {
    /// Opens the masking session for the cohort of the current round.
    pub(in crate::state_machine) fn new(state: &CoordinatorState) -> Self {
        Self {
            session: RoundSession::new(
                state.round_id,
                state.cohort.clone(),
                state.round_params.session_params(),
            ),
        }
    }
}

#[async_trait]
impl<T> Phase<T> for PhaseState<Selecting, T>
where
    T: Storage,
{
    const NAME: PhaseName = PhaseName::Selecting;

    async fn process(&mut self) -> Result<(), PhaseError> {
        // changes from before the round don't concern it
        while let Some(event) = self.shared.participant_events.try_recv() {
            debug!("skipping participant event {:?}", event);
        }

        let round_id = self.shared.round_id();
        let joined = self.join_cohort();

        let min = self.shared.state.selection.min_cohort;
        if joined.len() < min {
            return Err(PhaseError::RoundAbandoned(format!(
                "only {} of {} selected participants joined the round, at least {} required",
                joined.len(),
                self.shared.state.cohort.len(),
                min
            )));
        }
        info!("{} participant(s) joined round {}", joined.len(), round_id);

        let notification = Notification::RoundStarted {
            round_id,
            cohort: self.shared.state.cohort.clone(),
            threshold: self.private.session.params().threshold,
        };
        self.shared.notify(joined, notification).await;

        self.shared
            .checkpoint(PhaseName::Collecting, Some(&self.private.session))
            .await
    }

    fn broadcast(&mut self) {
        info!("broadcasting the cohort");
        let cohort = self.shared.state.cohort.clone();
        metric!(
            Measurement::CohortSize,
            cohort.len() as u32,
            ("round_id", self.shared.round_id()),
        );
        self.shared.events.broadcast_cohort(cohort);
    }

    async fn next(self) -> Option<StateMachine<T>> {
        Some(PhaseState::<Collecting, _>::new(self.shared, self.private.session).into())
    }
}

impl<T> PhaseState<Selecting, T> {
    /// Creates a new selecting state.
    pub fn new(shared: Shared<T>) -> Self {
        Self {
            private: Selecting::new(&shared.state),
            shared,
        }
    }

    /// Moves the cohort into the round. Members which can't join, e.g. because they unregistered
    /// since the selection, are dropped from the session right away.
    fn join_cohort(&mut self) -> Vec<ParticipantId> {
        let round_id = self.shared.round_id();
        let mut joined = Vec::with_capacity(self.shared.state.cohort.len());
        for id in self.shared.state.cohort.iter() {
            match self.shared.registry.select(id, round_id) {
                Ok(()) => joined.push(*id),
                Err(err) => {
                    warn!("participant {} can't join round {}: {}", id, round_id, err);
                    self.private.session.mark_dropped(id);
                }
            }
        }
        joined
    }
}
