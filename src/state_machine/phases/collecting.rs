use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::{
    metric,
    metrics::Measurement,
    notifier::Notification,
    protocol::{RoundSession, Stage},
    registry::{ParticipantEvent, ParticipantId, ParticipantState},
    state_machine::{
        phases::{Aggregating, Handler, Phase, PhaseError, PhaseName, PhaseState, Shared},
        requests::{KeyMaterialRequest, MaskedUpdateRequest, RequestError, StateMachineRequest},
        StateMachine,
    },
    storage::Storage,
};

/// The collecting state.
///
/// The cohort first exchanges its key material, then submits its masked updates. Members which
/// miss a deadline or drop out are excluded from the rest of the round.
#[derive(Debug)]
pub struct Collecting {
    pub(in crate::state_machine) session: RoundSession,
}

#[async_trait]
impl<T> Handler for PhaseState<Collecting, T>
where
    T: Storage,
{
    async fn handle_request(&mut self, req: StateMachineRequest) -> Result<(), RequestError> {
        match req {
            StateMachineRequest::KeyMaterial(KeyMaterialRequest {
                participant_id,
                material,
                ..
            }) => {
                self.private
                    .session
                    .add_key_material(&participant_id, material)?;
                Ok(())
            }
            StateMachineRequest::MaskedUpdate(MaskedUpdateRequest {
                participant_id,
                masked,
                ..
            }) => {
                self.private
                    .session
                    .validate_masked_update(&participant_id, &masked)?;
                self.shared
                    .registry
                    .set_state(&participant_id, ParticipantState::Submitted)?;
                self.private
                    .session
                    .add_masked_update(&participant_id, &masked)?;
                Ok(())
            }
            _ => Err(RequestError::UnexpectedMessage),
        }
    }

    async fn on_accepted(&mut self) -> Result<(), PhaseError> {
        self.shared
            .checkpoint(PhaseName::Collecting, Some(&self.private.session))
            .await
    }

    fn on_participant_event(&mut self, event: ParticipantEvent) -> Result<(), PhaseError> {
        let id = match event {
            ParticipantEvent::Transition {
                id,
                to: ParticipantState::Dropped,
                ..
            }
            | ParticipantEvent::Removed(id) => id,
            _ => return Ok(()),
        };
        if self.private.session.mark_dropped(&id) {
            info!(
                "participant {} dropped out of round {}",
                id,
                self.shared.round_id()
            );
            self.check_quorum()?;
        }
        Ok(())
    }

    fn is_complete(&self) -> bool {
        match self.private.session.stage() {
            Stage::KeyExchange => self.private.session.key_exchange_complete(),
            Stage::Submission => self.private.session.submission_complete(),
            Stage::Recovery => true,
        }
    }
}

#[async_trait]
impl<T> Phase<T> for PhaseState<Collecting, T>
where
    T: Storage,
{
    const NAME: PhaseName = PhaseName::Collecting;

    async fn process(&mut self) -> Result<(), PhaseError> {
        let time = self.shared.state.time;

        if self.private.session.stage() == Stage::KeyExchange {
            info!("collecting key material for round {}", self.shared.round_id());
            self.process_until(Instant::now() + time.key_exchange)
                .await?;
            let missing = self.private.session.close_key_exchange();
            self.drop_members(&missing);
            self.check_quorum()?;
            self.shared
                .checkpoint(PhaseName::Collecting, Some(&self.private.session))
                .await?;
        }

        if self.private.session.stage() == Stage::Submission {
            self.relay_keys().await;
            info!("collecting masked updates for round {}", self.shared.round_id());
            self.process_until(Instant::now() + time.collect).await?;
            let late = self.private.session.close_submission();
            self.drop_members(&late);
            self.check_quorum()?;
        }

        self.shared
            .checkpoint(PhaseName::Aggregating, Some(&self.private.session))
            .await
    }

    async fn next(self) -> Option<StateMachine<T>> {
        Some(PhaseState::<Aggregating, _>::new(self.shared, self.private.session).into())
    }
}

impl<T> PhaseState<Collecting, T> {
    /// Creates a new collecting state.
    pub fn new(shared: Shared<T>, session: RoundSession) -> Self {
        Self {
            private: Collecting { session },
            shared,
        }
    }

    /// Abandons the round once it can no longer reach the minimal number of contributions.
    fn check_quorum(&self) -> Result<(), PhaseError> {
        let reachable = self.private.session.max_contributors();
        let min = self.shared.state.selection.min_cohort;
        if reachable < min {
            Err(PhaseError::RoundAbandoned(format!(
                "at most {} update(s) can still be aggregated, at least {} required",
                reachable, min
            )))
        } else {
            Ok(())
        }
    }

    /// Marks members which missed a deadline as dropped in the registry.
    fn drop_members(&self, ids: &[ParticipantId]) {
        if ids.is_empty() {
            return;
        }
        info!("{} participant(s) missed the deadline", ids.len());
        metric!(
            Measurement::Dropouts,
            ids.len() as u32,
            ("round_id", self.shared.round_id()),
        );
        for id in ids {
            if let Err(err) = self
                .shared
                .registry
                .set_state(id, ParticipantState::Dropped)
            {
                // already dropped by the heartbeat monitor or unregistered
                debug!("participant {} not dropped: {}", id, err);
            }
        }
    }

    /// Relays the public keys and the sealed shares of the peers to the members which still
    /// have to submit.
    async fn relay_keys(&self) {
        let round_id = self.shared.round_id();
        for id in self.private.session.pending_submitters() {
            if let Some(relay) = self.private.session.relay_for(&id) {
                let notification = Notification::KeysAvailable { round_id, relay };
                self.shared.notify(Some(id), notification).await;
            }
        }
    }
}
