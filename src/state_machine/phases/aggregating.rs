use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::{
    notifier::Notification,
    protocol::{Aggregate, ProtocolError, RoundSession},
    registry::{ParticipantEvent, ParticipantId, ParticipantState},
    state_machine::{
        phases::{Failure, Finished, Handler, Phase, PhaseError, PhaseName, PhaseState, Shared},
        requests::{DropoutSharesRequest, RequestError, StateMachineRequest},
        StateMachine,
    },
    storage::Storage,
};

/// The aggregating state.
///
/// If members dropped after the key exchange, the surviving contributors are asked for their
/// shares of the dropped members' keys. The masks are then removed from the sum and the result
/// is computed.
#[derive(Debug)]
pub struct Aggregating {
    pub(in crate::state_machine) session: RoundSession,
    /// The result of the round, once computed.
    pub(in crate::state_machine) aggregate: Option<Aggregate>,
}

#[async_trait]
impl<T> Handler for PhaseState<Aggregating, T>
where
    T: Storage,
{
    async fn handle_request(&mut self, req: StateMachineRequest) -> Result<(), RequestError> {
        if let StateMachineRequest::DropoutShares(DropoutSharesRequest {
            participant_id,
            shares,
            ..
        }) = req
        {
            self.private
                .session
                .add_dropout_shares(&participant_id, shares)?;
            Ok(())
        } else {
            Err(RequestError::UnexpectedMessage)
        }
    }

    async fn on_accepted(&mut self) -> Result<(), PhaseError> {
        self.shared
            .checkpoint(PhaseName::Aggregating, Some(&self.private.session))
            .await
    }

    fn on_participant_event(&mut self, event: ParticipantEvent) -> Result<(), PhaseError> {
        if let ParticipantEvent::Transition {
            id,
            to: ParticipantState::Dropped,
            ..
        }
        | ParticipantEvent::Removed(id) = event
        {
            // its update stays in the sum, only its shares are lost
            if self.private.session.mark_dropped(&id) {
                info!("contributor {} dropped out during the recovery", id);
            }
        }
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.private.session.recovery_complete()
    }
}

#[async_trait]
impl<T> Phase<T> for PhaseState<Aggregating, T>
where
    T: Storage,
{
    const NAME: PhaseName = PhaseName::Aggregating;

    async fn process(&mut self) -> Result<(), PhaseError> {
        let dropped = self.private.session.to_recover();
        if !dropped.is_empty() {
            info!(
                "recovering the masks of {} dropped participant(s)",
                dropped.len()
            );
            self.request_dropout_shares(dropped).await;
            let deadline = Instant::now() + self.shared.state.time.aggregate;
            self.process_until(deadline).await?;
        }

        let combiner = self.shared.state.round_params.combination.combiner();
        let aggregate = self
            .private
            .session
            .finalize(self.shared.scheme.as_ref(), combiner.as_ref())?;
        info!(
            "computed the result of round {} from {} update(s)",
            self.shared.round_id(),
            aggregate.contributors
        );
        self.private.aggregate = Some(aggregate);
        Ok(())
    }

    async fn next(self) -> Option<StateMachine<T>> {
        Some(match self.private.aggregate {
            Some(aggregate) => PhaseState::<Finished, _>::new(self.shared, aggregate).into(),
            None => {
                warn!("aggregating phase ended without a result");
                let err = ProtocolError::AggregationFailed("no result computed".into());
                PhaseState::<Failure, _>::new(self.shared, err.into()).into()
            }
        })
    }
}

impl<T> PhaseState<Aggregating, T> {
    /// Creates a new aggregating state.
    pub fn new(shared: Shared<T>, session: RoundSession) -> Self {
        Self {
            private: Aggregating {
                session,
                aggregate: None,
            },
            shared,
        }
    }

    /// Asks the contributors which didn't answer yet for their shares of the dropped members.
    async fn request_dropout_shares(&self, dropped: Vec<ParticipantId>) {
        let session = &self.private.session;
        let providers = session
            .share_providers()
            .into_iter()
            .filter(|id| {
                session
                    .member(id)
                    .map_or(false, |member| !member.provided_dropout_shares)
            })
            .collect::<Vec<_>>();
        let notification = Notification::DropoutSharesRequested {
            round_id: self.shared.round_id(),
            dropped,
        };
        self.shared.notify(providers, notification).await;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tracing::Span;

    use super::*;
    use crate::{
        notifier::ChannelNotifier,
        protocol::Stage,
        state_machine::tests::{builder::StateMachineBuilder, participant::Participants, utils},
        storage::memory::MemoryStore,
    };

    #[tokio::test]
    async fn test_aggregating_without_dropouts() {
        utils::enable_logging();
        let participants = Participants::new(3, 3);
        let session = participants.session_after_submission(1, 3, &[1., 2., 3., 4.]);
        assert!(session.to_recover().is_empty());
        let (state_machine, _request_tx, _events, _) =
            StateMachineBuilder::new(MemoryStore::new())
                .with_cohort(participants.cohort())
                .with_phase(Aggregating {
                    session,
                    aggregate: None,
                })
                .build();
        assert!(state_machine.is_aggregating());

        let finished = state_machine.next().await.unwrap().into_finished_phase_state();
        assert_eq!(finished.private.aggregate.values, vec![1., 2., 3., 4.]);
        assert_eq!(finished.private.aggregate.contributors, 3);
    }

    #[tokio::test]
    async fn test_aggregating_with_dropout() {
        let store = MemoryStore::new();
        let (notifier, mut notifications) = ChannelNotifier::new();
        let participants = Participants::new(4, 3);
        let session = participants.session_after_submission(1, 3, &[2., 0., -1., 0.5]);
        assert_eq!(session.stage(), Stage::Recovery);
        let dropped = participants[3].id;
        assert_eq!(session.to_recover(), vec![dropped]);
        let relays = participants
            .iter()
            .take(3)
            .map(|participant| (participant.id, session.relay_for(&participant.id).unwrap()))
            .collect::<HashMap<_, _>>();

        let (state_machine, request_tx, _events, _) = StateMachineBuilder::new(store.clone())
            .with_notifier(notifier)
            .with_cohort(participants.cohort())
            .with_phase(Aggregating {
                session,
                aggregate: None,
            })
            .build();
        let state_machine = tokio::spawn(state_machine.next());

        for _ in 0..3 {
            let (to, notification) = notifications.recv().await.unwrap();
            assert!(relays.contains_key(&to));
            assert_eq!(
                notification,
                Notification::DropoutSharesRequested {
                    round_id: 1,
                    dropped: vec![dropped]
                }
            );
        }
        for participant in participants.iter().take(3) {
            let request =
                participant.dropout_shares_request(1, &relays[&participant.id], &[dropped]);
            request_tx.request(request, Span::none()).await.unwrap();
        }

        let finished = state_machine.await.unwrap().unwrap().into_finished_phase_state();
        assert_eq!(finished.private.aggregate.values, vec![2., 0., -1., 0.5]);
        assert_eq!(finished.private.aggregate.contributors, 3);

        // the recovery progress was persisted
        let checkpoint = store.checkpoints().pop().unwrap();
        assert_eq!(checkpoint.phase, PhaseName::Aggregating);
    }

    #[tokio::test(start_paused = true)]
    async fn test_too_few_dropout_shares() {
        let participants = Participants::new(4, 3);
        let session = participants.session_after_submission(1, 3, &[1., 1., 1., 1.]);
        let dropped = participants[3].id;
        let relay = session.relay_for(&participants[0].id).unwrap();
        let (state_machine, request_tx, _events, _) =
            StateMachineBuilder::new(MemoryStore::new())
                .with_cohort(participants.cohort())
                .with_phase(Aggregating {
                    session,
                    aggregate: None,
                })
                .build();
        let state_machine = tokio::spawn(state_machine.next());

        // a contributor must answer with the shares of exactly the dropped members
        assert!(matches!(
            request_tx
                .request(
                    participants[0].dropout_shares_request(1, &relay, &[]),
                    Span::none(),
                )
                .await,
            Err(RequestError::InvalidMessage(_))
        ));
        request_tx
            .request(
                participants[0].dropout_shares_request(1, &relay, &[dropped]),
                Span::none(),
            )
            .await
            .unwrap();

        // the others never answer
        let state_machine = state_machine.await.unwrap().unwrap();
        assert!(state_machine.is_failure());
    }
}
