use std::{future::Future, sync::Arc};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::{
    metric,
    metrics::Measurement,
    notifier::Notification,
    protocol::Aggregate,
    state_machine::{
        events::{ResultUpdate, RoundOutcome},
        phases::{Idle, Phase, PhaseError, PhaseName, PhaseState, Shared},
        StateMachine,
    },
    storage::{retry, Storage, StorageError},
};

/// The finished state.
#[derive(Debug)]
pub struct Finished {
    /// The result of the round.
    pub(in crate::state_machine) aggregate: Arc<Aggregate>,
    /// The outcome of the round, once the result was handed to the store.
    pub(in crate::state_machine) outcome: Option<RoundOutcome>,
}

#[async_trait]
impl<T> Phase<T> for PhaseState<Finished, T>
where
    T: Storage,
{
    const NAME: PhaseName = PhaseName::Finished;

    async fn process(&mut self) -> Result<(), PhaseError> {
        self.release_cohort();

        let outcome = match self.shared.store_result(&self.private.aggregate).await {
            Ok(handle) => {
                info!("stored the result of round {} as {}", self.shared.round_id(), handle);
                RoundOutcome::Finished { handle }
            }
            Err(err) => {
                warn!("failed to store the result: {:#}", err);
                self.shared.unstored_result = Some(self.private.aggregate.as_ref().clone());
                RoundOutcome::ComputedUnstored
            }
        };

        if let Err(err) = self.shared.checkpoint(PhaseName::Finished, None).await {
            warn!("failed to save the terminal checkpoint: {}", err);
        }

        let round_id = self.shared.round_id();
        self.shared
            .notify(
                self.shared.state.cohort.iter().copied(),
                Notification::RoundFinished { round_id },
            )
            .await;
        metric!(
            Measurement::AggregationSuccess,
            1_u32,
            ("round_id", round_id),
        );

        self.private.outcome = Some(outcome);
        Ok(())
    }

    fn broadcast(&mut self) {
        info!("broadcasting the round outcome");
        if let Some(outcome) = self.private.outcome.take() {
            self.shared.events.broadcast_outcome(outcome);
        }
        info!("broadcasting the result");
        self.shared
            .events
            .broadcast_result(ResultUpdate::New(self.private.aggregate.clone()));
    }

    async fn next(self) -> Option<StateMachine<T>> {
        Some(PhaseState::<Idle, _>::new(self.shared).into())
    }
}

impl<T> PhaseState<Finished, T> {
    /// Creates a new finished state.
    pub fn new(shared: Shared<T>, aggregate: Aggregate) -> Self {
        Self {
            private: Finished {
                aggregate: Arc::new(aggregate),
                outcome: None,
            },
            shared,
        }
    }
}

impl<T> Shared<T>
where
    T: Storage,
{
    /// Stores the result of a round and returns its handle.
    ///
    /// # Errors
    /// Fails once the retries are exhausted.
    pub fn store_result(
        &self,
        aggregate: &Aggregate,
    ) -> impl Future<Output = Result<String, StorageError>> + Send {
        let blob = bincode::serialize(aggregate);
        let round_id = aggregate.round_id;
        let store = self.store.clone();
        let policy = self.state.retry;
        async move {
            let blob = blob?;
            debug!("storing the result of round {}", round_id);
            retry(&policy, "storing the result", || {
                let mut store = store.clone();
                let blob = blob.clone();
                async move { store.put_result(round_id, &blob).await }
            })
            .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        notifier::ChannelNotifier,
        registry::{ParticipantId, ParticipantState},
        selector::Cohort,
        state_machine::tests::{builder::StateMachineBuilder, utils},
        storage::{memory::MemoryStore, ModelStorage},
    };

    fn aggregate(round_id: u64) -> Aggregate {
        Aggregate {
            round_id,
            values: vec![0.5, 1.5],
            contributors: 2,
        }
    }

    #[tokio::test]
    async fn test_finished_to_idle() {
        utils::enable_logging();
        let mut store = MemoryStore::new();
        let (notifier, mut notifications) = ChannelNotifier::new();
        let cohort = Cohort::new((1..=2).map(ParticipantId::from_u128));
        let (state_machine, _request_tx, events, registry) =
            StateMachineBuilder::new(store.clone())
                .with_round_id(3)
                .with_notifier(notifier)
                .with_cohort(cohort.clone())
                .with_finished(aggregate(3))
                .build();
        for id in cohort.iter() {
            utils::register_in_state(&registry, id, ParticipantState::Submitted);
        }
        assert!(state_machine.is_finished());

        let state_machine = state_machine.next().await.unwrap();
        assert!(state_machine.is_idle());

        for id in cohort.iter() {
            assert_eq!(registry.get_state(id).unwrap(), ParticipantState::Done);
            let (to, notification) = notifications.try_recv().unwrap();
            assert_eq!(to, *id);
            assert_eq!(notification, Notification::RoundFinished { round_id: 3 });
        }

        let handle = match events.outcome_listener().get_latest().event {
            Some(RoundOutcome::Finished { handle }) => handle,
            outcome => panic!("unexpected outcome {:?}", outcome),
        };
        let blob = store.get_result(&handle).await.unwrap().unwrap();
        let stored: Aggregate = bincode::deserialize(&blob).unwrap();
        assert_eq!(stored, aggregate(3));

        match events.result_listener().get_latest().event {
            ResultUpdate::New(result) => assert_eq!(*result, aggregate(3)),
            ResultUpdate::Invalidate => panic!("no result broadcasted"),
        }
        let checkpoint = store.checkpoints().pop().unwrap();
        assert_eq!(checkpoint.phase, PhaseName::Finished);
        assert!(checkpoint.unstored_result.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_with_failing_store() {
        let store = MemoryStore::new();
        store.fail_result_writes(true);
        let (state_machine, _request_tx, events, _) = StateMachineBuilder::new(store.clone())
            .with_round_id(3)
            .with_finished(aggregate(3))
            .build();

        let state_machine = state_machine.next().await.unwrap();
        assert!(state_machine.is_idle());
        assert_eq!(
            events.outcome_listener().get_latest().event,
            Some(RoundOutcome::ComputedUnstored)
        );
        assert!(store.results().is_empty());

        // the result is kept for a later attempt
        let checkpoint = store.checkpoints().pop().unwrap();
        assert_eq!(checkpoint.unstored_result, Some(aggregate(3)));
    }
}
