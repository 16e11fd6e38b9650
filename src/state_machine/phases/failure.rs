use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{error, info};

use crate::{
    event,
    metric,
    metrics::Measurement,
    protocol::ProtocolError,
    state_machine::{
        events::RoundOutcome,
        phases::{Idle, Phase, PhaseName, PhaseState, Shared, Shutdown},
        StateMachine,
    },
    storage::{Storage, StorageError},
};

/// Errors which end a phase early.
#[derive(Error, Debug)]
pub enum PhaseError {
    #[error("request channel error: {0}")]
    RequestChannel(&'static str),
    #[error("{0}")]
    RoundAbandoned(String),
    #[error("checkpoint failed: {0:#}")]
    Persistence(StorageError),
    #[error("aggregation failed: {0}")]
    Aggregation(#[from] ProtocolError),
}

/// The failure state.
#[derive(Debug)]
pub struct Failure {
    pub(in crate::state_machine) error: PhaseError,
}

#[async_trait]
impl<T> Phase<T> for PhaseState<Failure, T>
where
    T: Storage,
{
    const NAME: PhaseName = PhaseName::Failed;

    async fn process(&mut self) -> Result<(), PhaseError> {
        error!("phase state error: {}", self.private.error);
        event!("Phase error", self.private.error.to_string());
        if let PhaseError::Aggregation(_) = self.private.error {
            metric!(
                Measurement::AggregationFailure,
                1_u32,
                ("round_id", self.shared.round_id()),
            );
        }

        if self.shared.state.cohort.is_empty() {
            // no round started, its id stays free
            info!("no round in progress");
        } else {
            self.end_round(PhaseName::Failed).await;
        }
        Ok(())
    }

    fn broadcast(&mut self) {
        info!("broadcasting the round outcome");
        self.shared.events.broadcast_outcome(RoundOutcome::Failed {
            reason: self.private.error.to_string(),
        });
    }

    async fn next(mut self) -> Option<StateMachine<T>> {
        self.wait_for_store_readiness().await;

        Some(match self.private.error {
            PhaseError::RequestChannel(_) => PhaseState::<Shutdown, _>::new(self.shared).into(),
            _ => PhaseState::<Idle, _>::new(self.shared).into(),
        })
    }
}

impl<T> PhaseState<Failure, T> {
    /// Creates a new failure state.
    pub fn new(shared: Shared<T>, error: PhaseError) -> Self {
        Self {
            private: Failure { error },
            shared,
        }
    }
}

impl<T> PhaseState<Failure, T>
where
    T: Storage,
{
    /// Waits until the [`Storage`] is ready.
    async fn wait_for_store_readiness(&mut self) {
        while let Err(err) = <T as Storage>::is_ready(&mut self.shared.store).await {
            error!("store not ready: {}", err);
            info!("try again in 5 sec");
            sleep(Duration::from_secs(5)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        registry::ParticipantId,
        selector::Cohort,
        state_machine::tests::{builder::StateMachineBuilder, utils},
        storage::memory::MemoryStore,
    };

    #[tokio::test]
    async fn test_failure_to_shutdown() {
        utils::enable_logging();
        let store = MemoryStore::new();
        let (state_machine, _request_tx, events, _) = StateMachineBuilder::new(store.clone())
            .with_round_id(2)
            .with_cohort(Cohort::new((1..=3).map(ParticipantId::from_u128)))
            .with_phase(Failure {
                error: PhaseError::RequestChannel(""),
            })
            .build();
        assert!(state_machine.is_failure());

        let state_machine = state_machine.next().await.unwrap();
        assert!(state_machine.is_shutdown());

        assert_eq!(events.phase_listener().get_latest().event, PhaseName::Failed);
        assert!(matches!(
            events.outcome_listener().get_latest().event,
            Some(RoundOutcome::Failed { .. })
        ));
        let checkpoint = store.checkpoints().pop().unwrap();
        assert_eq!(checkpoint.round_id, 2);
        assert_eq!(checkpoint.phase, PhaseName::Failed);
        assert!(checkpoint.session.is_none());
    }

    #[tokio::test]
    async fn test_failure_to_idle() {
        let store = MemoryStore::new();
        let (state_machine, _request_tx, _events, _) = StateMachineBuilder::new(store)
            .with_phase(Failure {
                error: PhaseError::Aggregation(ProtocolError::AggregationFailed("test".into())),
            })
            .build();

        let state_machine = state_machine.next().await.unwrap();
        assert!(state_machine.is_idle());
    }

    #[tokio::test]
    async fn test_shutdown_while_idle_keeps_the_round_id() {
        let store = MemoryStore::new();
        let (state_machine, request_tx, _events, _) =
            StateMachineBuilder::new(store.clone()).build();
        drop(request_tx);

        let state_machine = state_machine.next().await.unwrap();
        assert!(state_machine.is_failure());
        let state_machine = state_machine.next().await.unwrap();
        assert!(state_machine.is_shutdown());
        assert!(store.checkpoints().is_empty());
    }
}
