//! This module provides the [`StateMachineInitializer`], which creates a new [`StateMachine`] or
//! resumes the round of the latest checkpoint.

use std::sync::Arc;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{
    mask::{MaskingScheme, PairwiseMasking},
    notifier::Notifier,
    protocol::{Aggregate, RoundSession},
    registry::{ParticipantEvents, ParticipantRegistry, ParticipantState},
    settings::Settings,
    state_machine::{
        coordinator::{Checkpoint, CoordinatorState},
        events::{EventPublisher, EventSubscriber},
        phases::{Aggregating, Collecting, Idle, PhaseName, PhaseState, Selecting, Shared},
        requests::{RequestReceiver, RequestSender},
        StateMachine,
    },
    storage::{retry, RetryPolicy, Storage, StorageError},
};

pub type StateMachineInitializationResult<T> = Result<T, StateMachineInitializationError>;

/// Error that can occur during the initialization of the [`StateMachine`].
#[derive(Debug, Error)]
pub enum StateMachineInitializationError {
    #[error("fetching the latest checkpoint failed: {0:#}")]
    FetchCheckpoint(StorageError),
    #[error("deleting coordinator data failed: {0:#}")]
    DeleteCoordinatorData(StorageError),
    #[error("invalid checkpoint: {0}")]
    InvalidCheckpoint(String),
}

/// The state machine initializer that initializes a new state machine.
pub struct StateMachineInitializer<T> {
    settings: Settings,
    store: T,
    registry: Arc<ParticipantRegistry>,
    participant_events: ParticipantEvents,
    notifier: Arc<dyn Notifier>,
    scheme: Arc<dyn MaskingScheme>,
}

impl<T> StateMachineInitializer<T>
where
    T: Storage,
{
    /// Creates a new [`StateMachineInitializer`] which masks with the [`PairwiseMasking`].
    pub fn new(
        settings: Settings,
        store: T,
        registry: Arc<ParticipantRegistry>,
        participant_events: ParticipantEvents,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            settings,
            store,
            registry,
            participant_events,
            notifier,
            scheme: Arc::new(PairwiseMasking),
        }
    }

    /// Replaces the masking scheme.
    pub fn with_scheme(mut self, scheme: Arc<dyn MaskingScheme>) -> Self {
        self.scheme = scheme;
        self
    }

    /// Initializes a new [`StateMachine`] from the latest checkpoint.
    ///
    /// # Behavior
    ///
    /// - Without a checkpoint, the state machine starts idle and its first round is round 1.
    /// - If the round of the checkpoint has ended, the state machine starts idle with the next
    ///   round. A result which could not be stored is stored again.
    /// - If the round of the checkpoint is still in progress, its cohort is restored into the
    ///   registry with a fresh liveness and the round resumes in the phase of the checkpoint.
    ///   Deadlines start anew.
    ///
    /// # Errors
    /// Fails if the checkpoint can't be loaded or if it is inconsistent.
    pub async fn init(
        self,
    ) -> StateMachineInitializationResult<(StateMachine<T>, RequestSender, EventSubscriber)> {
        let checkpoint = self.load_checkpoint().await?;
        let mut coordinator_state = CoordinatorState::new(&self.settings);

        let checkpoint = match checkpoint {
            None => {
                info!("no checkpoint found: starting from settings");
                return Ok(self.init_state_machine(coordinator_state, None, |shared| {
                    PhaseState::<Idle, _>::new(shared).into()
                }));
            }
            Some(checkpoint) => checkpoint,
        };

        info!(
            "restoring round {} from a checkpoint in phase {}",
            checkpoint.round_id, checkpoint.phase
        );
        coordinator_state.round_id = checkpoint.round_id;
        if checkpoint.is_terminal() {
            return Ok(self.init_state_machine(
                coordinator_state,
                checkpoint.unstored_result,
                |shared| PhaseState::<Idle, _>::new(shared).into(),
            ));
        }

        let Checkpoint {
            round_id,
            phase,
            cohort,
            session,
            unstored_result,
        } = checkpoint;

        coordinator_state.cohort = cohort;
        let now = Instant::now();
        match (phase, session) {
            (PhaseName::Selecting, _) => {
                for id in coordinator_state.cohort.iter() {
                    self.registry
                        .restore(*id, ParticipantState::Eligible, None, now);
                }
                Ok(self.init_state_machine(coordinator_state, unstored_result, |shared| {
                    PhaseState::<Selecting, _>::new(shared).into()
                }))
            }
            (phase, Some(session)) => {
                if session.round_id() != round_id || session.cohort() != &coordinator_state.cohort
                {
                    return Err(StateMachineInitializationError::InvalidCheckpoint(format!(
                        "the session of round {} does not belong to round {}",
                        session.round_id(),
                        round_id
                    )));
                }
                self.restore_members(&session, now);
                Ok(self.init_state_machine(coordinator_state, unstored_result, |shared| {
                    if phase == PhaseName::Collecting {
                        PhaseState::<Collecting, _>::new(shared, session).into()
                    } else {
                        PhaseState::<Aggregating, _>::new(shared, session).into()
                    }
                }))
            }
            (phase, None) => Err(StateMachineInitializationError::InvalidCheckpoint(format!(
                "a checkpoint in phase {} must carry a session",
                phase
            ))),
        }
    }

    /// Deletes all coordinator data, so that the next initialization starts from settings.
    ///
    /// # Errors
    /// Fails if the data can't be deleted.
    pub async fn reset(&mut self) -> StateMachineInitializationResult<()> {
        warn!("deleting all coordinator data");
        self.store
            .delete_coordinator_data()
            .await
            .map_err(StateMachineInitializationError::DeleteCoordinatorData)
    }

    async fn load_checkpoint(&self) -> StateMachineInitializationResult<Option<Checkpoint>> {
        let policy = RetryPolicy::from(&self.settings.persistence);
        let store = self.store.clone();
        retry(&policy, "loading the latest checkpoint", || {
            let mut store = store.clone();
            async move { store.load_latest_checkpoint().await }
        })
        .await
        .map_err(StateMachineInitializationError::FetchCheckpoint)
    }

    /// Puts the cohort of a resumed round back into the registry.
    fn restore_members(&self, session: &RoundSession, now: Instant) {
        let round_id = session.round_id();
        for id in session.cohort().iter() {
            let state = match session.member(id) {
                Some(member) if member.dropped => ParticipantState::Dropped,
                Some(member) if member.submitted => ParticipantState::Submitted,
                _ => ParticipantState::Selected,
            };
            debug!("participant {} resumes round {} as {}", id, round_id, state);
            self.registry.restore(*id, state, Some(round_id), now);
        }
    }

    // Initializes a new [`StateMachine`] with its components.
    fn init_state_machine<F>(
        self,
        coordinator_state: CoordinatorState,
        unstored_result: Option<Aggregate>,
        into_phase: F,
    ) -> (StateMachine<T>, RequestSender, EventSubscriber)
    where
        F: FnOnce(Shared<T>) -> StateMachine<T>,
    {
        let (event_publisher, event_subscriber) = EventPublisher::init(
            coordinator_state.round_id,
            PhaseName::Idle,
            coordinator_state.cohort.clone(),
        );

        let (request_rx, request_tx) = RequestReceiver::new();

        let mut shared = Shared::new(
            coordinator_state,
            event_publisher,
            request_rx,
            self.store,
            self.registry,
            self.participant_events,
            self.notifier,
            self.scheme,
        );
        shared.unstored_result = unstored_result;

        (into_phase(shared), request_tx, event_subscriber)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        notifier::NoopNotifier,
        protocol::Stage,
        registry::ParticipantId,
        selector::Cohort,
        settings::tests::settings,
        state_machine::tests::participant::Participants,
        storage::{memory::MemoryStore, CoordinatorStorage},
    };

    fn initializer(
        store: MemoryStore,
    ) -> (StateMachineInitializer<MemoryStore>, Arc<ParticipantRegistry>) {
        let (registry, events) = ParticipantRegistry::new(Duration::from_secs(30));
        let registry = Arc::new(registry);
        let initializer = StateMachineInitializer::new(
            settings(),
            store,
            registry.clone(),
            events,
            Arc::new(NoopNotifier),
        );
        (initializer, registry)
    }

    async fn save(store: &mut MemoryStore, checkpoint: Checkpoint) {
        store.save_checkpoint(&checkpoint).await.unwrap();
    }

    #[tokio::test]
    async fn test_init_without_checkpoint() {
        let (initializer, _) = initializer(MemoryStore::new());
        let (state_machine, _request_tx, _events) = initializer.init().await.unwrap();
        assert_eq!(state_machine.into_idle_phase_state().shared.round_id(), 1);
    }

    #[tokio::test]
    async fn test_init_after_ended_round() {
        let mut store = MemoryStore::new();
        let aggregate = Aggregate {
            round_id: 6,
            values: vec![1.],
            contributors: 3,
        };
        save(
            &mut store,
            Checkpoint {
                round_id: 7,
                phase: PhaseName::Abandoned,
                cohort: Cohort::default(),
                session: None,
                unstored_result: Some(aggregate.clone()),
            },
        )
        .await;

        let (initializer, _) = initializer(store);
        let (state_machine, _request_tx, _events) = initializer.init().await.unwrap();
        let idle = state_machine.into_idle_phase_state();
        assert_eq!(idle.shared.round_id(), 8);
        assert_eq!(idle.shared.unstored_result, Some(aggregate));
    }

    #[tokio::test]
    async fn test_resume_selecting() {
        let mut store = MemoryStore::new();
        let cohort = Cohort::new((1..=3).map(ParticipantId::from_u128));
        save(
            &mut store,
            Checkpoint {
                round_id: 2,
                phase: PhaseName::Selecting,
                cohort: cohort.clone(),
                session: None,
                unstored_result: None,
            },
        )
        .await;

        let (initializer, registry) = initializer(store);
        let (state_machine, _request_tx, _events) = initializer.init().await.unwrap();
        assert!(state_machine.is_selecting());
        for id in cohort.iter() {
            assert_eq!(registry.get_state(id).unwrap(), ParticipantState::Eligible);
        }
    }

    #[tokio::test]
    async fn test_resume_collecting() {
        let mut store = MemoryStore::new();
        let participants = Participants::new(4, 3);
        let session = participants.session_after_key_exchange(3, 1);
        save(
            &mut store,
            Checkpoint {
                round_id: 3,
                phase: PhaseName::Collecting,
                cohort: participants.cohort(),
                session: Some(session.clone()),
                unstored_result: None,
            },
        )
        .await;

        let (initializer, registry) = initializer(store);
        let (state_machine, _request_tx, _events) = initializer.init().await.unwrap();
        let collecting = state_machine.into_collecting_phase_state();
        assert_eq!(collecting.private.session, session);
        assert_eq!(collecting.private.session.stage(), Stage::Submission);
        assert_eq!(collecting.shared.round_id(), 3);

        let first = registry.handle(&participants[0].id).unwrap();
        assert_eq!(first.state, ParticipantState::Submitted);
        assert_eq!(first.last_selected, Some(3));
        for participant in participants.iter().skip(1) {
            assert_eq!(
                registry.get_state(&participant.id).unwrap(),
                ParticipantState::Selected
            );
        }
    }

    #[tokio::test]
    async fn test_resume_aggregating() {
        let mut store = MemoryStore::new();
        let participants = Participants::new(4, 3);
        let session = participants.session_after_submission(1, 3, &[1., 2., 3., 4.]);
        save(
            &mut store,
            Checkpoint {
                round_id: 1,
                phase: PhaseName::Aggregating,
                cohort: participants.cohort(),
                session: Some(session),
                unstored_result: None,
            },
        )
        .await;

        let (initializer, registry) = initializer(store);
        let (state_machine, _request_tx, _events) = initializer.init().await.unwrap();
        assert!(state_machine.is_aggregating());
        assert_eq!(
            registry.get_state(&participants[3].id).unwrap(),
            ParticipantState::Dropped
        );
    }

    #[tokio::test]
    async fn test_invalid_checkpoint() {
        let mut store = MemoryStore::new();
        save(
            &mut store,
            Checkpoint {
                round_id: 3,
                phase: PhaseName::Collecting,
                cohort: Cohort::new((1..=3).map(ParticipantId::from_u128)),
                session: None,
                unstored_result: None,
            },
        )
        .await;

        let (initializer, _) = initializer(store);
        assert!(matches!(
            initializer.init().await,
            Err(StateMachineInitializationError::InvalidCheckpoint(_))
        ));
    }

    #[tokio::test]
    async fn test_reset() {
        let mut store = MemoryStore::new();
        save(
            &mut store,
            Checkpoint {
                round_id: 9,
                phase: PhaseName::Finished,
                cohort: Cohort::default(),
                session: None,
                unstored_result: None,
            },
        )
        .await;

        let (mut initializer, _) = initializer(store.clone());
        initializer.reset().await.unwrap();
        assert!(store.checkpoints().is_empty());
        let (state_machine, _request_tx, _events) = initializer.init().await.unwrap();
        assert_eq!(state_machine.into_idle_phase_state().shared.round_id(), 1);
    }
}
