use std::{fmt, future::Future, sync::Arc, time::Instant};

use async_trait::async_trait;
use derive_more::Display;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, error_span, info, warn, Span};
use tracing_futures::Instrument;

use crate::{
    mask::MaskingScheme,
    metric,
    metrics::Measurement,
    notifier::{Notification, Notifier},
    protocol::{Aggregate, RoundSession},
    registry::{ParticipantEvents, ParticipantId, ParticipantRegistry},
    state_machine::{
        coordinator::{Checkpoint, CoordinatorState},
        events::EventPublisher,
        phases::{Abandoned, Failure, PhaseError},
        requests::{RequestError, RequestReceiver, ResponseSender, StateMachineRequest},
        StateMachine,
    },
    storage::{retry, Storage},
};

/// The name of the current phase.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum PhaseName {
    #[display(fmt = "Idle")]
    Idle,
    #[display(fmt = "Selecting")]
    Selecting,
    #[display(fmt = "Collecting")]
    Collecting,
    #[display(fmt = "Aggregating")]
    Aggregating,
    #[display(fmt = "Finished")]
    Finished,
    #[display(fmt = "Failed")]
    Failed,
    #[display(fmt = "Abandoned")]
    Abandoned,
    #[display(fmt = "Shutdown")]
    Shutdown,
}

/// A trait that must be implemented by a state in order to perform its tasks and to move to a
/// next state.
#[async_trait]
pub trait Phase<T>
where
    T: Storage,
{
    /// The name of the current phase.
    const NAME: PhaseName;

    /// Performs the tasks of this phase.
    async fn process(&mut self) -> Result<(), PhaseError>;

    /// Broadcasts data of this phase (nothing by default).
    fn broadcast(&mut self) {}

    /// Moves from this phase to the next phase.
    async fn next(self) -> Option<StateMachine<T>>;
}

/// A struct that contains the coordinator state and the I/O interfaces that are shared and
/// accessible by all `PhaseState`s.
pub struct Shared<T> {
    /// The coordinator state.
    pub(in crate::state_machine) state: CoordinatorState,
    /// The request receiver half.
    pub(in crate::state_machine) request_rx: RequestReceiver,
    /// The event publisher.
    pub(in crate::state_machine) events: EventPublisher,
    /// The store for checkpoints and results.
    pub(in crate::state_machine) store: T,
    /// The participant registry.
    pub(in crate::state_machine) registry: Arc<ParticipantRegistry>,
    /// The changes of the participant table, e.g. drops detected by the heartbeat monitor.
    pub(in crate::state_machine) participant_events: ParticipantEvents,
    /// The outbound channel to the participants.
    pub(in crate::state_machine) notifier: Arc<dyn Notifier>,
    /// The masking primitive.
    pub(in crate::state_machine) scheme: Arc<dyn MaskingScheme>,
    /// A computed result which could not be stored yet.
    pub(in crate::state_machine) unstored_result: Option<Aggregate>,
}

impl<T> fmt::Debug for Shared<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("state", &self.state)
            .field("request_rx", &self.request_rx)
            .field("events", &self.events)
            .field("notifier", &self.notifier)
            .field("scheme", &self.scheme)
            .field("unstored_result", &self.unstored_result)
            .finish()
    }
}

impl<T> Shared<T> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        coordinator_state: CoordinatorState,
        publisher: EventPublisher,
        request_rx: RequestReceiver,
        store: T,
        registry: Arc<ParticipantRegistry>,
        participant_events: ParticipantEvents,
        notifier: Arc<dyn Notifier>,
        scheme: Arc<dyn MaskingScheme>,
    ) -> Self {
        Self {
            state: coordinator_state,
            request_rx,
            events: publisher,
            store,
            registry,
            participant_events,
            notifier,
            scheme,
            unstored_result: None,
        }
    }

    /// Sets the round ID to the given value.
    pub fn set_round_id(&mut self, id: u64) {
        self.state.round_id = id;
        self.events.set_round_id(id);
    }

    /// Returns the current round ID.
    pub fn round_id(&self) -> u64 {
        self.state.round_id
    }

    /// Sends a notification to each of the given participants.
    pub fn notify<I>(&self, ids: I, notification: Notification) -> impl Future<Output = ()> + Send
    where
        I: IntoIterator<Item = ParticipantId>,
    {
        let notifier = self.notifier.clone();
        let ids = ids.into_iter().collect::<Vec<_>>();
        async move {
            for id in ids {
                notifier.notify(id, notification.clone()).await;
            }
        }
    }
}

impl<T> Shared<T>
where
    T: Storage,
{
    /// Persists a checkpoint of the current round.
    ///
    /// # Errors
    /// Fails with [`PhaseError::Persistence`] once the retries are exhausted.
    pub fn checkpoint(
        &self,
        phase: PhaseName,
        session: Option<&RoundSession>,
    ) -> impl Future<Output = Result<(), PhaseError>> + Send {
        let checkpoint = Checkpoint {
            round_id: self.state.round_id,
            phase,
            cohort: self.state.cohort.clone(),
            session: session.cloned(),
            unstored_result: self.unstored_result.clone(),
        };
        let store = self.store.clone();
        let policy = self.state.retry;
        async move {
            debug!(
                "saving checkpoint of round {} in phase {}",
                checkpoint.round_id, checkpoint.phase
            );
            retry(&policy, "saving the checkpoint", || {
                let mut store = store.clone();
                let checkpoint = checkpoint.clone();
                async move { store.save_checkpoint(&checkpoint).await }
            })
            .await
            .map_err(PhaseError::Persistence)
        }
    }
}

/// The state corresponding to a phase of the round.
///
/// This contains the state-dependent `private` state and the state-independent `shared` state
/// which is shared across state transitions.
pub struct PhaseState<S, T> {
    /// The private state.
    pub(in crate::state_machine) private: S,
    /// The shared coordinator state and I/O interfaces.
    pub(in crate::state_machine) shared: Shared<T>,
}

impl<S, T> PhaseState<S, T>
where
    S: Send,
    T: Storage,
    Self: Phase<T>,
{
    /// Runs the current phase to completion, then transitions to the next phase and returns it.
    pub async fn run_phase(mut self) -> Option<StateMachine<T>> {
        let phase = Self::NAME;
        let span = error_span!("run_phase", phase = %phase);

        async move {
            info!("starting phase");
            self.shared.events.broadcast_phase(phase);
            metric!(Measurement::Phase, phase as u8);

            let started = Instant::now();
            let result = self.process().await;
            metric!(
                Measurement::PhaseDuration,
                started.elapsed().as_secs_f64(),
                ("round_id", self.shared.round_id()),
                ("phase", phase),
            );
            if let Err(err) = result {
                warn!("failed to perform the phase tasks: {}", err);
                return Some(self.into_failure_state(err));
            }
            info!("phase ran successfully");

            if let Err(err) = self.purge_outdated_requests() {
                warn!("failed to purge outdated requests");
                match phase {
                    PhaseName::Failed | PhaseName::Shutdown => {
                        debug!(
                            "already in {} phase: ignoring error while purging outdated requests",
                            phase,
                        );
                    }
                    _ => return Some(self.into_failure_state(err)),
                }
            }

            self.broadcast();

            info!("transitioning to the next phase");
            self.next().await
        }
        .instrument(span)
        .await
    }

    /// Processes all the pending requests that are now considered outdated. This happens at the
    /// end of each phase, before transitioning to the next phase.
    ///
    /// Messages of another round are rejected as stale, the others are discarded.
    fn purge_outdated_requests(&mut self) -> Result<(), PhaseError> {
        info!("discarding outdated requests");
        let current = self.shared.round_id();
        while let Some((req, span, resp_tx)) = self.try_next_request()? {
            let _span_guard = span.enter();
            let response = match req.stale_round(current) {
                Some(round_id) => {
                    debug!("rejecting message of round {}", round_id);
                    metric!(rejected: current, Self::NAME);
                    RequestError::StaleRound(round_id, current)
                }
                None => {
                    debug!("discarding outdated request");
                    metric!(discarded: current, Self::NAME);
                    RequestError::MessageDiscarded
                }
            };
            let _ = resp_tx.send(Err(response));
        }
        Ok(())
    }
}

// Functions that are available to all states
impl<S, T> PhaseState<S, T> {
    /// Receives the next [`StateMachineRequest`].
    ///
    /// # Errors
    /// Returns [`PhaseError::RequestChannel`] when all sender halves have been dropped.
    pub async fn next_request(
        &mut self,
    ) -> Result<(StateMachineRequest, Span, ResponseSender), PhaseError> {
        debug!("waiting for the next incoming request");
        self.shared.request_rx.next().await.ok_or_else(|| {
            error!("request receiver broken: senders have been dropped");
            PhaseError::RequestChannel("all message senders have been dropped!")
        })
    }

    /// Receives the next pending [`StateMachineRequest`] without waiting.
    pub fn try_next_request(
        &mut self,
    ) -> Result<Option<(StateMachineRequest, Span, ResponseSender)>, PhaseError> {
        match self.shared.request_rx.try_recv() {
            Some(Some(item)) => Ok(Some(item)),
            None => {
                debug!("no pending request");
                Ok(None)
            }
            Some(None) => {
                warn!("failed to get next pending request: channel shut down");
                Err(PhaseError::RequestChannel(
                    "all message senders have been dropped!",
                ))
            }
        }
    }

    /// Ends the round: quorum losses, cancellations and persistence failures abandon it, any
    /// other error fails it.
    fn into_failure_state(self, err: PhaseError) -> StateMachine<T> {
        match err {
            PhaseError::RoundAbandoned(reason) => {
                PhaseState::<Abandoned, _>::new(self.shared, reason).into()
            }
            err @ PhaseError::Persistence(_) => {
                PhaseState::<Abandoned, _>::new(self.shared, err.to_string()).into()
            }
            err => PhaseState::<Failure, _>::new(self.shared, err).into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        state_machine::tests::utils,
        storage::memory::MemoryStore,
    };

    #[tokio::test]
    async fn test_update_round_id() {
        let (mut shared, _, event_subscriber) = utils::init_shared(MemoryStore::new());

        let phases = event_subscriber.phase_listener();
        let id = phases.get_latest().round_id;
        assert_eq!(id, 0);

        shared.set_round_id(1);
        assert_eq!(shared.state.round_id, 1);

        // old events keep their round id
        let id = phases.get_latest().round_id;
        assert_eq!(id, 0);

        shared.events.broadcast_phase(PhaseName::Selecting);
        let id = phases.get_latest().round_id;
        assert_eq!(id, 1);
    }

    #[tokio::test]
    async fn test_checkpoint_carries_the_unstored_result() {
        let store = MemoryStore::new();
        let (mut shared, _, _) = utils::init_shared(store.clone());
        shared.set_round_id(4);
        shared.unstored_result = Some(Aggregate {
            round_id: 3,
            values: vec![1.],
            contributors: 3,
        });

        shared.checkpoint(PhaseName::Abandoned, None).await.unwrap();
        let checkpoints = store.checkpoints();
        assert_eq!(checkpoints.len(), 1);
        assert_eq!(checkpoints[0].round_id, 4);
        assert_eq!(checkpoints[0].phase, PhaseName::Abandoned);
        assert_eq!(checkpoints[0].unstored_result.as_ref().unwrap().round_id, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_checkpoint_failure() {
        let store = MemoryStore::new();
        store.fail_checkpoint_writes(true);
        let (shared, _, _) = utils::init_shared(store);
        assert!(matches!(
            shared.checkpoint(PhaseName::Selecting, None).await,
            Err(PhaseError::Persistence(_))
        ));
    }
}
