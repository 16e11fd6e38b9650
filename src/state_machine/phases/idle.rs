use async_trait::async_trait;
use futures::StreamExt;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn, Span};
use tracing_futures::Instrument;

use crate::{
    metric,
    metrics::Measurement,
    registry::ParticipantState,
    selector::{self, Cohort, SelectionError},
    state_machine::{
        events::RoundOutcome,
        phases::{Phase, PhaseError, PhaseName, PhaseState, Selecting, Shared},
        requests::{RequestError, ResponseSender, StateMachineRequest},
        StateMachine,
    },
    storage::Storage,
};

/// The idle state.
///
/// The coordinator waits for a start request or for the round interval to elapse, then selects
/// the cohort of the next round.
#[derive(Debug)]
pub struct Idle;

#[async_trait]
impl<T> Phase<T> for PhaseState<Idle, T>
where
    T: Storage,
{
    const NAME: PhaseName = PhaseName::Idle;

    async fn process(&mut self) -> Result<(), PhaseError> {
        self.reset_participants();
        self.shared.state.cohort = Cohort::default();
        self.shared.events.broadcast_cohort(Cohort::default());
        self.store_pending_result().await;

        let interval = self.shared.state.time.round_interval;
        let timer = sleep(interval.unwrap_or_default());
        tokio::pin!(timer);

        loop {
            tokio::select! {
                biased;

                _ = &mut timer, if interval.is_some() => {
                    match self.select_cohort() {
                        Ok(cohort) => return self.begin_round(cohort).await,
                        Err(err) => {
                            warn!("can't start round {}: {}", self.shared.round_id(), err);
                            if let Some(interval) = interval {
                                timer.as_mut().reset(Instant::now() + interval);
                            }
                        }
                    }
                }
                Some(event) = self.shared.participant_events.recv() => {
                    debug!("ignoring participant event while idle: {:?}", event);
                }
                next = self.shared.request_rx.next() => {
                    let (req, span, resp_tx) = next.ok_or(PhaseError::RequestChannel(
                        "all message senders have been dropped!",
                    ))?;
                    if self.handle_request(req, span, resp_tx).await? {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn next(self) -> Option<StateMachine<T>> {
        Some(PhaseState::<Selecting, _>::new(self.shared).into())
    }
}

impl<T> PhaseState<Idle, T> {
    /// Creates a new idle state.
    pub fn new(mut shared: Shared<T>) -> Self {
        // Since some events are emitted very early, the round id must be correct when the idle
        // phase starts. Therefore, we update it here, when instantiating the idle PhaseState.
        shared.set_round_id(shared.round_id() + 1);
        debug!("new round id = {}", shared.round_id());
        metric!(Measurement::RoundTotalNumber, shared.round_id() as f64);
        Self {
            private: Idle,
            shared,
        }
    }

    /// Makes the members of past rounds eligible again.
    fn reset_participants(&self) {
        let registry = &self.shared.registry;
        for handle in registry.in_states(&[ParticipantState::Done, ParticipantState::Dropped]) {
            if let Err(err) = registry.set_state(&handle.id, ParticipantState::Eligible) {
                debug!("participant {} not reset: {}", handle.id, err);
            }
        }
    }

    /// Selects the cohort of the upcoming round among the live eligible participants.
    fn select_cohort(&self) -> Result<Cohort, SelectionError> {
        let policy = self.shared.state.selection.for_round(self.shared.round_id());
        let eligible = self.shared.registry.list_eligible(policy.liveness_window);
        selector::select(&eligible, &policy)
    }
}

impl<T> PhaseState<Idle, T>
where
    T: Storage,
{
    /// Retries to store the result of a past round which couldn't be stored.
    async fn store_pending_result(&mut self) {
        let aggregate = match self.shared.unstored_result.as_ref() {
            Some(aggregate) => aggregate,
            None => return,
        };
        let round_id = aggregate.round_id;
        info!("retrying to store the result of round {}", round_id);
        match self.shared.store_result(aggregate).await {
            Ok(handle) => {
                info!("stored the result of round {} as {}", round_id, handle);
                self.shared.unstored_result = None;
                self.shared
                    .events
                    .broadcast_outcome_of(round_id, RoundOutcome::Finished { handle });
            }
            Err(err) => warn!("the result of round {} is still unstored: {:#}", round_id, err),
        }
    }

    /// Answers a request. Returns whether a round was started.
    async fn handle_request(
        &mut self,
        req: StateMachineRequest,
        span: Span,
        resp_tx: ResponseSender,
    ) -> Result<bool, PhaseError> {
        let current = self.shared.round_id();
        let (response, started) = async {
            match req {
                StateMachineRequest::StartRound => match self.select_cohort() {
                    Ok(cohort) => match self.begin_round(cohort).await {
                        Ok(()) => (Ok(()), Ok(true)),
                        Err(err) => (Err(RequestError::Persistence), Err(err)),
                    },
                    Err(err) => {
                        info!("round not started: {}", err);
                        (Err(RequestError::Selection(err)), Ok(false))
                    }
                },
                StateMachineRequest::CancelRound => (Err(RequestError::NoActiveRound), Ok(false)),
                req => match req.stale_round(current) {
                    Some(round_id) => (Err(RequestError::StaleRound(round_id, current)), Ok(false)),
                    None => (Err(RequestError::NoActiveRound), Ok(false)),
                },
            }
        }
        .instrument(span)
        .await;

        if response.is_ok() {
            metric!(accepted: current, PhaseName::Idle);
        } else {
            metric!(rejected: current, PhaseName::Idle);
        }
        // This may error out if the receiver has already been dropped but it doesn't matter for us.
        let _ = resp_tx.send(response);
        started
    }

    /// Records the cohort of the upcoming round and persists it.
    ///
    /// # Errors
    /// Fails if the checkpoint can't be saved. The round is then abandoned.
    async fn begin_round(&mut self, cohort: Cohort) -> Result<(), PhaseError> {
        info!(
            "selected {} participant(s) for round {}",
            cohort.len(),
            self.shared.round_id()
        );
        self.shared.state.cohort = cohort;
        self.shared.checkpoint(PhaseName::Selecting, None).await
    }
}
