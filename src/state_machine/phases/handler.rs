use async_trait::async_trait;
use futures::StreamExt;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, Span};
use tracing_futures::Instrument;

use crate::{
    metric,
    registry::ParticipantEvent,
    state_machine::{
        phases::{Phase, PhaseError, PhaseState},
        requests::{RequestError, ResponseSender, StateMachineRequest},
    },
    storage::Storage,
};

/// A trait that must be implemented by a state to handle participant messages.
#[async_trait]
pub trait Handler {
    /// Handles a participant message of the current round.
    ///
    /// # Errors
    /// Fails if the masking session or the registry rejects the message. A rejected message
    /// leaves the round unchanged.
    async fn handle_request(&mut self, req: StateMachineRequest) -> Result<(), RequestError>;

    /// Persists the progress after a message was accepted and before it is acknowledged.
    async fn on_accepted(&mut self) -> Result<(), PhaseError>;

    /// Reacts to a change of the participant table, e.g. a member dropped by the heartbeat
    /// monitor.
    ///
    /// # Errors
    /// Fails with [`PhaseError::RoundAbandoned`] once the round can't reach its quorum anymore.
    fn on_participant_event(&mut self, event: ParticipantEvent) -> Result<(), PhaseError>;

    /// Checks whether the stage has everything it waits for.
    fn is_complete(&self) -> bool;
}

/// A counter to keep track of handled messages.
#[derive(Debug, Default)]
struct Counter {
    /// The number of messages successfully processed.
    accepted: u64,
    /// The number of messages that failed to be processed.
    rejected: u64,
}

impl Counter {
    fn increment_accepted(&mut self) {
        self.accepted += 1;
        debug!("{} messages accepted", self.accepted);
    }

    fn increment_rejected(&mut self) {
        self.rejected += 1;
        debug!("{} messages rejected", self.rejected);
    }
}

impl<S, T> PhaseState<S, T>
where
    S: Send,
    T: Storage,
    Self: Phase<T> + Handler,
{
    /// Processes requests and participant events until the stage is complete or the deadline
    /// passes, whichever comes first.
    ///
    /// # Errors
    /// Aborts if all request senders were dropped, if the round was cancelled or lost its quorum,
    /// or if an accepted message couldn't be persisted.
    pub(super) async fn process_until(&mut self, deadline: Instant) -> Result<(), PhaseError> {
        let mut counter = Counter::default();
        let deadline = sleep_until(deadline);
        tokio::pin!(deadline);

        info!("processing requests");
        while !self.is_complete() {
            tokio::select! {
                biased;

                _ = &mut deadline => {
                    debug!("deadline passed");
                    break;
                }
                Some(event) = self.shared.participant_events.recv() => {
                    self.on_participant_event(event)?;
                }
                next = self.shared.request_rx.next() => {
                    let (req, span, resp_tx) = next.ok_or(PhaseError::RequestChannel(
                        "all message senders have been dropped!",
                    ))?;
                    self.process_single(req, span, resp_tx, &mut counter).await?;
                }
            }
        }

        info!("in total {} messages accepted", counter.accepted);
        info!("in total {} messages rejected", counter.rejected);
        Ok(())
    }

    /// Processes a single request and answers it.
    async fn process_single(
        &mut self,
        req: StateMachineRequest,
        span: Span,
        resp_tx: ResponseSender,
        counter: &mut Counter,
    ) -> Result<(), PhaseError> {
        let (response, error) = self.respond_to(req).instrument(span).await;

        let round_id = self.shared.round_id();
        if response.is_ok() {
            counter.increment_accepted();
            metric!(accepted: round_id, Self::NAME);
        } else {
            counter.increment_rejected();
            metric!(rejected: round_id, Self::NAME);
        }

        // This may error out if the receiver has already been dropped but it doesn't matter for us.
        let _ = resp_tx.send(response);
        error.map_or(Ok(()), Err)
    }

    /// Computes the response to a request and the error which ends the phase, if any.
    async fn respond_to(
        &mut self,
        req: StateMachineRequest,
    ) -> (Result<(), RequestError>, Option<PhaseError>) {
        let current = self.shared.round_id();
        if let Some(round_id) = req.stale_round(current) {
            debug!("rejecting message of round {}", round_id);
            return (Err(RequestError::StaleRound(round_id, current)), None);
        }

        match req {
            StateMachineRequest::CancelRound => {
                info!("round {} cancelled", current);
                let reason = PhaseError::RoundAbandoned("cancelled by request".into());
                (Ok(()), Some(reason))
            }
            StateMachineRequest::StartRound => (Err(RequestError::RoundInProgress), None),
            req => match self.handle_request(req).await {
                Ok(()) => match self.on_accepted().await {
                    Ok(()) => (Ok(()), None),
                    Err(err) => (Err(RequestError::Persistence), Some(err)),
                },
                Err(err) => {
                    debug!("message rejected: {}", err);
                    (Err(err), None)
                }
            },
        }
    }
}
