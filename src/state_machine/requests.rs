//! This module provides the `StateMachineRequest`, `RequestSender` and `RequestReceiver` types.

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use derive_more::From;
use displaydoc::Display;
use futures::{future::FutureExt, Stream};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{trace, Span};

use crate::{
    mask::MaskObject,
    protocol::{DropoutShare, KeyMaterial, ProtocolError},
    registry::{ParticipantId, RegistryError},
    selector::SelectionError,
};

/// Errors which occurred while processing a request.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// the message belongs to round {0} but the current round is {1}
    StaleRound(u64, u64),
    /// participant {0} is not an active member of the cohort
    NotInCohort(ParticipantId),
    /// participant {0} already submitted this message
    AlreadySubmitted(ParticipantId),
    /// {0}
    InvalidTransition(RegistryError),
    /// the message is not expected in the current phase
    UnexpectedMessage,
    /// invalid message: {0}
    InvalidMessage(String),
    /// no round is in progress
    NoActiveRound,
    /// a round is already in progress
    RoundInProgress,
    /// {0}
    Selection(#[from] SelectionError),
    /// the message was discarded at the end of a phase
    MessageDiscarded,
    /// the round could not be persisted
    Persistence,
    /// the request could not be processed due to an internal error: {0}
    InternalError(&'static str),
}

impl From<ProtocolError> for RequestError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::NotInCohort(id) => RequestError::NotInCohort(id),
            ProtocolError::AlreadySubmitted(id) => RequestError::AlreadySubmitted(id),
            ProtocolError::UnexpectedMessage(_) => RequestError::UnexpectedMessage,
            ProtocolError::InvalidMessage(reason) | ProtocolError::AggregationFailed(reason) => {
                RequestError::InvalidMessage(reason)
            }
        }
    }
}

impl From<RegistryError> for RequestError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::UnknownParticipant(id) => RequestError::NotInCohort(id),
            err => RequestError::InvalidTransition(err),
        }
    }
}

/// A request to submit key material.
#[derive(Debug)]
pub struct KeyMaterialRequest {
    pub participant_id: ParticipantId,
    pub round_id: u64,
    pub material: KeyMaterial,
}

/// A request to submit a masked update.
#[derive(Debug)]
pub struct MaskedUpdateRequest {
    pub participant_id: ParticipantId,
    pub round_id: u64,
    pub masked: MaskObject,
}

/// A request to submit the opened shares of the dropped members.
#[derive(Debug)]
pub struct DropoutSharesRequest {
    pub participant_id: ParticipantId,
    pub round_id: u64,
    pub shares: Vec<DropoutShare>,
}

/// A request to the [`StateMachine`](crate::state_machine::StateMachine).
#[derive(Debug, From)]
pub enum StateMachineRequest {
    KeyMaterial(KeyMaterialRequest),
    MaskedUpdate(MaskedUpdateRequest),
    DropoutShares(DropoutSharesRequest),
    /// Starts a round now, if the coordinator is idle.
    #[from(ignore)]
    StartRound,
    /// Abandons the active round.
    #[from(ignore)]
    CancelRound,
}

impl StateMachineRequest {
    /// The round a participant message belongs to.
    pub fn round_id(&self) -> Option<u64> {
        match self {
            StateMachineRequest::KeyMaterial(req) => Some(req.round_id),
            StateMachineRequest::MaskedUpdate(req) => Some(req.round_id),
            StateMachineRequest::DropoutShares(req) => Some(req.round_id),
            StateMachineRequest::StartRound | StateMachineRequest::CancelRound => None,
        }
    }

    /// The round of a participant message which belongs to another round than `current`.
    pub fn stale_round(&self, current: u64) -> Option<u64> {
        self.round_id().filter(|round_id| *round_id != current)
    }
}

/// A handle to send requests to the [`StateMachine`](crate::state_machine::StateMachine).
#[derive(Clone, From, Debug)]
pub struct RequestSender(mpsc::UnboundedSender<(StateMachineRequest, Span, ResponseSender)>);

impl RequestSender {
    /// Sends a request to the state machine and waits for the response.
    ///
    /// # Errors
    /// Fails if the state machine rejected the request or if it is shutting down.
    pub async fn request(&self, req: StateMachineRequest, span: Span) -> Result<(), RequestError> {
        let (resp_tx, resp_rx) = oneshot::channel::<Result<(), RequestError>>();
        self.0.send((req, span, resp_tx)).map_err(|_| {
            RequestError::InternalError(
                "failed to send request to the state machine: state machine is shutting down",
            )
        })?;
        resp_rx.await.map_err(|_| {
            RequestError::InternalError("failed to receive response from the state machine")
        })?
    }

    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

/// A channel to send the response of a request.
pub(in crate::state_machine) type ResponseSender = oneshot::Sender<Result<(), RequestError>>;

/// The receiver half of the request channel, owned by the state machine.
#[derive(From, Debug)]
pub struct RequestReceiver(mpsc::UnboundedReceiver<(StateMachineRequest, Span, ResponseSender)>);

impl Stream for RequestReceiver {
    type Item = (StateMachineRequest, Span, ResponseSender);

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<Self::Item>> {
        trace!("RequestReceiver: polling");
        Pin::new(&mut self.get_mut().0).poll_recv(cx)
    }
}

impl RequestReceiver {
    /// Creates a new request channel.
    pub fn new() -> (Self, RequestSender) {
        let (tx, rx) = mpsc::unbounded_channel::<(StateMachineRequest, Span, ResponseSender)>();
        let receiver = RequestReceiver::from(rx);
        let handle = RequestSender::from(tx);
        (receiver, handle)
    }

    /// Closes the channel. Pending requests can still be received.
    pub fn close(&mut self) {
        self.0.close()
    }

    pub async fn recv(&mut self) -> Option<(StateMachineRequest, Span, ResponseSender)> {
        self.0.recv().await
    }

    /// Receives a pending request without waiting.
    ///
    /// Returns `None` if no request is pending and `Some(None)` if the channel is closed.
    pub fn try_recv(&mut self) -> Option<Option<(StateMachineRequest, Span, ResponseSender)>> {
        self.0.recv().now_or_never()
    }
}
