//! Outbound messages to the participants.
//!
//! The coordinator does not own a transport. Whatever delivers messages to the participants
//! implements [`Notifier`]; delivery is best effort and a failed delivery never affects the round.

use std::fmt;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    protocol::KeyRelay,
    registry::ParticipantId,
    selector::Cohort,
};

/// A message to a participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// The participant was selected for a round and shall submit its key material.
    RoundStarted {
        round_id: u64,
        cohort: Cohort,
        /// The number of shares needed to rebuild a secret key.
        threshold: usize,
    },
    /// The key exchange is over. The participant shall mask its update against the relayed keys.
    KeysAvailable { round_id: u64, relay: KeyRelay },
    /// The participant shall open its shares of the secret keys of the dropped members.
    DropoutSharesRequested {
        round_id: u64,
        dropped: Vec<ParticipantId>,
    },
    /// The round finished and its result was computed.
    RoundFinished { round_id: u64 },
    /// The round was abandoned or failed. Everything sent for it is void.
    RoundAbandoned { round_id: u64 },
}

impl Notification {
    pub fn round_id(&self) -> u64 {
        match self {
            Notification::RoundStarted { round_id, .. }
            | Notification::KeysAvailable { round_id, .. }
            | Notification::DropoutSharesRequested { round_id, .. }
            | Notification::RoundFinished { round_id }
            | Notification::RoundAbandoned { round_id } => *round_id,
        }
    }
}

/// Delivers notifications to participants.
#[async_trait]
pub trait Notifier: fmt::Debug + Send + Sync + 'static {
    async fn notify(&self, participant: ParticipantId, notification: Notification);
}

/// Drops every notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, _participant: ParticipantId, _notification: Notification) {}
}

/// Forwards notifications into a channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier(mpsc::UnboundedSender<(ParticipantId, Notification)>);

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(ParticipantId, Notification)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self(tx), rx)
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn notify(&self, participant: ParticipantId, notification: Notification) {
        // the receiver may be gone, which equals a failed delivery
        let _ = self.0.send((participant, notification));
    }
}
