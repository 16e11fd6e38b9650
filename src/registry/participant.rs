//! Participant identities, lifecycle states and records.

use std::fmt;

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

/// The opaque unique id of a participant.
#[derive(
    Clone,
    Copy,
    Debug,
    Display,
    From,
    Into,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
pub struct ParticipantId(Uuid);

impl ParticipantId {
    /// Creates a new random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates an id from a fixed number, mainly useful for reproducible orderings.
    pub fn from_u128(n: u128) -> Self {
        Self(Uuid::from_u128(n))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for ParticipantId {
    fn default() -> Self {
        Self::new()
    }
}

/// The lifecycle state of a participant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParticipantState {
    /// Registered but never heartbeated.
    Registered,
    /// Available for selection.
    Eligible,
    /// Member of the cohort of the current round.
    Selected,
    /// Submitted its masked update in the current round.
    Submitted,
    /// Took part in a round that ended.
    Done,
    /// Timed out during a round.
    Dropped,
}

impl ParticipantState {
    /// Checks whether the lifecycle allows moving from `self` to `to`.
    pub fn can_transition_to(self, to: ParticipantState) -> bool {
        use ParticipantState::*;
        matches!(
            (self, to),
            (Registered, Eligible)
                | (Eligible, Selected)
                | (Selected, Submitted)
                | (Submitted, Done)
                | (Selected, Dropped)
                | (Submitted, Dropped)
                | (Done, Eligible)
                | (Dropped, Eligible)
        )
    }

    /// Checks whether the participant is committed to the current round.
    pub fn is_in_round(self) -> bool {
        matches!(self, ParticipantState::Selected | ParticipantState::Submitted)
    }
}

impl fmt::Display for ParticipantState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ParticipantState::Registered => "Registered",
            ParticipantState::Eligible => "Eligible",
            ParticipantState::Selected => "Selected",
            ParticipantState::Submitted => "Submitted",
            ParticipantState::Done => "Done",
            ParticipantState::Dropped => "Dropped",
        };
        f.write_str(name)
    }
}

/// The canonical record of a participant, owned by the registry.
#[derive(Debug, Clone)]
pub(crate) struct Participant {
    pub id: ParticipantId,
    pub state: ParticipantState,
    pub last_heartbeat: Instant,
    pub last_selected: Option<u64>,
}

impl Participant {
    pub fn new(id: ParticipantId, now: Instant) -> Self {
        Self {
            id,
            state: ParticipantState::Registered,
            last_heartbeat: now,
            last_selected: None,
        }
    }

    pub fn is_live(&self, window: std::time::Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.last_heartbeat) <= window
    }

    pub fn handle(&self) -> ParticipantHandle {
        ParticipantHandle {
            id: self.id,
            state: self.state,
            last_heartbeat: self.last_heartbeat,
            last_selected: self.last_selected,
        }
    }
}

/// A read-only snapshot of a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParticipantHandle {
    pub id: ParticipantId,
    pub state: ParticipantState,
    pub last_heartbeat: Instant,
    /// The last round the participant was selected for.
    pub last_selected: Option<u64>,
}
