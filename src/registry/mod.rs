//! The participant registry.
//!
//! The [`ParticipantRegistry`] owns the canonical record of every known participant. Other
//! components only ever see [`ParticipantHandle`] snapshots and change a participant through the
//! registry's accessors, which enforce the participant lifecycle:
//!
//! ```text
//! Registered -> Eligible -> Selected -> Submitted -> Done
//!                              |           |          |
//!                              +-> Dropped <+         |
//!                                     |               |
//!                   Eligible <--------+---------------+
//! ```
//!
//! Every transition is reported as a [`ParticipantEvent`] on the channel returned by
//! [`ParticipantRegistry::new()`], in the order in which the transitions happened.
//!
//! Records of different participants are guarded independently, so operations on different ids
//! never contend beyond the short read lock on the participant table.

mod participant;

use std::{collections::HashMap, sync::Arc, time::Duration};

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::{sync::mpsc, time::Instant};
use tracing::{debug, info};

pub(crate) use self::participant::Participant;
pub use self::participant::{ParticipantHandle, ParticipantId, ParticipantState};

/// Errors of the registry accessors.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    #[error("participant {0} is already registered")]
    AlreadyRegistered(ParticipantId),
    #[error("participant {0} is unknown")]
    UnknownParticipant(ParticipantId),
    #[error("invalid transition of participant {id} from {from} to {to}")]
    InvalidTransition {
        id: ParticipantId,
        from: ParticipantState,
        to: ParticipantState,
    },
}

/// A change of the participant table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantEvent {
    /// A participant was (re-)registered.
    Registered(ParticipantId),
    /// A participant changed its lifecycle state.
    Transition {
        id: ParticipantId,
        from: ParticipantState,
        to: ParticipantState,
    },
    /// A participant was removed from the registry.
    Removed(ParticipantId),
}

/// The receiving half of the registry events.
#[derive(Debug)]
pub struct ParticipantEvents(mpsc::UnboundedReceiver<ParticipantEvent>);

impl ParticipantEvents {
    /// Receives the next event.
    ///
    /// Returns `None` once the registry has been dropped.
    pub async fn recv(&mut self) -> Option<ParticipantEvent> {
        self.0.recv().await
    }

    /// Receives the next event if one is pending.
    pub fn try_recv(&mut self) -> Option<ParticipantEvent> {
        self.0.try_recv().ok()
    }
}

type Entry = Arc<Mutex<Participant>>;

/// The participant registry.
#[derive(Debug)]
pub struct ParticipantRegistry {
    participants: RwLock<HashMap<ParticipantId, Entry>>,
    events_tx: mpsc::UnboundedSender<ParticipantEvent>,
    liveness_window: Duration,
}

impl ParticipantRegistry {
    /// Creates an empty registry.
    ///
    /// A participant counts as live while its last heartbeat is at most `liveness_window` old.
    pub fn new(liveness_window: Duration) -> (Self, ParticipantEvents) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let registry = Self {
            participants: RwLock::new(HashMap::new()),
            events_tx,
            liveness_window,
        };
        (registry, ParticipantEvents(events_rx))
    }

    fn entry(&self, id: &ParticipantId) -> Result<Entry, RegistryError> {
        self.participants
            .read()
            .get(id)
            .cloned()
            .ok_or(RegistryError::UnknownParticipant(*id))
    }

    fn emit(&self, event: ParticipantEvent) {
        // nobody may be listening, e.g. in tests of the registry alone
        let _ = self.events_tx.send(event);
    }

    fn transition(
        &self,
        participant: &mut Participant,
        to: ParticipantState,
    ) -> Result<ParticipantState, RegistryError> {
        let from = participant.state;
        if !from.can_transition_to(to) {
            return Err(RegistryError::InvalidTransition {
                id: participant.id,
                from,
                to,
            });
        }
        participant.state = to;
        debug!("participant {}: {} -> {}", participant.id, from, to);
        self.emit(ParticipantEvent::Transition {
            id: participant.id,
            from,
            to,
        });
        Ok(from)
    }

    /// Registers a participant.
    ///
    /// # Errors
    /// Fails with [`RegistryError::AlreadyRegistered`] if the participant is known and still
    /// live. The record of a stale participant is replaced. If that participant was part of the
    /// current round, it is dropped first.
    pub fn register(&self, id: ParticipantId) -> Result<ParticipantHandle, RegistryError> {
        self.register_at(id, Instant::now())
    }

    /// Registers a participant at the given instant. See [`register()`](Self::register).
    pub fn register_at(
        &self,
        id: ParticipantId,
        now: Instant,
    ) -> Result<ParticipantHandle, RegistryError> {
        let mut participants = self.participants.write();
        if let Some(entry) = participants.get(&id).cloned() {
            let mut participant = entry.lock();
            if participant.is_live(self.liveness_window, now) {
                return Err(RegistryError::AlreadyRegistered(id));
            }
            if participant.state.is_in_round() {
                self.transition(&mut participant, ParticipantState::Dropped)?;
            }
            debug!("replacing the stale record of participant {}", id);
        }
        let participant = Participant::new(id, now);
        let handle = participant.handle();
        participants.insert(id, Arc::new(Mutex::new(participant)));
        info!("participant {} registered", id);
        self.emit(ParticipantEvent::Registered(id));
        Ok(handle)
    }

    /// Removes a participant. A participant of the current round is dropped first.
    pub fn unregister(&self, id: &ParticipantId) -> Result<ParticipantHandle, RegistryError> {
        let mut participants = self.participants.write();
        let entry = participants
            .remove(id)
            .ok_or(RegistryError::UnknownParticipant(*id))?;
        let mut participant = entry.lock();
        if participant.state.is_in_round() {
            self.transition(&mut participant, ParticipantState::Dropped)?;
        }
        info!("participant {} unregistered", id);
        self.emit(ParticipantEvent::Removed(*id));
        Ok(participant.handle())
    }

    /// Records a heartbeat.
    ///
    /// Timestamps which are not newer than the last recorded one leave the liveness unchanged,
    /// hence repeating a heartbeat is idempotent. The first heartbeat of a registered
    /// participant makes it eligible.
    ///
    /// # Errors
    /// Fails with [`RegistryError::UnknownParticipant`] if the participant is not registered.
    pub fn heartbeat(&self, id: &ParticipantId, timestamp: Instant) -> Result<(), RegistryError> {
        let entry = self.entry(id)?;
        let mut participant = entry.lock();
        if timestamp > participant.last_heartbeat {
            participant.last_heartbeat = timestamp;
        }
        if participant.state == ParticipantState::Registered {
            self.transition(&mut participant, ParticipantState::Eligible)?;
        }
        Ok(())
    }

    /// Gets the lifecycle state of a participant.
    pub fn get_state(&self, id: &ParticipantId) -> Result<ParticipantState, RegistryError> {
        Ok(self.entry(id)?.lock().state)
    }

    /// Moves a participant to a new lifecycle state and returns the previous one.
    ///
    /// # Errors
    /// Fails with [`RegistryError::InvalidTransition`] if the lifecycle forbids the transition.
    pub fn set_state(
        &self,
        id: &ParticipantId,
        to: ParticipantState,
    ) -> Result<ParticipantState, RegistryError> {
        let entry = self.entry(id)?;
        let mut participant = entry.lock();
        self.transition(&mut participant, to)
    }

    /// Moves an eligible participant into the cohort of the given round.
    pub fn select(&self, id: &ParticipantId, round_id: u64) -> Result<(), RegistryError> {
        let entry = self.entry(id)?;
        let mut participant = entry.lock();
        self.transition(&mut participant, ParticipantState::Selected)?;
        participant.last_selected = Some(round_id);
        Ok(())
    }

    /// Drops a participant of the current round if its last heartbeat is older than `timeout`.
    ///
    /// The check and the transition happen atomically wrt. concurrent heartbeats. Returns whether
    /// the participant was dropped.
    pub fn drop_if_silent(
        &self,
        id: &ParticipantId,
        timeout: Duration,
        now: Instant,
    ) -> Result<bool, RegistryError> {
        let entry = self.entry(id)?;
        let mut participant = entry.lock();
        if participant.state.is_in_round() && !participant.is_live(timeout, now) {
            self.transition(&mut participant, ParticipantState::Dropped)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Gets a snapshot of a participant.
    pub fn handle(&self, id: &ParticipantId) -> Result<ParticipantHandle, RegistryError> {
        Ok(self.entry(id)?.lock().handle())
    }

    /// Lists the participants which are eligible and heartbeated within `window`.
    ///
    /// The returned sequence is lazy: the liveness and state of each participant are checked
    /// while iterating. It can be iterated any number of times.
    pub fn list_eligible(&self, window: Duration) -> EligibleParticipants {
        self.list_eligible_at(window, Instant::now())
    }

    /// Lists the eligible participants wrt. the given instant.
    /// See [`list_eligible()`](Self::list_eligible).
    pub fn list_eligible_at(&self, window: Duration, now: Instant) -> EligibleParticipants {
        let entries = self.participants.read().values().cloned().collect();
        EligibleParticipants {
            entries,
            window,
            now,
        }
    }

    /// Gets snapshots of all participants in one of the given states, sorted by id.
    pub fn in_states(&self, states: &[ParticipantState]) -> Vec<ParticipantHandle> {
        let mut handles = self
            .participants
            .read()
            .values()
            .map(|entry| entry.lock().handle())
            .filter(|handle| states.contains(&handle.state))
            .collect::<Vec<_>>();
        handles.sort_by_key(|handle| handle.id);
        handles
    }

    /// Removes the participants outside of the current round which have been silent for longer
    /// than `period`.
    pub fn evict_silent(&self, period: Duration, now: Instant) -> Vec<ParticipantId> {
        let mut participants = self.participants.write();
        let mut evicted = participants
            .iter()
            .filter(|(_, entry)| {
                let participant = entry.lock();
                !participant.state.is_in_round() && !participant.is_live(period, now)
            })
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();
        evicted.sort();
        for id in evicted.iter() {
            participants.remove(id);
            info!("participant {} evicted after a prolonged silence", id);
            self.emit(ParticipantEvent::Removed(*id));
        }
        evicted
    }

    /// Inserts or overwrites a participant in the given state, bypassing the lifecycle.
    ///
    /// Only used to rebuild the registry from a checkpoint after a restart. The participant is
    /// considered to have heartbeated at `now`.
    pub fn restore(
        &self,
        id: ParticipantId,
        state: ParticipantState,
        last_selected: Option<u64>,
        now: Instant,
    ) {
        let participant = Participant {
            id,
            state,
            last_heartbeat: now,
            last_selected,
        };
        debug!("restoring participant {} in state {}", id, state);
        self.participants
            .write()
            .insert(id, Arc::new(Mutex::new(participant)));
    }

    /// The liveness window used to decide whether a registration may replace an existing record.
    pub fn liveness_window(&self) -> Duration {
        self.liveness_window
    }

    /// The number of known participants.
    pub fn len(&self) -> usize {
        self.participants.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A lazy, restartable sequence of eligible participants.
///
/// See [`ParticipantRegistry::list_eligible()`].
#[derive(Debug, Clone)]
pub struct EligibleParticipants {
    entries: Vec<Entry>,
    window: Duration,
    now: Instant,
}

impl EligibleParticipants {
    /// Iterates over the eligible participants.
    pub fn iter(&self) -> impl Iterator<Item = ParticipantHandle> + '_ {
        self.entries.iter().filter_map(move |entry| {
            let participant = entry.lock();
            if participant.state == ParticipantState::Eligible
                && participant.is_live(self.window, self.now)
            {
                Some(participant.handle())
            } else {
                None
            }
        })
    }
}

impl<'a> IntoIterator for &'a EligibleParticipants {
    type Item = ParticipantHandle;
    type IntoIter = Box<dyn Iterator<Item = ParticipantHandle> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}
