//! This module provides the [`StateMachine`]'s `Events`, `EventSubscriber` and `EventPublisher`
//! types.
//!
//! [`StateMachine`]: crate::state_machine::StateMachine

use std::sync::Arc;

use tokio::sync::watch;

use crate::{protocol::Aggregate, selector::Cohort, state_machine::phases::PhaseName};

/// An event emitted by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event<E> {
    /// The round for which this event was emitted.
    pub round_id: u64,
    /// The event itself
    pub event: E,
}

/// How a round ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundOutcome {
    /// The result was computed and stored under the given handle.
    Finished { handle: String },
    /// The result was computed but could not be stored yet. The write is retried when the
    /// coordinator becomes idle.
    ComputedUnstored,
    /// The round was abandoned, e.g. because too few participants were left.
    Abandoned { reason: String },
    /// The round failed, e.g. because the masks of a dropped member could not be removed.
    Failed { reason: String },
}

/// An update of the round result.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultUpdate {
    Invalidate,
    New(Arc<Aggregate>),
}

/// A convenience type to emit any coordinator event.
#[derive(Debug)]
pub struct EventPublisher {
    round_id: u64,
    phase_tx: EventBroadcaster<PhaseName>,
    cohort_tx: EventBroadcaster<Cohort>,
    outcome_tx: EventBroadcaster<Option<RoundOutcome>>,
    result_tx: EventBroadcaster<ResultUpdate>,
}

/// The `EventSubscriber` hands out `EventListener`s for any coordinator event.
#[derive(Debug, Clone)]
pub struct EventSubscriber {
    phase_rx: EventListener<PhaseName>,
    cohort_rx: EventListener<Cohort>,
    outcome_rx: EventListener<Option<RoundOutcome>>,
    result_rx: EventListener<ResultUpdate>,
}

impl EventPublisher {
    /// Initializes a new event publisher with the given initial events.
    pub fn init(round_id: u64, phase: PhaseName, cohort: Cohort) -> (Self, EventSubscriber) {
        let (phase_tx, phase_rx) = watch::channel::<Event<PhaseName>>(Event {
            round_id,
            event: phase,
        });

        let (cohort_tx, cohort_rx) = watch::channel::<Event<Cohort>>(Event {
            round_id,
            event: cohort,
        });

        let (outcome_tx, outcome_rx) = watch::channel::<Event<Option<RoundOutcome>>>(Event {
            round_id,
            event: None,
        });

        let (result_tx, result_rx) = watch::channel::<Event<ResultUpdate>>(Event {
            round_id,
            event: ResultUpdate::Invalidate,
        });

        let publisher = EventPublisher {
            round_id,
            phase_tx: phase_tx.into(),
            cohort_tx: cohort_tx.into(),
            outcome_tx: outcome_tx.into(),
            result_tx: result_tx.into(),
        };

        let subscriber = EventSubscriber {
            phase_rx: phase_rx.into(),
            cohort_rx: cohort_rx.into(),
            outcome_rx: outcome_rx.into(),
            result_rx: result_rx.into(),
        };

        (publisher, subscriber)
    }

    /// Sets the round ID that is attached to the events the publisher broadcasts.
    pub fn set_round_id(&mut self, id: u64) {
        self.round_id = id;
    }

    fn event<T>(&self, event: T) -> Event<T> {
        Event {
            round_id: self.round_id,
            event,
        }
    }

    /// Emits a phase event.
    pub fn broadcast_phase(&mut self, phase: PhaseName) {
        self.phase_tx.broadcast(self.event(phase));
    }

    /// Emits the cohort of the current round.
    pub fn broadcast_cohort(&mut self, cohort: Cohort) {
        self.cohort_tx.broadcast(self.event(cohort));
    }

    /// Emits the outcome of the current round.
    pub fn broadcast_outcome(&mut self, outcome: RoundOutcome) {
        self.outcome_tx.broadcast(self.event(Some(outcome)));
    }

    /// Emits the outcome of an earlier round.
    pub fn broadcast_outcome_of(&mut self, round_id: u64, outcome: RoundOutcome) {
        self.outcome_tx.broadcast(Event {
            round_id,
            event: Some(outcome),
        });
    }

    /// Emits a result update.
    pub fn broadcast_result(&mut self, update: ResultUpdate) {
        self.result_tx.broadcast(self.event(update));
    }
}

impl EventSubscriber {
    /// Gets a listener for new phase events.
    pub fn phase_listener(&self) -> EventListener<PhaseName> {
        self.phase_rx.clone()
    }

    /// Gets a listener for the cohort of the current round.
    pub fn cohort_listener(&self) -> EventListener<Cohort> {
        self.cohort_rx.clone()
    }

    /// Gets a listener for round outcomes. `None` until the first round ended.
    pub fn outcome_listener(&self) -> EventListener<Option<RoundOutcome>> {
        self.outcome_rx.clone()
    }

    /// Gets a listener for new round results.
    pub fn result_listener(&self) -> EventListener<ResultUpdate> {
        self.result_rx.clone()
    }
}

/// A listener for coordinator events.
#[derive(Debug, Clone)]
pub struct EventListener<E>(watch::Receiver<Event<E>>);

impl<E> From<watch::Receiver<Event<E>>> for EventListener<E> {
    fn from(receiver: watch::Receiver<Event<E>>) -> Self {
        EventListener(receiver)
    }
}

impl<E> EventListener<E>
where
    E: Clone,
{
    /// Gets the latest event.
    pub fn get_latest(&self) -> Event<E> {
        self.0.borrow().clone()
    }

    /// Waits for the next event the listener has not seen yet.
    ///
    /// Returns `None` once the publisher has been dropped.
    pub async fn next(&mut self) -> Option<Event<E>> {
        self.0.changed().await.ok()?;
        Some(self.0.borrow_and_update().clone())
    }
}

/// A broadcaster for coordinator events.
#[derive(Debug)]
pub struct EventBroadcaster<E>(watch::Sender<Event<E>>);

impl<E> EventBroadcaster<E> {
    /// Broadcasts the given event. The event is kept even if nobody is listening.
    fn broadcast(&self, event: Event<E>) {
        self.0.send_replace(event);
    }
}

impl<E> From<watch::Sender<Event<E>>> for EventBroadcaster<E> {
    fn from(sender: watch::Sender<Event<E>>) -> Self {
        Self(sender)
    }
}

#[cfg(test)]
mod tests {
    use tokio_test::{assert_pending, assert_ready, task};

    use super::*;
    use crate::registry::ParticipantId;

    #[tokio::test]
    async fn test_events_carry_the_round_id() {
        let (mut publisher, subscriber) =
            EventPublisher::init(0, PhaseName::Idle, Cohort::default());
        let mut phases = subscriber.phase_listener();
        assert_eq!(
            phases.get_latest(),
            Event {
                round_id: 0,
                event: PhaseName::Idle
            }
        );

        publisher.set_round_id(1);
        publisher.broadcast_phase(PhaseName::Selecting);
        assert_eq!(
            phases.next().await,
            Some(Event {
                round_id: 1,
                event: PhaseName::Selecting
            })
        );

        let cohort = Cohort::new((1..=3).map(ParticipantId::from_u128));
        publisher.broadcast_cohort(cohort.clone());
        assert_eq!(subscriber.cohort_listener().get_latest().event, cohort);

        publisher.broadcast_outcome_of(0, RoundOutcome::Finished { handle: "0_ab".into() });
        let outcome = subscriber.outcome_listener().get_latest();
        assert_eq!(outcome.round_id, 0);
        assert_eq!(outcome.event, Some(RoundOutcome::Finished { handle: "0_ab".into() }));
    }

    #[tokio::test]
    async fn test_listener_ends_with_the_publisher() {
        let (publisher, subscriber) = EventPublisher::init(0, PhaseName::Idle, Cohort::default());
        let mut results = subscriber.result_listener();
        drop(publisher);
        assert!(results.next().await.is_none());
        assert_eq!(results.get_latest().event, ResultUpdate::Invalidate);
    }

    #[test]
    fn test_next_waits_for_an_unseen_event() {
        let (mut publisher, subscriber) =
            EventPublisher::init(4, PhaseName::Idle, Cohort::default());
        let mut phases = subscriber.phase_listener();
        let mut next = task::spawn(phases.next());
        assert_pending!(next.poll());

        publisher.broadcast_phase(PhaseName::Selecting);
        assert!(next.is_woken());
        assert_eq!(
            assert_ready!(next.poll()),
            Some(Event {
                round_id: 4,
                event: PhaseName::Selecting
            })
        );
    }
}
