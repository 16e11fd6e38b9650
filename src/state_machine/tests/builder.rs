use std::{sync::Arc, time::Duration};

use crate::{
    notifier::{NoopNotifier, Notifier},
    protocol::{Aggregate, RoundSession},
    registry::ParticipantRegistry,
    selector::Cohort,
    state_machine::{
        coordinator::CoordinatorState,
        events::EventSubscriber,
        phases::{self, Phase, PhaseState},
        requests::RequestSender,
        tests::utils,
        StateMachine,
    },
    storage::Storage,
};

pub struct StateMachineBuilder<P, T>
where
    T: Storage,
{
    coordinator_state: CoordinatorState,
    phase_state: P,
    store: T,
    notifier: Arc<dyn Notifier>,
    unstored_result: Option<Aggregate>,
}

impl<T> StateMachineBuilder<phases::Idle, T>
where
    T: Storage,
{
    /// Creates a builder of an idle state machine in round 1.
    pub fn new(store: T) -> Self {
        let mut coordinator_state = utils::coordinator_state();
        coordinator_state.round_id = 1;
        Self {
            coordinator_state,
            phase_state: phases::Idle,
            store,
            notifier: Arc::new(NoopNotifier),
            unstored_result: None,
        }
    }
}

impl<P, T> StateMachineBuilder<P, T>
where
    PhaseState<P, T>: Phase<T>,
    StateMachine<T>: From<PhaseState<P, T>>,
    T: Storage,
{
    pub fn build(
        self,
    ) -> (
        StateMachine<T>,
        RequestSender,
        EventSubscriber,
        Arc<ParticipantRegistry>,
    ) {
        let Self {
            coordinator_state,
            phase_state,
            store,
            notifier,
            unstored_result,
        } = self;

        let (mut shared, request_tx, event_subscriber, registry) =
            utils::init_shared_with(coordinator_state, store, notifier);
        shared.unstored_result = unstored_result;

        // Make sure the events that the listeners have are up to date
        shared
            .events
            .broadcast_phase(<PhaseState<P, _> as Phase<_>>::NAME);

        let state = PhaseState {
            private: phase_state,
            shared,
        };

        let state_machine = StateMachine::from(state);
        (state_machine, request_tx, event_subscriber, registry)
    }
}

impl<P, T> StateMachineBuilder<P, T>
where
    T: Storage,
{
    pub fn with_round_id(mut self, id: u64) -> Self {
        self.coordinator_state.round_id = id;
        self
    }

    pub fn with_cohort(mut self, cohort: Cohort) -> Self {
        self.coordinator_state.cohort = cohort;
        self
    }

    pub fn with_min_cohort(mut self, min: usize) -> Self {
        let selection = &mut self.coordinator_state.selection;
        selection.min_cohort = min;
        selection.target_cohort = selection.target_cohort.max(min);
        self
    }

    pub fn with_round_interval(mut self, interval: Duration) -> Self {
        self.coordinator_state.time.round_interval = Some(interval);
        self
    }

    pub fn with_notifier(mut self, notifier: impl Notifier) -> Self {
        self.notifier = Arc::new(notifier);
        self
    }

    pub fn with_unstored_result(mut self, aggregate: Aggregate) -> Self {
        self.unstored_result = Some(aggregate);
        self
    }

    pub fn with_phase<State>(self, phase_state: State) -> StateMachineBuilder<State, T> {
        let Self {
            coordinator_state,
            store,
            notifier,
            unstored_result,
            ..
        } = self;
        StateMachineBuilder {
            coordinator_state,
            phase_state,
            store,
            notifier,
            unstored_result,
        }
    }

    /// Moves to the selecting phase of the current round and cohort.
    pub fn with_selecting(self) -> StateMachineBuilder<phases::Selecting, T> {
        let selecting = phases::Selecting::new(&self.coordinator_state);
        self.with_phase(selecting)
    }

    /// Moves to the collecting phase with a fresh session of the current round and cohort.
    pub fn with_collecting(self) -> StateMachineBuilder<phases::Collecting, T> {
        let state = &self.coordinator_state;
        let session = RoundSession::new(
            state.round_id,
            state.cohort.clone(),
            state.round_params.session_params(),
        );
        self.with_phase(phases::Collecting { session })
    }

    pub fn with_finished(self, aggregate: Aggregate) -> StateMachineBuilder<phases::Finished, T> {
        self.with_phase(phases::Finished {
            aggregate: Arc::new(aggregate),
            outcome: None,
        })
    }
}
