use std::sync::Arc;

use tokio::time::Instant;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::{
    mask::PairwiseMasking,
    notifier::{NoopNotifier, Notifier},
    registry::{ParticipantId, ParticipantRegistry, ParticipantState},
    settings::tests::settings,
    state_machine::{
        coordinator::CoordinatorState,
        events::{EventPublisher, EventSubscriber},
        phases::{PhaseName, Shared},
        requests::{RequestReceiver, RequestSender},
    },
    storage::Storage,
};

pub fn enable_logging() {
    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(true)
        .try_init();
}

pub fn coordinator_state() -> CoordinatorState {
    CoordinatorState::new(&settings())
}

/// Creates the shared state of a state machine in round 0.
pub fn init_shared<T>(store: T) -> (Shared<T>, RequestSender, EventSubscriber)
where
    T: Storage,
{
    let (shared, request_tx, event_subscriber, _) =
        init_shared_with(coordinator_state(), store, Arc::new(NoopNotifier));
    (shared, request_tx, event_subscriber)
}

/// Creates the shared state of a state machine from the given coordinator state.
pub fn init_shared_with<T>(
    coordinator_state: CoordinatorState,
    store: T,
    notifier: Arc<dyn Notifier>,
) -> (
    Shared<T>,
    RequestSender,
    EventSubscriber,
    Arc<ParticipantRegistry>,
)
where
    T: Storage,
{
    let (registry, participant_events) =
        ParticipantRegistry::new(coordinator_state.selection.liveness_window);
    let registry = Arc::new(registry);

    let (event_publisher, event_subscriber) = EventPublisher::init(
        coordinator_state.round_id,
        PhaseName::Idle,
        coordinator_state.cohort.clone(),
    );
    let (request_rx, request_tx) = RequestReceiver::new();
    let shared = Shared::new(
        coordinator_state,
        event_publisher,
        request_rx,
        store,
        registry.clone(),
        participant_events,
        notifier,
        Arc::new(PairwiseMasking),
    );
    (shared, request_tx, event_subscriber, registry)
}

/// Registers a participant and walks it through the lifecycle into the given state.
///
/// # Panic
///
/// Panics if the participant is already registered.
pub fn register_in_state(
    registry: &ParticipantRegistry,
    id: &ParticipantId,
    state: ParticipantState,
) {
    use ParticipantState::*;

    registry.register(*id).unwrap();
    if state == Registered {
        return;
    }
    registry.heartbeat(id, Instant::now()).unwrap();
    let path: &[ParticipantState] = match state {
        Registered | Eligible => &[],
        Selected => &[Selected],
        Submitted => &[Selected, Submitted],
        Done => &[Selected, Submitted, Done],
        Dropped => &[Selected, Dropped],
    };
    for to in path {
        registry.set_state(id, *to).unwrap();
    }
}
