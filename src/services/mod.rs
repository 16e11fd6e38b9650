//! This module provides the coordinator facade.
//!
//! [`Coordinator::start`] wires the building blocks together: it creates the participant
//! registry, initializes the state machine from the latest checkpoint and spawns the state
//! machine and the heartbeat monitor. Participants and administrators talk to the running
//! coordinator through a [`CoordinatorHandle`]:
//!
//! - participant lifecycle: [`register_participant`], [`unregister_participant`], [`heartbeat`]
//! - round protocol: [`submit_key_material`], [`submit_masked_update`],
//!   [`submit_dropout_share`]
//! - administration: [`start_round`], [`cancel_round`], [`status`], [`subscribe`]
//!
//! [`register_participant`]: CoordinatorHandle::register_participant
//! [`unregister_participant`]: CoordinatorHandle::unregister_participant
//! [`heartbeat`]: CoordinatorHandle::heartbeat
//! [`submit_key_material`]: CoordinatorHandle::submit_key_material
//! [`submit_masked_update`]: CoordinatorHandle::submit_masked_update
//! [`submit_dropout_share`]: CoordinatorHandle::submit_dropout_share
//! [`start_round`]: CoordinatorHandle::start_round
//! [`cancel_round`]: CoordinatorHandle::cancel_round
//! [`status`]: CoordinatorHandle::status
//! [`subscribe`]: CoordinatorHandle::subscribe

use std::{sync::Arc, time::Duration};

use tokio::task::JoinHandle;
use tracing::{debug, error_span, info, Span};
use tracing_futures::Instrument;

use crate::{
    heartbeat::HeartbeatMonitor,
    mask::MaskObject,
    notifier::Notifier,
    protocol::{DropoutShare, KeyMaterial},
    registry::{ParticipantId, ParticipantRegistry, RegistryError},
    settings::Settings,
    state_machine::{
        events::EventSubscriber,
        initializer::{StateMachineInitializationResult, StateMachineInitializer},
        phases::PhaseName,
        requests::{
            DropoutSharesRequest,
            KeyMaterialRequest,
            MaskedUpdateRequest,
            RequestError,
            RequestSender,
            StateMachineRequest,
        },
    },
    storage::Storage,
};


/// A running coordinator.
#[derive(Debug)]
pub struct Coordinator {
    handle: CoordinatorHandle,
    state_machine: JoinHandle<Option<()>>,
    monitor: JoinHandle<()>,
}

impl Coordinator {
    /// Starts a coordinator.
    ///
    /// The state machine resumes the round of the latest checkpoint in `store`, if any.
    ///
    /// # Errors
    /// Fails if the checkpoint can't be loaded or doesn't describe a resumable round.
    pub async fn start<T>(
        settings: Settings,
        store: T,
        notifier: impl Notifier,
    ) -> StateMachineInitializationResult<Self>
    where
        T: Storage,
    {
        let liveness_window = Duration::from_secs(settings.selection.liveness_window);
        let (registry, participant_events) = ParticipantRegistry::new(liveness_window);
        let registry = Arc::new(registry);
        let monitor = HeartbeatMonitor::new(registry.clone(), settings.heartbeat);

        let (state_machine, request_tx, events) = StateMachineInitializer::new(
            settings,
            store,
            registry.clone(),
            participant_events,
            Arc::new(notifier),
        )
        .init()
        .await?;

        info!("starting the coordinator");
        let state_machine = tokio::spawn(
            state_machine
                .run()
                .instrument(error_span!("state_machine")),
        );
        let monitor_task = tokio::spawn(
            monitor
                .clone()
                .run()
                .instrument(error_span!("heartbeat_monitor")),
        );

        Ok(Self {
            handle: CoordinatorHandle {
                registry,
                monitor,
                request_tx,
                events,
            },
            state_machine,
            monitor: monitor_task,
        })
    }

    /// Gets a handle to the coordinator.
    pub fn handle(&self) -> CoordinatorHandle {
        self.handle.clone()
    }

    /// Stops the coordinator.
    ///
    /// The heartbeat monitor stops immediately. The state machine shuts down once every handle
    /// is dropped, so this only returns after the handles given out are gone.
    pub async fn shutdown(self) {
        let Self {
            handle,
            state_machine,
            monitor,
        } = self;
        monitor.abort();
        drop(handle);
        if let Err(err) = state_machine.await {
            debug!("state machine task ended abnormally: {}", err);
        }
        info!("coordinator stopped");
    }
}

/// The round, phase and cohort size the coordinator is currently in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorStatus {
    pub round_id: u64,
    pub phase: PhaseName,
    pub cohort_size: usize,
}

/// A handle to a running [`Coordinator`].
///
/// Handles are cheap to clone. The coordinator keeps running as long as one of them is alive.
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    registry: Arc<ParticipantRegistry>,
    monitor: HeartbeatMonitor,
    request_tx: RequestSender,
    events: EventSubscriber,
}

impl CoordinatorHandle {
    /// Registers a participant. Its first heartbeat makes it eligible for selection.
    ///
    /// # Errors
    /// Fails with [`RegistryError::AlreadyRegistered`] if the participant is known and live.
    pub fn register_participant(&self, id: ParticipantId) -> Result<(), RegistryError> {
        self.registry.register(id).map(|_| ())
    }

    /// Removes a participant. A member of the current round is dropped from it.
    pub fn unregister_participant(&self, id: &ParticipantId) -> Result<(), RegistryError> {
        self.registry.unregister(id).map(|_| ())
    }

    /// Records a heartbeat of a participant.
    pub fn heartbeat(&self, id: &ParticipantId) -> Result<(), RegistryError> {
        self.monitor.on_heartbeat(id)
    }

    pub async fn submit_key_material(
        &self,
        participant_id: ParticipantId,
        round_id: u64,
        material: KeyMaterial,
    ) -> Result<(), RequestError> {
        let req = KeyMaterialRequest {
            participant_id,
            round_id,
            material,
        };
        let span = error_span!("key_material", participant_id = %participant_id, round_id);
        self.request(req.into(), span).await
    }

    pub async fn submit_masked_update(
        &self,
        participant_id: ParticipantId,
        round_id: u64,
        masked: MaskObject,
    ) -> Result<(), RequestError> {
        let req = MaskedUpdateRequest {
            participant_id,
            round_id,
            masked,
        };
        let span = error_span!("masked_update", participant_id = %participant_id, round_id);
        self.request(req.into(), span).await
    }

    /// Submits the shares a participant opened for the dropped members of the round.
    pub async fn submit_dropout_share(
        &self,
        participant_id: ParticipantId,
        round_id: u64,
        shares: Vec<DropoutShare>,
    ) -> Result<(), RequestError> {
        let req = DropoutSharesRequest {
            participant_id,
            round_id,
            shares,
        };
        let span = error_span!("dropout_shares", participant_id = %participant_id, round_id);
        self.request(req.into(), span).await
    }

    /// Starts a round if the coordinator is idle.
    pub async fn start_round(&self) -> Result<(), RequestError> {
        self.request(StateMachineRequest::StartRound, Span::current())
            .await
    }

    /// Abandons the current round.
    pub async fn cancel_round(&self) -> Result<(), RequestError> {
        self.request(StateMachineRequest::CancelRound, Span::current())
            .await
    }

    pub fn status(&self) -> CoordinatorStatus {
        let phase = self.events.phase_listener().get_latest();
        let cohort = self.events.cohort_listener().get_latest();
        CoordinatorStatus {
            round_id: phase.round_id,
            phase: phase.event,
            cohort_size: cohort.event.len(),
        }
    }

    /// Subscribes to the round events.
    pub fn subscribe(&self) -> EventSubscriber {
        self.events.clone()
    }

    async fn request(&self, req: StateMachineRequest, span: Span) -> Result<(), RequestError> {
        self.request_tx.request(req, span).await
    }
}
