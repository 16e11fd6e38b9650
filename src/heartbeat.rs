//! Liveness tracking of the participants.
//!
//! The [`HeartbeatMonitor`] records heartbeats into the registry and periodically scans the
//! members of the current round. A member whose last heartbeat is older than the timeout is
//! dropped. The registry reports the drop as a [`ParticipantEvent`], which the round state machine
//! consumes, so the scan period bounds the latency with which a dropout is detected.
//!
//! All timeout arithmetic uses the monotonic [`Instant`], hence changes of the wall clock never
//! cause spurious drops.
//!
//! [`ParticipantEvent`]: crate::registry::ParticipantEvent

use std::{sync::Arc, time::Duration};

use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::{
    metric,
    metrics::Measurement,
    registry::{ParticipantId, ParticipantRegistry, ParticipantState, RegistryError},
    settings::HeartbeatSettings,
};

/// Monitors the liveness of the participants.
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    registry: Arc<ParticipantRegistry>,
    timeout: Duration,
    period: Duration,
    eviction: Duration,
}

impl HeartbeatMonitor {
    /// Creates a new monitor.
    pub fn new(registry: Arc<ParticipantRegistry>, settings: HeartbeatSettings) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(settings.timeout),
            period: Duration::from_secs(settings.period),
            eviction: Duration::from_secs(settings.eviction),
        }
    }

    /// Records a heartbeat of a participant at the current instant.
    ///
    /// # Errors
    /// Fails if the participant is unknown.
    pub fn on_heartbeat(&self, id: &ParticipantId) -> Result<(), RegistryError> {
        self.registry.heartbeat(id, Instant::now())
    }

    /// Drops every member of the current round which has been silent for longer than the
    /// timeout and returns them, sorted by id.
    pub fn scan(&self, now: Instant) -> Vec<ParticipantId> {
        let members = self
            .registry
            .in_states(&[ParticipantState::Selected, ParticipantState::Submitted]);

        let dropped = members
            .into_iter()
            .filter(|handle| {
                match self.registry.drop_if_silent(&handle.id, self.timeout, now) {
                    Ok(dropped) => dropped,
                    // the participant unregistered in the meantime
                    Err(err) => {
                        debug!("skipping participant {}: {}", handle.id, err);
                        false
                    }
                }
            })
            .map(|handle| handle.id)
            .collect::<Vec<_>>();

        if !dropped.is_empty() {
            info!("dropped {} silent participant(s)", dropped.len());
            metric!(Measurement::Dropouts, dropped.len() as f64);
        }
        dropped
    }

    /// Removes the participants outside of a round which have been silent for longer than the
    /// eviction period.
    pub fn evict(&self, now: Instant) -> Vec<ParticipantId> {
        self.registry.evict_silent(self.eviction, now)
    }

    /// Scans the participants periodically. Never returns; spawn it and abort the task to stop
    /// monitoring.
    pub async fn run(self) {
        info!(
            "monitoring heartbeats every {:?} with a timeout of {:?}",
            self.period, self.timeout
        );
        let mut ticks = interval(self.period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            let now = ticks.tick().await;
            let dropped = self.scan(now);
            for id in dropped.iter() {
                warn!("participant {} timed out", id);
            }
            let evicted = self.evict(now);
            if !evicted.is_empty() {
                debug!("evicted {} participant(s)", evicted.len());
            }
        }
    }
}
