use async_trait::async_trait;
use tracing::debug;

use crate::{
    state_machine::{
        phases::{Phase, PhaseError, PhaseName, PhaseState, Shared},
        requests::RequestError,
        StateMachine,
    },
    storage::Storage,
};

/// The shutdown state.
#[derive(Debug)]
pub struct Shutdown;

#[async_trait]
impl<T> Phase<T> for PhaseState<Shutdown, T>
where
    T: Storage,
{
    const NAME: PhaseName = PhaseName::Shutdown;

    async fn process(&mut self) -> Result<(), PhaseError> {
        // clear the request channel
        self.shared.request_rx.close();
        let current = self.shared.round_id();
        while let Some((req, _, resp_tx)) = self.shared.request_rx.recv().await {
            debug!("rejecting request: shutting down");
            let response = match req.stale_round(current) {
                Some(round_id) => RequestError::StaleRound(round_id, current),
                None => RequestError::InternalError("the state machine is shutting down"),
            };
            let _ = resp_tx.send(Err(response));
        }
        Ok(())
    }

    async fn next(self) -> Option<StateMachine<T>> {
        None
    }
}

impl<T> PhaseState<Shutdown, T> {
    /// Creates a new shutdown state.
    pub fn new(shared: Shared<T>) -> Self {
        Self {
            private: Shutdown,
            shared,
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio_test::{assert_pending, assert_ready, task};
    use tracing::Span;

    use super::*;
    use crate::{
        registry::ParticipantId,
        state_machine::{
            requests::{DropoutSharesRequest, StateMachineRequest},
            tests::builder::StateMachineBuilder,
        },
        storage::memory::MemoryStore,
    };

    #[tokio::test]
    async fn test_shutdown() {
        let (state_machine, request_tx, events, _) = StateMachineBuilder::new(MemoryStore::new())
            .with_phase(Shutdown)
            .build();
        assert!(state_machine.is_shutdown());
        drop(request_tx);

        assert!(state_machine.next().await.is_none());
        assert_eq!(events.phase_listener().get_latest().event, PhaseName::Shutdown);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_pending_requests() {
        let (state_machine, request_tx, _events, _) = StateMachineBuilder::new(MemoryStore::new())
            .with_round_id(3)
            .with_phase(Shutdown)
            .build();
        let stale = DropoutSharesRequest {
            participant_id: ParticipantId::from_u128(1),
            round_id: 2,
            shares: Vec::new(),
        };
        let mut stale = task::spawn(request_tx.request(stale.into(), Span::none()));
        let mut start =
            task::spawn(request_tx.request(StateMachineRequest::StartRound, Span::none()));
        assert_pending!(stale.poll());
        assert_pending!(start.poll());

        assert!(state_machine.next().await.is_none());
        assert_eq!(
            assert_ready!(stale.poll()),
            Err(RequestError::StaleRound(2, 3))
        );
        assert!(matches!(
            assert_ready!(start.poll()),
            Err(RequestError::InternalError(_))
        ));
    }
}
