//! The round state machine.
//!
//! A round moves through the following phases:
//!
//! ```text
//!                  +-> Abandoned -+
//!                  |              |
//! Idle -> Selecting -> Collecting -> Aggregating -> Finished -> Idle
//!                                       |
//!                                       +-> Failure -> Idle | Shutdown
//! ```
//!
//! - **Idle**: the coordinator waits for a [`StartRound`] request or for the round interval to
//!   elapse. Participants of past rounds become eligible again, the cohort of the next round is
//!   selected and persisted.
//! - **Selecting**: the cohort joins the round and is asked for its key material.
//! - **Collecting**: the cohort exchanges its key material through the coordinator, then submits
//!   its masked updates. Members which miss a deadline or drop out are excluded.
//! - **Aggregating**: the surviving contributors open the shares of the dropped members, their
//!   masks are removed and the result of the round is computed.
//! - **Finished**: the result is stored and published.
//! - **Abandoned**: the round lost its quorum, was cancelled or could not be persisted.
//! - **Failure**: the result could not be computed.
//! - **Shutdown**: all request senders have been dropped.
//!
//! The state machine is the only writer of the round. Requests arrive through the
//! [`RequestSender`] and are answered once they have been processed. Progress is published
//! through the [`EventSubscriber`].
//!
//! The state machine is created and, if a checkpoint exists, resumed by the
//! [`StateMachineInitializer`].
//!
//! [`StartRound`]: crate::state_machine::requests::StateMachineRequest::StartRound
//! [`RequestSender`]: crate::state_machine::requests::RequestSender
//! [`EventSubscriber`]: crate::state_machine::events::EventSubscriber
//! [`StateMachineInitializer`]: crate::state_machine::initializer::StateMachineInitializer

pub mod coordinator;
pub mod events;
pub mod initializer;
pub mod phases;
pub mod requests;

#[cfg(test)]
pub(crate) mod tests;

use derive_more::From;

use self::phases::{
    Abandoned,
    Aggregating,
    Collecting,
    Failure,
    Finished,
    Idle,
    PhaseState,
    Selecting,
    Shutdown,
};
use crate::storage::Storage;

/// The state machine with all its states.
#[derive(From)]
pub enum StateMachine<T> {
    Idle(PhaseState<Idle, T>),
    Selecting(PhaseState<Selecting, T>),
    Collecting(PhaseState<Collecting, T>),
    Aggregating(PhaseState<Aggregating, T>),
    Finished(PhaseState<Finished, T>),
    Abandoned(PhaseState<Abandoned, T>),
    Failure(PhaseState<Failure, T>),
    Shutdown(PhaseState<Shutdown, T>),
}

impl<T> StateMachine<T>
where
    T: Storage,
{
    /// Moves the [`StateMachine`] to the next state and consumes the current one.
    /// Returns the next state or `None` if the [`StateMachine`] reached the state [`Shutdown`].
    pub async fn next(self) -> Option<Self> {
        match self {
            StateMachine::Idle(state) => state.run_phase().await,
            StateMachine::Selecting(state) => state.run_phase().await,
            StateMachine::Collecting(state) => state.run_phase().await,
            StateMachine::Aggregating(state) => state.run_phase().await,
            StateMachine::Finished(state) => state.run_phase().await,
            StateMachine::Abandoned(state) => state.run_phase().await,
            StateMachine::Failure(state) => state.run_phase().await,
            StateMachine::Shutdown(state) => state.run_phase().await,
        }
    }

    /// Runs the state machine until it shuts down.
    /// The [`StateMachine`] shuts down once all [`RequestSender`]s have been dropped.
    ///
    /// [`RequestSender`]: crate::state_machine::requests::RequestSender
    pub async fn run(mut self) -> Option<()> {
        loop {
            self = self.next().await?;
        }
    }
}
