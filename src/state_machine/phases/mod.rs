//! This module provides the `PhaseStates` of the
//! [`StateMachine`](crate::state_machine::StateMachine).

mod abandoned;
mod aggregating;
mod collecting;
mod failure;
mod finished;
mod handler;
mod idle;
mod phase;
mod selecting;
mod shutdown;

pub use self::{
    abandoned::Abandoned,
    aggregating::Aggregating,
    collecting::Collecting,
    failure::{Failure, PhaseError},
    finished::Finished,
    handler::Handler,
    idle::Idle,
    phase::{Phase, PhaseName, PhaseState, Shared},
    selecting::Selecting,
    shutdown::Shutdown,
};
