//! State machine test utilities.

pub mod builder;
pub mod participant;
pub mod utils;
