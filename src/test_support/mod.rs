//! Helpers shared by unit tests.

pub mod fixtures;
pub mod socket_guard;
