//! Helpers shared by integration tests.

#![allow(dead_code)]

pub mod fixtures;
#[path = "../../src/test_support/socket_guard.rs"]
pub mod socket_guard;
