//! Testing utilities and mock implementations
//!
//! Mocks for exercising the gateway without an MQTT broker.

pub mod mocks;

pub use mocks::*;
