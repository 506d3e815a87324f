//! Common utilities for the virtual USB workspace
//!
//! This crate provides functionality shared by the host subsystem and its
//! tools: error handling, logging setup, the bounded pump channel that carries
//! notifications from backend threads to the consumer context, and
//! descriptor fixtures for tests.

pub mod channel;
pub mod error;
pub mod logging;
pub mod test_utils;

pub use channel::{Drained, PumpEvent, PumpNotifier, PumpReceiver, create_pump_bridge};
pub use error::{Error, Result};
pub use logging::setup_logging;
