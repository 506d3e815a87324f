//! Host backends implementing the controller SPI
//!
//! - [`libusb`]: real host devices through `rusb`
//! - [`mock`]: deterministic in-process test double

pub mod libusb;
pub mod mock;

pub use libusb::RusbControllerFactory;
pub use mock::{CancelMode, MockControllerFactory, MockHost};
