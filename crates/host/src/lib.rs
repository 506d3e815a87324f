//! Virtual USB host subsystem
//!
//! Lets a guest-facing consumer enumerate, open and drive USB devices attached
//! to the host without depending on a particular host transport. The pieces:
//!
//! - [`usb::Registry`]: process-wide coordinator with reference-counted
//!   backend activation, the published device list and change notifications
//! - [`usb::Device`]: one opened device with asynchronous transfers and an
//!   explicit `Opening -> Open -> Closing -> Closed` lifecycle
//! - [`usb::Controller`]: the backend contract, implemented by the libusb
//!   backend and by the in-process mock used in tests
//! - [`usb::state`]: checkpoint and restore of open-device identities
//!
//! Backend threads never run consumer callbacks. Completions and device-list
//! changes are queued and delivered from [`usb::Registry::pump`].

pub mod config;
pub mod usb;

pub use config::UsbConfig;
