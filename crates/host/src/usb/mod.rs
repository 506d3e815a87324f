//! USB subsystem
//!
//! Device identity, request lifecycle and change notification on top of an
//! exchangeable host backend.
//!
//! Two execution contexts take part:
//! - the backend context: threads owned by the active controller that scan
//!   the host and run transfers
//! - the consumer context: whoever calls [`Registry::pump`]; every completion
//!   callback and device-list notification runs there
//!
//! Backend threads only mutate completion queues and snapshots, then post a
//! [`common::PumpEvent`] for the consumer to act on.

pub mod backend;
pub mod controller;
pub mod device;
pub mod registry;
pub mod request;
pub mod state;

pub use controller::{
    Controller, ControllerContext, ControllerFactory, OpenDevices, PendingDevice, PollResults,
    UidAssignment, UidTable,
};
pub use device::{
    Device, DeviceBackend, DeviceClient, DeviceError, EndpointSelector, Lifecycle, Submission,
};
pub use registry::{
    DeviceChangeClient, DeviceListChange, PumpStats, Registry, SubscriptionId,
};
pub use request::{
    Completion, Request, RequestArena, RequestCompleter, RequestHandle, RequestPhase,
    USER_DATA_SIZE, UserData,
};
pub use state::{RestoredDevice, write_device_state};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
