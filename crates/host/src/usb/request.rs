//! Outstanding transfer bookkeeping
//!
//! Every request lives in a generational arena owned by its device. Backends
//! and consumers refer to a request only through a [`RequestHandle`]; once the
//! request has been delivered its slot is recycled with a new generation, so
//! a late completion carrying the old handle is rejected instead of touching
//! another request.

use super::device::DeviceShared;
use protocol::{TransferKind, TransferStatus, UsbError};
use std::fmt;
use std::sync::Weak;
use tracing::{debug, warn};

/// Size of the opaque consumer payload carried by each request
pub const USER_DATA_SIZE: usize = 16;

/// Opaque consumer payload, returned untouched with the completion
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct UserData(pub [u8; USER_DATA_SIZE]);

impl UserData {
    pub fn from_u64(value: u64) -> Self {
        let mut bytes = [0u8; USER_DATA_SIZE];
        bytes[..8].copy_from_slice(&value.to_le_bytes());
        Self(bytes)
    }

    /// First eight bytes as a little-endian integer
    pub fn as_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.0[..8]);
        u64::from_le_bytes(bytes)
    }
}

impl fmt::Debug for UserData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserData({:#x})", self.as_u64())
    }
}

/// Generational reference to a request slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestHandle {
    index: u32,
    generation: u32,
}

impl fmt::Display for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    /// Handed to the backend, completion not yet recorded
    Issued,
    /// Completion recorded, waiting for the consumer pump
    Completed,
}

#[derive(Debug)]
pub struct Request {
    pub endpoint: u8,
    pub kind: TransferKind,
    pub user_data: UserData,
    pub phase: RequestPhase,
    pub status: Option<TransferStatus>,
    pub data: Vec<u8>,
    pub actual_length: usize,
    /// Completed locally without reaching the backend
    pub synthetic: bool,
    pub cancel_requested: bool,
}

impl Request {
    pub fn new(endpoint: u8, kind: TransferKind, user_data: UserData, synthetic: bool) -> Self {
        Self {
            endpoint,
            kind,
            user_data,
            phase: RequestPhase::Issued,
            status: None,
            data: Vec::new(),
            actual_length: 0,
            synthetic,
            cancel_requested: false,
        }
    }

    pub fn is_issued(&self) -> bool {
        self.phase == RequestPhase::Issued
    }
}

/// What the consumer receives, exactly once per request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub handle: RequestHandle,
    pub endpoint: u8,
    pub kind: TransferKind,
    pub user_data: UserData,
    pub status: TransferStatus,
    /// IN data; empty for OUT transfers
    pub data: Vec<u8>,
    pub actual_length: usize,
    pub synthetic: bool,
}

struct Slot {
    generation: u32,
    request: Option<Request>,
}

/// Generational slot table
#[derive(Default)]
pub struct RequestArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    len: usize,
}

impl RequestArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, request: Request) -> RequestHandle {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.request = Some(request);
            return RequestHandle {
                index,
                generation: slot.generation,
            };
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            request: Some(request),
        });
        RequestHandle {
            index,
            generation: 0,
        }
    }

    fn slot(&self, handle: RequestHandle) -> Option<&Slot> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
    }

    pub fn get(&self, handle: RequestHandle) -> Option<&Request> {
        self.slot(handle)?.request.as_ref()
    }

    pub fn get_mut(&mut self, handle: RequestHandle) -> Option<&mut Request> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)?
            .request
            .as_mut()
    }

    /// Take the request out and retire the handle
    pub fn remove(&mut self, handle: RequestHandle) -> Option<Request> {
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)?;
        let request = slot.request.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.len -= 1;
        Some(request)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (RequestHandle, &Request)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.request.as_ref().map(|request| {
                (
                    RequestHandle {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    request,
                )
            })
        })
    }

    /// Number of requests still waiting on the backend
    pub fn issued(&self) -> usize {
        self.iter().filter(|(_, request)| request.is_issued()).count()
    }
}

/// Single-use completion token for one issued request
///
/// The backend receives one completer per submitted request. Completion moves
/// the request from `Issued` to `Completed`; whoever does that first (backend,
/// cancellation or device removal) decides the delivered status and every
/// later attempt is a no-op. A completer dropped without being used completes
/// its request with a failure so that `Close()` cannot wait forever.
pub struct RequestCompleter {
    device: Weak<DeviceShared>,
    handle: RequestHandle,
    armed: bool,
}

impl RequestCompleter {
    pub(crate) fn new(device: Weak<DeviceShared>, handle: RequestHandle) -> Self {
        Self {
            device,
            handle,
            armed: true,
        }
    }

    pub fn handle(&self) -> RequestHandle {
        self.handle
    }

    /// Record the backend result; returns `false` if another side won
    pub fn complete(mut self, status: TransferStatus, data: Vec<u8>, actual_length: usize) -> bool {
        self.armed = false;
        self.finish(status, data, actual_length)
    }

    fn finish(&self, status: TransferStatus, data: Vec<u8>, actual_length: usize) -> bool {
        match self.device.upgrade() {
            Some(device) => device.complete_request(self.handle, status, data, actual_length),
            None => {
                debug!("Completion for request {} after device teardown", self.handle);
                false
            }
        }
    }
}

impl Drop for RequestCompleter {
    fn drop(&mut self) {
        if self.armed && self.device.strong_count() > 0 {
            let status = TransferStatus::Failed(UsbError::Other {
                message: "request abandoned by backend".to_string(),
            });
            if self.finish(status, Vec::new(), 0) {
                warn!("Request {} abandoned by backend", self.handle);
            }
        }
    }
}

impl fmt::Debug for RequestCompleter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestCompleter")
            .field("handle", &self.handle)
            .field("armed", &self.armed)
            .finish()
    }
}
