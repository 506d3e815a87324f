//! Opened USB device
//!
//! A [`Device`] owns every request issued on it until the consumer has been
//! handed the completion. Lifecycle:
//!
//! ```text
//! Opening -> Open -> Closing -> Closed
//! ```
//!
//! Transfers are accepted only while `Open`. `close()` cancels everything,
//! waits for the backend to finish each request, delivers the completions and
//! releases the backend. A device that vanishes from the host goes to
//! `Closing` on its own, fails all outstanding requests with
//! [`TransferStatus::Removed`] and reaches `Closed` after delivery.
//!
//! Lock order: backend before state. Nothing calls into the backend while
//! holding the state lock, so completions (which take the state lock only)
//! can arrive from any thread at any time.

use super::controller::{ControllerContext, OpenDevices, PendingDevice};
use super::lock;
use super::request::{
    Completion, Request, RequestArena, RequestCompleter, RequestHandle, RequestPhase, UserData,
};
use common::{PumpEvent, PumpNotifier};
use protocol::types::{REQUEST_SET_CONFIGURATION, REQUEST_SET_INTERFACE};
use protocol::{
    DeviceDescriptor, DeviceStateRecord, Setup, TransferKind, TransferStatus, Uid, UsbError,
};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Opening,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    /// Operation issued after `close()` started or the device vanished
    #[error("device {0} is closed")]
    Closed(Uid),

    #[error("no such configuration, interface or alternate setting")]
    NotFound,

    #[error("rejected by device: {0}")]
    Rejected(UsbError),

    /// Isochronous packet lengths that do not fit the transfer buffer
    #[error("invalid isochronous packet layout: {0}")]
    InvalidPackets(String),
}

/// Which requests `cancel_requests` applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointSelector {
    All,
    Address(u8),
}

impl EndpointSelector {
    pub fn matches(&self, endpoint: u8) -> bool {
        match self {
            EndpointSelector::All => true,
            EndpointSelector::Address(address) => *address == endpoint,
        }
    }
}

/// One transfer as handed to the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub endpoint: u8,
    pub kind: TransferKind,
    /// Control transfers only
    pub setup: Option<Setup>,
    /// OUT payload; for IN transfers the length is the requested size
    pub data: Vec<u8>,
    /// Isochronous only: length of each packet, laid out back to back in `data`
    pub packet_lengths: Vec<u16>,
    pub timeout: Option<Duration>,
}

impl Submission {
    pub fn direction_in(&self) -> bool {
        match &self.setup {
            Some(setup) => setup.direction_in(),
            None => self.endpoint & 0x80 != 0,
        }
    }

    /// Bytes the device is asked to return (IN) or accept (OUT)
    pub fn requested_length(&self) -> usize {
        match &self.setup {
            Some(setup) if setup.direction_in() => setup.length as usize,
            _ => self.data.len(),
        }
    }
}

/// Per-device half of a backend
///
/// Called with the device's backend lock held and never with its state lock.
pub trait DeviceBackend: Send {
    /// SET_CONFIGURATION with the configuration's `bConfigurationValue`
    fn set_config(&mut self, configuration_value: u8) -> Result<(), UsbError>;

    fn set_interface_alt_setting(&mut self, interface: u8, alt_setting: u8)
    -> Result<(), UsbError>;

    /// Start a transfer; the result is reported through `completer`
    fn submit(&mut self, submission: Submission, completer: RequestCompleter);

    /// Ask the backend to abort a submitted request
    ///
    /// `true` means the backend still tracks the request and will complete
    /// it (with `Cancelled` or whatever status it already had). `false` makes
    /// the device complete it locally as cancelled.
    fn cancel(&mut self, handle: RequestHandle) -> bool;

    /// Control requests the backend satisfies without a transfer
    fn handle_locally(&mut self, _setup: &Setup) -> Option<TransferStatus> {
        None
    }

    /// Give the host device back; no completion may arrive afterwards
    fn release(&mut self);
}

/// Consumer side of an opened device
///
/// Only ever invoked from the consumer context (`process_pending`).
pub trait DeviceClient: Send + Sync {
    fn request_complete(&self, completion: Completion);
}

struct DeviceState {
    lifecycle: Lifecycle,
    arena: RequestArena,
    /// Completed requests in completion order, waiting for delivery
    completed: VecDeque<RequestHandle>,
    /// A pump event for this device is queued
    notify_pending: bool,
    active_config: usize,
    alt_settings: HashMap<u8, u8>,
    removed: bool,
    released: bool,
}

pub(crate) struct DeviceShared {
    id: u64,
    uid: Uid,
    descriptor: DeviceDescriptor,
    client: Arc<dyn DeviceClient>,
    this: Weak<DeviceShared>,
    state: Mutex<DeviceState>,
    drained: Condvar,
    backend: Mutex<Box<dyn DeviceBackend>>,
    /// Thread currently running a delivery pass
    delivering: Mutex<Option<ThreadId>>,
    notifier: PumpNotifier<PendingDevice>,
    open_devices: OpenDevices,
    transfer_timeout: Option<Duration>,
    close_warn_after: Duration,
}

impl DeviceShared {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn uid(&self) -> Uid {
        self.uid
    }

    pub(crate) fn lifecycle(&self) -> Lifecycle {
        lock(&self.state).lifecycle
    }

    fn ensure_open(&self, state: &DeviceState, operation: &str) -> Result<(), DeviceError> {
        if state.lifecycle != Lifecycle::Open {
            error!(
                "{} issued on device {} in state {:?}",
                operation, self.uid, state.lifecycle
            );
            return Err(DeviceError::Closed(self.uid));
        }
        Ok(())
    }

    /// Move an issued request to the delivery queue
    ///
    /// Returns `None` if the handle is stale or the request already
    /// completed, otherwise whether a pump event must be posted.
    fn record_completion(
        &self,
        state: &mut DeviceState,
        handle: RequestHandle,
        status: TransferStatus,
        data: Vec<u8>,
        actual_length: usize,
    ) -> Option<bool> {
        let request = state.arena.get_mut(handle)?;
        if !request.is_issued() {
            return None;
        }
        request.phase = RequestPhase::Completed;
        request.status = Some(status);
        request.data = data;
        request.actual_length = actual_length;
        state.completed.push_back(handle);

        if state.arena.issued() == 0 {
            self.drained.notify_all();
        }
        Some(!std::mem::replace(&mut state.notify_pending, true))
    }

    pub(crate) fn complete_request(
        &self,
        handle: RequestHandle,
        status: TransferStatus,
        data: Vec<u8>,
        actual_length: usize,
    ) -> bool {
        let signal = {
            let mut state = lock(&self.state);
            match self.record_completion(&mut state, handle, status, data, actual_length) {
                Some(signal) => signal,
                None => {
                    debug!(
                        "Ignoring completion of request {} on device {}: already completed",
                        handle, self.uid
                    );
                    return false;
                }
            }
        };

        if signal {
            self.signal();
        }
        true
    }

    fn signal(&self) {
        self.notifier
            .notify(PumpEvent::RequestsCompleted(PendingDevice::new(
                self.this.clone(),
            )));
    }

    fn claim_delivery(&self) -> DeliveryClaim<'_> {
        let current = thread::current().id();
        let mut owner = lock(&self.delivering);
        let holder = *owner;
        match holder {
            None => {
                *owner = Some(current);
                DeliveryClaim::Claimed(DeliveryGuard(&self.delivering))
            }
            Some(id) if id == current => DeliveryClaim::Nested,
            Some(_) => DeliveryClaim::Elsewhere,
        }
    }

    fn release_backend(&self) {
        let release = {
            let mut state = lock(&self.state);
            !std::mem::replace(&mut state.released, true)
        };
        if release {
            lock(&self.backend).release();
            debug!("Released backend of device {}", self.uid);
        }
    }

    /// Deliver queued completions until the queue stays empty
    fn deliver(&self) -> usize {
        let mut delivered = 0;
        loop {
            let batch: Vec<Completion> = {
                let mut state = lock(&self.state);
                state.notify_pending = false;
                let handles: Vec<RequestHandle> = state.completed.drain(..).collect();
                handles
                    .into_iter()
                    .filter_map(|handle| {
                        let request = state.arena.remove(handle)?;
                        Some(self.completion(handle, request))
                    })
                    .collect()
            };
            if batch.is_empty() {
                break;
            }

            delivered += batch.len();
            for completion in batch {
                debug!(
                    "Delivering request {} on device {} endpoint {:#04x}: {:?}",
                    completion.handle, self.uid, completion.endpoint, completion.status
                );
                self.client.request_complete(completion);
            }
        }

        let finished = {
            let mut state = lock(&self.state);
            let done = state.removed
                && state.lifecycle == Lifecycle::Closing
                && state.arena.is_empty();
            if done {
                state.lifecycle = Lifecycle::Closed;
            }
            done
        };
        if finished {
            self.drained.notify_all();
            self.open_devices.forget(self.id);
            info!("Device {} removed from host and closed", self.uid);
        }

        delivered
    }

    fn completion(&self, handle: RequestHandle, request: Request) -> Completion {
        let status = request.status.unwrap_or_else(|| {
            error!(
                "Request {} on device {} completed without a status",
                handle, self.uid
            );
            TransferStatus::Failed(UsbError::Other {
                message: "missing completion status".to_string(),
            })
        });
        Completion {
            handle,
            endpoint: request.endpoint,
            kind: request.kind,
            user_data: request.user_data,
            status,
            data: request.data,
            actual_length: request.actual_length,
            synthetic: request.synthetic,
        }
    }

    fn config_index_for_value(&self, value: u8) -> Option<usize> {
        self.descriptor
            .configs
            .iter()
            .position(|config| config.configuration_value == value)
    }

    /// Keep configuration bookkeeping in sync with a locally handled request
    fn apply_standard_request(&self, state: &mut DeviceState, setup: &Setup) {
        if setup.is_standard_device() && setup.request == REQUEST_SET_CONFIGURATION {
            if let Some(index) = self.config_index_for_value(setup.value as u8) {
                state.active_config = index;
                state.alt_settings.clear();
            }
        } else if setup.is_standard_interface() && setup.request == REQUEST_SET_INTERFACE {
            state
                .alt_settings
                .insert(setup.index as u8, setup.value as u8);
        }
    }
}

impl Drop for DeviceShared {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if !state.arena.is_empty() {
            error!(
                "Device {} dropped while owning {} requests",
                self.uid,
                state.arena.len()
            );
        }
        if !state.released {
            state.released = true;
            self.backend
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner)
                .release();
        }
    }
}

enum DeliveryClaim<'a> {
    /// This thread now owns delivery until the guard drops
    Claimed(DeliveryGuard<'a>),
    /// Called from a completion callback of this thread's delivery pass
    Nested,
    /// Another thread is delivering
    Elsewhere,
}

/// Releases delivery ownership even if a client callback panics
struct DeliveryGuard<'a>(&'a Mutex<Option<ThreadId>>);

impl Drop for DeliveryGuard<'_> {
    fn drop(&mut self) {
        *lock(self.0) = None;
    }
}

/// Handle to an opened device
///
/// Cheap to clone; all clones refer to the same device.
#[derive(Clone)]
pub struct Device {
    shared: Arc<DeviceShared>,
}

impl Device {
    pub(crate) fn new(
        ctx: &ControllerContext,
        uid: Uid,
        descriptor: DeviceDescriptor,
        backend: Box<dyn DeviceBackend>,
        client: Arc<dyn DeviceClient>,
    ) -> Self {
        let id = ctx.open_devices.next_id();
        let shared = Arc::new_cyclic(|this| DeviceShared {
            id,
            uid,
            descriptor,
            client,
            this: this.clone(),
            state: Mutex::new(DeviceState {
                lifecycle: Lifecycle::Opening,
                arena: RequestArena::new(),
                completed: VecDeque::new(),
                notify_pending: false,
                active_config: 0,
                alt_settings: HashMap::new(),
                removed: false,
                released: false,
            }),
            drained: Condvar::new(),
            backend: Mutex::new(backend),
            delivering: Mutex::new(None),
            notifier: ctx.notifier.clone(),
            open_devices: ctx.open_devices.clone(),
            transfer_timeout: ctx.config.transfer_timeout(),
            close_warn_after: ctx.config.close_warn_after(),
        });

        ctx.open_devices.insert(shared.clone());
        lock(&shared.state).lifecycle = Lifecycle::Open;
        info!(
            "Opened device {} ({:04x}:{:04x})",
            uid, shared.descriptor.vendor_id, shared.descriptor.product_id
        );

        Self { shared }
    }

    pub(crate) fn from_shared(shared: Arc<DeviceShared>) -> Self {
        Self { shared }
    }

    pub(crate) fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn uid(&self) -> Uid {
        self.shared.uid
    }

    pub fn vendor_id(&self) -> u16 {
        self.shared.descriptor.vendor_id
    }

    pub fn product_id(&self) -> u16 {
        self.shared.descriptor.product_id
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.shared.descriptor
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.shared.lifecycle()
    }

    pub fn is_open(&self) -> bool {
        self.lifecycle() == Lifecycle::Open
    }

    /// Requests owned by the device (issued plus awaiting delivery)
    pub fn outstanding(&self) -> usize {
        lock(&self.shared.state).arena.len()
    }

    /// Requests still waiting on the backend
    pub fn issued(&self) -> usize {
        lock(&self.shared.state).arena.issued()
    }

    /// Completed requests not yet delivered
    pub fn pending_delivery(&self) -> usize {
        lock(&self.shared.state).completed.len()
    }

    /// Index into `descriptor().configs` of the active configuration
    pub fn active_config(&self) -> usize {
        lock(&self.shared.state).active_config
    }

    pub fn alt_setting(&self, interface: u8) -> u8 {
        lock(&self.shared.state)
            .alt_settings
            .get(&interface)
            .copied()
            .unwrap_or(0)
    }

    /// Identity record for the state bridge
    pub fn device_state(&self) -> DeviceStateRecord {
        DeviceStateRecord {
            uid: self.shared.uid,
            vendor_id: self.vendor_id(),
            product_id: self.product_id(),
        }
    }

    /// Select configuration `config_index` of the descriptor
    pub fn set_config(&self, config_index: usize) -> Result<(), DeviceError> {
        let shared = &self.shared;
        let mut backend = lock(&shared.backend);
        shared.ensure_open(&lock(&shared.state), "SetConfig")?;

        let value = shared
            .descriptor
            .configs
            .get(config_index)
            .ok_or(DeviceError::NotFound)?
            .configuration_value;

        backend.set_config(value).map_err(|e| {
            warn!(
                "Device {} rejected configuration {}: {}",
                shared.uid, value, e
            );
            DeviceError::Rejected(e)
        })?;

        let mut state = lock(&shared.state);
        state.active_config = config_index;
        state.alt_settings.clear();
        debug!("Device {} now in configuration {}", shared.uid, value);
        Ok(())
    }

    pub fn set_interface_alt_setting(
        &self,
        interface_index: u8,
        setting_index: u8,
    ) -> Result<(), DeviceError> {
        let shared = &self.shared;
        let mut backend = lock(&shared.backend);
        {
            let state = lock(&shared.state);
            shared.ensure_open(&state, "SetInterfaceAltSetting")?;
            let exists = shared
                .descriptor
                .configs
                .get(state.active_config)
                .is_some_and(|config| {
                    config.interfaces.iter().any(|interface| {
                        interface.interface_number == interface_index
                            && interface.alternate_setting == setting_index
                    })
                });
            if !exists {
                return Err(DeviceError::NotFound);
            }
        }

        backend
            .set_interface_alt_setting(interface_index, setting_index)
            .map_err(|e| {
                warn!(
                    "Device {} rejected alternate setting {} on interface {}: {}",
                    shared.uid, setting_index, interface_index, e
                );
                DeviceError::Rejected(e)
            })?;

        lock(&shared.state)
            .alt_settings
            .insert(interface_index, setting_index);
        Ok(())
    }

    /// Issue a control transfer on endpoint 0
    ///
    /// For IN requests `setup.length` bytes are requested and `data` is
    /// ignored; for OUT requests `data` is the payload.
    pub fn control_request(
        &self,
        setup: Setup,
        data: Vec<u8>,
        user_data: UserData,
    ) -> Result<RequestHandle, DeviceError> {
        let shared = &self.shared;
        let mut backend = lock(&shared.backend);
        shared.ensure_open(&lock(&shared.state), "ControlRequest")?;

        if let Some(status) = backend.handle_locally(&setup) {
            drop(backend);
            return self.complete_synthetic(setup, user_data, status);
        }

        let data = if setup.direction_in() {
            Vec::new()
        } else {
            data
        };
        let submission = Submission {
            endpoint: 0,
            kind: TransferKind::Control,
            setup: Some(setup),
            data,
            packet_lengths: Vec::new(),
            timeout: shared.transfer_timeout,
        };
        self.submit_locked(&mut backend, submission, user_data)
    }

    /// For IN endpoints `data.len()` is the number of bytes requested
    pub fn bulk_request(
        &self,
        endpoint: u8,
        data: Vec<u8>,
        user_data: UserData,
    ) -> Result<RequestHandle, DeviceError> {
        self.issue(endpoint, TransferKind::Bulk, data, user_data)
    }

    pub fn interrupt_request(
        &self,
        endpoint: u8,
        data: Vec<u8>,
        user_data: UserData,
    ) -> Result<RequestHandle, DeviceError> {
        self.issue(endpoint, TransferKind::Interrupt, data, user_data)
    }

    /// Issue `packet_lengths.len()` isochronous packets
    ///
    /// Packet `n` occupies the `packet_lengths[n]` bytes of `data` following
    /// packet `n - 1`; the lengths must add up to at most `data.len()`.
    pub fn isochronous_request(
        &self,
        endpoint: u8,
        data: Vec<u8>,
        packet_lengths: Vec<u16>,
        user_data: UserData,
    ) -> Result<RequestHandle, DeviceError> {
        let submission = Submission {
            endpoint,
            kind: TransferKind::Isochronous,
            setup: None,
            data,
            packet_lengths,
            timeout: self.shared.transfer_timeout,
        };
        let mut backend = lock(&self.shared.backend);
        self.submit_locked(&mut backend, submission, user_data)
    }

    fn issue(
        &self,
        endpoint: u8,
        kind: TransferKind,
        data: Vec<u8>,
        user_data: UserData,
    ) -> Result<RequestHandle, DeviceError> {
        let submission = Submission {
            endpoint,
            kind,
            setup: None,
            data,
            packet_lengths: Vec::new(),
            timeout: self.shared.transfer_timeout,
        };
        let mut backend = lock(&self.shared.backend);
        self.submit_locked(&mut backend, submission, user_data)
    }

    fn submit_locked(
        &self,
        backend: &mut Box<dyn DeviceBackend>,
        submission: Submission,
        user_data: UserData,
    ) -> Result<RequestHandle, DeviceError> {
        let shared = &self.shared;
        let handle = {
            let mut state = lock(&shared.state);
            shared.ensure_open(&state, "Transfer")?;
            if submission.kind == TransferKind::Isochronous {
                check_packet_layout(&submission)?;
            }
            state.arena.insert(Request::new(
                submission.endpoint,
                submission.kind,
                user_data,
                false,
            ))
        };

        debug!(
            "Submitting {:?} request {} on device {} endpoint {:#04x} ({} bytes)",
            submission.kind,
            handle,
            shared.uid,
            submission.endpoint,
            submission.requested_length()
        );
        backend.submit(submission, RequestCompleter::new(shared.this.clone(), handle));
        Ok(handle)
    }

    fn complete_synthetic(
        &self,
        setup: Setup,
        user_data: UserData,
        status: TransferStatus,
    ) -> Result<RequestHandle, DeviceError> {
        let shared = &self.shared;
        let (handle, signal) = {
            let mut state = lock(&shared.state);
            shared.ensure_open(&state, "ControlRequest")?;
            let handle = state
                .arena
                .insert(Request::new(0, TransferKind::Control, user_data, true));
            if status.is_success() {
                shared.apply_standard_request(&mut state, &setup);
            }
            let signal = shared
                .record_completion(&mut state, handle, status, Vec::new(), 0)
                .unwrap_or(false);
            (handle, signal)
        };

        debug!(
            "Control request {:#04x} on device {} completed locally",
            setup.request, shared.uid
        );
        if signal {
            shared.signal();
        }
        Ok(handle)
    }

    /// Cancel issued requests on one endpoint or on all of them
    ///
    /// Returns once the cancellation has been forwarded; the cancelled status
    /// is delivered by the next pump. A request the backend already finished
    /// keeps the backend's status. Returns the number of requests affected.
    pub fn cancel_requests(&self, selector: EndpointSelector) -> usize {
        let shared = &self.shared;
        let mut backend = lock(&shared.backend);
        let handles: Vec<RequestHandle> = {
            let mut state = lock(&shared.state);
            let handles: Vec<RequestHandle> = state
                .arena
                .iter()
                .filter(|(_, r)| r.is_issued() && !r.cancel_requested && selector.matches(r.endpoint))
                .map(|(handle, _)| handle)
                .collect();
            for handle in &handles {
                if let Some(request) = state.arena.get_mut(*handle) {
                    request.cancel_requested = true;
                }
            }
            handles
        };

        for &handle in &handles {
            if !backend.cancel(handle) {
                shared.complete_request(handle, TransferStatus::Cancelled, Vec::new(), 0);
            }
        }

        if !handles.is_empty() {
            debug!(
                "Cancelled {} requests on device {} ({:?})",
                handles.len(),
                shared.uid,
                selector
            );
        }
        handles.len()
    }

    /// Deliver completed requests to the client (consumer context only)
    ///
    /// Returns the number of completions delivered.
    pub fn process_pending(&self) -> usize {
        let shared = &self.shared;
        match shared.claim_delivery() {
            DeliveryClaim::Claimed(_guard) => shared.deliver(),
            DeliveryClaim::Nested | DeliveryClaim::Elsewhere => {
                error!(
                    "process_pending invoked concurrently on device {}",
                    shared.uid
                );
                0
            }
        }
    }

    /// Cancel everything, wait for the backend, deliver and release
    ///
    /// Blocks until every outstanding request has been completed by the
    /// backend. Calling `close` on a closed device does nothing.
    pub fn close(&self) {
        let shared = &self.shared;
        {
            let mut state = lock(&shared.state);
            match state.lifecycle {
                Lifecycle::Closed => {
                    debug!("Device {} already closed", shared.uid);
                    return;
                }
                Lifecycle::Closing if !state.removed => {
                    error!("close invoked twice on device {}", shared.uid);
                    return;
                }
                _ => state.lifecycle = Lifecycle::Closing,
            }
        }
        info!("Closing device {}", shared.uid);

        self.cancel_requests(EndpointSelector::All);

        {
            let started = Instant::now();
            let mut state = lock(&shared.state);
            while state.arena.issued() > 0 {
                let (guard, wait) = shared
                    .drained
                    .wait_timeout(state, shared.close_warn_after)
                    .unwrap_or_else(PoisonError::into_inner);
                state = guard;
                if wait.timed_out() && state.arena.issued() > 0 {
                    warn!(
                        "Close of device {} still waiting on {} requests after {:?}",
                        shared.uid,
                        state.arena.issued(),
                        started.elapsed()
                    );
                }
            }
        }

        match shared.claim_delivery() {
            DeliveryClaim::Claimed(_guard) => {
                shared.deliver();
            }
            // the outer pass has already taken its batch out of the arena
            DeliveryClaim::Nested => {
                debug!("Device {} closed from a completion callback", shared.uid);
                shared.deliver();
            }
            DeliveryClaim::Elsewhere => {
                debug!(
                    "Device {} closed while another thread delivers, delivery continues there",
                    shared.uid
                );
            }
        }

        shared.release_backend();
        lock(&shared.state).lifecycle = Lifecycle::Closed;
        shared.drained.notify_all();
        shared.open_devices.remove(shared.id);
        info!("Closed device {}", shared.uid);
    }

    /// The device left the host (backend context)
    ///
    /// Every issued request completes with `Removed`, the backend is released
    /// and the device leaves the open set. It reaches `Closed` once the pump
    /// has delivered those completions.
    pub fn mark_removed(&self) {
        let shared = &self.shared;
        let issued: Vec<RequestHandle> = {
            let mut state = lock(&shared.state);
            if state.removed || state.lifecycle == Lifecycle::Closed {
                return;
            }
            state.removed = true;
            state.lifecycle = Lifecycle::Closing;
            state
                .arena
                .iter()
                .filter(|(_, r)| r.is_issued())
                .map(|(handle, _)| handle)
                .collect()
        };

        if issued.is_empty() {
            info!("Open device {} removed from host", shared.uid);
        } else {
            warn!(
                "Open device {} removed from host with {} outstanding requests",
                shared.uid,
                issued.len()
            );
        }

        for handle in issued {
            shared.complete_request(handle, TransferStatus::Removed, Vec::new(), 0);
        }
        shared.release_backend();
        shared.open_devices.retire(shared.id);

        // the pump must visit the device to finish its lifecycle
        lock(&shared.state).notify_pending = true;
        shared.signal();
    }
}

fn check_packet_layout(submission: &Submission) -> Result<(), DeviceError> {
    if submission.packet_lengths.is_empty() {
        return Err(DeviceError::InvalidPackets("no packets".to_string()));
    }
    let total: usize = submission.packet_lengths.iter().map(|&len| len as usize).sum();
    if total > submission.data.len() {
        return Err(DeviceError::InvalidPackets(format!(
            "packets need {} bytes, buffer holds {}",
            total,
            submission.data.len()
        )));
    }
    Ok(())
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("uid", &self.shared.uid)
            .field("vendor_id", &format_args!("{:#06x}", self.vendor_id()))
            .field("product_id", &format_args!("{:#06x}", self.product_id()))
            .field("lifecycle", &self.lifecycle())
            .finish()
    }
}
