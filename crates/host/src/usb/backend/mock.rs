//! In-process test double for the controller SPI
//!
//! [`MockHost`] plays the physical host: tests plug and unplug descriptors,
//! trigger enumeration passes and complete submitted transfers explicitly.
//! Whatever thread calls into the host acts as the backend context, so every
//! race can be staged deterministically.

use crate::usb::controller::{Controller, ControllerContext, ControllerFactory, PollResults, UidTable};
use crate::usb::device::{Device, DeviceBackend, DeviceClient, Submission};
use crate::usb::lock;
use crate::usb::request::{RequestCompleter, RequestHandle};
use protocol::types::{REQUEST_SET_CONFIGURATION, REQUEST_SET_INTERFACE};
use protocol::{DeviceDescriptor, DeviceList, Setup, TransferStatus, Uid, UsbError};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// How the mock backend answers a cancel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CancelMode {
    /// Complete with `Cancelled` before `cancel` returns
    #[default]
    Immediate,
    /// Keep the transfer until `finish_cancelled` or `complete` is called
    Deferred,
}

struct Pending {
    submission: Submission,
    completer: RequestCompleter,
    cancel_requested: bool,
}

#[derive(Default)]
struct HostState {
    plugged: Vec<(u64, DeviceDescriptor)>,
    reverse_enumeration: bool,
    submitted: HashMap<Uid, VecDeque<Pending>>,
    reject_config: bool,
    cancel_mode: CancelMode,
    fail_init: bool,
    created: usize,
    destroyed: usize,
    should_scan: bool,
    released: Vec<Uid>,
    core: Option<Arc<MockCore>>,
}

impl HostState {
    fn enumerate(&self) -> Vec<(u64, DeviceDescriptor)> {
        let mut devices = self.plugged.clone();
        if self.reverse_enumeration {
            devices.reverse();
        }
        devices
    }
}

/// Simulated host shared by the test and the mock controller
#[derive(Clone, Default)]
pub struct MockHost {
    state: Arc<Mutex<HostState>>,
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a device under host identity `host_id`
    ///
    /// The descriptor's `uid` is ignored; the controller assigns one on the
    /// next enumeration pass.
    pub fn plug(&self, host_id: u64, descriptor: DeviceDescriptor) {
        let mut state = lock(&self.state);
        state.plugged.retain(|(id, _)| *id != host_id);
        state.plugged.push((host_id, descriptor));
    }

    pub fn unplug(&self, host_id: u64) -> bool {
        let mut state = lock(&self.state);
        let before = state.plugged.len();
        state.plugged.retain(|(id, _)| *id != host_id);
        state.plugged.len() != before
    }

    /// Enumerate devices in reverse plug order from now on
    pub fn set_reverse_enumeration(&self, reverse: bool) {
        lock(&self.state).reverse_enumeration = reverse;
    }

    /// Run one enumeration pass on the calling thread
    ///
    /// Does nothing while no controller exists or scanning is suspended.
    /// Returns whether the published snapshot changed.
    pub fn rescan(&self) -> bool {
        let (core, devices) = {
            let state = lock(&self.state);
            let Some(core) = state.core.clone() else {
                debug!("Mock rescan without an active controller");
                return false;
            };
            if !state.should_scan {
                debug!("Mock rescan skipped, scanning suspended");
                return false;
            }
            (core, state.enumerate())
        };
        core.scan(devices)
    }

    /// Complete the oldest transfer submitted to `endpoint` of device `uid`
    ///
    /// For IN transfers `data` is returned to the consumer (truncated to the
    /// requested length); for OUT transfers the full payload is reported as
    /// written. Returns `false` if nothing was pending or the request had
    /// already been completed by another path.
    pub fn complete(&self, uid: Uid, endpoint: u8, status: TransferStatus, data: Vec<u8>) -> bool {
        let pending = {
            let mut state = lock(&self.state);
            let Some(queue) = state.submitted.get_mut(&uid) else {
                return false;
            };
            let Some(index) = queue.iter().position(|p| p.submission.endpoint == endpoint) else {
                return false;
            };
            queue.remove(index)
        };
        let Some(pending) = pending else {
            return false;
        };

        let submission = pending.submission;
        let (data, actual_length) = if submission.direction_in() {
            let mut data = data;
            data.truncate(submission.requested_length());
            let length = data.len();
            (data, length)
        } else {
            (Vec::new(), submission.data.len())
        };
        pending.completer.complete(status, data, actual_length)
    }

    /// Complete every transfer whose cancel was deferred
    pub fn finish_cancelled(&self) -> usize {
        let cancelled: Vec<Pending> = {
            let mut state = lock(&self.state);
            state
                .submitted
                .values_mut()
                .flat_map(|queue| {
                    let (cancelled, kept): (VecDeque<Pending>, VecDeque<Pending>) =
                        queue.drain(..).partition(|p| p.cancel_requested);
                    *queue = kept;
                    cancelled
                })
                .collect()
        };

        let count = cancelled.len();
        for pending in cancelled {
            pending
                .completer
                .complete(TransferStatus::Cancelled, Vec::new(), 0);
        }
        count
    }

    /// Submissions still held for device `uid`, oldest first
    pub fn submitted(&self, uid: Uid) -> Vec<Submission> {
        lock(&self.state)
            .submitted
            .get(&uid)
            .map(|queue| queue.iter().map(|p| p.submission.clone()).collect())
            .unwrap_or_default()
    }

    /// Make SET_CONFIGURATION and SET_INTERFACE fail like a stalling device
    pub fn set_reject_config(&self, reject: bool) {
        lock(&self.state).reject_config = reject;
    }

    pub fn set_cancel_mode(&self, mode: CancelMode) {
        lock(&self.state).cancel_mode = mode;
    }

    /// Make the next controller creation fail
    pub fn set_fail_init(&self, fail: bool) {
        lock(&self.state).fail_init = fail;
    }

    pub fn created_count(&self) -> usize {
        lock(&self.state).created
    }

    pub fn destroyed_count(&self) -> usize {
        lock(&self.state).destroyed
    }

    /// A controller was created and has since been destroyed
    pub fn is_destroyed(&self) -> bool {
        let state = lock(&self.state);
        state.core.is_none() && state.destroyed > 0
    }

    pub fn should_scan(&self) -> bool {
        lock(&self.state).should_scan
    }

    /// Uids whose device backend has been released, in release order
    pub fn released(&self) -> Vec<Uid> {
        lock(&self.state).released.clone()
    }

    fn cancel(&self, uid: Uid, handle: RequestHandle) -> bool {
        let pending = {
            let mut state = lock(&self.state);
            let mode = state.cancel_mode;
            let Some(queue) = state.submitted.get_mut(&uid) else {
                return false;
            };
            let Some(index) = queue.iter().position(|p| p.completer.handle() == handle) else {
                return false;
            };
            match mode {
                CancelMode::Deferred => {
                    queue[index].cancel_requested = true;
                    return true;
                }
                CancelMode::Immediate => queue.remove(index),
            }
        };

        if let Some(pending) = pending {
            pending
                .completer
                .complete(TransferStatus::Cancelled, Vec::new(), 0);
        }
        true
    }

    fn release(&self, uid: Uid) {
        let abandoned = {
            let mut state = lock(&self.state);
            state.released.push(uid);
            state.submitted.remove(&uid)
        };
        // completers dropped here lose against whoever completed them first
        drop(abandoned);
    }
}

/// Enumeration state of one mock controller
struct MockCore {
    ctx: ControllerContext,
    scan: Mutex<UidTable<u64>>,
    results: PollResults,
}

impl MockCore {
    fn scan(&self, devices: Vec<(u64, DeviceDescriptor)>) -> bool {
        let (list, removed) = {
            let mut table = lock(&self.scan);
            let keys: Vec<u64> = devices.iter().map(|(id, _)| *id).collect();
            let assignment = table.assign(&keys);
            let list: DeviceList = devices
                .into_iter()
                .zip(assignment.uids)
                .map(|((_, mut descriptor), uid)| {
                    descriptor.uid = uid;
                    descriptor
                })
                .collect();
            (list, assignment.removed)
        };

        self.ctx.mark_removed(&removed);

        let changed = self.results.publish(list);
        if changed {
            self.ctx.notify_devices_changed();
        }
        changed
    }
}

struct MockDeviceBackend {
    uid: Uid,
    host: MockHost,
}

impl MockDeviceBackend {
    fn rejecting(&self) -> bool {
        lock(&self.host.state).reject_config
    }
}

impl DeviceBackend for MockDeviceBackend {
    fn set_config(&mut self, configuration_value: u8) -> Result<(), UsbError> {
        if self.rejecting() {
            return Err(UsbError::Pipe);
        }
        debug!("Mock device {} set configuration {}", self.uid, configuration_value);
        Ok(())
    }

    fn set_interface_alt_setting(&mut self, interface: u8, alt_setting: u8) -> Result<(), UsbError> {
        if self.rejecting() {
            return Err(UsbError::Pipe);
        }
        debug!(
            "Mock device {} interface {} alternate setting {}",
            self.uid, interface, alt_setting
        );
        Ok(())
    }

    fn submit(&mut self, submission: Submission, completer: RequestCompleter) {
        lock(&self.host.state)
            .submitted
            .entry(self.uid)
            .or_default()
            .push_back(Pending {
                submission,
                completer,
                cancel_requested: false,
            });
    }

    fn cancel(&mut self, handle: RequestHandle) -> bool {
        self.host.cancel(self.uid, handle)
    }

    fn handle_locally(&mut self, setup: &Setup) -> Option<TransferStatus> {
        let standard = (setup.is_standard_device() && setup.request == REQUEST_SET_CONFIGURATION)
            || (setup.is_standard_interface() && setup.request == REQUEST_SET_INTERFACE);
        if !standard {
            return None;
        }
        Some(if self.rejecting() {
            TransferStatus::Stall
        } else {
            TransferStatus::Completed
        })
    }

    fn release(&mut self) {
        self.host.release(self.uid);
    }
}

struct MockController {
    core: Arc<MockCore>,
    host: MockHost,
}

impl Controller for MockController {
    fn open_uid(&self, uid: Uid, client: Arc<dyn DeviceClient>) -> Option<Device> {
        let descriptor = self.core.results.find(uid)?;
        let backend = MockDeviceBackend {
            uid,
            host: self.host.clone(),
        };
        Some(self.core.ctx.open_device(uid, descriptor, Box::new(backend), client))
    }

    fn update_should_scan(&self, active: bool) {
        debug!("Mock scanning {}", if active { "enabled" } else { "suspended" });
        lock(&self.host.state).should_scan = active;
    }

    fn update_device_list(&self, out: &mut DeviceList) {
        self.core.results.copy_into(out);
    }

    fn destroy(self: Box<Self>) {
        let mut state = lock(&self.host.state);
        state.core = None;
        state.should_scan = false;
        state.destroyed += 1;
        info!("Mock controller destroyed");
    }
}

/// Creates controllers driven by a [`MockHost`]
#[derive(Clone, Default)]
pub struct MockControllerFactory {
    host: MockHost,
}

impl MockControllerFactory {
    pub fn new(host: MockHost) -> Self {
        Self { host }
    }

    pub fn host(&self) -> &MockHost {
        &self.host
    }
}

impl ControllerFactory for MockControllerFactory {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn create(&self, ctx: ControllerContext) -> common::Result<Box<dyn Controller>> {
        let (core, devices) = {
            let mut state = lock(&self.host.state);
            if state.fail_init {
                return Err(common::Error::BackendUnavailable(
                    "mock host initialization failed".to_string(),
                ));
            }
            let core = Arc::new(MockCore {
                ctx,
                scan: Mutex::new(UidTable::new()),
                results: PollResults::new(),
            });
            state.core = Some(core.clone());
            state.created += 1;
            (core, state.enumerate())
        };

        // initial enumeration runs regardless of the scan hint
        core.scan(devices);
        info!("Mock controller created");

        Ok(Box::new(MockController {
            core,
            host: self.host.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::UsbConfig;
    use crate::usb::controller::OpenDevices;
    use crate::usb::request::{Completion, UserData};
    use common::create_pump_bridge;
    use common::test_utils::{create_mock_device, create_mock_hid_keyboard};

    struct NullClient;

    impl DeviceClient for NullClient {
        fn request_complete(&self, _completion: Completion) {}
    }

    fn controller(host: &MockHost) -> (Box<dyn Controller>, OpenDevices) {
        let (notifier, _receiver) = create_pump_bridge(16);
        let open_devices = OpenDevices::new();
        let ctx = ControllerContext::new(notifier, open_devices.clone(), UsbConfig::default());
        let controller = MockControllerFactory::new(host.clone()).create(ctx).unwrap();
        (controller, open_devices)
    }

    #[test]
    fn test_initial_enumeration_assigns_uids() {
        let host = MockHost::new();
        host.plug(10, create_mock_hid_keyboard(0));
        host.plug(20, create_mock_device(0, 0x1234, 0x5678));

        let (controller, _) = controller(&host);
        let mut list = DeviceList::new();
        controller.update_device_list(&mut list);

        assert_eq!(list.len(), 2);
        assert_eq!(list[0].uid, Uid(1));
        assert_eq!(list[1].uid, Uid(2));
        controller.destroy();
        assert!(host.is_destroyed());
    }

    #[test]
    fn test_rescan_suspended_until_enabled() {
        let host = MockHost::new();
        let (controller, _) = controller(&host);
        host.plug(1, create_mock_hid_keyboard(0));

        assert!(!host.rescan());
        controller.update_should_scan(true);
        assert!(host.rescan());
        assert!(!host.rescan());
        controller.destroy();
    }

    #[test]
    fn test_complete_truncates_in_data() {
        let host = MockHost::new();
        host.plug(1, create_mock_device(0, 0x1234, 0x5678));
        let (controller, _) = controller(&host);

        let device = controller.open_uid(Uid(1), Arc::new(NullClient)).unwrap();
        device.bulk_request(0x81, vec![0; 4], UserData::default()).unwrap();
        assert_eq!(host.submitted(Uid(1)).len(), 1);

        assert!(host.complete(Uid(1), 0x81, TransferStatus::Completed, vec![1; 16]));
        assert!(!host.complete(Uid(1), 0x81, TransferStatus::Completed, vec![]));
        assert_eq!(device.pending_delivery(), 1);

        device.close();
        controller.destroy();
    }

    #[test]
    fn test_unplug_marks_open_device_removed() {
        let host = MockHost::new();
        host.plug(1, create_mock_device(0, 0x1234, 0x5678));
        let (controller, open_devices) = controller(&host);
        controller.update_should_scan(true);

        let device = controller.open_uid(Uid(1), Arc::new(NullClient)).unwrap();
        assert_eq!(open_devices.len(), 1);

        assert!(host.unplug(1));
        assert!(host.rescan());
        assert!(open_devices.is_empty());
        assert_eq!(host.released(), vec![Uid(1)]);
        assert!(controller.open_uid(Uid(1), Arc::new(NullClient)).is_none());

        device.process_pending();
        controller.destroy();
    }

    #[test]
    fn test_fail_init() {
        let host = MockHost::new();
        host.set_fail_init(true);
        let (notifier, _receiver) = create_pump_bridge(4);
        let ctx = ControllerContext::new(notifier, OpenDevices::new(), UsbConfig::default());
        let result = MockControllerFactory::new(host.clone()).create(ctx);
        assert!(matches!(result, Err(common::Error::BackendUnavailable(_))));
        assert_eq!(host.created_count(), 0);
    }
}
