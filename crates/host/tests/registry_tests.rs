//! Registry Integration Tests
//!
//! Drives the whole subsystem through the mock backend: enumeration, Uid
//! assignment, change notification, request delivery and teardown.
//!
//! # Test Scenarios
//! - Open by vendor/product id, issue and cancel a transfer
//! - Uid stability across rescans and enumeration order
//! - Backend reference counting and failed initialization
//! - Close draining, removal mid-use, cancel/complete races
//! - Locally handled SET_CONFIGURATION
//!
//! Run with: `cargo test -p host --test registry_tests`

use common::test_utils::{create_mock_device, create_mock_hid_keyboard, get_device_descriptor_setup};
use host::UsbConfig;
use host::usb::backend::{CancelMode, MockControllerFactory, MockHost};
use host::usb::{
    Completion, DeviceChangeClient, DeviceClient, DeviceError, DeviceListChange, EndpointSelector,
    Lifecycle, Registry, UserData,
};
use proptest::prelude::*;
use protocol::{Setup, TransferKind, TransferStatus, Uid};
use std::sync::{Arc, Mutex};
use std::thread;

// ============================================================================
// Helpers
// ============================================================================

#[derive(Default)]
struct CompletionLog {
    completions: Mutex<Vec<Completion>>,
}

impl CompletionLog {
    fn take(&self) -> Vec<Completion> {
        std::mem::take(&mut *self.completions.lock().unwrap())
    }
}

impl DeviceClient for CompletionLog {
    fn request_complete(&self, completion: Completion) {
        self.completions.lock().unwrap().push(completion);
    }
}

#[derive(Default)]
struct ChangeLog {
    changes: Mutex<Vec<DeviceListChange>>,
}

impl ChangeLog {
    fn take(&self) -> Vec<DeviceListChange> {
        std::mem::take(&mut *self.changes.lock().unwrap())
    }
}

impl DeviceChangeClient for ChangeLog {
    fn devices_changed(&self, change: &DeviceListChange) {
        self.changes.lock().unwrap().push(change.clone());
    }
}

fn registry(host: &MockHost) -> Registry {
    Registry::new(
        Arc::new(MockControllerFactory::new(host.clone())),
        UsbConfig::default(),
    )
}

/// Keyboard at host id 10 and a vendor device at host id 20
fn two_device_host() -> MockHost {
    let host = MockHost::new();
    host.plug(10, create_mock_hid_keyboard(0));
    host.plug(20, create_mock_device(0, 0x1234, 0x5678));
    host
}

// ============================================================================
// Enumeration and Identity
// ============================================================================

#[test]
fn test_open_cancel_scenario() {
    let host = two_device_host();
    let registry = registry(&host);
    assert!(registry.ref_interface());

    let list = registry.get_device_list();
    assert_eq!(list.len(), 2);
    assert_eq!((list[0].uid, list[0].vendor_id, list[0].product_id), (Uid(1), 0x046d, 0xc312));
    assert_eq!((list[1].uid, list[1].vendor_id, list[1].product_id), (Uid(2), 0x1234, 0x5678));

    let client = Arc::new(CompletionLog::default());
    let (uid, device) = registry.open_vid_pid(0x046d, 0xc312, client.clone());
    assert_eq!(uid, Some(Uid(1)));
    let device = device.expect("device should open");
    assert_eq!(device.uid(), Uid(1));
    assert_eq!(device.lifecycle(), Lifecycle::Open);

    let handle = device
        .bulk_request(0x81, vec![0; 64], UserData::from_u64(7))
        .unwrap();
    assert_eq!(host.submitted(Uid(1)).len(), 1);
    assert_eq!(device.cancel_requests(EndpointSelector::Address(0x81)), 1);

    registry.pump();
    let completions = client.take();
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].handle, handle);
    assert_eq!(completions[0].status, TransferStatus::Cancelled);
    assert_eq!(completions[0].user_data.as_u64(), 7);
    assert_eq!(device.outstanding(), 0);

    device.close();
    registry.reset_interface();
    assert!(host.is_destroyed());
}

#[test]
fn test_uids_stable_across_rescans() {
    let host = two_device_host();
    let registry = registry(&host);
    let changes = Arc::new(ChangeLog::default());
    registry.register_device_change_client(changes.clone());
    registry.ref_interface();

    host.plug(30, create_mock_device(0, 0xabcd, 0x0001));
    assert!(host.rescan());
    registry.pump();

    let list = registry.get_device_list();
    let uids: Vec<Uid> = list.iter().map(|d| d.uid).collect();
    assert_eq!(uids, vec![Uid(1), Uid(2), Uid(3)]);

    let received = changes.take();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].added.len(), 1);
    assert_eq!(received[0].added[0].uid, Uid(3));
    assert!(received[0].removed.is_empty());

    // a departed device never hands its Uid to a newcomer
    host.unplug(20);
    host.plug(40, create_mock_device(0, 0x1234, 0x5678));
    assert!(host.rescan());
    registry.pump();

    let received = changes.take();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].removed[0].uid, Uid(2));
    assert_eq!(received[0].added[0].uid, Uid(4));
    assert_eq!(registry.find_vid_pid(0x1234, 0x5678), Some(Uid(4)));

    registry.reset_interface();
}

#[test]
fn test_reordered_enumeration_is_not_a_change() {
    let host = two_device_host();
    let registry = registry(&host);
    let changes = Arc::new(ChangeLog::default());
    registry.register_device_change_client(changes.clone());
    registry.ref_interface();

    host.set_reverse_enumeration(true);
    assert!(!host.rescan());
    let stats = registry.pump();
    assert!(!stats.list_changed);
    assert!(changes.take().is_empty());

    registry.reset_interface();
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_plug_order_does_not_matter(ids in proptest::collection::hash_set(1u64..1000, 1..8)) {
        let ids: Vec<u64> = ids.into_iter().collect();
        let host = MockHost::new();
        for (n, id) in ids.iter().enumerate() {
            host.plug(*id, create_mock_device(0, 0x1000, n as u16));
        }

        let registry = registry(&host);
        let changes = Arc::new(ChangeLog::default());
        registry.register_device_change_client(changes.clone());
        registry.ref_interface();
        let before = registry.get_device_list();

        host.set_reverse_enumeration(true);
        prop_assert!(!host.rescan());
        registry.pump();
        prop_assert!(changes.take().is_empty());

        let mut after = registry.get_device_list();
        let mut expected = before.clone();
        after.sort_by_key(|d| d.uid);
        expected.sort_by_key(|d| d.uid);
        prop_assert_eq!(after, expected);

        registry.reset_interface();
    }
}

// ============================================================================
// Backend Activation
// ============================================================================

#[test]
fn test_backend_reference_counting() {
    let host = two_device_host();
    let registry = registry(&host);

    assert!(registry.ref_interface());
    assert!(registry.ref_interface());
    assert_eq!(host.created_count(), 1);

    registry.reset_interface();
    assert!(registry.is_scanning_enabled());
    assert_eq!(host.destroyed_count(), 0);

    registry.reset_interface();
    assert!(!registry.is_scanning_enabled());
    assert_eq!(host.destroyed_count(), 1);

    // unmatched reset is reported and ignored
    registry.reset_interface();
    assert_eq!(host.destroyed_count(), 1);

    assert!(registry.ref_interface());
    assert_eq!(host.created_count(), 2);
    registry.shutdown();
    assert!(host.is_destroyed());
}

#[test]
fn test_failed_backend_leaves_scanning_disabled() {
    let host = two_device_host();
    host.set_fail_init(true);
    let registry = registry(&host);

    assert!(!registry.ref_interface());
    assert!(!registry.is_scanning_enabled());
    assert!(registry.get_device_list().is_empty());
    assert!(registry.open_uid(Uid(1), Arc::new(CompletionLog::default())).is_none());
    assert_eq!(
        registry.open_vid_pid(0x046d, 0xc312, Arc::new(CompletionLog::default())).0,
        None
    );

    registry.reset_interface();
    host.set_fail_init(false);
    assert!(registry.ref_interface());
    assert_eq!(registry.get_device_list().len(), 2);
    registry.reset_interface();
}

#[test]
fn test_scanning_follows_subscribers() {
    let host = two_device_host();
    let registry = registry(&host);
    registry.ref_interface();
    assert!(!host.should_scan());

    let first = registry.register_device_change_client(Arc::new(ChangeLog::default()));
    let second = registry.register_device_change_client(Arc::new(ChangeLog::default()));
    assert!(host.should_scan());

    assert!(registry.deregister_device_change_client(first));
    assert!(host.should_scan());
    assert!(registry.deregister_device_change_client(second));
    assert!(!host.should_scan());
    assert!(!registry.deregister_device_change_client(second));

    registry.reset_interface();
}

#[test]
fn test_concurrent_subscriber_churn_settles_scanning() {
    let host = two_device_host();
    let registry = registry(&host);
    registry.ref_interface();

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let registry = registry.clone();
            thread::spawn(move || {
                for _ in 0..200 {
                    let id = registry.register_device_change_client(Arc::new(ChangeLog::default()));
                    assert!(registry.deregister_device_change_client(id));
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    // the last hint applied must reflect the final, empty subscriber set
    assert!(!host.should_scan());

    let id = registry.register_device_change_client(Arc::new(ChangeLog::default()));
    assert!(host.should_scan());
    registry.deregister_device_change_client(id);
    registry.reset_interface();
}

// ============================================================================
// Request Delivery
// ============================================================================

#[test]
fn test_completions_delivered_in_order_by_pump() {
    let host = two_device_host();
    let registry = registry(&host);
    registry.ref_interface();

    let client = Arc::new(CompletionLog::default());
    let device = registry.open_uid(Uid(2), client.clone()).unwrap();

    let read = device.bulk_request(0x81, vec![0; 8], UserData::from_u64(1)).unwrap();
    let write = device.bulk_request(0x02, vec![9; 5], UserData::from_u64(2)).unwrap();
    assert_eq!(device.outstanding(), 2);

    assert!(host.complete(Uid(2), 0x81, TransferStatus::Completed, vec![1, 2, 3]));
    assert!(host.complete(Uid(2), 0x02, TransferStatus::Completed, Vec::new()));
    assert!(client.take().is_empty(), "nothing is delivered outside the pump");

    let stats = registry.pump();
    assert_eq!(stats.delivered, 2);

    let completions = client.take();
    assert_eq!(completions[0].handle, read);
    assert_eq!(completions[0].data, vec![1, 2, 3]);
    assert_eq!(completions[0].actual_length, 3);
    assert_eq!(completions[1].handle, write);
    assert_eq!(completions[1].actual_length, 5);
    assert!(completions[1].data.is_empty());
    assert_eq!(device.outstanding(), 0);

    registry.shutdown();
    assert_eq!(device.lifecycle(), Lifecycle::Closed);
}

#[test]
fn test_control_request_reaches_backend() {
    let host = two_device_host();
    let registry = registry(&host);
    registry.ref_interface();

    let client = Arc::new(CompletionLog::default());
    let device = registry.open_uid(Uid(1), client.clone()).unwrap();
    let setup = get_device_descriptor_setup();
    device
        .control_request(setup, Vec::new(), UserData::default())
        .unwrap();

    let submitted = host.submitted(Uid(1));
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0].kind, TransferKind::Control);
    assert_eq!(submitted[0].setup, Some(setup));

    host.complete(Uid(1), 0, TransferStatus::Completed, vec![0x12; 32]);
    registry.pump();
    let completions = client.take();
    assert_eq!(completions[0].actual_length, 18);
    assert!(!completions[0].synthetic);

    registry.shutdown();
}

#[test]
fn test_isochronous_packets_reach_backend() {
    let host = two_device_host();
    let registry = registry(&host);
    registry.ref_interface();

    let client = Arc::new(CompletionLog::default());
    let device = registry.open_uid(Uid(2), client.clone()).unwrap();
    device
        .isochronous_request(0x83, vec![0; 96], vec![32, 32, 32], UserData::default())
        .unwrap();
    assert!(matches!(
        device.isochronous_request(0x83, vec![0; 16], vec![32], UserData::default()),
        Err(DeviceError::InvalidPackets(_))
    ));

    let submitted = host.submitted(Uid(2));
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0].kind, TransferKind::Isochronous);
    assert_eq!(submitted[0].packet_lengths, vec![32, 32, 32]);

    host.complete(Uid(2), 0x83, TransferStatus::Completed, vec![7; 96]);
    registry.pump();
    let completions = client.take();
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].actual_length, 96);

    registry.shutdown();
}

#[test]
fn test_set_configuration_completes_locally() {
    let host = two_device_host();
    let registry = registry(&host);
    registry.ref_interface();

    let client = Arc::new(CompletionLog::default());
    let device = registry.open_uid(Uid(2), client.clone()).unwrap();
    assert_eq!(device.active_config(), 0);

    let set_config = Setup {
        request_type: 0x00,
        request: 0x09,
        value: 1,
        index: 0,
        length: 0,
    };
    device
        .control_request(set_config, Vec::new(), UserData::from_u64(3))
        .unwrap();
    assert!(host.submitted(Uid(2)).is_empty());

    registry.pump();
    let completions = client.take();
    assert_eq!(completions.len(), 1);
    assert!(completions[0].synthetic);
    assert_eq!(completions[0].status, TransferStatus::Completed);
    assert_eq!(device.active_config(), 0);

    host.set_reject_config(true);
    device
        .control_request(set_config, Vec::new(), UserData::from_u64(4))
        .unwrap();
    registry.pump();
    assert_eq!(client.take()[0].status, TransferStatus::Stall);

    assert!(matches!(device.set_config(0), Err(DeviceError::Rejected(_))));
    host.set_reject_config(false);
    assert!(device.set_config(0).is_ok());
    assert!(matches!(device.set_config(5), Err(DeviceError::NotFound)));

    registry.shutdown();
}

#[test]
fn test_deferred_cancel_completes_later() {
    let host = two_device_host();
    host.set_cancel_mode(CancelMode::Deferred);
    let registry = registry(&host);
    registry.ref_interface();

    let client = Arc::new(CompletionLog::default());
    let device = registry.open_uid(Uid(2), client.clone()).unwrap();
    device.bulk_request(0x81, vec![0; 8], UserData::default()).unwrap();
    device.bulk_request(0x02, vec![0; 8], UserData::default()).unwrap();

    assert_eq!(device.cancel_requests(EndpointSelector::All), 2);
    registry.pump();
    assert!(client.take().is_empty());
    assert_eq!(device.outstanding(), 2);

    // a second cancel does not touch requests already being cancelled
    assert_eq!(device.cancel_requests(EndpointSelector::All), 0);

    assert_eq!(host.finish_cancelled(), 2);
    registry.pump();
    let completions = client.take();
    assert_eq!(completions.len(), 2);
    assert!(completions.iter().all(|c| c.status == TransferStatus::Cancelled));

    host.set_cancel_mode(CancelMode::Immediate);
    registry.shutdown();
}

#[test]
fn test_cancel_racing_completion_delivers_once() {
    let host = two_device_host();
    let registry = registry(&host);
    registry.ref_interface();

    let client = Arc::new(CompletionLog::default());
    let device = registry.open_uid(Uid(2), client.clone()).unwrap();

    for round in 0..50u64 {
        let handle = device
            .bulk_request(0x81, vec![0; 4], UserData::from_u64(round))
            .unwrap();

        let backend = host.clone();
        let completer = thread::spawn(move || {
            backend.complete(Uid(2), 0x81, TransferStatus::Completed, vec![1, 2, 3, 4])
        });
        device.cancel_requests(EndpointSelector::Address(0x81));
        completer.join().unwrap();

        registry.pump();
        let completions = client.take();
        assert_eq!(completions.len(), 1, "round {}", round);
        assert_eq!(completions[0].handle, handle);
        assert!(matches!(
            completions[0].status,
            TransferStatus::Completed | TransferStatus::Cancelled
        ));
        assert_eq!(device.outstanding(), 0);
    }

    registry.shutdown();
}

// ============================================================================
// Teardown
// ============================================================================

#[test]
fn test_close_cancels_and_delivers_everything() {
    let host = two_device_host();
    let registry = registry(&host);
    registry.ref_interface();

    let client = Arc::new(CompletionLog::default());
    let device = registry.open_uid(Uid(2), client.clone()).unwrap();
    for n in 0..3 {
        device.bulk_request(0x81, vec![0; 8], UserData::from_u64(n)).unwrap();
    }
    assert_eq!(registry.open_device_count(), 1);

    device.close();
    assert_eq!(device.lifecycle(), Lifecycle::Closed);
    assert_eq!(device.outstanding(), 0);
    assert_eq!(registry.open_device_count(), 0);
    assert_eq!(host.released(), vec![Uid(2)]);

    let completions = client.take();
    assert_eq!(completions.len(), 3);
    assert!(completions.iter().all(|c| c.status == TransferStatus::Cancelled));

    assert!(matches!(
        device.bulk_request(0x81, vec![0; 8], UserData::default()),
        Err(DeviceError::Closed(Uid(2)))
    ));
    device.close();

    registry.reset_interface();
}

#[test]
fn test_removal_mid_use() {
    let host = two_device_host();
    let registry = registry(&host);
    let changes = Arc::new(ChangeLog::default());
    registry.register_device_change_client(changes.clone());
    registry.ref_interface();

    let client = Arc::new(CompletionLog::default());
    let device = registry.open_uid(Uid(2), client.clone()).unwrap();
    device.interrupt_request(0x81, vec![0; 8], UserData::default()).unwrap();

    host.unplug(20);
    assert!(host.rescan());
    assert_eq!(device.lifecycle(), Lifecycle::Closing);
    assert_eq!(registry.open_device_count(), 0);

    let stats = registry.pump();
    assert!(stats.list_changed);
    assert_eq!(stats.delivered, 1);

    let completions = client.take();
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].status, TransferStatus::Removed);
    assert_eq!(device.lifecycle(), Lifecycle::Closed);

    let received = changes.take();
    assert_eq!(received[0].removed.len(), 1);
    assert_eq!(received[0].removed[0].uid, Uid(2));
    assert!(registry.open_uid(Uid(2), client).is_none());

    registry.reset_interface();
}

#[test]
fn test_last_reset_removes_open_devices() {
    let host = two_device_host();
    let registry = registry(&host);
    registry.ref_interface();

    let client = Arc::new(CompletionLog::default());
    let device = registry.open_uid(Uid(1), client.clone()).unwrap();
    device.interrupt_request(0x81, vec![0; 8], UserData::default()).unwrap();

    registry.reset_interface();
    assert!(host.is_destroyed());
    assert_eq!(registry.open_device_count(), 0);

    registry.pump();
    let completions = client.take();
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].status, TransferStatus::Removed);
    assert_eq!(device.lifecycle(), Lifecycle::Closed);
}
