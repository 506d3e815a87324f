//! State Bridge Integration Tests
//!
//! Checkpoints the identity of open devices, restarts the backend and
//! re-resolves the checkpoint against the new device list.
//!
//! Run with: `cargo test -p host --test state_tests`

use common::test_utils::{create_mock_device, create_mock_hid_keyboard};
use host::UsbConfig;
use host::usb::backend::{MockControllerFactory, MockHost};
use host::usb::{Completion, DeviceClient, Lifecycle, Registry, UserData, write_device_state};
use protocol::{TransferStatus, Uid};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct CompletionLog {
    completions: Mutex<Vec<Completion>>,
}

impl DeviceClient for CompletionLog {
    fn request_complete(&self, completion: Completion) {
        self.completions.lock().unwrap().push(completion);
    }
}

fn setup() -> (MockHost, Registry) {
    let host = MockHost::new();
    host.plug(10, create_mock_hid_keyboard(0));
    host.plug(20, create_mock_device(0, 0x1234, 0x5678));
    let registry = Registry::new(
        Arc::new(MockControllerFactory::new(host.clone())),
        UsbConfig::default(),
    );
    assert!(registry.ref_interface());
    (host, registry)
}

/// Open both devices, checkpoint them and bring the backend down
fn checkpoint(registry: &Registry) -> Vec<u8> {
    let client: Arc<dyn DeviceClient> = Arc::new(CompletionLog::default());
    let keyboard = registry.open_uid(Uid(1), client.clone()).unwrap();
    let vendor = registry.open_uid(Uid(2), client).unwrap();

    let bytes = write_device_state(&[&keyboard, &vendor]).unwrap();
    registry.shutdown();
    assert_eq!(keyboard.lifecycle(), Lifecycle::Closed);
    bytes
}

#[test]
fn test_restore_reopens_present_devices() {
    let (_host, registry) = setup();
    let bytes = checkpoint(&registry);

    assert!(registry.ref_interface());
    let client = Arc::new(CompletionLog::default());
    let restored = registry.read_device_state(&bytes, client.clone()).unwrap();

    assert_eq!(restored.len(), 2);
    assert!(restored.iter().all(|r| r.is_present()));
    assert_eq!(restored[0].record.uid, Uid(1));
    assert_eq!(restored[1].record.vendor_id, 0x1234);
    assert_eq!(registry.open_device_count(), 2);

    // restored devices are fully usable
    let vendor = restored[1].device.as_ref().unwrap();
    vendor.bulk_request(0x02, vec![1, 2, 3], UserData::default()).unwrap();
    registry.shutdown();
    let completions = client.completions.lock().unwrap();
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].status, TransferStatus::Cancelled);
}

#[test]
fn test_vanished_device_reported_absent() {
    let (host, registry) = setup();
    let bytes = checkpoint(&registry);

    host.unplug(20);
    assert!(registry.ref_interface());
    let restored = registry
        .read_device_state(&bytes, Arc::new(CompletionLog::default()))
        .unwrap();

    assert_eq!(restored.len(), 2);
    assert!(restored[0].is_present());
    assert!(!restored[1].is_present());
    assert_eq!(restored[1].record.uid, Uid(2));
    assert_eq!(registry.open_device_count(), 1);
    registry.shutdown();
}

#[test]
fn test_identity_must_match_uid_and_ids() {
    let (host, registry) = setup();
    let bytes = checkpoint(&registry);

    // the keyboard is replaced and now enumerates last, shifting every Uid
    host.plug(10, create_mock_device(0, 0xabcd, 0xef01));
    assert!(registry.ref_interface());
    let list = registry.get_device_list();
    assert_eq!((list[0].uid, list[0].vendor_id), (Uid(1), 0x1234));

    let restored = registry
        .read_device_state(&bytes, Arc::new(CompletionLog::default()))
        .unwrap();
    assert!(restored.iter().all(|r| !r.is_present()));
    assert_eq!(registry.open_device_count(), 0);
    registry.shutdown();
}

#[test]
fn test_restore_without_backend_finds_nothing() {
    let (_host, registry) = setup();
    let bytes = checkpoint(&registry);

    let restored = registry
        .read_device_state(&bytes, Arc::new(CompletionLog::default()))
        .unwrap();
    assert_eq!(restored.len(), 2);
    assert!(restored.iter().all(|r| !r.is_present()));
}

#[test]
fn test_corrupted_checkpoint_rejected() {
    let (_host, registry) = setup();
    let mut bytes = checkpoint(&registry);
    assert!(registry.ref_interface());

    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    assert!(
        registry
            .read_device_state(&bytes, Arc::new(CompletionLog::default()))
            .is_err()
    );
    assert!(
        registry
            .read_device_state(&bytes[..3], Arc::new(CompletionLog::default()))
            .is_err()
    );
    assert_eq!(registry.open_device_count(), 0);
    registry.shutdown();
}
