//! Device state bridge for checkpoint/restore
//!
//! Only device identity is written. In-flight requests are not part of a
//! checkpoint; consumers re-issue transfers after restore.

use super::device::{Device, DeviceClient};
use super::registry::Registry;
use protocol::{
    CURRENT_VERSION, Checkpoint, DeviceStateRecord, ProtocolError, decode_framed, encode_framed,
};
use std::sync::Arc;
use tracing::{debug, info};

/// Serialize the identity of every open device in `devices`
///
/// Devices that are closing or closed are skipped.
pub fn write_device_state(devices: &[&Device]) -> Result<Vec<u8>, ProtocolError> {
    let records: Vec<DeviceStateRecord> = devices
        .iter()
        .filter(|device| device.is_open())
        .map(|device| device.device_state())
        .collect();

    debug!("Writing device state for {} devices", records.len());
    encode_framed(&Checkpoint {
        version: CURRENT_VERSION,
        records,
    })
}

/// One record of a restored checkpoint
#[derive(Debug)]
pub struct RestoredDevice {
    pub record: DeviceStateRecord,
    /// `None` when the device is no longer present or could not be opened
    pub device: Option<Device>,
}

impl RestoredDevice {
    pub fn is_present(&self) -> bool {
        self.device.is_some()
    }
}

impl Registry {
    /// Re-resolve a checkpoint against the current device list
    ///
    /// A record is reopened only if uid, vendor id and product id all match
    /// an entry of the snapshot. Missing devices are reported per record and
    /// never fail the restore; only a corrupted or incompatible stream does.
    pub fn read_device_state(
        &self,
        bytes: &[u8],
        client: Arc<dyn DeviceClient>,
    ) -> Result<Vec<RestoredDevice>, ProtocolError> {
        let checkpoint = decode_framed(bytes)?;
        let snapshot = self.get_device_list();

        let restored = checkpoint
            .records
            .into_iter()
            .map(|record| {
                let device = if snapshot.iter().any(|desc| record.matches(desc)) {
                    self.open_uid(record.uid, client.clone())
                } else {
                    info!(
                        "Device {} ({:04x}:{:04x}) not present after restore",
                        record.uid, record.vendor_id, record.product_id
                    );
                    None
                };
                RestoredDevice { record, device }
            })
            .collect();

        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::UsbConfig;
    use crate::usb::backend::{MockControllerFactory, MockHost};
    use crate::usb::request::Completion;
    use common::test_utils::create_mock_hid_keyboard;
    use protocol::Uid;

    struct NullClient;

    impl DeviceClient for NullClient {
        fn request_complete(&self, _completion: Completion) {}
    }

    #[test]
    fn test_closed_devices_are_not_written() {
        let host = MockHost::new();
        host.plug(1, create_mock_hid_keyboard(0));
        let registry = Registry::new(
            Arc::new(MockControllerFactory::new(host)),
            UsbConfig::default(),
        );
        registry.ref_interface();

        let device = registry.open_uid(Uid(1), Arc::new(NullClient)).unwrap();
        device.close();

        let bytes = write_device_state(&[&device]).unwrap();
        let restored = registry
            .read_device_state(&bytes, Arc::new(NullClient))
            .unwrap();
        assert!(restored.is_empty());
        registry.shutdown();
    }

    #[test]
    fn test_empty_checkpoint() {
        let bytes = write_device_state(&[]).unwrap();
        let checkpoint = decode_framed(&bytes).unwrap();
        assert!(checkpoint.records.is_empty());
    }
}
