//! Host device access through rusb
//!
//! Descriptor conversion into the descriptor model, and an opened device
//! with its claimed interfaces.

use super::transfers::map_rusb_error;
use crate::usb::lock;
use protocol::types::{
    DESCRIPTOR_TYPE_CONFIG, DESCRIPTOR_TYPE_DEVICE, DESCRIPTOR_TYPE_ENDPOINT,
    DESCRIPTOR_TYPE_INTERFACE,
};
use protocol::{
    ConfigDescriptor, DeviceDescriptor, EndpointDescriptor, InterfaceDescriptor, Uid, UsbError,
};
use rusb::{Context, DeviceHandle};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Root hubs are VID 0x1d6b (Linux Foundation) with device class 9 (Hub)
pub(crate) fn is_root_hub(descriptor: &DeviceDescriptor) -> bool {
    descriptor.vendor_id == 0x1d6b && descriptor.class == 0x09
}

fn bcd(version: rusb::Version) -> u16 {
    (u16::from(version.major()) << 8)
        | (u16::from(version.minor() & 0x0f) << 4)
        | u16::from(version.sub_minor() & 0x0f)
}

/// Rebuild bmAttributes from the decoded endpoint fields
fn endpoint_attributes(endpoint: &rusb::EndpointDescriptor) -> u8 {
    let transfer = match endpoint.transfer_type() {
        rusb::TransferType::Control => 0,
        rusb::TransferType::Isochronous => 1,
        rusb::TransferType::Bulk => 2,
        rusb::TransferType::Interrupt => 3,
    };
    let sync = match endpoint.sync_type() {
        rusb::SyncType::NoSync => 0,
        rusb::SyncType::Asynchronous => 1,
        rusb::SyncType::Adaptive => 2,
        rusb::SyncType::Synchronous => 3,
    };
    let usage = match endpoint.usage_type() {
        rusb::UsageType::Data => 0,
        rusb::UsageType::Feedback => 1,
        rusb::UsageType::FeedbackData => 2,
        rusb::UsageType::Reserved => 3,
    };
    transfer | (sync << 2) | (usage << 4)
}

fn convert_endpoint(endpoint: &rusb::EndpointDescriptor) -> EndpointDescriptor {
    EndpointDescriptor {
        length: 7,
        descriptor_type: DESCRIPTOR_TYPE_ENDPOINT,
        address: endpoint.address(),
        attributes: endpoint_attributes(endpoint),
        max_packet_size: endpoint.max_packet_size(),
        interval: endpoint.interval(),
        refresh: endpoint.refresh(),
        synch_address: endpoint.synch_address(),
    }
}

fn convert_config(config: &rusb::ConfigDescriptor) -> ConfigDescriptor {
    let interfaces: Vec<InterfaceDescriptor> = config
        .interfaces()
        .flat_map(|interface| interface.descriptors())
        .map(|setting| {
            let endpoints: Vec<EndpointDescriptor> =
                setting.endpoint_descriptors().map(|e| convert_endpoint(&e)).collect();
            InterfaceDescriptor {
                length: 9,
                descriptor_type: DESCRIPTOR_TYPE_INTERFACE,
                interface_number: setting.interface_number(),
                alternate_setting: setting.setting_number(),
                num_endpoints: setting.num_endpoints(),
                class: setting.class_code(),
                subclass: setting.sub_class_code(),
                protocol: setting.protocol_code(),
                interface_index: setting.description_string_index().unwrap_or(0),
                endpoints,
            }
        })
        .collect();

    let extra = config.extra().to_vec();
    let total_length = 9
        + extra.len()
        + interfaces
            .iter()
            .map(|i| 9 + 7 * i.endpoints.len())
            .sum::<usize>();

    let attributes = 0x80
        | (u8::from(config.self_powered()) << 6)
        | (u8::from(config.remote_wakeup()) << 5);

    ConfigDescriptor {
        length: 9,
        descriptor_type: DESCRIPTOR_TYPE_CONFIG,
        total_length: total_length.min(usize::from(u16::MAX)) as u16,
        num_interfaces: config.num_interfaces(),
        configuration_value: config.number(),
        configuration_index: config.description_string_index().unwrap_or(0),
        attributes,
        max_power: (config.max_power() / 2).min(u16::from(u8::MAX)) as u8,
        extra,
        interfaces,
    }
}

/// Read the device descriptor and every configuration without opening the device
pub(crate) fn read_descriptor_tree(
    device: &rusb::Device<Context>,
    uid: Uid,
) -> rusb::Result<DeviceDescriptor> {
    let desc = device.device_descriptor()?;

    let mut configs = Vec::with_capacity(usize::from(desc.num_configurations()));
    for index in 0..desc.num_configurations() {
        configs.push(convert_config(&device.config_descriptor(index)?));
    }

    Ok(DeviceDescriptor {
        length: 18,
        descriptor_type: DESCRIPTOR_TYPE_DEVICE,
        usb_version: bcd(desc.usb_version()),
        class: desc.class_code(),
        subclass: desc.sub_class_code(),
        protocol: desc.protocol_code(),
        max_packet_size0: desc.max_packet_size(),
        vendor_id: desc.vendor_id(),
        product_id: desc.product_id(),
        device_version: bcd(desc.device_version()),
        manufacturer_index: desc.manufacturer_string_index().unwrap_or(0),
        product_index: desc.product_string_index().unwrap_or(0),
        serial_number_index: desc.serial_number_string_index().unwrap_or(0),
        num_configurations: desc.num_configurations(),
        uid,
        configs,
    })
}

/// Opened host device with the interfaces of its active configuration claimed
pub(crate) struct HostDevice {
    uid: Uid,
    handle: Mutex<DeviceHandle<Context>>,
    /// Interfaces claimed by us
    claimed: Mutex<Vec<u8>>,
}

impl HostDevice {
    /// Open the device, detach kernel drivers and claim its interfaces
    pub fn open(uid: Uid, device: &rusb::Device<Context>) -> Result<Self, UsbError> {
        let mut handle = device.open().map_err(|e| {
            warn!("Failed to open device {}: {}", uid, e);
            map_rusb_error(e)
        })?;
        debug!("Opened host device {}", uid);

        let claimed = claim_active_interfaces(&mut handle, uid)?;

        Ok(Self {
            uid,
            handle: Mutex::new(handle),
            claimed: Mutex::new(claimed),
        })
    }

    pub fn uid(&self) -> Uid {
        self.uid
    }

    /// Run `f` with the device handle locked
    pub fn with_handle<R>(&self, f: impl FnOnce(&DeviceHandle<Context>) -> R) -> R {
        f(&lock(&self.handle))
    }

    /// Switch configuration and re-claim the new configuration's interfaces
    pub fn set_configuration(&self, value: u8) -> Result<(), UsbError> {
        let mut handle = lock(&self.handle);
        let mut claimed = lock(&self.claimed);

        for interface in claimed.drain(..) {
            if let Err(e) = handle.release_interface(interface) {
                debug!("Failed to release interface {} on {}: {}", interface, self.uid, e);
            }
        }

        handle
            .set_active_configuration(value)
            .map_err(map_rusb_error)?;
        debug!("Device {} switched to configuration {}", self.uid, value);

        *claimed = claim_active_interfaces(&mut handle, self.uid)?;
        Ok(())
    }

    pub fn set_alternate_setting(&self, interface: u8, setting: u8) -> Result<(), UsbError> {
        lock(&self.handle)
            .set_alternate_setting(interface, setting)
            .map_err(map_rusb_error)
    }

    /// Release claimed interfaces and hand them back to the kernel
    pub fn close(&self) {
        let mut handle = lock(&self.handle);
        let mut claimed = lock(&self.claimed);

        for interface in claimed.drain(..) {
            if let Err(e) = handle.release_interface(interface) {
                warn!("Failed to release interface {}: {}", interface, e);
            }

            if let Err(e) = handle.attach_kernel_driver(interface) {
                debug!(
                    "Could not reattach kernel driver to interface {} (may not have been detached): {}",
                    interface, e
                );
            } else {
                debug!(
                    "Reattached kernel driver to interface {} on device {}",
                    interface, self.uid
                );
            }
        }
        debug!("Closed host device {}", self.uid);
    }
}

fn claim_active_interfaces(
    handle: &mut DeviceHandle<Context>,
    uid: Uid,
) -> Result<Vec<u8>, UsbError> {
    let config = handle.device().active_config_descriptor().map_err(|e| {
        warn!("Failed to get active config descriptor of {}: {}", uid, e);
        map_rusb_error(e)
    })?;

    let mut claimed = Vec::new();
    for interface in config.interfaces() {
        let number = interface.number();

        match handle.kernel_driver_active(number) {
            Ok(true) => {
                debug!(
                    "Detaching kernel driver from interface {} on device {}",
                    number, uid
                );
                if let Err(e) = handle.detach_kernel_driver(number) {
                    warn!(
                        "Failed to detach kernel driver from interface {}: {}",
                        number, e
                    );
                }
            }
            Ok(false) => {}
            Err(e) => {
                debug!(
                    "Could not check kernel driver status for interface {}: {}",
                    number, e
                );
            }
        }

        if let Err(e) = handle.claim_interface(number) {
            warn!("Failed to claim interface {} on {}: {}", number, uid, e);
            for previous in claimed {
                let _ = handle.release_interface(previous);
            }
            return Err(map_rusb_error(e));
        }

        debug!("Claimed interface {} on device {}", number, uid);
        claimed.push(number);
    }

    Ok(claimed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{create_mock_hid_keyboard, create_mock_hub_device};

    #[test]
    fn test_root_hub_detection() {
        let mut hub = create_mock_hub_device(1);
        assert!(!is_root_hub(&hub));
        hub.vendor_id = 0x1d6b;
        assert!(is_root_hub(&hub));
        assert!(!is_root_hub(&create_mock_hid_keyboard(2)));
    }
}
