//! USB descriptor model and transfer type definitions
//!
//! This module defines the passive descriptor hierarchy published by host
//! controllers (device -> configurations -> interfaces -> endpoints), the
//! setup packet used by control transfers, and the status values delivered
//! with every request completion.

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Standard descriptor type codes (USB 2.0, table 9-5)
pub const DESCRIPTOR_TYPE_DEVICE: u8 = 0x01;
pub const DESCRIPTOR_TYPE_CONFIG: u8 = 0x02;
pub const DESCRIPTOR_TYPE_INTERFACE: u8 = 0x04;
pub const DESCRIPTOR_TYPE_ENDPOINT: u8 = 0x05;

/// Standard requests that change device configuration state
pub const REQUEST_SET_CONFIGURATION: u8 = 0x09;
pub const REQUEST_SET_INTERFACE: u8 = 0x0b;

/// Registry-assigned device identifier
///
/// Stable across rescans for as long as the backend recognizes the same host
/// device. Not stable across a full backend teardown and restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Uid(pub u32);

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// USB transfer types (bmAttributes bits 1..0 of an endpoint)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferKind {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

impl TransferKind {
    /// Decode from endpoint bmAttributes
    pub fn from_attributes(attributes: u8) -> Self {
        match attributes & 0x03 {
            0 => TransferKind::Control,
            1 => TransferKind::Isochronous,
            2 => TransferKind::Bulk,
            _ => TransferKind::Interrupt,
        }
    }
}

/// Endpoint descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    /// Endpoint address (bit 7 = IN)
    pub address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
    /// Audio-class extension fields, zero for everything else
    pub refresh: u8,
    pub synch_address: u8,
}

impl EndpointDescriptor {
    pub fn direction_in(&self) -> bool {
        self.address & 0x80 != 0
    }

    pub fn number(&self) -> u8 {
        self.address & 0x0f
    }

    pub fn transfer_kind(&self) -> TransferKind {
        TransferKind::from_attributes(self.attributes)
    }
}

/// Interface descriptor (one entry per alternate setting)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub num_endpoints: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    /// String descriptor index (iInterface)
    pub interface_index: u8,
    pub endpoints: Vec<EndpointDescriptor>,
}

/// Configuration descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    pub total_length: u16,
    pub num_interfaces: u8,
    pub configuration_value: u8,
    /// String descriptor index (iConfiguration)
    pub configuration_index: u8,
    pub attributes: u8,
    /// Maximum power in 2mA units
    pub max_power: u8,
    /// Class-specific bytes that follow the standard configuration descriptor
    #[serde(with = "serde_bytes")]
    pub extra: Vec<u8>,
    pub interfaces: Vec<InterfaceDescriptor>,
}

/// Device descriptor together with its full configuration tree
///
/// `PartialEq` compares every field including `uid`; this is the comparison
/// used when publishing snapshots, so a Uid change is a visible change. Use
/// [`DeviceDescriptor::same_hardware`] to compare hardware identity only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    /// bcdUSB
    pub usb_version: u16,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub max_packet_size0: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    /// bcdDevice
    pub device_version: u16,
    pub manufacturer_index: u8,
    pub product_index: u8,
    pub serial_number_index: u8,
    pub num_configurations: u8,
    /// Assigned by the controller, not part of raw hardware identity
    pub uid: Uid,
    pub configs: Vec<ConfigDescriptor>,
}

impl DeviceDescriptor {
    /// Structural equality ignoring the assigned `uid`
    pub fn same_hardware(&self, other: &DeviceDescriptor) -> bool {
        self.length == other.length
            && self.descriptor_type == other.descriptor_type
            && self.usb_version == other.usb_version
            && self.class == other.class
            && self.subclass == other.subclass
            && self.protocol == other.protocol
            && self.max_packet_size0 == other.max_packet_size0
            && self.vendor_id == other.vendor_id
            && self.product_id == other.product_id
            && self.device_version == other.device_version
            && self.manufacturer_index == other.manufacturer_index
            && self.product_index == other.product_index
            && self.serial_number_index == other.serial_number_index
            && self.num_configurations == other.num_configurations
            && self.configs == other.configs
    }

    /// Find the first interface matching class/subclass/protocol
    ///
    /// Returns `(config index, interface)` in descriptor order.
    pub fn find_interface(
        &self,
        class: u8,
        subclass: u8,
        protocol: u8,
    ) -> Option<(usize, &InterfaceDescriptor)> {
        self.configs.iter().enumerate().find_map(|(index, config)| {
            config
                .interfaces
                .iter()
                .find(|i| i.class == class && i.subclass == subclass && i.protocol == protocol)
                .map(|i| (index, i))
        })
    }

    /// Build the model from raw little-endian USB descriptor bytes
    ///
    /// `device` is the 18-byte device descriptor, `configs` the complete
    /// configuration descriptor blocks (wTotalLength bytes each) as returned
    /// by GET_DESCRIPTOR. Class-specific descriptors between the configuration
    /// and its first interface are kept in `extra`; those inside an interface
    /// are skipped.
    pub fn parse(device: &[u8], configs: &[&[u8]], uid: Uid) -> Result<Self> {
        need(device, 18)?;
        if device[1] != DESCRIPTOR_TYPE_DEVICE {
            return Err(ProtocolError::UnexpectedDescriptor {
                expected: DESCRIPTOR_TYPE_DEVICE,
                actual: device[1],
            });
        }

        let configs = configs
            .iter()
            .map(|raw| parse_config(raw))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            length: device[0],
            descriptor_type: device[1],
            usb_version: le16(device, 2),
            class: device[4],
            subclass: device[5],
            protocol: device[6],
            max_packet_size0: device[7],
            vendor_id: le16(device, 8),
            product_id: le16(device, 10),
            device_version: le16(device, 12),
            manufacturer_index: device[14],
            product_index: device[15],
            serial_number_index: device[16],
            num_configurations: device[17],
            uid,
            configs,
        })
    }
}

fn need(bytes: &[u8], len: usize) -> Result<()> {
    if bytes.len() < len {
        return Err(ProtocolError::BufferTooSmall {
            needed: len,
            available: bytes.len(),
        });
    }
    Ok(())
}

fn le16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn parse_config(raw: &[u8]) -> Result<ConfigDescriptor> {
    need(raw, 9)?;
    if raw[1] != DESCRIPTOR_TYPE_CONFIG {
        return Err(ProtocolError::UnexpectedDescriptor {
            expected: DESCRIPTOR_TYPE_CONFIG,
            actual: raw[1],
        });
    }

    let mut config = ConfigDescriptor {
        length: raw[0],
        descriptor_type: raw[1],
        total_length: le16(raw, 2),
        num_interfaces: raw[4],
        configuration_value: raw[5],
        configuration_index: raw[6],
        attributes: raw[7],
        max_power: raw[8],
        extra: Vec::new(),
        interfaces: Vec::new(),
    };

    let end = (config.total_length as usize).min(raw.len());
    let mut offset = (raw[0] as usize).max(9);
    while offset + 2 <= end {
        let len = raw[offset] as usize;
        if len < 2 || offset + len > end {
            return Err(ProtocolError::BufferTooSmall {
                needed: offset + len.max(2),
                available: end,
            });
        }
        let block = &raw[offset..offset + len];
        match block[1] {
            DESCRIPTOR_TYPE_INTERFACE => {
                need(block, 9)?;
                config.interfaces.push(InterfaceDescriptor {
                    length: block[0],
                    descriptor_type: block[1],
                    interface_number: block[2],
                    alternate_setting: block[3],
                    num_endpoints: block[4],
                    class: block[5],
                    subclass: block[6],
                    protocol: block[7],
                    interface_index: block[8],
                    endpoints: Vec::new(),
                });
            }
            DESCRIPTOR_TYPE_ENDPOINT => {
                need(block, 7)?;
                let endpoint = EndpointDescriptor {
                    length: block[0],
                    descriptor_type: block[1],
                    address: block[2],
                    attributes: block[3],
                    max_packet_size: le16(block, 4),
                    interval: block[6],
                    refresh: block.get(7).copied().unwrap_or(0),
                    synch_address: block.get(8).copied().unwrap_or(0),
                };
                match config.interfaces.last_mut() {
                    Some(interface) => interface.endpoints.push(endpoint),
                    None => {
                        return Err(ProtocolError::UnexpectedDescriptor {
                            expected: DESCRIPTOR_TYPE_INTERFACE,
                            actual: DESCRIPTOR_TYPE_ENDPOINT,
                        });
                    }
                }
            }
            _ if config.interfaces.is_empty() => config.extra.extend_from_slice(block),
            _ => {}
        }
        offset += len;
    }

    Ok(config)
}

/// Control transfer setup packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Setup {
    /// bmRequestType
    pub request_type: u8,
    /// bRequest
    pub request: u8,
    /// wValue
    pub value: u16,
    /// wIndex
    pub index: u16,
    /// wLength
    pub length: u16,
}

impl Setup {
    pub const SIZE: usize = 8;

    /// Data stage direction (bmRequestType bit 7)
    pub fn direction_in(&self) -> bool {
        self.request_type & 0x80 != 0
    }

    /// Standard request addressed to the device (type 0, recipient 0)
    pub fn is_standard_device(&self) -> bool {
        self.request_type & 0x7f == 0
    }

    /// Standard request addressed to an interface (type 0, recipient 1)
    pub fn is_standard_interface(&self) -> bool {
        self.request_type & 0x7f == 0x01
    }

    /// Wire format (little-endian)
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let value = self.value.to_le_bytes();
        let index = self.index.to_le_bytes();
        let length = self.length.to_le_bytes();
        [
            self.request_type,
            self.request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        need(bytes, Self::SIZE)?;
        Ok(Self {
            request_type: bytes[0],
            request: bytes[1],
            value: le16(bytes, 2),
            index: le16(bytes, 4),
            length: le16(bytes, 6),
        })
    }
}

/// Backend error taxonomy
///
/// Maps to libusb error codes. See rusb::Error for details.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum UsbError {
    /// Transfer timed out
    Timeout,
    /// Endpoint stalled (protocol error)
    Pipe,
    /// Device was disconnected
    NoDevice,
    /// Device or endpoint not found
    NotFound,
    /// Device is busy
    Busy,
    /// Buffer overflow
    Overflow,
    /// I/O error
    Io,
    /// Invalid parameter
    InvalidParam,
    /// Access denied (permissions)
    Access,
    /// Operation not supported by the backend
    NotSupported,
    /// Other error with message
    Other { message: String },
}

impl UsbError {
    /// Completion status a transfer failing with this error is delivered with
    pub fn into_status(self) -> TransferStatus {
        match self {
            UsbError::Timeout => TransferStatus::Timeout,
            UsbError::Pipe => TransferStatus::Stall,
            UsbError::NoDevice => TransferStatus::Removed,
            UsbError::Overflow => TransferStatus::Overflow,
            other => TransferStatus::Failed(other),
        }
    }
}

impl fmt::Display for UsbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UsbError::Timeout => f.write_str("timeout"),
            UsbError::Pipe => f.write_str("pipe error"),
            UsbError::NoDevice => f.write_str("no device"),
            UsbError::NotFound => f.write_str("not found"),
            UsbError::Busy => f.write_str("busy"),
            UsbError::Overflow => f.write_str("overflow"),
            UsbError::Io => f.write_str("i/o error"),
            UsbError::InvalidParam => f.write_str("invalid parameter"),
            UsbError::Access => f.write_str("access denied"),
            UsbError::NotSupported => f.write_str("not supported"),
            UsbError::Other { message } => f.write_str(message),
        }
    }
}

/// Status delivered with a request completion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferStatus {
    /// Transfer finished; the completion carries the transferred data
    Completed,
    /// Backend-specific timeout elapsed
    Timeout,
    /// Endpoint halted
    Stall,
    /// Cancelled through `CancelRequests` or `Close`
    Cancelled,
    /// Device disappeared while the request was outstanding
    Removed,
    /// Device sent more data than requested
    Overflow,
    /// Any other backend failure
    Failed(UsbError),
}

impl TransferStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, TransferStatus::Completed)
    }
}
