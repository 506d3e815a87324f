//! Guest-facing descriptor wire layout
//!
//! Guests consume descriptors as fixed, padded records:
//!
//! ```text
//! device     20 bytes  (18 standard bytes + 2 pad)
//! config     12 bytes  ( 9 standard bytes + 3 pad)
//! interface  12 bytes  ( 9 standard bytes + 3 pad)
//! endpoint    8 bytes  ( 7 standard bytes + bRefresh)
//! ```
//!
//! Multi-byte fields (`bcdUSB`, `idVendor`, `idProduct`, `bcdDevice`,
//! `wTotalLength`, `wMaxPacketSize`) are written in the guest's byte order, so
//! they are byte-swapped whenever guest and host orders differ.

use crate::error::{ProtocolError, Result};
use crate::types::{
    ConfigDescriptor, DeviceDescriptor, EndpointDescriptor, InterfaceDescriptor, Uid,
};
use byteorder::{BigEndian, ByteOrder, LittleEndian, WriteBytesExt};
use std::io::Write;

pub const DEVICE_DESCRIPTOR_SIZE: usize = 20;
pub const CONFIG_DESCRIPTOR_SIZE: usize = 12;
pub const INTERFACE_DESCRIPTOR_SIZE: usize = 12;
pub const ENDPOINT_DESCRIPTOR_SIZE: usize = 8;

/// Byte order of the guest consuming the layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestByteOrder {
    Little,
    Big,
}

impl GuestByteOrder {
    /// Byte order of the host running this code
    pub fn native() -> Self {
        if cfg!(target_endian = "big") {
            GuestByteOrder::Big
        } else {
            GuestByteOrder::Little
        }
    }

    /// Whether multi-byte fields must be swapped relative to host order
    pub fn needs_swap(self) -> bool {
        self != Self::native()
    }

    fn write_u16<W: Write>(self, writer: &mut W, value: u16) -> std::io::Result<()> {
        match self {
            GuestByteOrder::Little => writer.write_u16::<LittleEndian>(value),
            GuestByteOrder::Big => writer.write_u16::<BigEndian>(value),
        }
    }

    fn read_u16(self, bytes: &[u8]) -> u16 {
        match self {
            GuestByteOrder::Little => LittleEndian::read_u16(bytes),
            GuestByteOrder::Big => BigEndian::read_u16(bytes),
        }
    }
}

fn check_len(bytes: &[u8], needed: usize) -> Result<()> {
    if bytes.len() < needed {
        return Err(ProtocolError::BufferTooSmall {
            needed,
            available: bytes.len(),
        });
    }
    Ok(())
}

pub fn write_device_descriptor<W: Write>(
    writer: &mut W,
    desc: &DeviceDescriptor,
    order: GuestByteOrder,
) -> Result<()> {
    writer.write_all(&[desc.length, desc.descriptor_type])?;
    order.write_u16(writer, desc.usb_version)?;
    writer.write_all(&[
        desc.class,
        desc.subclass,
        desc.protocol,
        desc.max_packet_size0,
    ])?;
    order.write_u16(writer, desc.vendor_id)?;
    order.write_u16(writer, desc.product_id)?;
    order.write_u16(writer, desc.device_version)?;
    writer.write_all(&[
        desc.manufacturer_index,
        desc.product_index,
        desc.serial_number_index,
        desc.num_configurations,
        0,
        0,
    ])?;
    Ok(())
}

pub fn write_config_descriptor<W: Write>(
    writer: &mut W,
    desc: &ConfigDescriptor,
    order: GuestByteOrder,
) -> Result<()> {
    writer.write_all(&[desc.length, desc.descriptor_type])?;
    order.write_u16(writer, desc.total_length)?;
    writer.write_all(&[
        desc.num_interfaces,
        desc.configuration_value,
        desc.configuration_index,
        desc.attributes,
        desc.max_power,
        0,
        0,
        0,
    ])?;
    Ok(())
}

pub fn write_interface_descriptor<W: Write>(
    writer: &mut W,
    desc: &InterfaceDescriptor,
) -> Result<()> {
    writer.write_all(&[
        desc.length,
        desc.descriptor_type,
        desc.interface_number,
        desc.alternate_setting,
        desc.num_endpoints,
        desc.class,
        desc.subclass,
        desc.protocol,
        desc.interface_index,
        0,
        0,
        0,
    ])?;
    Ok(())
}

pub fn write_endpoint_descriptor<W: Write>(
    writer: &mut W,
    desc: &EndpointDescriptor,
    order: GuestByteOrder,
) -> Result<()> {
    writer.write_all(&[desc.length, desc.descriptor_type, desc.address, desc.attributes])?;
    order.write_u16(writer, desc.max_packet_size)?;
    writer.write_all(&[desc.interval, desc.refresh])?;
    Ok(())
}

/// Read a device record; `configs` is left empty and `uid` is set by the caller
pub fn read_device_descriptor(
    bytes: &[u8],
    order: GuestByteOrder,
    uid: Uid,
) -> Result<DeviceDescriptor> {
    check_len(bytes, DEVICE_DESCRIPTOR_SIZE)?;
    Ok(DeviceDescriptor {
        length: bytes[0],
        descriptor_type: bytes[1],
        usb_version: order.read_u16(&bytes[2..4]),
        class: bytes[4],
        subclass: bytes[5],
        protocol: bytes[6],
        max_packet_size0: bytes[7],
        vendor_id: order.read_u16(&bytes[8..10]),
        product_id: order.read_u16(&bytes[10..12]),
        device_version: order.read_u16(&bytes[12..14]),
        manufacturer_index: bytes[14],
        product_index: bytes[15],
        serial_number_index: bytes[16],
        num_configurations: bytes[17],
        uid,
        configs: Vec::new(),
    })
}

pub fn read_config_descriptor(bytes: &[u8], order: GuestByteOrder) -> Result<ConfigDescriptor> {
    check_len(bytes, CONFIG_DESCRIPTOR_SIZE)?;
    Ok(ConfigDescriptor {
        length: bytes[0],
        descriptor_type: bytes[1],
        total_length: order.read_u16(&bytes[2..4]),
        num_interfaces: bytes[4],
        configuration_value: bytes[5],
        configuration_index: bytes[6],
        attributes: bytes[7],
        max_power: bytes[8],
        extra: Vec::new(),
        interfaces: Vec::new(),
    })
}

pub fn read_interface_descriptor(bytes: &[u8]) -> Result<InterfaceDescriptor> {
    check_len(bytes, INTERFACE_DESCRIPTOR_SIZE)?;
    Ok(InterfaceDescriptor {
        length: bytes[0],
        descriptor_type: bytes[1],
        interface_number: bytes[2],
        alternate_setting: bytes[3],
        num_endpoints: bytes[4],
        class: bytes[5],
        subclass: bytes[6],
        protocol: bytes[7],
        interface_index: bytes[8],
        endpoints: Vec::new(),
    })
}

pub fn read_endpoint_descriptor(bytes: &[u8], order: GuestByteOrder) -> Result<EndpointDescriptor> {
    check_len(bytes, ENDPOINT_DESCRIPTOR_SIZE)?;
    Ok(EndpointDescriptor {
        length: bytes[0],
        descriptor_type: bytes[1],
        address: bytes[2],
        attributes: bytes[3],
        max_packet_size: order.read_u16(&bytes[4..6]),
        interval: bytes[6],
        refresh: bytes[7],
        synch_address: 0,
    })
}

/// Size of the flattened tree produced by [`encode_device_tree`]
pub fn device_tree_size(desc: &DeviceDescriptor) -> usize {
    DEVICE_DESCRIPTOR_SIZE
        + desc
            .configs
            .iter()
            .map(|c| {
                CONFIG_DESCRIPTOR_SIZE
                    + c.interfaces
                        .iter()
                        .map(|i| {
                            INTERFACE_DESCRIPTOR_SIZE
                                + i.endpoints.len() * ENDPOINT_DESCRIPTOR_SIZE
                        })
                        .sum::<usize>()
            })
            .sum::<usize>()
}

/// Flatten device -> configs -> interfaces -> endpoints in descriptor order
pub fn encode_device_tree(desc: &DeviceDescriptor, order: GuestByteOrder) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(device_tree_size(desc));
    write_device_descriptor(&mut out, desc, order)?;
    for config in &desc.configs {
        write_config_descriptor(&mut out, config, order)?;
        for interface in &config.interfaces {
            write_interface_descriptor(&mut out, interface)?;
            for endpoint in &interface.endpoints {
                write_endpoint_descriptor(&mut out, endpoint, order)?;
            }
        }
    }
    Ok(out)
}

/// Copy the flattened tree into a guest buffer without overrunning it
///
/// Returns the number of bytes written.
pub fn copy_device_tree_into(
    dst: &mut [u8],
    desc: &DeviceDescriptor,
    order: GuestByteOrder,
) -> Result<usize> {
    let needed = device_tree_size(desc);
    if needed > dst.len() {
        return Err(ProtocolError::BufferTooSmall {
            needed,
            available: dst.len(),
        });
    }
    let tree = encode_device_tree(desc, order)?;
    dst[..tree.len()].copy_from_slice(&tree);
    Ok(tree.len())
}
