//! Descriptor model and persistent formats for the virtual USB subsystem
//!
//! This crate holds the passive, host-independent data the rest of the
//! workspace exchanges:
//!
//! - the USB descriptor hierarchy published by controllers, with structural
//!   equality for snapshot diffing ([`types`], [`snapshot`])
//! - the fixed guest wire layout of those descriptors ([`layout`])
//! - the checkpoint stream written by the device state bridge ([`codec`])
//!
//! # Example
//!
//! ```
//! use protocol::{CURRENT_VERSION, Checkpoint, DeviceStateRecord, Uid};
//! use protocol::{decode_framed, encode_framed};
//!
//! let checkpoint = Checkpoint {
//!     version: CURRENT_VERSION,
//!     records: vec![DeviceStateRecord { uid: Uid(1), vendor_id: 0x046d, product_id: 0xc312 }],
//! };
//!
//! let bytes = encode_framed(&checkpoint).unwrap();
//! let restored = decode_framed(&bytes).unwrap();
//! assert_eq!(restored.records[0].uid, Uid(1));
//! ```

pub mod checkpoint;
pub mod codec;
pub mod error;
pub mod integrity;
pub mod layout;
pub mod snapshot;
pub mod types;
pub mod version;

pub use checkpoint::{Checkpoint, DeviceStateRecord};
pub use codec::{
    CHECKPOINT_MAGIC, MAX_FRAME_SIZE, decode_checkpoint, decode_framed, encode_checkpoint,
    encode_framed, read_framed, validate_version, write_framed,
};
pub use error::{ProtocolError, Result};
pub use layout::GuestByteOrder;
pub use snapshot::{DeviceList, DeviceListDiff, diff_device_lists, find_vid_pid, same_device_set};
pub use types::{
    ConfigDescriptor, DeviceDescriptor, EndpointDescriptor, InterfaceDescriptor, Setup,
    TransferKind, TransferStatus, Uid, UsbError,
};
pub use version::{CURRENT_VERSION, ProtocolVersion};
