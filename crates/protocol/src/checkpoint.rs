//! Checkpoint records for the device state bridge
//!
//! A checkpoint carries, per open device a consumer still references, the
//! minimal identity needed to re-resolve the device after restore. In-flight
//! requests are never persisted: they are implicitly cancelled at a checkpoint
//! boundary and the consumer re-issues transfers after restore.

use crate::types::{DeviceDescriptor, Uid};
use crate::version::ProtocolVersion;
use serde::{Deserialize, Serialize};

/// Identity of one open device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceStateRecord {
    pub uid: Uid,
    pub vendor_id: u16,
    pub product_id: u16,
}

impl DeviceStateRecord {
    /// Whether `desc` is the device this record was written for
    pub fn matches(&self, desc: &DeviceDescriptor) -> bool {
        desc.uid == self.uid
            && desc.vendor_id == self.vendor_id
            && desc.product_id == self.product_id
    }
}

/// Versioned checkpoint envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Format version of this checkpoint
    pub version: ProtocolVersion,
    /// One record per open device, in the order they were written
    pub records: Vec<DeviceStateRecord>,
}
