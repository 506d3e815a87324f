//! Device list snapshots and order-independent diffing
//!
//! Controllers publish their enumeration result as a [`DeviceList`]. Two
//! snapshots are considered equal when they hold the same multiset of
//! descriptors under full structural equality (assigned Uid included), no
//! matter in which order the host enumerated them.

use crate::types::{DeviceDescriptor, Uid};

/// Snapshot of the devices a controller currently knows about
pub type DeviceList = Vec<DeviceDescriptor>;

/// Difference between two snapshots
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceListDiff {
    /// Descriptors present in the new snapshot only
    pub added: Vec<DeviceDescriptor>,
    /// Descriptors present in the old snapshot only
    pub removed: Vec<DeviceDescriptor>,
}

impl DeviceListDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    /// Uids of removed descriptors
    pub fn removed_uids(&self) -> Vec<Uid> {
        self.removed.iter().map(|d| d.uid).collect()
    }
}

/// Compute the multiset difference between `old` and `new`
///
/// Each descriptor in `new` consumes at most one equal descriptor in `old`,
/// so duplicates are accounted for. Lists are small (tens of devices), a
/// quadratic match is fine.
pub fn diff_device_lists(old: &[DeviceDescriptor], new: &[DeviceDescriptor]) -> DeviceListDiff {
    let mut matched = vec![false; old.len()];
    let mut added = Vec::new();

    for desc in new {
        let hit = old
            .iter()
            .enumerate()
            .position(|(i, candidate)| !matched[i] && candidate == desc);
        match hit {
            Some(i) => matched[i] = true,
            None => added.push(desc.clone()),
        }
    }

    let removed = old
        .iter()
        .zip(matched)
        .filter(|(_, hit)| !hit)
        .map(|(desc, _)| desc.clone())
        .collect();

    DeviceListDiff { added, removed }
}

/// True when both snapshots hold the same descriptors in any order
pub fn same_device_set(old: &[DeviceDescriptor], new: &[DeviceDescriptor]) -> bool {
    old.len() == new.len() && diff_device_lists(old, new).is_empty()
}

/// First device in snapshot order matching vendor/product id
pub fn find_vid_pid(
    list: &[DeviceDescriptor],
    vendor_id: u16,
    product_id: u16,
) -> Option<&DeviceDescriptor> {
    list.iter()
        .find(|d| d.vendor_id == vendor_id && d.product_id == product_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DESCRIPTOR_TYPE_DEVICE;

    fn desc(uid: u32, vendor_id: u16, product_id: u16) -> DeviceDescriptor {
        DeviceDescriptor {
            length: 18,
            descriptor_type: DESCRIPTOR_TYPE_DEVICE,
            usb_version: 0x0200,
            class: 0,
            subclass: 0,
            protocol: 0,
            max_packet_size0: 64,
            vendor_id,
            product_id,
            device_version: 0x0100,
            manufacturer_index: 0,
            product_index: 0,
            serial_number_index: 0,
            num_configurations: 0,
            uid: Uid(uid),
            configs: Vec::new(),
        }
    }

    #[test]
    fn test_permutation_is_not_a_change() {
        let old = vec![desc(1, 0x046d, 0xc312), desc(2, 0x1234, 0x5678)];
        let new = vec![desc(2, 0x1234, 0x5678), desc(1, 0x046d, 0xc312)];
        assert!(diff_device_lists(&old, &new).is_empty());
        assert!(same_device_set(&old, &new));
    }

    #[test]
    fn test_single_addition() {
        let old = vec![desc(1, 0x046d, 0xc312)];
        let new = vec![desc(1, 0x046d, 0xc312), desc(2, 0x1234, 0x5678)];
        let diff = diff_device_lists(&old, &new);
        assert_eq!(diff.added, vec![desc(2, 0x1234, 0x5678)]);
        assert!(diff.removed.is_empty());
    }

    #[test]
    fn test_uid_churn_is_a_change() {
        let old = vec![desc(1, 0x046d, 0xc312)];
        let new = vec![desc(3, 0x046d, 0xc312)];
        let diff = diff_device_lists(&old, &new);
        assert_eq!(diff.added.len(), 1);
        assert_eq!(diff.removed_uids(), vec![Uid(1)]);
    }

    #[test]
    fn test_duplicates_are_counted() {
        let old = vec![desc(1, 1, 1), desc(1, 1, 1)];
        let new = vec![desc(1, 1, 1)];
        let diff = diff_device_lists(&old, &new);
        assert!(diff.added.is_empty());
        assert_eq!(diff.removed.len(), 1);
        assert!(!same_device_set(&old, &new));
    }

    #[test]
    fn test_find_vid_pid_returns_first_in_order() {
        let list = vec![desc(7, 0x1234, 0x5678), desc(3, 0x1234, 0x5678)];
        assert_eq!(find_vid_pid(&list, 0x1234, 0x5678).unwrap().uid, Uid(7));
        assert!(find_vid_pid(&list, 0xffff, 0x0001).is_none());
    }
}
