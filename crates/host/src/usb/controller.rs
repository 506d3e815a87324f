//! Backend SPI and the shared pieces every backend builds on
//!
//! A backend provides a [`ControllerFactory`]; the registry creates one
//! [`Controller`] on first interest and destroys it when interest drops to
//! zero. Controllers enumerate the host on their own threads, keep host
//! identity to Uid assignments in a [`UidTable`] guarded by a scan lock and
//! publish the resulting snapshot through [`PollResults`], which has its own
//! lock so a reader never waits for a scan in progress.

use super::device::{Device, DeviceBackend, DeviceClient, DeviceShared};
use super::lock;
use crate::UsbConfig;
use common::{PumpEvent, PumpNotifier};
use protocol::{DeviceDescriptor, DeviceList, Uid, same_device_set};
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, warn};

/// Backend-specific controller
///
/// All methods may be called from the consumer context while the
/// controller's own threads are scanning.
pub trait Controller: Send + Sync {
    /// Open a device from the last enumeration; `None` if unknown or gone
    fn open_uid(&self, uid: Uid, client: Arc<dyn DeviceClient>) -> Option<Device>;

    /// Whether anyone currently cares about device presence
    fn update_should_scan(&self, active: bool);

    /// Copy the latest published snapshot into `out`
    fn update_device_list(&self, out: &mut DeviceList);

    /// Stop and join all background work
    ///
    /// No backend callback may fire after this returns.
    fn destroy(self: Box<Self>);
}

/// Constructs controllers for one host transport
pub trait ControllerFactory: Send + Sync {
    fn name(&self) -> &'static str;

    fn create(&self, ctx: ControllerContext) -> common::Result<Box<dyn Controller>>;
}

/// Device with completions waiting, as posted on the pump channel
#[derive(Clone)]
pub struct PendingDevice(Weak<DeviceShared>);

impl PendingDevice {
    pub(crate) fn new(device: Weak<DeviceShared>) -> Self {
        Self(device)
    }

    /// `None` once the device has been dropped
    pub(crate) fn upgrade(&self) -> Option<Device> {
        self.0.upgrade().map(Device::from_shared)
    }
}

impl fmt::Debug for PendingDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.upgrade() {
            Some(device) => write!(f, "PendingDevice({})", device.uid()),
            None => f.write_str("PendingDevice(<dropped>)"),
        }
    }
}

/// What the registry hands a controller at creation
#[derive(Clone)]
pub struct ControllerContext {
    pub(crate) notifier: PumpNotifier<PendingDevice>,
    pub(crate) open_devices: OpenDevices,
    pub(crate) config: UsbConfig,
}

impl ControllerContext {
    pub fn new(
        notifier: PumpNotifier<PendingDevice>,
        open_devices: OpenDevices,
        config: UsbConfig,
    ) -> Self {
        Self {
            notifier,
            open_devices,
            config,
        }
    }

    pub fn config(&self) -> &UsbConfig {
        &self.config
    }

    /// Ask the consumer pump to pick up a new snapshot
    pub fn notify_devices_changed(&self) -> bool {
        self.notifier.notify(PumpEvent::DevicesChanged)
    }

    /// Wrap a backend in an open device registered with the registry
    pub fn open_device(
        &self,
        uid: Uid,
        descriptor: DeviceDescriptor,
        backend: Box<dyn DeviceBackend>,
        client: Arc<dyn DeviceClient>,
    ) -> Device {
        Device::new(self, uid, descriptor, backend, client)
    }

    /// Fail every open device whose Uid vanished from the host
    pub fn mark_removed(&self, uids: &[Uid]) {
        for &uid in uids {
            for device in self.open_devices.find_by_uid(uid) {
                device.mark_removed();
            }
        }
    }
}

/// Result of one Uid assignment pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UidAssignment {
    /// One Uid per present host device, in input order
    pub uids: Vec<Uid>,
    /// Uids of host devices no longer present, ascending
    pub removed: Vec<Uid>,
}

/// Host identity to Uid table
///
/// `K` is the backend's notion of "same host device" (for libusb the bus,
/// address and port path). Descriptor contents play no part: two identical
/// keyboards get different Uids, and a device that re-enumerates under a new
/// address gets a new one.
#[derive(Debug, Clone)]
pub struct UidTable<K> {
    entries: HashMap<K, Uid>,
    next: u32,
}

impl<K: Eq + Hash + Clone> Default for UidTable<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone> UidTable<K> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            next: 1,
        }
    }

    /// Assign Uids for the devices present in this enumeration pass
    ///
    /// Known keys keep their Uid, new keys get the next Uid and keys missing
    /// from `present` are dropped. A key listed twice maps to one Uid.
    pub fn assign(&mut self, present: &[K]) -> UidAssignment {
        let mut entries = HashMap::with_capacity(present.len());
        let mut uids = Vec::with_capacity(present.len());

        for key in present {
            let known = entries.get(key).or_else(|| self.entries.get(key)).copied();
            let uid = match known {
                Some(uid) => uid,
                None => self.allocate(&entries),
            };
            entries.insert(key.clone(), uid);
            uids.push(uid);
        }

        let mut removed: Vec<Uid> = self
            .entries
            .iter()
            .filter(|(key, _)| !entries.contains_key(*key))
            .map(|(_, uid)| *uid)
            .collect();
        removed.sort_unstable();

        self.entries = entries;
        UidAssignment { uids, removed }
    }

    /// Next Uid not held by `self.entries` or `pending`
    fn allocate(&mut self, pending: &HashMap<K, Uid>) -> Uid {
        loop {
            let uid = Uid(self.next);
            self.next = self.next.checked_add(1).unwrap_or_else(|| {
                warn!("Uid space exhausted, wrapping around");
                1
            });
            let taken = |assigned: &HashMap<K, Uid>| assigned.values().any(|held| *held == uid);
            if !taken(&self.entries) && !taken(pending) {
                return uid;
            }
        }
    }

    pub fn get(&self, key: &K) -> Option<Uid> {
        self.entries.get(key).copied()
    }

    pub fn key_for(&self, uid: Uid) -> Option<&K> {
        self.entries
            .iter()
            .find_map(|(key, assigned)| (*assigned == uid).then_some(key))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Published snapshot behind the results lock
#[derive(Debug, Default)]
pub struct PollResults {
    list: Mutex<DeviceList>,
}

impl PollResults {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the snapshot unless it holds the same descriptors
    ///
    /// Comparison includes the assigned Uid and ignores order. Returns
    /// whether the snapshot changed.
    pub fn publish(&self, list: DeviceList) -> bool {
        let mut current = lock(&self.list);
        if same_device_set(&current, &list) {
            return false;
        }
        debug!(
            "Publishing device list: {} -> {} devices",
            current.len(),
            list.len()
        );
        *current = list;
        true
    }

    pub fn snapshot(&self) -> DeviceList {
        lock(&self.list).clone()
    }

    pub fn copy_into(&self, out: &mut DeviceList) {
        out.clone_from(&lock(&self.list));
    }

    pub fn find(&self, uid: Uid) -> Option<DeviceDescriptor> {
        lock(&self.list).iter().find(|d| d.uid == uid).cloned()
    }
}

#[derive(Default)]
struct OpenSet {
    open: HashMap<u64, Arc<DeviceShared>>,
    /// Removed from the host, still delivering their last completions
    retired: Vec<(u64, Weak<DeviceShared>)>,
}

/// Devices opened through the registry and not yet closed
///
/// Mutated from the consumer context (open, close) and from the backend
/// context (removal on vanish).
#[derive(Clone, Default)]
pub struct OpenDevices {
    inner: Arc<Mutex<OpenSet>>,
    next_id: Arc<AtomicU64>,
}

impl OpenDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn insert(&self, device: Arc<DeviceShared>) {
        lock(&self.inner).open.insert(device.id(), device);
    }

    pub(crate) fn remove(&self, id: u64) {
        let mut set = lock(&self.inner);
        set.open.remove(&id);
        set.retired.retain(|(retired, _)| *retired != id);
    }

    /// Move a vanished device out of the open set
    pub(crate) fn retire(&self, id: u64) {
        let mut set = lock(&self.inner);
        if let Some(device) = set.open.remove(&id) {
            set.retired.push((id, Arc::downgrade(&device)));
        }
    }

    pub(crate) fn forget(&self, id: u64) {
        lock(&self.inner).retired.retain(|(retired, _)| *retired != id);
    }

    pub fn find_by_uid(&self, uid: Uid) -> Vec<Device> {
        lock(&self.inner)
            .open
            .values()
            .filter(|device| device.uid() == uid)
            .cloned()
            .map(Device::from_shared)
            .collect()
    }

    pub fn all(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = lock(&self.inner)
            .open
            .values()
            .cloned()
            .map(Device::from_shared)
            .collect();
        devices.sort_by_key(|device| device.id());
        devices
    }

    /// Every device that may hold undelivered completions
    pub(crate) fn sweep_targets(&self) -> Vec<Device> {
        let mut set = lock(&self.inner);
        set.retired.retain(|(_, device)| device.strong_count() > 0);
        let mut devices: Vec<Device> = set
            .open
            .values()
            .cloned()
            .chain(set.retired.iter().filter_map(|(_, device)| device.upgrade()))
            .map(Device::from_shared)
            .collect();
        devices.sort_by_key(|device| device.id());
        devices
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).open.len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.inner).open.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{create_mock_device, create_mock_device_list};

    #[test]
    fn test_uids_are_stable_across_rescans() {
        let mut table = UidTable::new();
        let first = table.assign(&["a", "b", "c"]);
        assert_eq!(first.uids, vec![Uid(1), Uid(2), Uid(3)]);
        assert!(first.removed.is_empty());

        let second = table.assign(&["c", "a", "b"]);
        assert_eq!(second.uids, vec![Uid(3), Uid(1), Uid(2)]);
        assert!(second.removed.is_empty());
    }

    #[test]
    fn test_vanished_keys_are_dropped_and_uids_not_reused() {
        let mut table = UidTable::new();
        table.assign(&["a", "b"]);

        let gone = table.assign(&["b"]);
        assert_eq!(gone.removed, vec![Uid(1)]);
        assert_eq!(table.len(), 1);

        // "a" comes back as a new device
        let back = table.assign(&["a", "b"]);
        assert_eq!(back.uids, vec![Uid(3), Uid(2)]);
        assert_eq!(table.key_for(Uid(3)), Some(&"a"));
        assert_eq!(table.get(&"b"), Some(Uid(2)));
    }

    #[test]
    fn test_duplicate_key_maps_to_one_uid() {
        let mut table = UidTable::new();
        let assignment = table.assign(&[7u64, 7]);
        assert_eq!(assignment.uids, vec![Uid(1), Uid(1)]);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_wraparound_skips_uids_in_use() {
        let mut table = UidTable::new();
        table.assign(&["a", "b"]);
        table.next = u32::MAX;

        let assignment = table.assign(&["a", "b", "c", "d"]);
        assert_eq!(
            assignment.uids,
            vec![Uid(1), Uid(2), Uid(u32::MAX), Uid(3)]
        );
    }

    #[test]
    fn test_publish_ignores_permutation() {
        let results = PollResults::new();
        let mut list = create_mock_device_list(3);
        assert!(results.publish(list.clone()));

        list.reverse();
        assert!(!results.publish(list.clone()));

        list.push(create_mock_device(9, 0x1234, 0x5678));
        assert!(results.publish(list));
        assert_eq!(results.snapshot().len(), 4);
        assert!(results.find(Uid(9)).is_some());
    }

    #[test]
    fn test_publish_detects_uid_churn() {
        let results = PollResults::new();
        results.publish(vec![create_mock_device(1, 0x1234, 0x5678)]);
        assert!(results.publish(vec![create_mock_device(2, 0x1234, 0x5678)]));
    }

    #[test]
    fn test_copy_into_replaces_contents() {
        let results = PollResults::new();
        results.publish(create_mock_device_list(2));
        let mut out = create_mock_device_list(5);
        results.copy_into(&mut out);
        assert_eq!(out.len(), 2);
    }
}
