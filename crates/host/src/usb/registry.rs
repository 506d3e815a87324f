//! Process-wide coordinator of the USB subsystem
//!
//! The [`Registry`] owns the active controller (created on the first
//! [`Registry::ref_interface`], destroyed on the last matching
//! [`Registry::reset_interface`]), the published device list, the change
//! subscribers and the set of open devices.
//!
//! Nothing here runs on backend threads except through the pump channel:
//! controllers and devices post events, and [`Registry::pump`] (the consumer
//! context) delivers request completions and device list changes.

use super::controller::{Controller, ControllerContext, ControllerFactory, OpenDevices, PendingDevice};
use super::device::{Device, DeviceClient};
use super::lock;
use crate::UsbConfig;
use common::{PumpEvent, PumpNotifier, PumpReceiver, create_pump_bridge};
use protocol::{DeviceDescriptor, DeviceList, Uid, diff_device_lists, find_vid_pid};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, error, info, warn};

/// Device list change as delivered to subscribers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceListChange {
    /// The new snapshot
    pub devices: DeviceList,
    pub added: Vec<DeviceDescriptor>,
    pub removed: Vec<DeviceDescriptor>,
}

/// Receives device list changes (consumer context only)
pub trait DeviceChangeClient: Send + Sync {
    fn devices_changed(&self, change: &DeviceListChange);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// What one pump cycle did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpStats {
    /// Completions handed to device clients
    pub delivered: usize,
    /// Subscribers were notified of a new device list
    pub list_changed: bool,
}

struct BackendSlot {
    refs: usize,
    controller: Option<Box<dyn Controller>>,
}

struct RegistryInner {
    factory: Arc<dyn ControllerFactory>,
    config: UsbConfig,
    open_devices: OpenDevices,
    notifier: PumpNotifier<PendingDevice>,
    receiver: PumpReceiver<PendingDevice>,
    backend: Mutex<BackendSlot>,
    snapshot: RwLock<DeviceList>,
    subscribers: Mutex<Vec<(SubscriptionId, Arc<dyn DeviceChangeClient>)>>,
    next_subscription: AtomicU64,
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        let slot = self.backend.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(controller) = slot.controller.take() {
            warn!(
                "Registry dropped with backend '{}' still active, destroying it",
                self.factory.name()
            );
            controller.destroy();
        }
    }
}

/// Shared handle to the USB subsystem
///
/// Clones refer to the same registry.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Registry {
    pub fn new(factory: Arc<dyn ControllerFactory>, config: UsbConfig) -> Self {
        let (notifier, receiver) = create_pump_bridge(config.pump_queue_capacity);
        Self {
            inner: Arc::new(RegistryInner {
                factory,
                config,
                open_devices: OpenDevices::new(),
                notifier,
                receiver,
                backend: Mutex::new(BackendSlot {
                    refs: 0,
                    controller: None,
                }),
                snapshot: RwLock::new(DeviceList::new()),
                subscribers: Mutex::new(Vec::new()),
                next_subscription: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &UsbConfig {
        &self.inner.config
    }

    pub fn backend_name(&self) -> &'static str {
        self.inner.factory.name()
    }

    /// Take a reference on the backend, starting it on the first one
    ///
    /// Returns whether scanning is enabled. A backend that fails to start is
    /// reported and leaves scanning disabled; the reference is still counted
    /// and must be dropped with `reset_interface`.
    pub fn ref_interface(&self) -> bool {
        let mut slot = lock(&self.inner.backend);
        slot.refs += 1;
        if slot.refs > 1 {
            return slot.controller.is_some();
        }

        let factory = &self.inner.factory;
        let ctx = ControllerContext::new(
            self.inner.notifier.clone(),
            self.inner.open_devices.clone(),
            self.inner.config.clone(),
        );
        match factory.create(ctx) {
            Ok(controller) => {
                controller.update_should_scan(self.has_subscribers());

                let mut list = DeviceList::new();
                controller.update_device_list(&mut list);
                info!(
                    "USB backend '{}' started with {} devices",
                    factory.name(),
                    list.len()
                );
                *write(&self.inner.snapshot) = list;

                slot.controller = Some(controller);
                true
            }
            Err(e) => {
                error!(
                    "USB backend '{}' unavailable, scanning disabled: {}",
                    factory.name(),
                    e
                );
                false
            }
        }
    }

    /// Drop a reference; the last one destroys the backend
    ///
    /// Devices still open at that point are failed as removed.
    pub fn reset_interface(&self) {
        let (controller, open) = {
            let mut slot = lock(&self.inner.backend);
            if slot.refs == 0 {
                error!("reset_interface called without a matching ref_interface");
                return;
            }
            slot.refs -= 1;
            if slot.refs > 0 {
                return;
            }
            (slot.controller.take(), self.inner.open_devices.all())
        };

        if !open.is_empty() {
            warn!("USB backend going down with {} open devices", open.len());
            for device in &open {
                device.mark_removed();
            }
        }

        if let Some(controller) = controller {
            controller.destroy();
            info!("USB backend '{}' stopped", self.inner.factory.name());
        }
        self.inner.notifier.notify(PumpEvent::DevicesChanged);
    }

    pub fn is_scanning_enabled(&self) -> bool {
        lock(&self.inner.backend).controller.is_some()
    }

    /// Subscribe to device list changes
    ///
    /// No notification is sent for the current list; read it with
    /// `get_device_list` after subscribing.
    pub fn register_device_change_client(
        &self,
        client: Arc<dyn DeviceChangeClient>,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::Relaxed) + 1);
        lock(&self.inner.subscribers).push((id, client));
        debug!("Registered device change client {:?}", id);
        self.update_should_scan();
        id
    }

    pub fn deregister_device_change_client(&self, id: SubscriptionId) -> bool {
        let removed = {
            let mut subscribers = lock(&self.inner.subscribers);
            let before = subscribers.len();
            subscribers.retain(|(subscription, _)| *subscription != id);
            subscribers.len() != before
        };
        if removed {
            debug!("Deregistered device change client {:?}", id);
            self.update_should_scan();
        } else {
            warn!("Deregistering unknown device change client {:?}", id);
        }
        removed
    }

    fn has_subscribers(&self) -> bool {
        !lock(&self.inner.subscribers).is_empty()
    }

    /// Read the subscriber count under the backend lock so concurrent
    /// updates are applied in the order they observe it
    fn update_should_scan(&self) {
        let slot = lock(&self.inner.backend);
        if let Some(controller) = &slot.controller {
            controller.update_should_scan(self.has_subscribers());
        }
    }

    /// The snapshot subscribers were last notified about
    pub fn get_device_list(&self) -> DeviceList {
        read(&self.inner.snapshot).clone()
    }

    pub fn open_uid(&self, uid: Uid, client: Arc<dyn DeviceClient>) -> Option<Device> {
        let slot = lock(&self.inner.backend);
        let Some(controller) = &slot.controller else {
            warn!("open_uid({}) with no active USB backend", uid);
            return None;
        };
        let device = controller.open_uid(uid, client);
        if device.is_none() {
            debug!("Device {} not found", uid);
        }
        device
    }

    /// Uid of the first device in snapshot order with this vendor/product id
    pub fn find_vid_pid(&self, vendor_id: u16, product_id: u16) -> Option<Uid> {
        find_vid_pid(&read(&self.inner.snapshot), vendor_id, product_id).map(|d| d.uid)
    }

    /// Resolve vendor/product id through the snapshot, then open by Uid
    ///
    /// The Uid is returned even when the open itself fails.
    pub fn open_vid_pid(
        &self,
        vendor_id: u16,
        product_id: u16,
        client: Arc<dyn DeviceClient>,
    ) -> (Option<Uid>, Option<Device>) {
        let Some(uid) = self.find_vid_pid(vendor_id, product_id) else {
            debug!("No device {:04x}:{:04x} in snapshot", vendor_id, product_id);
            return (None, None);
        };
        (Some(uid), self.open_uid(uid, client))
    }

    pub fn open_device_count(&self) -> usize {
        self.inner.open_devices.len()
    }

    pub fn open_devices(&self) -> Vec<Device> {
        self.inner.open_devices.all()
    }

    /// Run one consumer pump cycle
    ///
    /// Delivers completions of every signalled device and, if a controller
    /// published a new snapshot, notifies subscribers of the difference.
    /// Callbacks run on the calling thread.
    pub fn pump(&self) -> PumpStats {
        let drained = self.inner.receiver.drain();
        let mut refresh = drained.overflowed;
        let mut devices = if drained.overflowed {
            warn!("Pump queue overflowed, sweeping all devices");
            self.inner.open_devices.sweep_targets()
        } else {
            Vec::new()
        };

        for event in drained.events {
            match event {
                PumpEvent::RequestsCompleted(pending) => devices.extend(pending.upgrade()),
                PumpEvent::DevicesChanged => refresh = true,
            }
        }

        let mut stats = PumpStats::default();
        let mut seen = HashSet::new();
        for device in devices {
            if seen.insert(device.id()) {
                stats.delivered += device.process_pending();
            }
        }

        if refresh {
            stats.list_changed = self.refresh_snapshot();
        }
        stats
    }

    fn refresh_snapshot(&self) -> bool {
        let mut list = DeviceList::new();
        if let Some(controller) = &lock(&self.inner.backend).controller {
            controller.update_device_list(&mut list);
        }

        let diff = {
            let mut snapshot = write(&self.inner.snapshot);
            let diff = diff_device_lists(&snapshot, &list);
            if diff.is_empty() {
                return false;
            }
            snapshot.clone_from(&list);
            diff
        };

        info!(
            "Device list changed: {} added, {} removed, {} present",
            diff.added.len(),
            diff.removed.len(),
            list.len()
        );
        let change = DeviceListChange {
            devices: list,
            added: diff.added,
            removed: diff.removed,
        };

        let subscribers: Vec<Arc<dyn DeviceChangeClient>> = lock(&self.inner.subscribers)
            .iter()
            .map(|(_, client)| client.clone())
            .collect();
        for subscriber in subscribers {
            subscriber.devices_changed(&change);
        }
        true
    }

    /// Close every open device and stop the backend regardless of references
    pub fn shutdown(&self) {
        let open = self.inner.open_devices.all();
        if !open.is_empty() {
            info!("Closing {} open devices", open.len());
        }
        for device in open {
            device.close();
        }
        for device in self.inner.open_devices.sweep_targets() {
            device.process_pending();
        }

        let controller = {
            let mut slot = lock(&self.inner.backend);
            slot.refs = 0;
            slot.controller.take()
        };
        if let Some(controller) = controller {
            controller.destroy();
            info!("USB backend '{}' stopped", self.inner.factory.name());
        }

        write(&self.inner.snapshot).clear();
        let stale = self.inner.receiver.drain();
        debug!("Discarded {} pump events at shutdown", stale.events.len());
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
