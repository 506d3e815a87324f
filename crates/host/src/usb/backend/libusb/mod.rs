//! libusb backend (through `rusb`)
//!
//! One `usb-scan` thread per controller enumerates the host. With libusb
//! hotplug support, arrival and departure callbacks only raise a rescan flag
//! and the thread rescans on its next wakeup; otherwise it polls every
//! `scan_interval_ms`. Scanning is suspended while the registry reports that
//! nobody is interested in device presence.
//!
//! Host identity is the (bus, address, port path) triple, so a device keeps
//! its Uid until it is unplugged or re-enumerated by the host.

mod device;
mod transfers;
mod worker;

pub use transfers::map_rusb_error;

use crate::usb::controller::{Controller, ControllerContext, ControllerFactory, PollResults, UidTable};
use crate::usb::device::{Device, DeviceClient};
use crate::usb::lock;
use device::{HostDevice, is_root_hub, read_descriptor_tree};
use protocol::{DeviceList, Uid};
use rusb::{Context, Hotplug, HotplugBuilder, Registration, UsbContext};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use worker::RusbDeviceBackend;

/// Wakeup period of the scan thread
const EVENT_TIMEOUT: Duration = Duration::from_millis(100);

/// Host identity of an attached device
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct HostKey {
    bus: u8,
    address: u8,
    ports: Vec<u8>,
}

impl HostKey {
    fn of(device: &rusb::Device<Context>) -> Self {
        Self {
            bus: device.bus_number(),
            address: device.address(),
            ports: device.port_numbers().unwrap_or_default(),
        }
    }
}

struct ScanShared {
    ctx: ControllerContext,
    context: Context,
    /// Scan lock: host identity to Uid
    table: Mutex<UidTable<HostKey>>,
    /// Devices of the last pass, for opening by Uid
    host_devices: Mutex<HashMap<Uid, rusb::Device<Context>>>,
    results: PollResults,
    should_scan: AtomicBool,
    rescan: Arc<AtomicBool>,
    shutdown: AtomicBool,
}

impl ScanShared {
    /// One enumeration pass; returns whether the published snapshot changed
    fn scan(&self) -> rusb::Result<bool> {
        let config = self.ctx.config();
        let mut found = Vec::new();

        for device in self.context.devices()?.iter() {
            let descriptor = match read_descriptor_tree(&device, Uid(0)) {
                Ok(descriptor) => descriptor,
                Err(e) => {
                    debug!(
                        "Skipping device bus={} addr={}: {}",
                        device.bus_number(),
                        device.address(),
                        e
                    );
                    continue;
                }
            };

            if config.skip_root_hubs && is_root_hub(&descriptor) {
                continue;
            }
            if !config.allows(descriptor.vendor_id, descriptor.product_id) {
                debug!(
                    "Device ignored by filter: vid={:#06x}, pid={:#06x}",
                    descriptor.vendor_id, descriptor.product_id
                );
                continue;
            }

            found.push((HostKey::of(&device), device, descriptor));
        }

        let (list, removed) = {
            let mut table = lock(&self.table);
            let keys: Vec<HostKey> = found.iter().map(|(key, _, _)| key.clone()).collect();
            let assignment = table.assign(&keys);

            let mut host_devices = HashMap::with_capacity(found.len());
            let mut list = DeviceList::with_capacity(found.len());
            for ((_, device, mut descriptor), uid) in found.into_iter().zip(assignment.uids) {
                descriptor.uid = uid;
                host_devices.insert(uid, device);
                list.push(descriptor);
            }
            *lock(&self.host_devices) = host_devices;
            (list, assignment.removed)
        };

        if !removed.is_empty() {
            debug!("Devices left the host: {:?}", removed);
        }
        self.ctx.mark_removed(&removed);

        let changed = self.results.publish(list);
        if changed {
            self.ctx.notify_devices_changed();
        }
        Ok(changed)
    }
}

/// Raises the rescan flag on arrival and departure
struct HotplugCallback {
    rescan: Arc<AtomicBool>,
}

impl<T: UsbContext> Hotplug<T> for HotplugCallback {
    fn device_arrived(&mut self, device: rusb::Device<T>) {
        debug!(
            "Hot-plug: device arrived (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        self.rescan.store(true, Ordering::Release);
    }

    fn device_left(&mut self, device: rusb::Device<T>) {
        debug!(
            "Hot-plug: device left (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        self.rescan.store(true, Ordering::Release);
    }
}

fn register_hotplug(shared: &ScanShared) -> Option<Registration<Context>> {
    if !shared.ctx.config().use_hotplug {
        return None;
    }
    if !rusb::has_hotplug() {
        info!("libusb hotplug not supported, polling for devices");
        return None;
    }

    let callback = HotplugCallback {
        rescan: shared.rescan.clone(),
    };
    match HotplugBuilder::new()
        .enumerate(false)
        .register(&shared.context, Box::new(callback))
    {
        Ok(registration) => {
            debug!("Hot-plug callbacks registered");
            Some(registration)
        }
        Err(e) => {
            warn!("Failed to register hot-plug callbacks, polling instead: {}", e);
            None
        }
    }
}

fn run_scan_loop(shared: Arc<ScanShared>) {
    let registration = register_hotplug(&shared);
    let interval = shared.ctx.config().scan_interval();
    let mut last_scan = Instant::now();
    info!("USB scan thread started");

    while !shared.shutdown.load(Ordering::Acquire) {
        if registration.is_some() {
            match shared.context.handle_events(Some(EVENT_TIMEOUT)) {
                Ok(()) => {}
                Err(rusb::Error::Interrupted) => debug!("USB event handling interrupted"),
                Err(e) => {
                    warn!("Error handling USB events: {}", e);
                    thread::sleep(EVENT_TIMEOUT);
                }
            }
        } else {
            thread::sleep(EVENT_TIMEOUT);
        }

        // a pending rescan flag survives while scanning is suspended
        if !shared.should_scan.load(Ordering::Acquire) {
            continue;
        }

        let due = if registration.is_some() {
            shared.rescan.swap(false, Ordering::AcqRel)
        } else {
            shared.rescan.swap(false, Ordering::AcqRel) || last_scan.elapsed() >= interval
        };
        if !due {
            continue;
        }

        last_scan = Instant::now();
        if let Err(e) = shared.scan() {
            warn!("USB scan failed: {}", e);
        }
    }

    drop(registration);
    info!("USB scan thread stopped");
}

struct RusbController {
    shared: Arc<ScanShared>,
    thread: Option<JoinHandle<()>>,
}

impl Controller for RusbController {
    fn open_uid(&self, uid: Uid, client: Arc<dyn DeviceClient>) -> Option<Device> {
        let descriptor = self.shared.results.find(uid)?;
        let device = lock(&self.shared.host_devices).get(&uid).cloned()?;

        match HostDevice::open(uid, &device) {
            Ok(host) => {
                let backend = RusbDeviceBackend::new(host);
                Some(
                    self.shared
                        .ctx
                        .open_device(uid, descriptor, Box::new(backend), client),
                )
            }
            Err(e) => {
                warn!("Failed to open device {}: {}", uid, e);
                None
            }
        }
    }

    fn update_should_scan(&self, active: bool) {
        let previous = self.shared.should_scan.swap(active, Ordering::AcqRel);
        if previous != active {
            debug!("USB scanning {}", if active { "resumed" } else { "suspended" });
            if active {
                // pick up anything that changed while suspended
                self.shared.rescan.store(true, Ordering::Release);
            }
        }
    }

    fn update_device_list(&self, out: &mut DeviceList) {
        self.shared.results.copy_into(out);
    }

    fn destroy(mut self: Box<Self>) {
        self.shared.shutdown.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            error!("USB scan thread panicked");
        }
        info!("libusb controller destroyed");
    }
}

/// Creates libusb controllers
#[derive(Debug, Clone, Copy, Default)]
pub struct RusbControllerFactory;

impl ControllerFactory for RusbControllerFactory {
    fn name(&self) -> &'static str {
        "libusb"
    }

    fn create(&self, ctx: ControllerContext) -> common::Result<Box<dyn Controller>> {
        let context = Context::new()
            .map_err(|e| common::Error::BackendUnavailable(format!("libusb init failed: {}", e)))?;

        let shared = Arc::new(ScanShared {
            ctx,
            context,
            table: Mutex::new(UidTable::new()),
            host_devices: Mutex::new(HashMap::new()),
            results: PollResults::new(),
            should_scan: AtomicBool::new(false),
            rescan: Arc::new(AtomicBool::new(false)),
            shutdown: AtomicBool::new(false),
        });

        // initial enumeration runs regardless of the scan hint
        match shared.scan() {
            Ok(_) => info!(
                "libusb controller found {} devices",
                shared.results.snapshot().len()
            ),
            Err(e) => warn!("Initial USB enumeration failed: {}", e),
        }

        let thread_shared = shared.clone();
        let thread = thread::Builder::new()
            .name("usb-scan".to_string())
            .spawn(move || run_scan_loop(thread_shared))?;

        Ok(Box::new(RusbController {
            shared,
            thread: Some(thread),
        }))
    }
}
