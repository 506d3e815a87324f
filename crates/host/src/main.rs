//! vusb-monitor
//!
//! Watches USB devices through the virtual USB subsystem and the libusb
//! backend. Prints device list changes as they are published and can open a
//! device to read its device descriptor with a control transfer.

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use common::setup_logging;
use host::UsbConfig;
use host::usb::backend::RusbControllerFactory;
use host::usb::{
    Completion, Device, DeviceChangeClient, DeviceClient, DeviceListChange, Registry, UserData,
};
use protocol::{DeviceDescriptor, Setup};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

/// How often the consumer pump runs
const PUMP_INTERVAL: Duration = Duration::from_millis(20);

/// GET_DESCRIPTOR(Device) request
const GET_DEVICE_DESCRIPTOR: Setup = Setup {
    request_type: 0x80,
    request: 0x06,
    value: 0x0100,
    index: 0,
    length: 18,
};

#[derive(Parser, Debug)]
#[command(name = "vusb-monitor")]
#[command(
    author,
    version,
    about = "Virtual USB monitor - watch and probe host USB devices"
)]
#[command(long_about = "
Enumerates host USB devices through the virtual USB subsystem and prints
arrivals and departures until interrupted.

EXAMPLES:
    # Watch devices with the default configuration
    vusb-monitor

    # List devices once and exit
    vusb-monitor --list-devices

    # Open a device and read its device descriptor
    vusb-monitor --open 046d:c312

    # Run with debug logging
    vusb-monitor --log-level debug

CONFIGURATION:
    The configuration is looked up in the following order:
    1. Path specified with --config
    2. ~/.config/vusb/usb.toml
    3. /etc/vusb/usb.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List USB devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Open the first device matching VID:PID (hex) and read its device descriptor
    #[arg(long, value_name = "VID:PID")]
    open: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = UsbConfig::default();
        let path = UsbConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        UsbConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        UsbConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.log_level.clone());
    setup_logging(&log_level).context("Failed to setup logging")?;

    info!("vusb-monitor v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    let target = args.open.as_deref().map(parse_vid_pid).transpose()?;

    let registry = Registry::new(Arc::new(RusbControllerFactory), config);
    if !registry.ref_interface() {
        registry.reset_interface();
        bail!("USB backend '{}' is unavailable", registry.backend_name());
    }

    let result = if args.list_devices {
        list_devices(&registry);
        Ok(())
    } else {
        monitor(&registry, target).await
    };

    registry.reset_interface();
    registry.shutdown();
    info!("Monitor shutdown complete");
    result
}

/// Parse `VID:PID` with hexadecimal ids, `0x` prefixes allowed
fn parse_vid_pid(value: &str) -> Result<(u16, u16)> {
    let (vid, pid) = value
        .split_once(':')
        .ok_or_else(|| anyhow!("Expected VID:PID, got '{}'", value))?;

    let parse = |id: &str| {
        let id = id.trim();
        let id = id.strip_prefix("0x").unwrap_or(id);
        u16::from_str_radix(id, 16).with_context(|| format!("Invalid USB id '{}'", id))
    };

    Ok((parse(vid)?, parse(pid)?))
}

fn describe(device: &DeviceDescriptor) -> String {
    format!(
        "[{}] {:04x}:{:04x} class {:#04x}, USB {:x}.{:02x}, {} configuration(s)",
        device.uid,
        device.vendor_id,
        device.product_id,
        device.class,
        device.usb_version >> 8,
        device.usb_version & 0xff,
        device.num_configurations
    )
}

fn list_devices(registry: &Registry) {
    let devices = registry.get_device_list();
    if devices.is_empty() {
        println!("No USB devices found.");
        return;
    }

    println!("Found {} USB device(s):\n", devices.len());
    for device in &devices {
        println!("  {}", describe(device));
        for config in &device.configs {
            println!(
                "      Configuration {}: {} interface(s), {} mA",
                config.configuration_value,
                config.num_interfaces,
                u16::from(config.max_power) * 2
            );
        }
    }
}

/// Prints device list changes
struct ChangePrinter;

impl DeviceChangeClient for ChangePrinter {
    fn devices_changed(&self, change: &DeviceListChange) {
        for device in &change.removed {
            println!("- {}", describe(device));
        }
        for device in &change.added {
            println!("+ {}", describe(device));
        }
        println!("  {} device(s) present", change.devices.len());
    }
}

/// Prints completions of the requests the monitor issues
struct CompletionPrinter;

impl DeviceClient for CompletionPrinter {
    fn request_complete(&self, completion: Completion) {
        if !completion.status.is_success() {
            warn!(
                "Request {} on endpoint {:#04x} finished with {:?}",
                completion.user_data.as_u64(),
                completion.endpoint,
                completion.status
            );
            return;
        }

        let data = &completion.data[..completion.actual_length.min(completion.data.len())];
        println!("Device descriptor ({} bytes): {:02x?}", data.len(), data);
        if data.len() >= 12 {
            println!(
                "  bcdUSB {:04x}, idVendor {:04x}, idProduct {:04x}",
                u16::from_le_bytes([data[2], data[3]]),
                u16::from_le_bytes([data[8], data[9]]),
                u16::from_le_bytes([data[10], data[11]])
            );
        }
    }
}

fn open_target(registry: &Registry, vendor_id: u16, product_id: u16) -> Option<Device> {
    let (uid, device) = registry.open_vid_pid(vendor_id, product_id, Arc::new(CompletionPrinter));
    let Some(uid) = uid else {
        warn!("No device {:04x}:{:04x} present", vendor_id, product_id);
        return None;
    };
    let Some(device) = device else {
        error!("Failed to open device {} ({:04x}:{:04x})", uid, vendor_id, product_id);
        return None;
    };

    info!("Opened device {} ({:04x}:{:04x})", uid, vendor_id, product_id);
    if let Err(e) = device.control_request(GET_DEVICE_DESCRIPTOR, Vec::new(), UserData::from_u64(1)) {
        error!("Failed to read device descriptor of {}: {}", uid, e);
    }
    Some(device)
}

async fn monitor(registry: &Registry, target: Option<(u16, u16)>) -> Result<()> {
    let subscription = registry.register_device_change_client(Arc::new(ChangePrinter));

    list_devices(registry);
    let device = target.and_then(|(vid, pid)| open_target(registry, vid, pid));

    info!("Press Ctrl+C to exit");
    let mut interval = tokio::time::interval(PUMP_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let result = loop {
        tokio::select! {
            _ = interval.tick() => {
                registry.pump();
            }
            received = signal::ctrl_c() => {
                match &received {
                    Ok(()) => info!("Received Ctrl+C, shutting down..."),
                    Err(e) => error!("Error waiting for Ctrl+C: {}", e),
                }
                break received.context("Failed to wait for Ctrl+C");
            }
        }
    };

    if let Some(device) = device {
        device.close();
    }
    registry.deregister_device_change_client(subscription);
    result
}
