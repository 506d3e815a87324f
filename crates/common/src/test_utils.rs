//! Test utilities for the virtual USB workspace
//!
//! Descriptor fixtures and helpers shared by the test suites of every crate.
//!
//! # Example
//!
//! ```
//! use common::test_utils::create_mock_device;
//! use protocol::Uid;
//!
//! let device = create_mock_device(1, 0x1234, 0x5678);
//! assert_eq!(device.vendor_id, 0x1234);
//! assert_eq!(device.uid, Uid(1));
//! ```

use protocol::types::{
    DESCRIPTOR_TYPE_CONFIG, DESCRIPTOR_TYPE_DEVICE, DESCRIPTOR_TYPE_ENDPOINT,
    DESCRIPTOR_TYPE_INTERFACE,
};
use protocol::{
    ConfigDescriptor, DeviceDescriptor, EndpointDescriptor, InterfaceDescriptor, Setup, Uid,
};
use std::future::Future;
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Build an endpoint descriptor
pub fn mock_endpoint(address: u8, attributes: u8, max_packet_size: u16) -> EndpointDescriptor {
    EndpointDescriptor {
        length: 7,
        descriptor_type: DESCRIPTOR_TYPE_ENDPOINT,
        address,
        attributes,
        max_packet_size,
        interval: if attributes & 0x03 == 0x03 { 10 } else { 0 },
        refresh: 0,
        synch_address: 0,
    }
}

/// Build an interface descriptor (alternate setting 0) around `endpoints`
pub fn mock_interface(
    number: u8,
    class: u8,
    subclass: u8,
    protocol: u8,
    endpoints: Vec<EndpointDescriptor>,
) -> InterfaceDescriptor {
    InterfaceDescriptor {
        length: 9,
        descriptor_type: DESCRIPTOR_TYPE_INTERFACE,
        interface_number: number,
        alternate_setting: 0,
        num_endpoints: endpoints.len() as u8,
        class,
        subclass,
        protocol,
        interface_index: 0,
        endpoints,
    }
}

/// Build configuration 1 holding `interfaces`
pub fn mock_config(interfaces: Vec<InterfaceDescriptor>) -> ConfigDescriptor {
    let total_length = 9 + interfaces
        .iter()
        .map(|i| 9 + 7 * i.endpoints.len())
        .sum::<usize>();
    ConfigDescriptor {
        length: 9,
        descriptor_type: DESCRIPTOR_TYPE_CONFIG,
        total_length: total_length as u16,
        num_interfaces: interfaces.len() as u8,
        configuration_value: 1,
        configuration_index: 0,
        attributes: 0x80,
        max_power: 50,
        extra: Vec::new(),
        interfaces,
    }
}

/// Create a mock device with one vendor-specific interface
///
/// The interface carries a bulk IN endpoint 0x81 and a bulk OUT endpoint
/// 0x02, enough to exercise the transfer paths.
pub fn create_mock_device(uid: u32, vendor_id: u16, product_id: u16) -> DeviceDescriptor {
    create_mock_device_with_class(
        uid,
        vendor_id,
        product_id,
        mock_config(vec![mock_interface(
            0,
            0xff,
            0x00,
            0x00,
            vec![mock_endpoint(0x81, 0x02, 512), mock_endpoint(0x02, 0x02, 512)],
        )]),
    )
}

fn create_mock_device_with_class(
    uid: u32,
    vendor_id: u16,
    product_id: u16,
    config: ConfigDescriptor,
) -> DeviceDescriptor {
    DeviceDescriptor {
        length: 18,
        descriptor_type: DESCRIPTOR_TYPE_DEVICE,
        usb_version: 0x0200,
        class: 0x00,
        subclass: 0x00,
        protocol: 0x00,
        max_packet_size0: 64,
        vendor_id,
        product_id,
        device_version: 0x0100,
        manufacturer_index: 1,
        product_index: 2,
        serial_number_index: 3,
        num_configurations: 1,
        uid: Uid(uid),
        configs: vec![config],
    }
}

/// Create a mock HID keyboard (boot interface, interrupt IN 0x81)
pub fn create_mock_hid_keyboard(uid: u32) -> DeviceDescriptor {
    create_mock_device_with_class(
        uid,
        0x046d,
        0xc312,
        mock_config(vec![mock_interface(
            0,
            0x03,
            0x01,
            0x01,
            vec![mock_endpoint(0x81, 0x03, 8)],
        )]),
    )
}

/// Create a mock mass storage device (SCSI, bulk-only transport)
pub fn create_mock_mass_storage_device(uid: u32) -> DeviceDescriptor {
    create_mock_device_with_class(
        uid,
        0x0781,
        0x5581,
        mock_config(vec![mock_interface(
            0,
            0x08,
            0x06,
            0x50,
            vec![mock_endpoint(0x81, 0x02, 512), mock_endpoint(0x02, 0x02, 512)],
        )]),
    )
}

/// Create a mock hub device
pub fn create_mock_hub_device(uid: u32) -> DeviceDescriptor {
    let mut hub = create_mock_device_with_class(
        uid,
        0x05e3,
        0x0608,
        mock_config(vec![mock_interface(
            0,
            0x09,
            0x00,
            0x00,
            vec![mock_endpoint(0x81, 0x03, 1)],
        )]),
    );
    hub.class = 0x09;
    hub
}

/// Create a list of distinct mock devices with Uids 1..=count
///
/// # Example
/// ```
/// use common::test_utils::create_mock_device_list;
///
/// let devices = create_mock_device_list(5);
/// assert_eq!(devices.len(), 5);
/// ```
pub fn create_mock_device_list(count: u32) -> Vec<DeviceDescriptor> {
    (1..=count)
        .map(|i| create_mock_device(i, 0x1000 + (i as u16), 0x2000 + (i as u16)))
        .collect()
}

/// Timeout wrapper for async tests
///
/// # Example
/// ```ignore
/// use common::test_utils::{with_timeout, DEFAULT_TEST_TIMEOUT};
///
/// #[tokio::test]
/// async fn test_with_timeout() {
///     let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await.unwrap();
///     assert_eq!(result, 42);
/// }
/// ```
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Poll `condition` until it holds or `timeout` elapses
///
/// For tests that wait on backend threads without an async runtime.
pub fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = std::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if std::time::Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}

/// Raw 18-byte device descriptor (GET_DESCRIPTOR Device) for 1234:5678
pub fn create_raw_device_descriptor() -> Vec<u8> {
    vec![
        0x12, // bLength
        0x01, // bDescriptorType (Device)
        0x00, 0x02, // bcdUSB (2.00)
        0x00, // bDeviceClass
        0x00, // bDeviceSubClass
        0x00, // bDeviceProtocol
        0x40, // bMaxPacketSize0 (64 bytes)
        0x34, 0x12, // idVendor (0x1234)
        0x78, 0x56, // idProduct (0x5678)
        0x00, 0x01, // bcdDevice (1.00)
        0x01, // iManufacturer
        0x02, // iProduct
        0x03, // iSerialNumber
        0x01, // bNumConfigurations
    ]
}

/// Raw configuration block with a class-specific descriptor before the
/// interface and a HID descriptor inside it
pub fn create_raw_config_descriptor() -> Vec<u8> {
    vec![
        // Configuration descriptor
        0x09, // bLength
        0x02, // bDescriptorType (Configuration)
        0x31, 0x00, // wTotalLength (49 bytes)
        0x01, // bNumInterfaces
        0x01, // bConfigurationValue
        0x00, // iConfiguration
        0x80, // bmAttributes (Bus-powered)
        0x32, // bMaxPower (100mA)
        // Interface association descriptor (kept as config extra)
        0x08, 0x0b, 0x00, 0x01, 0x03, 0x01, 0x01, 0x00,
        // Interface descriptor
        0x09, // bLength
        0x04, // bDescriptorType (Interface)
        0x00, // bInterfaceNumber
        0x00, // bAlternateSetting
        0x02, // bNumEndpoints
        0x03, // bInterfaceClass (HID)
        0x01, // bInterfaceSubClass (Boot)
        0x01, // bInterfaceProtocol (Keyboard)
        0x00, // iInterface
        // HID descriptor (skipped)
        0x09, 0x21, 0x11, 0x01, 0x00, 0x01, 0x22, 0x3f, 0x00,
        // Endpoint descriptor
        0x07, // bLength
        0x05, // bDescriptorType (Endpoint)
        0x81, // bEndpointAddress (EP1 IN)
        0x03, // bmAttributes (Interrupt)
        0x08, 0x00, // wMaxPacketSize (8 bytes)
        0x0a, // bInterval
        // Endpoint descriptor
        0x07, 0x05, 0x02, 0x02, 0x00, 0x02, 0x00,
    ]
}

/// Standard GET_DESCRIPTOR(Device) setup packet
pub fn get_device_descriptor_setup() -> Setup {
    Setup {
        request_type: 0x80,
        request: 0x06,
        value: 0x0100,
        index: 0,
        length: 18,
    }
}
