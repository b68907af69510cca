//! The monitoring-source seam: primary, fallback, and mock backends all
//! feed the same raw-notification channel and answer the same enumeration
//! and string-descriptor queries.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use autoweave_bus::streams::{EventSource, UsbAction};

use crate::UsbError;

/// One raw observation from a monitoring source, before the daemon
/// pipeline has deduplicated or enriched it.
#[derive(Debug, Clone, PartialEq)]
pub struct RawUsbNotification {
    pub action: UsbAction,
    pub vendor_id: u16,
    pub product_id: u16,
    pub bus_number: u8,
    pub device_address: u8,
    pub port_path: String,
    /// Structured descriptor fields known without opening the device.
    pub descriptor: serde_json::Value,
}

/// String descriptors read from an opened device.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StringDescriptors {
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
}

/// A source of USB notifications.
///
/// `start` is expected to deliver hot-plug observations onto `sink` until
/// `stop`; `enumerate` answers the currently-visible device set as attach
/// notifications. String reads may block in the OS and are bounded by the
/// daemon, not the backend.
#[async_trait]
pub trait UsbBackend: Send + Sync {
    fn source(&self) -> EventSource;

    async fn start(&self, sink: mpsc::UnboundedSender<RawUsbNotification>) -> Result<(), UsbError>;

    async fn stop(&self);

    async fn enumerate(&self) -> Result<Vec<RawUsbNotification>, UsbError>;

    async fn read_strings(
        &self,
        device: &RawUsbNotification,
    ) -> Result<StringDescriptors, UsbError>;
}

/// A scriptable device for the mock backend.
#[derive(Debug, Clone)]
pub struct MockDevice {
    pub vendor_id: u16,
    pub product_id: u16,
    pub bus_number: u8,
    pub device_address: u8,
    pub port_path: String,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
}

impl MockDevice {
    pub fn new(vendor_id: u16, product_id: u16, bus_number: u8, device_address: u8) -> Self {
        Self {
            vendor_id,
            product_id,
            bus_number,
            device_address,
            port_path: format!("{bus_number}-{device_address}"),
            manufacturer: None,
            product: None,
            serial_number: None,
        }
    }

    pub fn with_strings(mut self, manufacturer: &str, product: &str, serial: &str) -> Self {
        self.manufacturer = Some(manufacturer.to_string());
        self.product = Some(product.to_string());
        self.serial_number = Some(serial.to_string());
        self
    }

    fn notification(&self, action: UsbAction) -> RawUsbNotification {
        RawUsbNotification {
            action,
            vendor_id: self.vendor_id,
            product_id: self.product_id,
            bus_number: self.bus_number,
            device_address: self.device_address,
            port_path: self.port_path.clone(),
            descriptor: serde_json::json!({
                "idVendor": format!("0x{:04x}", self.vendor_id),
                "idProduct": format!("0x{:04x}", self.product_id),
            }),
        }
    }

    fn key(&self) -> (u8, u8) {
        (self.bus_number, self.device_address)
    }
}

/// Scriptable in-process backend for tests: `plug` and `unplug` push
/// notifications exactly like a hardware callback would.
pub struct MockBackend {
    source: EventSource,
    attached: Mutex<HashMap<(u8, u8), MockDevice>>,
    sink: Mutex<Option<mpsc::UnboundedSender<RawUsbNotification>>>,
    /// When set, `start` fails — used to drive fallback promotion.
    refuse_start: Mutex<bool>,
}

impl MockBackend {
    pub fn new(source: EventSource) -> Self {
        Self {
            source,
            attached: Mutex::new(HashMap::new()),
            sink: Mutex::new(None),
            refuse_start: Mutex::new(false),
        }
    }

    pub fn refuse_start(&self) {
        *self.refuse_start.lock() = true;
    }

    /// Pre-seed a device as already connected before the daemon starts, so
    /// it is only visible to enumeration.
    pub fn seed(&self, device: MockDevice) {
        self.attached.lock().insert(device.key(), device);
    }

    /// Simulate a physical attach.
    pub fn plug(&self, device: MockDevice) {
        let notification = device.notification(UsbAction::Attach);
        self.attached.lock().insert(device.key(), device);
        if let Some(sink) = self.sink.lock().as_ref() {
            let _ = sink.send(notification);
        }
    }

    /// Simulate a physical detach.
    pub fn unplug(&self, bus_number: u8, device_address: u8) {
        let removed = self.attached.lock().remove(&(bus_number, device_address));
        if let (Some(device), Some(sink)) = (removed, self.sink.lock().as_ref()) {
            let _ = sink.send(device.notification(UsbAction::Detach));
        }
    }

    /// Re-send an attach notification for an already-connected device,
    /// mimicking hardware bounce.
    pub fn bounce(&self, bus_number: u8, device_address: u8) {
        let attached = self.attached.lock();
        if let (Some(device), Some(sink)) =
            (attached.get(&(bus_number, device_address)), self.sink.lock().as_ref())
        {
            let _ = sink.send(device.notification(UsbAction::Attach));
        }
    }

    /// Inject an arbitrary raw notification, bypassing the attached-set
    /// bookkeeping. Lets tests exercise inconsistent hardware sequences.
    pub fn send_raw(&self, notification: RawUsbNotification) {
        if let Some(sink) = self.sink.lock().as_ref() {
            let _ = sink.send(notification);
        }
    }
}

#[async_trait]
impl UsbBackend for MockBackend {
    fn source(&self) -> EventSource {
        self.source
    }

    async fn start(&self, sink: mpsc::UnboundedSender<RawUsbNotification>) -> Result<(), UsbError> {
        if *self.refuse_start.lock() {
            return Err(UsbError::SourceUnavailable("mock backend refused".into()));
        }
        *self.sink.lock() = Some(sink);
        Ok(())
    }

    async fn stop(&self) {
        *self.sink.lock() = None;
    }

    async fn enumerate(&self) -> Result<Vec<RawUsbNotification>, UsbError> {
        Ok(self
            .attached
            .lock()
            .values()
            .map(|d| d.notification(UsbAction::Attach))
            .collect())
    }

    async fn read_strings(
        &self,
        device: &RawUsbNotification,
    ) -> Result<StringDescriptors, UsbError> {
        let attached = self.attached.lock();
        let found = attached.get(&(device.bus_number, device.device_address));
        Ok(found
            .map(|d| StringDescriptors {
                manufacturer: d.manufacturer.clone(),
                product: d.product.clone(),
                serial_number: d.serial_number.clone(),
            })
            .unwrap_or_default())
    }
}
