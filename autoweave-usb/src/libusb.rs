//! Primary monitoring source: libusb enumeration plus hot-plug callbacks.
//!
//! libusb calls block, so every operation is pushed onto the blocking pool
//! and the callback event loop runs on a dedicated OS thread. The callback
//! itself only forwards raw notifications onto the daemon channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusb::{Context, Device, Hotplug, HotplugBuilder, UsbContext};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use autoweave_bus::streams::{EventSource, UsbAction};

use crate::backend::{RawUsbNotification, StringDescriptors, UsbBackend};
use crate::UsbError;

/// Per-call timeout for control transfers while reading string descriptors.
/// The daemon applies the overall per-device bound on top of this.
const STRING_READ_TIMEOUT: Duration = Duration::from_millis(50);

pub struct LibusbBackend {
    context: Context,
    running: Arc<AtomicBool>,
    event_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
    // Dropping the registration unregisters the callback; it must live as
    // long as the event loop.
    registration: Mutex<Option<rusb::Registration<Context>>>,
}

impl LibusbBackend {
    pub fn new() -> Result<Self, UsbError> {
        let context =
            Context::new().map_err(|e| UsbError::SourceUnavailable(e.to_string()))?;
        Ok(Self {
            context,
            running: Arc::new(AtomicBool::new(false)),
            event_thread: Mutex::new(None),
            registration: Mutex::new(None),
        })
    }

    fn notification_for(device: &Device<Context>, action: UsbAction) -> Option<RawUsbNotification> {
        let descriptor = device.device_descriptor().ok()?;
        let port_path = match device.port_numbers() {
            Ok(ports) if !ports.is_empty() => {
                let chain: Vec<String> = ports.iter().map(|p| p.to_string()).collect();
                format!("{}-{}", device.bus_number(), chain.join("."))
            }
            _ => format!("{}-0", device.bus_number()),
        };
        Some(RawUsbNotification {
            action,
            vendor_id: descriptor.vendor_id(),
            product_id: descriptor.product_id(),
            bus_number: device.bus_number(),
            device_address: device.address(),
            port_path,
            descriptor: serde_json::json!({
                "bcdUSB": format!("{}", descriptor.usb_version()),
                "bDeviceClass": descriptor.class_code(),
                "bDeviceSubClass": descriptor.sub_class_code(),
                "bDeviceProtocol": descriptor.protocol_code(),
                "bMaxPacketSize0": descriptor.max_packet_size(),
                "idVendor": format!("0x{:04x}", descriptor.vendor_id()),
                "idProduct": format!("0x{:04x}", descriptor.product_id()),
                "bcdDevice": format!("{}", descriptor.device_version()),
                "bNumConfigurations": descriptor.num_configurations(),
            }),
        })
    }
}

struct CallbackForwarder {
    sink: mpsc::UnboundedSender<RawUsbNotification>,
}

impl Hotplug<Context> for CallbackForwarder {
    fn device_arrived(&mut self, device: Device<Context>) {
        if let Some(notification) = LibusbBackend::notification_for(&device, UsbAction::Attach) {
            let _ = self.sink.send(notification);
        }
    }

    fn device_left(&mut self, device: Device<Context>) {
        if let Some(notification) = LibusbBackend::notification_for(&device, UsbAction::Detach) {
            let _ = self.sink.send(notification);
        }
    }
}

#[async_trait]
impl UsbBackend for LibusbBackend {
    fn source(&self) -> EventSource {
        EventSource::Primary
    }

    async fn start(&self, sink: mpsc::UnboundedSender<RawUsbNotification>) -> Result<(), UsbError> {
        if !rusb::has_hotplug() {
            return Err(UsbError::SourceUnavailable(
                "libusb hotplug capability is not available on this platform".into(),
            ));
        }

        let registration = HotplugBuilder::new()
            .enumerate(false)
            .register(self.context.clone(), Box::new(CallbackForwarder { sink }))
            .map_err(|e| UsbError::SourceUnavailable(e.to_string()))?;
        *self.registration.lock() = Some(registration);

        self.running.store(true, Ordering::SeqCst);
        let running = Arc::clone(&self.running);
        let context = self.context.clone();
        let handle = std::thread::Builder::new()
            .name("usb-hotplug-events".into())
            .spawn(move || {
                while running.load(Ordering::SeqCst) {
                    if let Err(e) = context.handle_events(Some(Duration::from_millis(250))) {
                        warn!(error = %e, "libusb event loop error");
                        break;
                    }
                }
                debug!("libusb event loop stopped");
            })
            .map_err(|e| UsbError::SourceUnavailable(e.to_string()))?;
        *self.event_thread.lock() = Some(handle);
        Ok(())
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        *self.registration.lock() = None;
        let handle = self.event_thread.lock().take();
        if let Some(handle) = handle {
            let _ = tokio::task::spawn_blocking(move || {
                let _ = handle.join();
            })
            .await;
        }
    }

    async fn enumerate(&self) -> Result<Vec<RawUsbNotification>, UsbError> {
        let context = self.context.clone();
        tokio::task::spawn_blocking(move || {
            let devices = context
                .devices()
                .map_err(|e| UsbError::EnumerationFailed(e.to_string()))?;
            let mut notifications = Vec::new();
            for device in devices.iter() {
                if let Some(n) = LibusbBackend::notification_for(&device, UsbAction::Attach) {
                    notifications.push(n);
                }
            }
            Ok(notifications)
        })
        .await
        .map_err(|e| UsbError::EnumerationFailed(e.to_string()))?
    }

    async fn read_strings(
        &self,
        target: &RawUsbNotification,
    ) -> Result<StringDescriptors, UsbError> {
        let context = self.context.clone();
        let bus = target.bus_number;
        let address = target.device_address;
        tokio::task::spawn_blocking(move || {
            let devices = context
                .devices()
                .map_err(|e| UsbError::EnumerationFailed(e.to_string()))?;
            for device in devices.iter() {
                if device.bus_number() != bus || device.address() != address {
                    continue;
                }
                let descriptor = match device.device_descriptor() {
                    Ok(d) => d,
                    Err(_) => break,
                };
                let handle = match device.open() {
                    Ok(h) => h,
                    // The device may be gone or claimed; strings stay empty.
                    Err(_) => break,
                };
                let language = match handle.read_languages(STRING_READ_TIMEOUT) {
                    Ok(languages) => match languages.first() {
                        Some(l) => *l,
                        None => break,
                    },
                    Err(_) => break,
                };
                return Ok(StringDescriptors {
                    manufacturer: handle
                        .read_manufacturer_string(language, &descriptor, STRING_READ_TIMEOUT)
                        .ok(),
                    product: handle
                        .read_product_string(language, &descriptor, STRING_READ_TIMEOUT)
                        .ok(),
                    serial_number: handle
                        .read_serial_number_string(language, &descriptor, STRING_READ_TIMEOUT)
                        .ok(),
                });
            }
            Ok(StringDescriptors::default())
        })
        .await
        .map_err(|e| UsbError::SourceUnavailable(e.to_string()))?
    }
}
