//! Fallback monitoring source: sysfs polling.
//!
//! When the libusb hotplug capability is unavailable the daemon promotes
//! this source. It diffs `/sys/bus/usb/devices` on an interval and
//! synthesizes attach/detach notifications from the delta. Coarser than
//! the callback source, but it keeps events flowing on hosts where the
//! primary is unusable.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use autoweave_bus::streams::{EventSource, UsbAction};

use crate::backend::{RawUsbNotification, StringDescriptors, UsbBackend};
use crate::UsbError;

const SYSFS_USB_ROOT: &str = "/sys/bus/usb/devices";

#[derive(Debug, Clone, PartialEq)]
struct SysfsDevice {
    vendor_id: u16,
    product_id: u16,
    bus_number: u8,
    device_address: u8,
    port_path: String,
    manufacturer: Option<String>,
    product: Option<String>,
    serial_number: Option<String>,
}

impl SysfsDevice {
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
}

pub struct SysfsBackend {
    root: PathBuf,
    poll_interval: Duration,
    running: Arc<AtomicBool>,
    poller: Mutex<Option<JoinHandle<()>>>,
    /// Last observed device set, keyed by (bus, address).
    snapshot: Arc<Mutex<HashMap<(u8, u8), SysfsDevice>>>,
}

impl SysfsBackend {
    pub fn new(poll_interval: Duration) -> Self {
        Self::with_root(PathBuf::from(SYSFS_USB_ROOT), poll_interval)
    }

    /// Test seam: point the poller at a fake sysfs tree.
    pub fn with_root(root: PathBuf, poll_interval: Duration) -> Self {
        Self {
            root,
            poll_interval,
            running: Arc::new(AtomicBool::new(false)),
            poller: Mutex::new(None),
            snapshot: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn scan(root: &Path) -> Result<HashMap<(u8, u8), SysfsDevice>, UsbError> {
        let mut devices = HashMap::new();
        let entries = std::fs::read_dir(root)
            .map_err(|e| UsbError::EnumerationFailed(format!("{}: {e}", root.display())))?;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            // Interface nodes contain ':'; root hubs start with "usb".
            if name.contains(':') {
                continue;
            }
            let dir = entry.path();
            let Some(device) = Self::read_device(&dir, &name) else {
                continue;
            };
            devices.insert((device.bus_number, device.device_address), device);
        }
        Ok(devices)
    }

    fn read_device(dir: &Path, port_name: &str) -> Option<SysfsDevice> {
        let vendor_id = read_hex16(&dir.join("idVendor"))?;
        let product_id = read_hex16(&dir.join("idProduct"))?;
        let bus_number = read_decimal(&dir.join("busnum"))?;
        let device_address = read_decimal(&dir.join("devnum"))?;
        Some(SysfsDevice {
            vendor_id,
            product_id,
            bus_number,
            device_address,
            port_path: port_name.to_string(),
            manufacturer: read_string(&dir.join("manufacturer")),
            product: read_string(&dir.join("product")),
            serial_number: read_string(&dir.join("serial")),
        })
    }
}

fn read_string(path: &Path) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn read_hex16(path: &Path) -> Option<u16> {
    u16::from_str_radix(read_string(path)?.as_str(), 16).ok()
}

fn read_decimal(path: &Path) -> Option<u8> {
    read_string(path)?.parse().ok()
}

#[async_trait]
impl UsbBackend for SysfsBackend {
    fn source(&self) -> EventSource {
        EventSource::Fallback
    }

    async fn start(&self, sink: mpsc::UnboundedSender<RawUsbNotification>) -> Result<(), UsbError> {
        // Fail fast if the tree is unreadable; better than a silent poller.
        let initial = {
            let root = self.root.clone();
            tokio::task::spawn_blocking(move || SysfsBackend::scan(&root))
                .await
                .map_err(|e| UsbError::SourceUnavailable(e.to_string()))??
        };
        *self.snapshot.lock() = initial;

        self.running.store(true, Ordering::SeqCst);
        let running = Arc::clone(&self.running);
        let snapshot = Arc::clone(&self.snapshot);
        let root = self.root.clone();
        let interval = self.poll_interval;

        let handle = tokio::spawn(async move {
            while running.load(Ordering::SeqCst) {
                tokio::time::sleep(interval).await;
                let scan_root = root.clone();
                let current =
                    match tokio::task::spawn_blocking(move || SysfsBackend::scan(&scan_root)).await
                    {
                        Ok(Ok(devices)) => devices,
                        Ok(Err(e)) => {
                            warn!(error = %e, "sysfs poll failed");
                            continue;
                        }
                        Err(e) => {
                            warn!(error = %e, "sysfs poll task failed");
                            continue;
                        }
                    };

                let mut previous = snapshot.lock();
                for (key, device) in &current {
                    if !previous.contains_key(key) {
                        let _ = sink.send(device.notification(UsbAction::Attach));
                    }
                }
                for (key, device) in previous.iter() {
                    if !current.contains_key(key) {
                        let _ = sink.send(device.notification(UsbAction::Detach));
                    }
                }
                *previous = current;
            }
            debug!("sysfs poller stopped");
        });
        *self.poller.lock() = Some(handle);
        Ok(())
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handle = self.poller.lock().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
    }

    async fn enumerate(&self) -> Result<Vec<RawUsbNotification>, UsbError> {
        let root = self.root.clone();
        let devices = tokio::task::spawn_blocking(move || SysfsBackend::scan(&root))
            .await
            .map_err(|e| UsbError::EnumerationFailed(e.to_string()))??;
        Ok(devices
            .values()
            .map(|d| d.notification(UsbAction::Attach))
            .collect())
    }

    async fn read_strings(
        &self,
        device: &RawUsbNotification,
    ) -> Result<StringDescriptors, UsbError> {
        let snapshot = self.snapshot.lock();
        let found = snapshot.get(&(device.bus_number, device.device_address));
        Ok(found
            .map(|d| StringDescriptors {
                manufacturer: d.manufacturer.clone(),
                product: d.product.clone(),
                serial_number: d.serial_number.clone(),
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_device(root: &Path, name: &str, vendor: &str, product: &str, bus: u8, addr: u8) {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("idVendor"), vendor).unwrap();
        fs::write(dir.join("idProduct"), product).unwrap();
        fs::write(dir.join("busnum"), bus.to_string()).unwrap();
        fs::write(dir.join("devnum"), addr.to_string()).unwrap();
        fs::write(dir.join("manufacturer"), "Canon\n").unwrap();
    }

    #[test]
    fn scan_reads_devices_and_skips_interfaces() {
        let dir = tempfile::tempdir().unwrap();
        write_device(dir.path(), "1-1.4", "04a9", "220e", 1, 5);
        fs::create_dir_all(dir.path().join("1-1.4:1.0")).unwrap();

        let devices = SysfsBackend::scan(dir.path()).unwrap();
        assert_eq!(devices.len(), 1);
        let device = &devices[&(1, 5)];
        assert_eq!(device.vendor_id, 0x04a9);
        assert_eq!(device.product_id, 0x220e);
        assert_eq!(device.port_path, "1-1.4");
        assert_eq!(device.manufacturer.as_deref(), Some("Canon"));
    }

    #[test]
    fn nodes_without_ids_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("usb1")).unwrap();
        let devices = SysfsBackend::scan(dir.path()).unwrap();
        assert!(devices.is_empty());
    }
}
