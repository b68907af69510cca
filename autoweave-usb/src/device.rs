//! Device identity and the live-index record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use autoweave_bus::streams::{EventSource, HotplugRecord, UsbAction};

/// Stable 16-hex device signature derived from
/// `SHA-256("vendorId:productId:busNumber:deviceAddress")`, truncated.
///
/// The signature is the key of the live-device index: two physical events
/// with the same signature inside the debounce window collapse to one, and
/// the same device yields the same signature across daemon restarts.
pub fn device_signature(vendor_id: u16, product_id: u16, bus_number: u8, device_address: u8) -> String {
    let input = format!("{vendor_id:04x}:{product_id:04x}:{bus_number}:{device_address}");
    let digest = Sha256::digest(input.as_bytes());
    let mut out = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Snapshot of one connected device, held in the live index from attach to
/// detach.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsbDeviceInfo {
    pub signature: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub bus_number: u8,
    pub device_address: u8,
    pub port_path: String,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
    /// Opaque structured descriptor blob, passed through to the wire.
    pub descriptor: serde_json::Value,
    pub first_seen_at: DateTime<Utc>,
}

impl UsbDeviceInfo {
    /// Build the wire record for this device at event time.
    pub fn to_record(&self, action: UsbAction, source: EventSource) -> HotplugRecord {
        HotplugRecord {
            source,
            action,
            vendor_id: self.vendor_id,
            product_id: self.product_id,
            device_signature: self.signature.clone(),
            manufacturer: self.manufacturer.clone().unwrap_or_default(),
            product: self.product.clone().unwrap_or_default(),
            serial_number: self.serial_number.clone().unwrap_or_default(),
            bus_number: self.bus_number,
            device_address: self.device_address,
            port_path: self.port_path.clone(),
            timestamp: Utc::now().timestamp_millis(),
            device_descriptor: self.descriptor.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_16_hex_and_deterministic() {
        let a = device_signature(0x04a9, 0x220e, 1, 5);
        let b = device_signature(0x04a9, 0x220e, 1, 5);
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn signature_distinguishes_address() {
        let a = device_signature(0x04a9, 0x220e, 1, 5);
        let b = device_signature(0x04a9, 0x220e, 1, 6);
        assert_ne!(a, b);
    }
}
