//! Wire formats for the streams the core publishes and consumes.
//!
//! Every field is a string on the wire. The hotplug record carries a full
//! snapshot of the device at event time; the plugin record carries
//! lifecycle transitions emitted by the loader.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::BusError;

/// Default stream carrying USB attach/detach events.
pub const HOTPLUG_STREAM: &str = "aw:hotplug";

/// Default stream carrying plugin lifecycle events.
pub const PLUGIN_STREAM: &str = "aw:plugin";

/// Stream name for a named job queue. The job queue itself is an external
/// collaborator; the core only routes permitted publishes and deliveries.
pub fn queue_stream(queue: &str) -> String {
    format!("aw:queue:{queue}")
}

/// Which monitoring source observed the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    Primary,
    Fallback,
}

impl EventSource {
    pub fn as_str(self) -> &'static str {
        match self {
            EventSource::Primary => "primary",
            EventSource::Fallback => "fallback",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsbAction {
    Attach,
    Detach,
}

impl UsbAction {
    pub fn as_str(self) -> &'static str {
        match self {
            UsbAction::Attach => "attach",
            UsbAction::Detach => "detach",
        }
    }
}

/// One `aw:hotplug` entry.
#[derive(Debug, Clone, PartialEq)]
pub struct HotplugRecord {
    pub source: EventSource,
    pub action: UsbAction,
    /// 4-hex, lowercase.
    pub vendor_id: u16,
    /// 4-hex, lowercase.
    pub product_id: u16,
    /// Stable 16-hex device signature.
    pub device_signature: String,
    pub manufacturer: String,
    pub product: String,
    pub serial_number: String,
    pub bus_number: u8,
    pub device_address: u8,
    pub port_path: String,
    /// Decimal milliseconds since epoch.
    pub timestamp: i64,
    /// Opaque structured descriptor blob.
    pub device_descriptor: serde_json::Value,
}

impl HotplugRecord {
    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            ("source".into(), self.source.as_str().into()),
            ("action".into(), self.action.as_str().into()),
            ("vendor_id".into(), format!("{:04x}", self.vendor_id)),
            ("product_id".into(), format!("{:04x}", self.product_id)),
            ("device_signature".into(), self.device_signature.clone()),
            ("manufacturer".into(), self.manufacturer.clone()),
            ("product".into(), self.product.clone()),
            ("serial_number".into(), self.serial_number.clone()),
            ("bus_number".into(), self.bus_number.to_string()),
            ("device_address".into(), self.device_address.to_string()),
            ("port_path".into(), self.port_path.clone()),
            ("timestamp".into(), self.timestamp.to_string()),
            (
                "device_descriptor".into(),
                self.device_descriptor.to_string(),
            ),
        ]
    }

    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self, BusError> {
        let get = |key: &str| {
            fields
                .get(key)
                .cloned()
                .ok_or_else(|| BusError::Protocol(format!("hotplug record missing `{key}`")))
        };
        let source = match get("source")?.as_str() {
            "primary" => EventSource::Primary,
            "fallback" => EventSource::Fallback,
            other => {
                return Err(BusError::Protocol(format!("unknown source `{other}`")));
            }
        };
        let action = match get("action")?.as_str() {
            "attach" => UsbAction::Attach,
            "detach" => UsbAction::Detach,
            other => {
                return Err(BusError::Protocol(format!("unknown action `{other}`")));
            }
        };
        let parse_hex16 = |key: &str| -> Result<u16, BusError> {
            let raw = get(key)?;
            u16::from_str_radix(&raw, 16)
                .map_err(|_| BusError::Protocol(format!("`{key}` is not 4-hex: `{raw}`")))
        };
        let parse_num = |key: &str| -> Result<u8, BusError> {
            let raw = get(key)?;
            raw.parse()
                .map_err(|_| BusError::Protocol(format!("`{key}` is not numeric: `{raw}`")))
        };
        let descriptor_raw = get("device_descriptor")?;
        Ok(Self {
            source,
            action,
            vendor_id: parse_hex16("vendor_id")?,
            product_id: parse_hex16("product_id")?,
            device_signature: get("device_signature")?,
            manufacturer: get("manufacturer")?,
            product: get("product")?,
            serial_number: get("serial_number")?,
            bus_number: parse_num("bus_number")?,
            device_address: parse_num("device_address")?,
            port_path: get("port_path")?,
            timestamp: get("timestamp")?
                .parse()
                .map_err(|_| BusError::Protocol("`timestamp` is not numeric".into()))?,
            device_descriptor: serde_json::from_str(&descriptor_raw)
                .map_err(|e| BusError::Protocol(format!("bad descriptor blob: {e}")))?,
        })
    }
}

/// Lifecycle kinds emitted on `aw:plugin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleKind {
    Loaded,
    Unloaded,
    Failed,
}

impl LifecycleKind {
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleKind::Loaded => "loaded",
            LifecycleKind::Unloaded => "unloaded",
            LifecycleKind::Failed => "failed",
        }
    }
}

/// One `aw:plugin` entry.
#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleRecord {
    pub kind: LifecycleKind,
    pub name: String,
    pub version: String,
    pub instance_id: String,
    /// Present on `failed` and forced `unloaded`.
    pub reason: Option<String>,
    /// Present on `unloaded` when the worker had to be force-terminated.
    pub forced: Option<bool>,
}

impl LifecycleRecord {
    pub fn loaded(name: &str, version: &str, instance_id: &str) -> Self {
        Self {
            kind: LifecycleKind::Loaded,
            name: name.into(),
            version: version.into(),
            instance_id: instance_id.into(),
            reason: None,
            forced: None,
        }
    }

    pub fn unloaded(name: &str, version: &str, instance_id: &str, forced: bool) -> Self {
        Self {
            kind: LifecycleKind::Unloaded,
            name: name.into(),
            version: version.into(),
            instance_id: instance_id.into(),
            reason: None,
            forced: Some(forced),
        }
    }

    pub fn failed(name: &str, version: &str, instance_id: &str, reason: &str) -> Self {
        Self {
            kind: LifecycleKind::Failed,
            name: name.into(),
            version: version.into(),
            instance_id: instance_id.into(),
            reason: Some(reason.into()),
            forced: None,
        }
    }

    pub fn to_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            ("kind".into(), self.kind.as_str().to_string()),
            ("name".into(), self.name.clone()),
            ("version".into(), self.version.clone()),
            ("instance_id".into(), self.instance_id.clone()),
        ];
        if let Some(reason) = &self.reason {
            fields.push(("reason".into(), reason.clone()));
        }
        if let Some(forced) = self.forced {
            fields.push(("forced".into(), forced.to_string()));
        }
        fields
    }

    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self, BusError> {
        let get = |key: &str| {
            fields
                .get(key)
                .cloned()
                .ok_or_else(|| BusError::Protocol(format!("lifecycle record missing `{key}`")))
        };
        let kind = match get("kind")?.as_str() {
            "loaded" => LifecycleKind::Loaded,
            "unloaded" => LifecycleKind::Unloaded,
            "failed" => LifecycleKind::Failed,
            other => {
                return Err(BusError::Protocol(format!("unknown lifecycle kind `{other}`")));
            }
        };
        Ok(Self {
            kind,
            name: get("name")?,
            version: get("version")?,
            instance_id: get("instance_id")?,
            reason: fields.get("reason").cloned(),
            forced: fields.get("forced").map(|f| f == "true"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> HotplugRecord {
        HotplugRecord {
            source: EventSource::Primary,
            action: UsbAction::Attach,
            vendor_id: 0x04a9,
            product_id: 0x220e,
            device_signature: "0123456789abcdef".into(),
            manufacturer: "Canon".into(),
            product: "CanoScan".into(),
            serial_number: String::new(),
            bus_number: 1,
            device_address: 5,
            port_path: "1-1.4".into(),
            timestamp: 1722500000123,
            device_descriptor: serde_json::json!({ "bcdUSB": "0x0200", "bMaxPacketSize0": 64 }),
        }
    }

    #[test]
    fn hotplug_fields_round_trip() {
        let rec = record();
        let fields: HashMap<String, String> = rec.to_fields().into_iter().collect();
        assert_eq!(fields["vendor_id"], "04a9");
        assert_eq!(fields["action"], "attach");
        let back = HotplugRecord::from_fields(&fields).unwrap();
        assert_eq!(back, rec);
    }

    #[test]
    fn missing_field_is_protocol_error() {
        let mut fields: HashMap<String, String> = record().to_fields().into_iter().collect();
        fields.remove("device_signature");
        assert!(matches!(
            HotplugRecord::from_fields(&fields),
            Err(BusError::Protocol(_))
        ));
    }

    #[test]
    fn lifecycle_fields_round_trip() {
        let rec = LifecycleRecord::unloaded("usb-scanner-plugin", "1.0.0", "i-1", true);
        let fields: HashMap<String, String> = rec.to_fields().into_iter().collect();
        assert_eq!(fields["kind"], "unloaded");
        assert_eq!(fields["forced"], "true");
        let back = LifecycleRecord::from_fields(&fields).unwrap();
        assert_eq!(back, rec);
    }
}
