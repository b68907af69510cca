//! The closed permission record and the capability request sum type.

use std::collections::HashSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use autoweave_manifest::PermissionsDecl;

pub use autoweave_manifest::{AccessMode, InboundInterface};

/// The closed record derived from `manifest.permissions`. The sole
/// authority on what a plugin may do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionSet {
    /// Ordered filesystem grants; the longest matching prefix wins.
    pub filesystem: Vec<FilesystemPermission>,
    pub network: NetworkPermissions,
    pub usb: UsbPermissions,
    pub memory: MemoryPermissions,
    /// Kebab-case queue names the plugin may publish to and consume from.
    pub queues: HashSet<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilesystemPermission {
    pub prefix: PathBuf,
    pub mode: AccessMode,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NetworkPermissions {
    /// Exact-match outbound origins (scheme + host + port).
    pub outbound: HashSet<Origin>,
    pub inbound_port: Option<u16>,
    pub inbound_interface: InboundInterface,
}

/// A normalized URL origin. Default ports are filled in from the scheme so
/// `https://api.example.com` and `https://api.example.com:443` compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Origin {
    pub scheme: String,
    pub host: String,
    pub port: Option<u16>,
}

impl Origin {
    /// Parse an origin from a URL string, dropping path/query/fragment.
    pub fn parse(raw: &str) -> Option<Self> {
        let url = url::Url::parse(raw).ok()?;
        let host = url.host_str()?.to_ascii_lowercase();
        Some(Self {
            scheme: url.scheme().to_ascii_lowercase(),
            host,
            port: url.port_or_known_default(),
        })
    }
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}://{}:{}", self.scheme, self.host, port),
            None => write!(f, "{}://{}", self.scheme, self.host),
        }
    }
}

/// USB filter sets. Empty on either side means "no match"; both empty means
/// the plugin has no USB access at all.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UsbPermissions {
    pub vendor_ids: HashSet<u16>,
    pub product_ids: HashSet<u16>,
}

impl UsbPermissions {
    /// The membership test used by both the router filter and `usb.open`.
    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_ids.contains(&vendor_id) && self.product_ids.contains(&product_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryPermissions {
    pub max_heap_mb: u32,
    pub max_workers: u32,
}

impl MemoryPermissions {
    /// The heap ceiling in bytes: `maxHeapMB * 10^6`.
    pub fn heap_limit_bytes(&self) -> u64 {
        self.max_heap_mb as u64 * 1_000_000
    }
}

impl PermissionSet {
    /// Build the concrete permission set from declared manifest permissions.
    ///
    /// Manifest validation has already run, so malformed ids or origins are
    /// a programming error here and are skipped defensively rather than
    /// panicking.
    pub fn from_declaration(decl: &PermissionsDecl) -> Self {
        let filesystem = decl
            .filesystem
            .iter()
            .map(|grant| FilesystemPermission {
                prefix: PathBuf::from(&grant.path_prefix),
                mode: grant.mode,
            })
            .collect();

        let network = decl
            .network
            .as_ref()
            .map(|net| NetworkPermissions {
                outbound: net
                    .outbound_allowlist
                    .iter()
                    .filter_map(|raw| Origin::parse(raw))
                    .collect(),
                inbound_port: net.inbound_port,
                inbound_interface: net.inbound_interface,
            })
            .unwrap_or_default();

        let usb = decl
            .usb
            .as_ref()
            .map(|usb| UsbPermissions {
                vendor_ids: usb.vendor_ids.iter().filter_map(|id| parse_usb_id(id)).collect(),
                product_ids: usb.product_ids.iter().filter_map(|id| parse_usb_id(id)).collect(),
            })
            .unwrap_or_default();

        let memory_decl = decl.memory.clone().unwrap_or_default();
        let memory = MemoryPermissions {
            max_heap_mb: memory_decl.max_heap_mb,
            max_workers: memory_decl.max_workers,
        };

        Self {
            filesystem,
            network,
            usb,
            memory,
            queues: decl.queues.iter().cloned().collect(),
        }
    }
}

fn parse_usb_id(raw: &str) -> Option<u16> {
    u16::from_str_radix(raw.strip_prefix("0x")?, 16).ok()
}

/// Exhaustive set of privileged operations a plugin can request from the
/// host. Every host-call resolves to exactly one of these before anything
/// privileged happens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapabilityRequest {
    Fs { path: PathBuf, mode: AccessMode },
    NetOut { origin: String },
    NetIn { port: u16, interface: InboundInterface },
    UsbOpen { vendor_id: u16, product_id: u16 },
    QueuePublish { queue: String },
    QueueConsume { queue: String },
    MemoryAlloc { bytes: u64 },
    WorkerSpawn,
}
