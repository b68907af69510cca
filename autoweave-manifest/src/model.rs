//! Typed manifest model.
//!
//! [`ManifestDocument`] is the syntactic stage: well-formed JSON with an
//! object at the top level, nothing more. [`PluginManifest`] is the semantic
//! stage produced by [`ManifestDocument::validate`] and is guaranteed to
//! satisfy every schema rule. Code downstream of the loader only ever sees
//! the validated form.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{validator, ManifestError};

/// Well-known manifest file name inside each plugin directory.
pub const MANIFEST_FILE_NAME: &str = "autoweave.plugin.json";

/// A parsed-but-unvalidated manifest document.
///
/// Holds the raw JSON tree so that validation can report precise field paths
/// and so the canonical signature input can be rebuilt byte-for-byte.
#[derive(Debug, Clone)]
pub struct ManifestDocument {
    root: Value,
}

impl ManifestDocument {
    /// Parse manifest bytes into a document.
    ///
    /// Only syntactic well-formedness is checked here; schema violations are
    /// the domain of [`validate`](Self::validate).
    pub fn parse(bytes: &[u8]) -> Result<Self, ManifestError> {
        let root: Value =
            serde_json::from_slice(bytes).map_err(|e| ManifestError::Malformed(e.to_string()))?;
        if !root.is_object() {
            return Err(ManifestError::Malformed(
                "top level must be a JSON object".into(),
            ));
        }
        Ok(Self { root })
    }

    /// Enforce the manifest schema and produce the validated form.
    ///
    /// `plugin_root` is the directory the manifest was discovered in; it is
    /// needed to check entry-path containment and filesystem-grant symlink
    /// freedom at validation time.
    pub fn validate(&self, plugin_root: &std::path::Path) -> Result<PluginManifest, ManifestError> {
        validator::validate(&self.root, plugin_root)
    }

    /// The raw JSON tree, used by signature canonicalization.
    pub fn raw(&self) -> &Value {
        &self.root
    }
}

/// A fully validated plugin manifest. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    /// Plugin identity, `^[a-z0-9-]{3,50}$`.
    pub name: String,
    /// Semver `MAJOR.MINOR.PATCH[-pre]`.
    pub version: String,
    pub description: String,
    pub author: AuthorRecord,
    /// Entry-point path, relative, resolving inside the plugin root.
    pub entry: String,
    pub permissions: PermissionsDecl,
    pub hooks: HooksDecl,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<DependencyConstraints>,
    pub signature: SignatureRecord,
}

impl PluginManifest {
    /// `name@version`, the human identity used in logs and lifecycle events.
    pub fn qualified_name(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorRecord {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// Declared permissions, the input to the permission evaluator.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionsDecl {
    #[serde(default)]
    pub filesystem: Vec<FilesystemGrant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkDecl>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usb: Option<UsbDecl>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryDecl>,
    #[serde(default)]
    pub queues: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilesystemGrant {
    /// Absolute, normalized path prefix.
    pub path_prefix: String,
    pub mode: AccessMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    Read,
    Write,
    ReadWrite,
}

impl AccessMode {
    /// Whether `self` is within what `granted` allows.
    pub fn permitted_by(self, granted: AccessMode) -> bool {
        match granted {
            AccessMode::ReadWrite => true,
            AccessMode::Read => self == AccessMode::Read,
            AccessMode::Write => self == AccessMode::Write,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkDecl {
    /// URL origins the plugin may connect out to. Exact match, no wildcards.
    #[serde(default)]
    pub outbound_allowlist: Vec<String>,
    /// Optional listening port, 1024..=65535.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inbound_port: Option<u16>,
    #[serde(default)]
    pub inbound_interface: InboundInterface,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InboundInterface {
    #[default]
    Localhost,
    All,
}

/// USB device filter. An empty set on either side matches nothing.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsbDecl {
    /// `0x`-prefixed 4-hex vendor ids.
    #[serde(default)]
    pub vendor_ids: Vec<String>,
    /// `0x`-prefixed 4-hex product ids.
    #[serde(default)]
    pub product_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryDecl {
    /// Heap ceiling in megabytes, 10..=1024.
    pub max_heap_mb: u32,
    /// Worker ceiling, 1..=8.
    pub max_workers: u32,
}

impl Default for MemoryDecl {
    fn default() -> Self {
        Self {
            max_heap_mb: 128,
            max_workers: 1,
        }
    }
}

/// Symbolic hook names resolved against the table the plugin entry publishes
/// at initialization. All hooks are optional.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HooksDecl {
    #[serde(default, rename = "onLoad", skip_serializing_if = "Option::is_none")]
    pub on_load: Option<String>,
    #[serde(default, rename = "onUnload", skip_serializing_if = "Option::is_none")]
    pub on_unload: Option<String>,
    #[serde(default, rename = "onUSBAttach", skip_serializing_if = "Option::is_none")]
    pub on_usb_attach: Option<String>,
    #[serde(default, rename = "onUSBDetach", skip_serializing_if = "Option::is_none")]
    pub on_usb_detach: Option<String>,
    #[serde(default, rename = "onJobReceived", skip_serializing_if = "Option::is_none")]
    pub on_job_received: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyConstraints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureRecord {
    /// Always `SHA-256`.
    pub algorithm: String,
    /// 64-hex content digest.
    pub value: String,
    /// Opaque provenance metadata; never interpreted by the core.
    pub signer: String,
}
