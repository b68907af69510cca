//! Bit-for-bit schema enforcement for manifest documents.
//!
//! The walk is two-phased: first the JSON tree is checked structurally
//! (required keys present, unknown keys rejected at every level) so that
//! errors carry the exact field path, then the typed manifest is built and
//! every field is checked against its pattern or range.

use std::path::{Component, Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::model::{PluginManifest, SignatureRecord};
use crate::ManifestError;

/// Plugin name pattern.
pub static NAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9-]{3,50}$").expect("name pattern"));

/// Semver `MAJOR.MINOR.PATCH` with an optional pre-release tag.
pub static VERSION_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(0|[1-9]\d*)\.(0|[1-9]\d*)\.(0|[1-9]\d*)(-[0-9A-Za-z][0-9A-Za-z.-]*)?$")
        .expect("version pattern")
});

/// `0x`-prefixed 4-hex USB vendor/product id.
pub static USB_ID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^0x[0-9a-fA-F]{4}$").expect("usb id pattern"));

/// Hook names must be plain identifiers.
pub static HOOK_NAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("hook name pattern"));

static HEX64_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9a-fA-F]{64}$").expect("hex64 pattern"));

const TOP_REQUIRED: &[&str] = &[
    "name",
    "version",
    "description",
    "author",
    "entry",
    "permissions",
    "hooks",
    "signature",
];
const TOP_OPTIONAL: &[&str] = &["dependencies"];
const AUTHOR_KEYS: (&[&str], &[&str]) = (&["name"], &["email"]);
const PERMISSION_KEYS: (&[&str], &[&str]) =
    (&[], &["filesystem", "network", "usb", "memory", "queues"]);
const FILESYSTEM_KEYS: (&[&str], &[&str]) = (&["pathPrefix", "mode"], &[]);
const NETWORK_KEYS: (&[&str], &[&str]) = (
    &[],
    &["outboundAllowlist", "inboundPort", "inboundInterface"],
);
const USB_KEYS: (&[&str], &[&str]) = (&[], &["vendorIds", "productIds"]);
const MEMORY_KEYS: (&[&str], &[&str]) = (&["maxHeapMB", "maxWorkers"], &[]);
const HOOK_KEYS: (&[&str], &[&str]) = (
    &[],
    &["onLoad", "onUnload", "onUSBAttach", "onUSBDetach", "onJobReceived"],
);
const DEPENDENCY_KEYS: (&[&str], &[&str]) = (&[], &["hostVersion", "runtimeVersion"]);
const SIGNATURE_KEYS: (&[&str], &[&str]) = (&["algorithm", "value", "signer"], &[]);

pub(crate) fn validate(root: &Value, plugin_root: &Path) -> Result<PluginManifest, ManifestError> {
    let obj = root
        .as_object()
        .ok_or_else(|| ManifestError::Malformed("top level must be a JSON object".into()))?;

    check_keys("", obj, TOP_REQUIRED, TOP_OPTIONAL)?;
    check_object_keys("author", obj.get("author"), AUTHOR_KEYS)?;
    check_object_keys("permissions", obj.get("permissions"), PERMISSION_KEYS)?;
    if let Some(perms) = obj.get("permissions").and_then(Value::as_object) {
        if let Some(fs) = perms.get("filesystem") {
            let entries = fs.as_array().ok_or_else(|| {
                ManifestError::invalid("permissions.filesystem", "must be an array")
            })?;
            for (i, entry) in entries.iter().enumerate() {
                check_object_keys(
                    &format!("permissions.filesystem[{i}]"),
                    Some(entry),
                    FILESYSTEM_KEYS,
                )?;
            }
        }
        check_object_keys("permissions.network", perms.get("network"), NETWORK_KEYS)?;
        check_object_keys("permissions.usb", perms.get("usb"), USB_KEYS)?;
        check_object_keys("permissions.memory", perms.get("memory"), MEMORY_KEYS)?;
    }
    check_object_keys("hooks", obj.get("hooks"), HOOK_KEYS)?;
    check_object_keys("dependencies", obj.get("dependencies"), DEPENDENCY_KEYS)?;
    check_object_keys("signature", obj.get("signature"), SIGNATURE_KEYS)?;

    // The key sets are clean, so a type error is the only way this can fail.
    let manifest: PluginManifest = serde_json::from_value(root.clone())
        .map_err(|e| ManifestError::invalid("<document>", e.to_string()))?;

    check_fields(&manifest, plugin_root)?;
    Ok(manifest)
}

fn check_keys(
    path: &str,
    obj: &serde_json::Map<String, Value>,
    required: &[&str],
    optional: &[&str],
) -> Result<(), ManifestError> {
    for key in required {
        if !obj.contains_key(*key) {
            return Err(ManifestError::invalid(
                join(path, key),
                "required field is missing",
            ));
        }
    }
    for key in obj.keys() {
        if !required.contains(&key.as_str()) && !optional.contains(&key.as_str()) {
            return Err(ManifestError::invalid(join(path, key), "unknown field"));
        }
    }
    Ok(())
}

fn check_object_keys(
    path: &str,
    value: Option<&Value>,
    (required, optional): (&[&str], &[&str]),
) -> Result<(), ManifestError> {
    match value {
        None | Some(Value::Null) => Ok(()),
        Some(Value::Object(obj)) => check_keys(path, obj, required, optional),
        Some(_) => Err(ManifestError::invalid(path, "must be an object")),
    }
}

fn join(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}

fn check_fields(manifest: &PluginManifest, plugin_root: &Path) -> Result<(), ManifestError> {
    if !NAME_PATTERN.is_match(&manifest.name) {
        return Err(ManifestError::invalid(
            "name",
            "must match ^[a-z0-9-]{3,50}$",
        ));
    }
    if !VERSION_PATTERN.is_match(&manifest.version) {
        return Err(ManifestError::invalid(
            "version",
            "must be semver MAJOR.MINOR.PATCH[-pre]",
        ));
    }
    if manifest.description.trim().is_empty() {
        return Err(ManifestError::invalid("description", "must be non-empty"));
    }
    if manifest.author.name.trim().is_empty() {
        return Err(ManifestError::invalid("author.name", "must be non-empty"));
    }

    check_entry(&manifest.entry, plugin_root)?;

    for (i, grant) in manifest.permissions.filesystem.iter().enumerate() {
        check_fs_prefix(&format!("permissions.filesystem[{i}].pathPrefix"), &grant.path_prefix)?;
    }

    if let Some(network) = &manifest.permissions.network {
        for (i, origin) in network.outbound_allowlist.iter().enumerate() {
            let parsed = url::Url::parse(origin).map_err(|e| {
                ManifestError::invalid(
                    format!("permissions.network.outboundAllowlist[{i}]"),
                    format!("must parse as a URL with scheme: {e}"),
                )
            })?;
            if !parsed.has_host() {
                return Err(ManifestError::invalid(
                    format!("permissions.network.outboundAllowlist[{i}]"),
                    "origin must include a host",
                ));
            }
        }
        if let Some(port) = network.inbound_port {
            if port < 1024 {
                return Err(ManifestError::invalid(
                    "permissions.network.inboundPort",
                    "must be in 1024..65535",
                ));
            }
        }
    }

    if let Some(usb) = &manifest.permissions.usb {
        for (i, id) in usb.vendor_ids.iter().enumerate() {
            if !USB_ID_PATTERN.is_match(id) {
                return Err(ManifestError::invalid(
                    format!("permissions.usb.vendorIds[{i}]"),
                    "must be a 0x-prefixed 4-hex id",
                ));
            }
        }
        for (i, id) in usb.product_ids.iter().enumerate() {
            if !USB_ID_PATTERN.is_match(id) {
                return Err(ManifestError::invalid(
                    format!("permissions.usb.productIds[{i}]"),
                    "must be a 0x-prefixed 4-hex id",
                ));
            }
        }
    }

    if let Some(memory) = &manifest.permissions.memory {
        if !(10..=1024).contains(&memory.max_heap_mb) {
            return Err(ManifestError::invalid(
                "permissions.memory.maxHeapMB",
                "must be in 10..=1024",
            ));
        }
        if !(1..=8).contains(&memory.max_workers) {
            return Err(ManifestError::invalid(
                "permissions.memory.maxWorkers",
                "must be in 1..=8",
            ));
        }
    }

    for (i, queue) in manifest.permissions.queues.iter().enumerate() {
        if !is_kebab_case(queue) {
            return Err(ManifestError::invalid(
                format!("permissions.queues[{i}]"),
                "queue names must be kebab-case",
            ));
        }
    }

    let hooks = [
        ("hooks.onLoad", &manifest.hooks.on_load),
        ("hooks.onUnload", &manifest.hooks.on_unload),
        ("hooks.onUSBAttach", &manifest.hooks.on_usb_attach),
        ("hooks.onUSBDetach", &manifest.hooks.on_usb_detach),
        ("hooks.onJobReceived", &manifest.hooks.on_job_received),
    ];
    for (path, hook) in hooks {
        if let Some(name) = hook {
            if !HOOK_NAME_PATTERN.is_match(name) {
                return Err(ManifestError::invalid(path, "must be a non-empty identifier"));
            }
        }
    }

    if let Some(deps) = &manifest.dependencies {
        for (path, constraint) in [
            ("dependencies.hostVersion", &deps.host_version),
            ("dependencies.runtimeVersion", &deps.runtime_version),
        ] {
            if let Some(value) = constraint {
                if value.trim().is_empty() {
                    return Err(ManifestError::invalid(path, "must be non-empty"));
                }
            }
        }
    }

    check_signature_record(&manifest.signature)?;
    Ok(())
}

fn check_signature_record(signature: &SignatureRecord) -> Result<(), ManifestError> {
    if signature.algorithm != "SHA-256" {
        return Err(ManifestError::invalid(
            "signature.algorithm",
            "only SHA-256 is supported",
        ));
    }
    if !HEX64_PATTERN.is_match(&signature.value) {
        return Err(ManifestError::invalid(
            "signature.value",
            "must be a 64-hex digest",
        ));
    }
    Ok(())
}

/// The entry path must stay inside the plugin root after lexical
/// normalization; `..` components may never escape.
fn check_entry(entry: &str, plugin_root: &Path) -> Result<(), ManifestError> {
    if entry.is_empty() {
        return Err(ManifestError::invalid("entry", "must be non-empty"));
    }
    let path = Path::new(entry);
    if path.is_absolute() {
        return Err(ManifestError::invalid("entry", "must be a relative path"));
    }
    let mut depth: i32 = 0;
    for component in path.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return Err(ManifestError::invalid(
                        "entry",
                        "path resolves outside the plugin root",
                    ));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(ManifestError::invalid("entry", "must be a relative path"));
            }
        }
    }
    // Belt and braces: the joined path must still start with the root.
    let joined = normalize_lexically(&plugin_root.join(path));
    if !joined.starts_with(normalize_lexically(plugin_root)) {
        return Err(ManifestError::invalid(
            "entry",
            "path resolves outside the plugin root",
        ));
    }
    Ok(())
}

fn check_fs_prefix(path: &str, prefix: &str) -> Result<(), ManifestError> {
    let p = Path::new(prefix);
    if !p.is_absolute() {
        return Err(ManifestError::invalid(path, "must be an absolute path"));
    }
    for component in p.components() {
        if matches!(component, Component::ParentDir | Component::CurDir) {
            return Err(ManifestError::invalid(path, "must be normalized"));
        }
    }
    // Symlink freedom is checked against the components that exist right now.
    let mut walk = PathBuf::new();
    for component in p.components() {
        walk.push(component);
        match std::fs::symlink_metadata(&walk) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(ManifestError::invalid(
                    path,
                    format!("`{}` is a symlink", walk.display()),
                ));
            }
            _ => {}
        }
    }
    Ok(())
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

fn is_kebab_case(s: &str) -> bool {
    !s.is_empty()
        && !s.starts_with('-')
        && !s.ends_with('-')
        && !s.contains("--")
        && s.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}
