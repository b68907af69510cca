//! Content-signature computation and verification.
//!
//! The digest is a pure function of manifest content and covered files:
//! the manifest is canonicalized (signature field removed, keys sorted, no
//! insignificant whitespace), hashed with SHA-256, and then every plugin
//! file outside the denylist is fed into the same hasher in lexicographic
//! path order. The manifest file itself is excluded from the file walk —
//! it carries the digest and cannot cover itself.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::model::{ManifestDocument, PluginManifest, MANIFEST_FILE_NAME};
use crate::ManifestError;

/// Path components excluded from the content digest by default: build
/// outputs, dependency trees, and VCS metadata.
pub const DEFAULT_DENYLIST: &[&str] = &[".git", ".hg", ".svn", "target", "node_modules", "dist"];

/// Compute the SHA-256 content digest for a manifest document rooted at
/// `plugin_root`, as a lowercase 64-hex string.
pub fn compute_content_digest(
    document: &ManifestDocument,
    plugin_root: &Path,
    denylist: &[&str],
) -> Result<String, ManifestError> {
    let canonical = canonicalize(document.raw());
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());

    let mut files = Vec::new();
    collect_files(plugin_root, plugin_root, denylist, &mut files)?;
    files.sort();
    for relative in &files {
        let bytes = fs::read(plugin_root.join(relative))?;
        hasher.update(&bytes);
    }
    debug!(
        root = %plugin_root.display(),
        covered_files = files.len(),
        "computed manifest content digest"
    );

    Ok(hex_encode(&hasher.finalize()))
}

/// Verify that the digest over the manifest and the plugin files equals
/// `signature.value`.
pub fn verify_signature(
    manifest: &PluginManifest,
    document: &ManifestDocument,
    plugin_root: &Path,
    denylist: &[&str],
) -> Result<(), ManifestError> {
    let computed = compute_content_digest(document, plugin_root, denylist)?;
    let declared = manifest.signature.value.to_ascii_lowercase();
    if computed != declared {
        return Err(ManifestError::BadSignature {
            declared,
            computed,
        });
    }
    Ok(())
}

/// Fill in `signature.value` for a manifest document over the tree rooted
/// at `plugin_root`. Used by signing tooling and test fixtures; the digest
/// is independent of any signature value already present.
pub fn sign_manifest_value(
    mut manifest: Value,
    plugin_root: &Path,
    denylist: &[&str],
) -> Result<Value, ManifestError> {
    let document = ManifestDocument::parse(manifest.to_string().as_bytes())?;
    let digest = compute_content_digest(&document, plugin_root, denylist)?;
    manifest["signature"]["value"] = Value::String(digest);
    Ok(manifest)
}

/// Serialize the manifest minus its `signature` field with sorted keys and
/// no insignificant whitespace.
///
/// `serde_json`'s default map is ordered by key, so re-building the tree
/// through `Value` yields the canonical byte sequence.
fn canonicalize(root: &Value) -> String {
    let mut tree = root.clone();
    if let Some(obj) = tree.as_object_mut() {
        obj.remove("signature");
    }
    sort_tree(&mut tree);
    tree.to_string()
}

fn sort_tree(value: &mut Value) {
    match value {
        Value::Object(obj) => {
            let mut entries: Vec<(String, Value)> = std::mem::take(obj).into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            for (key, mut child) in entries {
                sort_tree(&mut child);
                obj.insert(key, child);
            }
        }
        Value::Array(items) => {
            for item in items {
                sort_tree(item);
            }
        }
        _ => {}
    }
}

fn collect_files(
    root: &Path,
    dir: &Path,
    denylist: &[&str],
    out: &mut Vec<PathBuf>,
) -> Result<(), ManifestError> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if denylist.iter().any(|d| *d == name) {
            continue;
        }
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_files(root, &path, denylist, out)?;
        } else if file_type.is_file() {
            let Ok(relative) = path.strip_prefix(root) else {
                continue;
            };
            if relative == Path::new(MANIFEST_FILE_NAME) {
                continue;
            }
            out.push(relative.to_path_buf());
        }
        // Symlinks and special files are not covered.
    }
    Ok(())
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}
