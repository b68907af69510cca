//! # AutoWeave Plugin Manifest
//!
//! Parsing, validation, and content-signature verification for
//! `autoweave.plugin.json`, the single source of truth about a plugin.
//!
//! The manifest flows through three stages, each with its own failure mode:
//!
//! 1. **Parse** (`ManifestDocument::parse`): the raw bytes must be well-formed
//!    JSON with structurally sane field types. Anything else is
//!    [`ManifestError::Malformed`] — the document never enters the system.
//! 2. **Validate** (`ManifestDocument::validate`): the schema is enforced
//!    bit-for-bit. Required fields must be present, no unknown fields are
//!    tolerated at any level, and every field must match its declared pattern
//!    or range. Violations are [`ManifestError::Invalid`] with the offending
//!    field path, and park the plugin in the `Failed` state.
//! 3. **Verify** (`verify_signature`): the SHA-256 content digest over the
//!    canonicalized manifest plus every covered plugin file must equal
//!    `signature.value`. A mismatch is [`ManifestError::BadSignature`].
//!
//! A validated [`PluginManifest`] is immutable; hot-reload replaces the whole
//! record rather than mutating it in place.

mod model;
mod signature;
mod validator;

pub use model::{
    AccessMode, AuthorRecord, DependencyConstraints, FilesystemGrant, HooksDecl, InboundInterface,
    ManifestDocument, MemoryDecl, NetworkDecl, PermissionsDecl, PluginManifest, SignatureRecord,
    UsbDecl, MANIFEST_FILE_NAME,
};
pub use signature::{
    compute_content_digest, sign_manifest_value, verify_signature, DEFAULT_DENYLIST,
};
pub use validator::{HOOK_NAME_PATTERN, NAME_PATTERN, USB_ID_PATTERN, VERSION_PATTERN};

use thiserror::Error;

/// Closed error set for the manifest subsystem.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// The bytes were not a well-formed manifest document.
    #[error("malformed manifest: {0}")]
    Malformed(String),

    /// The document parsed but violates the manifest schema.
    #[error("invalid manifest at `{path}`: {reason}")]
    Invalid { path: String, reason: String },

    /// The computed content digest does not match `signature.value`.
    #[error("content signature mismatch: manifest declares {declared}, computed {computed}")]
    BadSignature { declared: String, computed: String },

    /// Plugin files could not be read while computing the content digest.
    #[error("failed to read plugin files: {0}")]
    Io(#[from] std::io::Error),
}

impl ManifestError {
    pub(crate) fn invalid(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
