//! # AutoWeave Permission Evaluator
//!
//! Converts a manifest's declared permissions into a concrete
//! [`PermissionSet`] at load time, and decides every privileged call a
//! plugin makes against that set for the rest of the instance's life.
//!
//! The set is a lattice element: every capability check is a membership
//! test, built once per load and never mutated while the plugin runs. The
//! only mutable state is the resource accounting (cumulative heap bytes,
//! live worker count), which lives in atomics beside the set.
//!
//! Checks are O(set lookup). The evaluator is a pure policy component; it
//! never performs the privileged action itself — the worker host does that
//! after an `Allow`.

mod evaluator;
mod types;

pub use evaluator::PermissionEvaluator;
pub use types::{
    AccessMode, CapabilityRequest, FilesystemPermission, InboundInterface, MemoryPermissions,
    NetworkPermissions, Origin, PermissionSet, UsbPermissions,
};

use thiserror::Error;

/// Structured denial reasons. Every variant names exactly what was asked
/// for and what the permission set grants.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PermissionDenied {
    #[error("path `{path}` is outside every declared filesystem prefix")]
    PathNotGranted { path: String },

    #[error("mode {requested:?} exceeds granted {granted:?} for `{path}`")]
    ModeExceeded {
        path: String,
        requested: AccessMode,
        granted: AccessMode,
    },

    #[error("origin `{0}` is not a valid URL origin")]
    OriginUnparseable(String),

    #[error("origin `{0}` is not in the outbound allowlist")]
    OriginNotAllowed(String),

    #[error("inbound listening on port {port} ({interface:?}) is not declared")]
    InboundNotDeclared {
        port: u16,
        interface: InboundInterface,
    },

    #[error("usb device {vendor_id:04x}:{product_id:04x} is not in the declared filter")]
    UsbNotDeclared { vendor_id: u16, product_id: u16 },

    #[error("queue `{0}` is not declared")]
    QueueNotDeclared(String),

    #[error("allocation of {requested} bytes exceeds heap limit ({used} of {limit} in use)")]
    HeapExhausted {
        requested: u64,
        used: u64,
        limit: u64,
    },

    #[error("worker limit of {limit} reached")]
    WorkerLimitReached { limit: u32 },
}
