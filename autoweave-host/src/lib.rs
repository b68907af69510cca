//! # AutoWeave Plugin Worker Host
//!
//! Runs each plugin instance in an isolated execution context and mediates
//! every privileged operation through a single host-call channel.
//!
//! ## Isolation contract
//!
//! Each instance gets a dedicated OS worker thread with:
//!
//! - a private heap ceiling enforced by cumulative allocation accounting in
//!   the permission evaluator, with force-termination on sustained breach;
//! - a private namespace — the entry object and its hook table exist only
//!   on the worker thread, and no host state is reachable from it;
//! - exactly one egress: the [`HostContext`] handed to every hook, whose
//!   methods serialize a [`HostCall`] onto the mediation channel. The host
//!   resolves it to a [`CapabilityRequest`](autoweave_permissions::CapabilityRequest),
//!   the permission evaluator decides, and only then does the host perform
//!   the privileged action. Denial happens at the interface, not by hiding
//!   the API.
//!
//! ## Entry points and hooks
//!
//! Plugins are not dynamically imported. An entry implementation is
//! registered in the [`EntryRegistry`] under the plugin name; at spawn the
//! worker instantiates it and the entry publishes its hook table. Hook
//! invocations arrive by symbolic name (from `manifest.hooks`) over the
//! command channel in FIFO order; each carries a per-hook timeout on the
//! host side. A hook that overruns is reported as a structured fault, and
//! repeated overruns escalate to the loader, which fails the plugin.

mod entry;
mod host;
mod hostcall;
mod worker;

pub use entry::{EntryRegistry, HookPayload, HookTable, PluginEntry};
pub use host::{
    HostServices, UsbDeviceLookup, WorkerFault, WorkerFaultKind, WorkerHost, WorkerHostConfig,
};
pub use hostcall::{HostCall, HostCallError, HostContext, HostReply, LogLevel};
pub use worker::HookKind;

use thiserror::Error;
use uuid::Uuid;

/// Closed error set for the worker host.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("failed to spawn worker for `{plugin}`: {reason}")]
    WorkerSpawnFailed { plugin: String, reason: String },

    #[error("no worker with instance id {0}")]
    UnknownInstance(Uuid),

    #[error("hook `{hook}` timed out after {timeout_ms} ms")]
    HookTimeout { hook: String, timeout_ms: u64 },

    #[error("hook `{hook}` failed: {reason}")]
    HookError { hook: String, reason: String },

    #[error("worker heap limit exceeded")]
    HeapLimitExceeded,
}
