//! # AutoWeave Plugin Loader
//!
//! Owns the plugin table and the per-plugin state machine:
//!
//! ```text
//! Discovered --(parse, validate, verify signature)--> Validated
//! Validated  --(spawn worker, invoke onLoad)--------> Running
//! Running    --(file change / unload request)-------> Draining
//! Draining   --(onUnload, terminate worker)---------> Stopped
//! any        --(unrecoverable error)----------------> Failed
//! ```
//!
//! Plugins are discovered by a recursive scan of the plugin directory and
//! kept current by a filesystem watcher whose change bursts are coalesced
//! per plugin for a debounce window before a reload fires.
//!
//! Hot reload never swaps in place: the new worker is spawned and made
//! Ready first, the plugin record is replaced atomically (new instance id),
//! and only then is the old instance drained. A failed reload leaves the
//! previous instance Running.
//!
//! At most one transition is in flight per plugin; transitions for
//! different plugins run concurrently. Every transition that matters to
//! the outside world is published on the plugin stream.

mod loader;
mod state;
mod watcher;

pub use loader::{PluginLoader, PluginLoaderConfig, ReadySignal, RouteTarget};
pub use state::{PluginRecord, PluginState};

use thiserror::Error;

/// Closed error set for the loader.
#[derive(Debug, Error)]
pub enum LoaderError {
    #[error(transparent)]
    Manifest(#[from] autoweave_manifest::ManifestError),

    #[error(transparent)]
    Host(#[from] autoweave_host::HostError),

    #[error("plugin directory error: {0}")]
    Io(#[from] std::io::Error),

    #[error("reload of `{plugin}` failed: {reason}")]
    ReloadFailed { plugin: String, reason: String },

    #[error("watcher error: {0}")]
    Watch(String),
}
