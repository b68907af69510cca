//! Plugin records and states, owned exclusively by the loader.
//!
//! Other components hold instance ids, never owning handles; the worker
//! host resolves instance ids to workers, and the router reads immutable
//! routing snapshots.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use autoweave_manifest::PluginManifest;
use autoweave_permissions::PermissionEvaluator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginState {
    Discovered,
    Validated,
    Loading,
    Running,
    Draining,
    Stopped,
    Failed,
}

impl PluginState {
    pub fn as_str(self) -> &'static str {
        match self {
            PluginState::Discovered => "discovered",
            PluginState::Validated => "validated",
            PluginState::Loading => "loading",
            PluginState::Running => "running",
            PluginState::Draining => "draining",
            PluginState::Stopped => "stopped",
            PluginState::Failed => "failed",
        }
    }
}

/// One loaded (or failed) plugin. Replaced wholesale on hot reload, never
/// mutated field-by-field from outside the loader.
pub struct PluginRecord {
    pub manifest: Option<PluginManifest>,
    /// Directory name under the plugin root; the table key.
    pub directory: String,
    pub root: PathBuf,
    /// Content digest at load time.
    pub digest: Option<String>,
    pub state: PluginState,
    /// Unique per load; changes on every reload.
    pub instance_id: Option<Uuid>,
    pub evaluator: Option<Arc<PermissionEvaluator>>,
    pub last_state_change: DateTime<Utc>,
    pub termination_reason: Option<String>,
}

impl PluginRecord {
    pub fn failed(directory: &str, root: PathBuf, reason: String) -> Self {
        Self {
            manifest: None,
            directory: directory.to_string(),
            root,
            digest: None,
            state: PluginState::Failed,
            instance_id: None,
            evaluator: None,
            last_state_change: Utc::now(),
            termination_reason: Some(reason),
        }
    }

    pub fn name(&self) -> &str {
        self.manifest
            .as_ref()
            .map(|m| m.name.as_str())
            .unwrap_or(&self.directory)
    }

    pub fn version(&self) -> &str {
        self.manifest
            .as_ref()
            .map(|m| m.version.as_str())
            .unwrap_or("unknown")
    }
}
