//! Explicit plugin-entry registration and the published hook table.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;

use crate::hostcall::HostContext;

/// Payload handed to event hooks: the USB event snapshot or job body as
/// structured JSON.
pub type HookPayload = serde_json::Value;

type HookFn = Box<dyn FnMut(&HostContext, &HookPayload) -> anyhow::Result<()> + Send>;

/// The table a plugin entry publishes at initialization. Hook invocations
/// resolve symbolic names (from `manifest.hooks`) against it.
#[derive(Default)]
pub struct HookTable {
    handlers: HashMap<String, HookFn>,
}

impl HookTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a handler under a symbolic name. Re-registering a name
    /// replaces the previous handler.
    pub fn register<F>(&mut self, name: &str, handler: F)
    where
        F: FnMut(&HostContext, &HookPayload) -> anyhow::Result<()> + Send + 'static,
    {
        self.handlers.insert(name.to_string(), Box::new(handler));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub(crate) fn invoke(
        &mut self,
        name: &str,
        ctx: &HostContext,
        payload: &HookPayload,
    ) -> Option<anyhow::Result<()>> {
        self.handlers.get_mut(name).map(|f| f(ctx, payload))
    }
}

/// A plugin's well-known entry point.
///
/// The single obligation is publishing the hook table; everything else the
/// plugin does happens inside hooks, against the capability-checked
/// context.
pub trait PluginEntry: Send {
    fn register_hooks(&mut self, table: &mut HookTable) -> anyhow::Result<()>;
}

type EntryFactory = Box<dyn Fn() -> Box<dyn PluginEntry> + Send + Sync>;

/// Registry of entry factories keyed by plugin name.
///
/// Dynamic-import semantics are deliberately absent: the host binary (or a
/// test harness) registers every loadable entry up front, and the loader
/// resolves the manifest's plugin name here at spawn time. A fresh entry
/// object is instantiated per instance, so hot-reload never reuses state.
#[derive(Default)]
pub struct EntryRegistry {
    factories: DashMap<String, Arc<EntryFactory>>,
}

impl EntryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, plugin_name: &str, factory: F)
    where
        F: Fn() -> Box<dyn PluginEntry> + Send + Sync + 'static,
    {
        self.factories
            .insert(plugin_name.to_string(), Arc::new(Box::new(factory)));
    }

    pub fn instantiate(&self, plugin_name: &str) -> Option<Box<dyn PluginEntry>> {
        self.factories.get(plugin_name).map(|f| (f.value())())
    }

    pub fn contains(&self, plugin_name: &str) -> bool {
        self.factories.contains_key(plugin_name)
    }
}
