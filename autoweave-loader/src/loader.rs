//! The loader proper: scan, load, hot-reload, drain, and fault handling.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};
use uuid::Uuid;

use autoweave_bus::streams::{LifecycleRecord, PLUGIN_STREAM};
use autoweave_bus::BufferedPublisher;
use autoweave_host::{HookKind, WorkerFault, WorkerHost};
use autoweave_manifest::{
    verify_signature, ManifestDocument, PluginManifest, DEFAULT_DENYLIST, MANIFEST_FILE_NAME,
};
use autoweave_permissions::{PermissionEvaluator, PermissionSet, UsbPermissions};

use crate::state::{PluginRecord, PluginState};
use crate::watcher::DirectoryWatcher;
use crate::LoaderError;

#[derive(Debug, Clone)]
pub struct PluginLoaderConfig {
    pub plugin_dir: PathBuf,
    /// Quiet period before a change burst triggers a reload.
    pub reload_debounce: Duration,
    /// Bound on worker spawn + hook-table registration.
    pub ready_timeout: Duration,
    pub onload_timeout: Duration,
    pub onunload_timeout: Duration,
    pub plugin_stream: String,
    /// Path components excluded from signature verification.
    pub signature_denylist: Vec<String>,
}

impl Default for PluginLoaderConfig {
    fn default() -> Self {
        Self {
            plugin_dir: PathBuf::from("./plugins"),
            reload_debounce: Duration::from_millis(250),
            ready_timeout: Duration::from_secs(10),
            onload_timeout: Duration::from_secs(10),
            onunload_timeout: Duration::from_secs(5),
            plugin_stream: PLUGIN_STREAM.to_string(),
            signature_denylist: DEFAULT_DENYLIST.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// What the router needs to know about one running instance.
#[derive(Debug, Clone)]
pub struct RouteTarget {
    pub instance_id: Uuid,
    pub plugin: String,
    pub version: String,
    pub usb: UsbPermissions,
    /// Queues the instance may consume jobs from.
    pub queues: std::collections::HashSet<String>,
}

/// Broadcast when an instance reaches Running; the router replays
/// currently-connected matching devices to it.
#[derive(Debug, Clone)]
pub struct ReadySignal {
    pub instance_id: Uuid,
    pub plugin: String,
}

struct Prepared {
    manifest: PluginManifest,
    digest: String,
    evaluator: Arc<PermissionEvaluator>,
}

/// Owns the plugin table; drives every state transition.
pub struct PluginLoader {
    config: PluginLoaderConfig,
    host: Arc<WorkerHost>,
    publisher: Arc<BufferedPublisher>,
    table: DashMap<String, PluginRecord>,
    transitions: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    /// Immutable routing snapshot, rebuilt after every state change. The
    /// router clones the Arc per message and never observes a half-applied
    /// transition.
    routing: RwLock<Arc<Vec<RouteTarget>>>,
    ready_tx: broadcast::Sender<ReadySignal>,
    watcher: Mutex<Option<DirectoryWatcher>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PluginLoader {
    pub fn new(
        config: PluginLoaderConfig,
        host: Arc<WorkerHost>,
        publisher: Arc<BufferedPublisher>,
    ) -> Self {
        let (ready_tx, _) = broadcast::channel(64);
        Self {
            config,
            host,
            publisher,
            table: DashMap::new(),
            transitions: DashMap::new(),
            routing: RwLock::new(Arc::new(Vec::new())),
            ready_tx,
            watcher: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Enumerate plugin directories, bring each one up, and start watching
    /// for changes. Loader startup does not fail on individual plugin
    /// failures; those are parked in `Failed` and published.
    pub async fn start(self: &Arc<Self>) -> Result<(), LoaderError> {
        let directories = self.scan_plugin_dirs().await?;
        let mut loads = JoinSet::new();
        for directory in directories {
            let loader = Arc::clone(self);
            loads.spawn(async move {
                loader.load_plugin(&directory).await;
            });
        }
        while loads.join_next().await.is_some() {}

        let (reload_tx, mut reload_rx) = mpsc::unbounded_channel();
        let watcher = DirectoryWatcher::spawn(
            self.config.plugin_dir.clone(),
            self.config.reload_debounce,
            reload_tx,
        )?;
        *self.watcher.lock() = Some(watcher);

        let loader = Arc::clone(self);
        let reload_task = tokio::spawn(async move {
            while let Some(directory) = reload_rx.recv().await {
                let manifest_path = loader
                    .config
                    .plugin_dir
                    .join(&directory)
                    .join(MANIFEST_FILE_NAME);
                if manifest_path.exists() {
                    loader.reload_plugin(&directory).await;
                } else {
                    loader.unload_plugin(&directory, true).await;
                }
            }
        });

        let mut tasks = self.tasks.lock();
        tasks.push(reload_task);
        if let Some(mut fault_rx) = self.host.take_fault_stream() {
            let loader = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                while let Some(fault) = fault_rx.recv().await {
                    loader.handle_fault(fault).await;
                }
            }));
        }
        Ok(())
    }

    /// Stop watching and drain every running plugin within the shutdown
    /// budget. A worker exceeding its share is force-terminated.
    pub async fn stop(self: &Arc<Self>, budget: Duration) {
        let watcher = self.watcher.lock().take();
        if let Some(watcher) = watcher {
            watcher.shutdown().await;
        }
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
            let _ = task.await;
        }

        let running: Vec<String> = self
            .table
            .iter()
            .filter(|r| r.state == PluginState::Running)
            .map(|r| r.directory.clone())
            .collect();
        if running.is_empty() {
            return;
        }
        let share = budget / running.len() as u32;
        let drain_timeout = share.min(self.config.onunload_timeout);

        let mut drains = JoinSet::new();
        for directory in running {
            let loader = Arc::clone(self);
            drains.spawn(async move {
                loader.drain_and_stop(&directory, drain_timeout).await;
            });
        }
        while drains.join_next().await.is_some() {}
    }

    /// Immutable view for the router.
    pub fn routing_snapshot(&self) -> Arc<Vec<RouteTarget>> {
        Arc::clone(&self.routing.read())
    }

    pub fn subscribe_ready(&self) -> broadcast::Receiver<ReadySignal> {
        self.ready_tx.subscribe()
    }

    pub fn plugin_state(&self, directory: &str) -> Option<PluginState> {
        self.table.get(directory).map(|r| r.state)
    }

    pub fn instance_of(&self, directory: &str) -> Option<Uuid> {
        self.table.get(directory).and_then(|r| r.instance_id)
    }

    pub fn running_count(&self) -> usize {
        self.table
            .iter()
            .filter(|r| r.state == PluginState::Running)
            .count()
    }

    async fn scan_plugin_dirs(&self) -> Result<Vec<String>, LoaderError> {
        let mut directories = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.config.plugin_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(dir = %self.config.plugin_dir.display(), "plugin directory does not exist");
                return Ok(directories);
            }
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if entry.path().join(MANIFEST_FILE_NAME).exists() {
                directories.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        directories.sort();
        Ok(directories)
    }

    fn transition_lock(&self, directory: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.transitions
            .entry(directory.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Discovered → Running for a fresh plugin directory.
    pub async fn load_plugin(self: &Arc<Self>, directory: &str) {
        let lock = self.transition_lock(directory);
        let _guard = lock.lock().await;
        let root = self.config.plugin_dir.join(directory);
        debug!(directory, "loading plugin");

        let prepared = match self.prepare(&root).await {
            Ok(prepared) => prepared,
            Err(e) => {
                self.park_failed(directory, root, None, e.to_string());
                return;
            }
        };
        match self.spawn_instance(&prepared).await {
            Ok(instance_id) => {
                self.commit_running(directory, root, prepared, instance_id);
            }
            Err(e) => {
                self.park_failed(directory, root, Some(&prepared), e.to_string());
            }
        }
    }

    /// Hot reload: spawn-new → ready → drain-old, never swap-in-place.
    pub async fn reload_plugin(self: &Arc<Self>, directory: &str) {
        let lock = self.transition_lock(directory);
        let _guard = lock.lock().await;
        let root = self.config.plugin_dir.join(directory);

        let previous = self.table.get(directory).and_then(|r| {
            if r.state == PluginState::Running {
                r.instance_id
                    .map(|id| (id, r.name().to_string(), r.version().to_string()))
            } else {
                None
            }
        });
        info!(directory, reloading_over = previous.is_some(), "plugin change detected");

        let prepared = match self.prepare(&root).await {
            Ok(prepared) => prepared,
            Err(e) if previous.is_some() => {
                // The previous instance keeps running; the failed attempt is
                // only published.
                warn!(directory, error = %e, "reload rejected, previous instance stays up");
                self.publish(LifecycleRecord::failed(directory, "unknown", "", &e.to_string()));
                return;
            }
            Err(e) => {
                self.park_failed(directory, root, None, e.to_string());
                return;
            }
        };

        let new_instance = match self.spawn_instance(&prepared).await {
            Ok(id) => id,
            Err(e) if previous.is_some() => {
                warn!(directory, error = %e, "replacement worker failed, previous instance stays up");
                self.publish(LifecycleRecord::failed(
                    &prepared.manifest.name,
                    &prepared.manifest.version,
                    "",
                    &e.to_string(),
                ));
                return;
            }
            Err(e) => {
                self.park_failed(directory, root, Some(&prepared), e.to_string());
                return;
            }
        };

        // The new instance is Ready: replace the record atomically, then
        // drain the old worker.
        self.commit_running(directory, root, prepared, new_instance);

        if let Some((old_id, old_name, old_version)) = previous {
            let forced = self.drain_instance(old_id).await;
            self.publish(LifecycleRecord::unloaded(
                &old_name,
                &old_version,
                &old_id.to_string(),
                forced,
            ));
        }
    }

    /// Running → Draining → Stopped; optionally drop the record entirely
    /// (directory removed from disk).
    pub async fn unload_plugin(self: &Arc<Self>, directory: &str, remove_record: bool) {
        let lock = self.transition_lock(directory);
        let _guard = lock.lock().await;
        self.drain_and_stop_locked(directory, self.config.onunload_timeout)
            .await;
        if remove_record {
            self.table.remove(directory);
            self.transitions.remove(directory);
            self.rebuild_routing();
        }
    }

    async fn drain_and_stop(self: &Arc<Self>, directory: &str, drain_timeout: Duration) {
        let lock = self.transition_lock(directory);
        let _guard = lock.lock().await;
        self.drain_and_stop_locked(directory, drain_timeout).await;
    }

    async fn drain_and_stop_locked(&self, directory: &str, drain_timeout: Duration) {
        let Some((instance_id, name, version)) = self.table.get(directory).and_then(|r| {
            if r.state == PluginState::Running {
                r.instance_id
                    .map(|id| (id, r.name().to_string(), r.version().to_string()))
            } else {
                None
            }
        }) else {
            return;
        };

        self.set_state(directory, PluginState::Draining, None);
        let forced = self.drain_instance_with_timeout(instance_id, drain_timeout).await;
        self.set_state(directory, PluginState::Stopped, None);
        self.rebuild_routing();
        self.publish(LifecycleRecord::unloaded(
            &name,
            &version,
            &instance_id.to_string(),
            forced,
        ));
    }

    async fn drain_instance(&self, instance_id: Uuid) -> bool {
        self.drain_instance_with_timeout(instance_id, self.config.onunload_timeout)
            .await
    }

    /// Invoke `onUnload` under a hard timeout, then terminate the worker.
    /// Returns whether termination had to be forced.
    async fn drain_instance_with_timeout(&self, instance_id: Uuid, timeout: Duration) -> bool {
        let forced = match self
            .host
            .invoke_hook(instance_id, HookKind::OnUnload, json!({}), timeout)
            .await
        {
            Ok(()) => false,
            Err(e) => {
                warn!(%instance_id, error = %e, "onUnload did not complete cleanly, forcing termination");
                true
            }
        };
        let _ = self.host.terminate(instance_id, forced).await;
        forced
    }

    async fn prepare(&self, root: &Path) -> Result<Prepared, LoaderError> {
        let bytes = tokio::fs::read(root.join(MANIFEST_FILE_NAME)).await?;
        let document = ManifestDocument::parse(&bytes)?;
        let manifest = document.validate(root)?;
        let denylist: Vec<&str> = self
            .config
            .signature_denylist
            .iter()
            .map(|s| s.as_str())
            .collect();
        verify_signature(&manifest, &document, root, &denylist)?;
        let digest = manifest.signature.value.to_ascii_lowercase();
        let evaluator = Arc::new(PermissionEvaluator::new(PermissionSet::from_declaration(
            &manifest.permissions,
        )));
        Ok(Prepared {
            manifest,
            digest,
            evaluator,
        })
    }

    /// Spawn the worker and run `onLoad`; the instance is Ready only once
    /// both succeed.
    async fn spawn_instance(&self, prepared: &Prepared) -> Result<Uuid, LoaderError> {
        let instance_id = self
            .host
            .spawn(
                &prepared.manifest,
                Arc::clone(&prepared.evaluator),
                self.config.ready_timeout,
            )
            .await?;
        match self
            .host
            .invoke_hook(
                instance_id,
                HookKind::OnLoad,
                json!({}),
                self.config.onload_timeout,
            )
            .await
        {
            Ok(()) => Ok(instance_id),
            Err(e) => {
                let _ = self.host.terminate(instance_id, true).await;
                Err(e.into())
            }
        }
    }

    fn commit_running(
        &self,
        directory: &str,
        root: PathBuf,
        prepared: Prepared,
        instance_id: Uuid,
    ) {
        let name = prepared.manifest.name.clone();
        let version = prepared.manifest.version.clone();
        self.table.insert(
            directory.to_string(),
            PluginRecord {
                manifest: Some(prepared.manifest),
                directory: directory.to_string(),
                root,
                digest: Some(prepared.digest),
                state: PluginState::Running,
                instance_id: Some(instance_id),
                evaluator: Some(prepared.evaluator),
                last_state_change: Utc::now(),
                termination_reason: None,
            },
        );
        self.rebuild_routing();
        info!(plugin = %name, version = %version, %instance_id, "plugin running");
        self.publish(LifecycleRecord::loaded(
            &name,
            &version,
            &instance_id.to_string(),
        ));
        let _ = self.ready_tx.send(ReadySignal {
            instance_id,
            plugin: name,
        });
    }

    fn park_failed(
        &self,
        directory: &str,
        root: PathBuf,
        prepared: Option<&Prepared>,
        reason: String,
    ) {
        warn!(directory, %reason, "plugin failed");
        let (name, version) = match prepared {
            Some(p) => (p.manifest.name.clone(), p.manifest.version.clone()),
            None => (directory.to_string(), "unknown".to_string()),
        };
        self.table.insert(
            directory.to_string(),
            PluginRecord::failed(directory, root, reason.clone()),
        );
        self.rebuild_routing();
        self.publish(LifecycleRecord::failed(&name, &version, "", &reason));
    }

    async fn handle_fault(self: &Arc<Self>, fault: WorkerFault) {
        let Some(directory) = self.table.iter().find_map(|r| {
            (r.instance_id == Some(fault.instance_id)).then(|| r.directory.clone())
        }) else {
            // A fault from an already-replaced instance; nothing to do.
            return;
        };
        let lock = self.transition_lock(&directory);
        let _guard = lock.lock().await;

        // Re-check under the lock; a reload may have replaced the instance.
        let still_current = self
            .table
            .get(&directory)
            .map(|r| r.instance_id == Some(fault.instance_id))
            .unwrap_or(false);
        if !still_current {
            return;
        }

        let reason = match &fault.kind {
            autoweave_host::WorkerFaultKind::HeapLimitExceeded => "heap limit exceeded".to_string(),
            autoweave_host::WorkerFaultKind::RepeatedHookTimeouts { hook } => {
                format!("repeated `{hook}` timeouts")
            }
        };
        warn!(plugin = %fault.plugin, instance_id = %fault.instance_id, %reason, "worker fault, failing plugin");
        let _ = self.host.terminate(fault.instance_id, true).await;
        self.set_state(&directory, PluginState::Failed, Some(reason.clone()));
        self.rebuild_routing();
        self.publish(LifecycleRecord::failed(
            &fault.plugin,
            &fault.version,
            &fault.instance_id.to_string(),
            &reason,
        ));
    }

    fn set_state(&self, directory: &str, state: PluginState, reason: Option<String>) {
        if let Some(mut record) = self.table.get_mut(directory) {
            record.state = state;
            record.last_state_change = Utc::now();
            if reason.is_some() {
                record.termination_reason = reason;
            }
        }
    }

    fn rebuild_routing(&self) {
        let targets: Vec<RouteTarget> = self
            .table
            .iter()
            .filter(|r| r.state == PluginState::Running)
            .filter_map(|r| {
                let manifest = r.manifest.as_ref()?;
                let evaluator = r.evaluator.as_ref()?;
                Some(RouteTarget {
                    instance_id: r.instance_id?,
                    plugin: manifest.name.clone(),
                    version: manifest.version.clone(),
                    usb: evaluator.permission_set().usb.clone(),
                    queues: evaluator.permission_set().queues.clone(),
                })
            })
            .collect();
        *self.routing.write() = Arc::new(targets);
    }

    fn publish(&self, record: LifecycleRecord) {
        self.publisher
            .enqueue(&self.config.plugin_stream, record.to_fields());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autoweave_bus::streams::LifecycleKind;
    use autoweave_bus::{MemoryBus, PublisherConfig};
    use autoweave_host::{EntryRegistry, HookTable, HostServices, PluginEntry, WorkerHostConfig};
    use autoweave_manifest::sign_manifest_value;
    use serde_json::json;
    use std::fs;

    struct TestEntry {
        calls: Arc<Mutex<Vec<String>>>,
        onload_sleep: Option<Duration>,
    }

    impl PluginEntry for TestEntry {
        fn register_hooks(&mut self, table: &mut HookTable) -> anyhow::Result<()> {
            let calls = Arc::clone(&self.calls);
            let sleep = self.onload_sleep;
            table.register("initialize", move |_ctx, _payload| {
                if let Some(duration) = sleep {
                    std::thread::sleep(duration);
                }
                calls.lock().push("initialize".into());
                Ok(())
            });
            let calls = Arc::clone(&self.calls);
            table.register("teardown", move |_ctx, _payload| {
                calls.lock().push("teardown".into());
                Ok(())
            });
            Ok(())
        }
    }

    struct Rig {
        bus: Arc<MemoryBus>,
        loader: Arc<PluginLoader>,
        host: Arc<WorkerHost>,
        calls: Arc<Mutex<Vec<String>>>,
        _tmp: tempfile::TempDir,
    }

    fn rig(onload_timeout: Duration, onload_sleep: Option<Duration>) -> Rig {
        let tmp = tempfile::tempdir().unwrap();
        let bus = Arc::new(MemoryBus::new());
        let publisher = Arc::new(BufferedPublisher::new(
            bus.clone() as Arc<dyn autoweave_bus::EventBus>,
            PublisherConfig::default(),
        ));
        let calls = Arc::new(Mutex::new(Vec::new()));
        let registry = Arc::new(EntryRegistry::new());
        let entry_calls = Arc::clone(&calls);
        registry.register("usb-scanner-plugin", move || {
            Box::new(TestEntry {
                calls: Arc::clone(&entry_calls),
                onload_sleep,
            })
        });
        let host = Arc::new(WorkerHost::new(
            WorkerHostConfig::default(),
            registry,
            Arc::new(HostServices::new(None, None)),
        ));
        let loader = Arc::new(PluginLoader::new(
            PluginLoaderConfig {
                plugin_dir: tmp.path().to_path_buf(),
                onload_timeout,
                onunload_timeout: Duration::from_millis(500),
                // Reloads in these tests are driven explicitly; keep the
                // watcher out of the way.
                reload_debounce: Duration::from_secs(60),
                ..Default::default()
            },
            Arc::clone(&host),
            publisher,
        ));
        Rig {
            bus,
            loader,
            host,
            calls,
            _tmp: tmp,
        }
    }

    fn write_plugin(plugin_root: &Path, entry_bytes: &[u8]) {
        let dir = plugin_root.join("usb-scanner-plugin");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("entry.bin"), entry_bytes).unwrap();
        let manifest = json!({
            "name": "usb-scanner-plugin",
            "version": "1.0.0",
            "description": "Document scanner bridge",
            "author": { "name": "AutoWeave Team" },
            "entry": "entry.bin",
            "permissions": {
                "usb": { "vendorIds": ["0x04A9"], "productIds": ["0x220E"] }
            },
            "hooks": { "onLoad": "initialize", "onUnload": "teardown" },
            "signature": {
                "algorithm": "SHA-256",
                "value": "0".repeat(64),
                "signer": "tests"
            }
        });
        let signed = sign_manifest_value(manifest, &dir, DEFAULT_DENYLIST).unwrap();
        fs::write(dir.join(MANIFEST_FILE_NAME), signed.to_string()).unwrap();
    }

    async fn lifecycle_events(bus: &MemoryBus, count: usize) -> Vec<LifecycleRecord> {
        for _ in 0..200 {
            if bus.stream_len(PLUGIN_STREAM) >= count {
                return bus
                    .snapshot(PLUGIN_STREAM)
                    .iter()
                    .map(|m| LifecycleRecord::from_fields(&m.fields).unwrap())
                    .collect();
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {count} lifecycle events");
    }

    #[tokio::test]
    async fn load_publishes_loaded_and_invokes_on_load() {
        let rig = rig(Duration::from_secs(5), None);
        write_plugin(rig._tmp.path(), b"payload-v1");
        rig.loader.start().await.unwrap();

        let events = lifecycle_events(&rig.bus, 1).await;
        assert_eq!(events[0].kind, LifecycleKind::Loaded);
        assert_eq!(events[0].name, "usb-scanner-plugin");
        assert_eq!(events[0].version, "1.0.0");
        assert_eq!(
            rig.loader.plugin_state("usb-scanner-plugin"),
            Some(PluginState::Running)
        );
        assert_eq!(rig.calls.lock().as_slice(), ["initialize"]);
        assert_eq!(rig.loader.routing_snapshot().len(), 1);
        rig.loader.stop(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn tampered_entry_file_parks_plugin_failed() {
        let rig = rig(Duration::from_secs(5), None);
        write_plugin(rig._tmp.path(), b"payload-v1");
        // Flip a byte after signing.
        fs::write(
            rig._tmp.path().join("usb-scanner-plugin/entry.bin"),
            b"qayload-v1",
        )
        .unwrap();
        rig.loader.start().await.unwrap();

        let events = lifecycle_events(&rig.bus, 1).await;
        assert_eq!(events[0].kind, LifecycleKind::Failed);
        assert!(events[0]
            .reason
            .as_deref()
            .unwrap_or_default()
            .contains("signature"));
        assert_eq!(
            rig.loader.plugin_state("usb-scanner-plugin"),
            Some(PluginState::Failed)
        );
        // No worker was ever spawned.
        assert_eq!(rig.host.running_count(), 0);
        assert!(rig.calls.lock().is_empty());
        rig.loader.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn on_load_timeout_fails_plugin_and_terminates_worker() {
        let rig = rig(Duration::from_millis(50), Some(Duration::from_millis(400)));
        write_plugin(rig._tmp.path(), b"payload-v1");
        rig.loader.start().await.unwrap();

        let events = lifecycle_events(&rig.bus, 1).await;
        assert_eq!(events[0].kind, LifecycleKind::Failed);
        assert_eq!(
            rig.loader.plugin_state("usb-scanner-plugin"),
            Some(PluginState::Failed)
        );
        assert_eq!(rig.host.running_count(), 0);
        assert!(rig.loader.routing_snapshot().is_empty());
        rig.loader.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn reload_swaps_instance_and_orders_events() {
        let rig = rig(Duration::from_secs(5), None);
        write_plugin(rig._tmp.path(), b"payload-v1");
        rig.loader.start().await.unwrap();
        lifecycle_events(&rig.bus, 1).await;
        let first_instance = rig.loader.instance_of("usb-scanner-plugin").unwrap();

        // New entry bytes, freshly signed: same manifest, new digest.
        write_plugin(rig._tmp.path(), b"payload-v2");
        rig.loader.reload_plugin("usb-scanner-plugin").await;

        let events = lifecycle_events(&rig.bus, 3).await;
        assert_eq!(events[1].kind, LifecycleKind::Loaded);
        assert_eq!(events[2].kind, LifecycleKind::Unloaded);
        assert_eq!(events[2].forced, Some(false));
        // The unloaded event names the replaced instance.
        assert_eq!(events[2].instance_id, first_instance.to_string());

        let second_instance = rig.loader.instance_of("usb-scanner-plugin").unwrap();
        assert_ne!(first_instance, second_instance);
        assert_eq!(
            rig.loader.plugin_state("usb-scanner-plugin"),
            Some(PluginState::Running)
        );
        // onLoad ran twice, onUnload once on the old instance.
        assert_eq!(
            rig.calls.lock().as_slice(),
            ["initialize", "initialize", "teardown"]
        );
        rig.loader.stop(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn identical_files_reload_keeps_digest_changes_instance() {
        let rig = rig(Duration::from_secs(5), None);
        write_plugin(rig._tmp.path(), b"payload-v1");
        rig.loader.start().await.unwrap();
        lifecycle_events(&rig.bus, 1).await;
        let first_instance = rig.loader.instance_of("usb-scanner-plugin").unwrap();
        let first_digest = rig
            .loader
            .table
            .get("usb-scanner-plugin")
            .unwrap()
            .digest
            .clone();

        rig.loader.reload_plugin("usb-scanner-plugin").await;
        let second_instance = rig.loader.instance_of("usb-scanner-plugin").unwrap();
        let second_digest = rig
            .loader
            .table
            .get("usb-scanner-plugin")
            .unwrap()
            .digest
            .clone();
        assert_eq!(first_digest, second_digest);
        assert_ne!(first_instance, second_instance);
        rig.loader.stop(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn unload_stops_worker_and_publishes() {
        let rig = rig(Duration::from_secs(5), None);
        write_plugin(rig._tmp.path(), b"payload-v1");
        rig.loader.start().await.unwrap();
        lifecycle_events(&rig.bus, 1).await;

        rig.loader.unload_plugin("usb-scanner-plugin", false).await;
        let events = lifecycle_events(&rig.bus, 2).await;
        assert_eq!(events[1].kind, LifecycleKind::Unloaded);
        assert_eq!(events[1].forced, Some(false));
        assert_eq!(
            rig.loader.plugin_state("usb-scanner-plugin"),
            Some(PluginState::Stopped)
        );
        assert!(rig.loader.routing_snapshot().is_empty());
        assert_eq!(rig.host.running_count(), 0);
        assert!(rig.calls.lock().contains(&"teardown".to_string()));
        rig.loader.stop(Duration::from_secs(1)).await;
    }
}
