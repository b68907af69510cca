//! The worker host: spawning, hook invocation, host-call service, and
//! resource-fault escalation.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use autoweave_bus::streams::queue_stream;
use autoweave_bus::BufferedPublisher;
use autoweave_manifest::PluginManifest;
use autoweave_permissions::{
    AccessMode, CapabilityRequest, PermissionDenied, PermissionEvaluator,
};

use crate::entry::{EntryRegistry, HookPayload};
use crate::hostcall::{emit_plugin_log, HostCall, HostCallEnvelope, HostReply};
use crate::worker::{worker_main, HookKind, WorkerHandle};
use crate::HostError;

/// Read access to the daemon's live-device index, injected by the assembly
/// root so the host crate stays independent of the USB crate.
pub trait UsbDeviceLookup: Send + Sync {
    fn find(&self, vendor_id: u16, product_id: u16) -> Option<serde_json::Value>;
}

/// Privileged back-ends the host-call service uses after an Allow.
pub struct HostServices {
    /// Queue publishes go through the same buffered publisher as every
    /// other stream write.
    pub publisher: Option<Arc<BufferedPublisher>>,
    pub usb_lookup: Option<Arc<dyn UsbDeviceLookup>>,
    pub http: reqwest::Client,
}

impl HostServices {
    pub fn new(
        publisher: Option<Arc<BufferedPublisher>>,
        usb_lookup: Option<Arc<dyn UsbDeviceLookup>>,
    ) -> Self {
        Self {
            publisher,
            usb_lookup,
            http: reqwest::Client::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerHostConfig {
    /// Bound on a single host-call round trip as seen by the plugin.
    pub hostcall_timeout: Duration,
    /// Grace window for heap-ceiling overshoot before force-termination.
    pub heap_breach_grace: Duration,
    /// Consecutive hook timeouts before the instance is reported failed.
    pub timeout_strike_limit: u32,
}

impl Default for WorkerHostConfig {
    fn default() -> Self {
        Self {
            hostcall_timeout: Duration::from_secs(5),
            heap_breach_grace: Duration::from_millis(250),
            timeout_strike_limit: 3,
        }
    }
}

/// A resource or hook fault escalated to the loader, which owns the state
/// machine and decides the transition.
#[derive(Debug, Clone)]
pub struct WorkerFault {
    pub instance_id: Uuid,
    pub plugin: String,
    pub version: String,
    pub kind: WorkerFaultKind,
}

#[derive(Debug, Clone)]
pub enum WorkerFaultKind {
    /// Sustained heap-ceiling breach past the grace window.
    HeapLimitExceeded,
    /// `timeout_strike_limit` consecutive hook timeouts.
    RepeatedHookTimeouts { hook: String },
}

/// Spawns and supervises one isolated worker per plugin instance.
///
/// The host holds workers by instance id only; the loader owns the plugin
/// records and drives lifecycle transitions.
pub struct WorkerHost {
    config: WorkerHostConfig,
    registry: Arc<EntryRegistry>,
    services: Arc<HostServices>,
    workers: DashMap<Uuid, Arc<WorkerHandle>>,
    faults_tx: mpsc::UnboundedSender<WorkerFault>,
    faults_rx: Mutex<Option<mpsc::UnboundedReceiver<WorkerFault>>>,
    hook_timeouts: AtomicU64,
}

impl WorkerHost {
    pub fn new(
        config: WorkerHostConfig,
        registry: Arc<EntryRegistry>,
        services: Arc<HostServices>,
    ) -> Self {
        let (faults_tx, faults_rx) = mpsc::unbounded_channel();
        Self {
            config,
            registry,
            services,
            workers: DashMap::new(),
            faults_tx,
            faults_rx: Mutex::new(Some(faults_rx)),
            hook_timeouts: AtomicU64::new(0),
        }
    }

    /// The fault stream. Single consumer; the loader takes it at wiring
    /// time.
    pub fn take_fault_stream(&self) -> Option<mpsc::UnboundedReceiver<WorkerFault>> {
        self.faults_rx.lock().take()
    }

    /// Spawn an isolated worker for a validated manifest. Returns once the
    /// entry has published its hook table; `onLoad` is a separate,
    /// loader-driven invocation.
    pub async fn spawn(
        &self,
        manifest: &PluginManifest,
        evaluator: Arc<PermissionEvaluator>,
        ready_timeout: Duration,
    ) -> Result<Uuid, HostError> {
        let entry = self.registry.instantiate(&manifest.name).ok_or_else(|| {
            HostError::WorkerSpawnFailed {
                plugin: manifest.name.clone(),
                reason: format!("no entry registered for `{}`", manifest.entry),
            }
        })?;

        let instance_id = Uuid::new_v4();
        let (call_tx, call_rx) = mpsc::unbounded_channel();
        let ctx = crate::hostcall::HostContext::new(
            manifest.name.clone(),
            instance_id,
            call_tx,
            self.config.hostcall_timeout,
        );
        let (cmd_tx, cmd_rx) = std_mpsc::channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        let thread = std::thread::Builder::new()
            .name(format!("plugin-{}", manifest.name))
            .spawn(move || worker_main(entry, ctx, cmd_rx, ready_tx))
            .map_err(|e| HostError::WorkerSpawnFailed {
                plugin: manifest.name.clone(),
                reason: e.to_string(),
            })?;

        let service = tokio::spawn(host_call_service(
            manifest.name.clone(),
            manifest.version.clone(),
            instance_id,
            call_rx,
            Arc::clone(&evaluator),
            Arc::clone(&self.services),
            self.config.clone(),
            self.faults_tx.clone(),
        ));

        let handle = Arc::new(WorkerHandle {
            instance_id,
            plugin: manifest.name.clone(),
            version: manifest.version.clone(),
            hooks: manifest.hooks.clone(),
            evaluator,
            cmd_tx: Mutex::new(Some(cmd_tx)),
            thread: Mutex::new(Some(thread)),
            service: Mutex::new(Some(service)),
            timeout_strikes: AtomicU32::new(0),
        });

        match tokio::time::timeout(ready_timeout, ready_rx).await {
            Ok(Ok(Ok(()))) => {
                debug!(plugin = %manifest.name, %instance_id, "worker ready, hook table published");
                self.workers.insert(instance_id, handle);
                Ok(instance_id)
            }
            Ok(Ok(Err(reason))) => {
                handle.shutdown(true).await;
                Err(HostError::WorkerSpawnFailed {
                    plugin: manifest.name.clone(),
                    reason,
                })
            }
            Ok(Err(_)) => {
                handle.shutdown(true).await;
                Err(HostError::WorkerSpawnFailed {
                    plugin: manifest.name.clone(),
                    reason: "worker thread died during hook registration".into(),
                })
            }
            Err(_) => {
                handle.shutdown(true).await;
                Err(HostError::WorkerSpawnFailed {
                    plugin: manifest.name.clone(),
                    reason: "hook registration timed out".into(),
                })
            }
        }
    }

    /// Invoke a hook and wait for its result under `timeout`. Undeclared
    /// hooks succeed as no-ops.
    pub async fn invoke_hook(
        &self,
        instance_id: Uuid,
        kind: HookKind,
        payload: HookPayload,
        timeout: Duration,
    ) -> Result<(), HostError> {
        let (handle, hook, done_rx) = match self.begin_invoke(instance_id, kind, payload)? {
            Some(parts) => parts,
            None => return Ok(()),
        };
        self.await_hook(&handle, &hook, done_rx, timeout).await
    }

    /// Enqueue a hook invocation and monitor it asynchronously. The
    /// command is on the instance's FIFO channel when this returns, which
    /// is the router's ack point; completion is watched by a background
    /// task so event dispatch never blocks on hook execution.
    pub fn dispatch_hook(
        self: &Arc<Self>,
        instance_id: Uuid,
        kind: HookKind,
        payload: HookPayload,
        timeout: Duration,
    ) -> Result<(), HostError> {
        let (handle, hook, done_rx) = match self.begin_invoke(instance_id, kind, payload)? {
            Some(parts) => parts,
            None => return Ok(()),
        };
        let host = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = host.await_hook(&handle, &hook, done_rx, timeout).await {
                warn!(
                    plugin = %handle.plugin,
                    instance_id = %handle.instance_id,
                    error = %e,
                    "dispatched hook failed"
                );
            }
        });
        Ok(())
    }

    fn begin_invoke(
        &self,
        instance_id: Uuid,
        kind: HookKind,
        payload: HookPayload,
    ) -> Result<Option<(Arc<WorkerHandle>, String, oneshot::Receiver<Result<(), String>>)>, HostError>
    {
        let handle = self
            .workers
            .get(&instance_id)
            .map(|h| Arc::clone(h.value()))
            .ok_or(HostError::UnknownInstance(instance_id))?;
        let Some(hook) = kind.resolve(&handle.hooks).cloned() else {
            return Ok(None);
        };
        let (done_tx, done_rx) = oneshot::channel();
        if !handle.enqueue(hook.clone(), payload, done_tx) {
            return Err(HostError::UnknownInstance(instance_id));
        }
        Ok(Some((handle, hook, done_rx)))
    }

    async fn await_hook(
        &self,
        handle: &Arc<WorkerHandle>,
        hook: &str,
        done_rx: oneshot::Receiver<Result<(), String>>,
        timeout: Duration,
    ) -> Result<(), HostError> {
        match tokio::time::timeout(timeout, done_rx).await {
            Ok(Ok(Ok(()))) => {
                handle.timeout_strikes.store(0, Ordering::Relaxed);
                Ok(())
            }
            Ok(Ok(Err(reason))) => {
                handle.timeout_strikes.store(0, Ordering::Relaxed);
                Err(HostError::HookError {
                    hook: hook.to_string(),
                    reason,
                })
            }
            Ok(Err(_)) => Err(HostError::HookError {
                hook: hook.to_string(),
                reason: "worker terminated before the hook completed".into(),
            }),
            Err(_) => {
                self.hook_timeouts.fetch_add(1, Ordering::Relaxed);
                let strikes = handle.timeout_strikes.fetch_add(1, Ordering::Relaxed) + 1;
                if strikes >= self.config.timeout_strike_limit {
                    let _ = self.faults_tx.send(WorkerFault {
                        instance_id: handle.instance_id,
                        plugin: handle.plugin.clone(),
                        version: handle.version.clone(),
                        kind: WorkerFaultKind::RepeatedHookTimeouts {
                            hook: hook.to_string(),
                        },
                    });
                }
                Err(HostError::HookTimeout {
                    hook: hook.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Terminate a worker. Graceful termination drains the command loop;
    /// forced termination abandons it. The caller (loader) is responsible
    /// for having invoked `onUnload` first when draining.
    pub async fn terminate(&self, instance_id: Uuid, forced: bool) -> Result<(), HostError> {
        let Some((_, handle)) = self.workers.remove(&instance_id) else {
            return Err(HostError::UnknownInstance(instance_id));
        };
        info!(plugin = %handle.plugin, %instance_id, forced, "terminating worker");
        handle.shutdown(forced).await;
        Ok(())
    }

    pub fn running_count(&self) -> usize {
        self.workers.len()
    }

    /// Heap bytes currently accounted to an instance.
    pub fn heap_used(&self, instance_id: Uuid) -> Option<u64> {
        self.workers
            .get(&instance_id)
            .map(|handle| handle.evaluator.heap_used())
    }

    pub fn is_running(&self, instance_id: Uuid) -> bool {
        self.workers.contains_key(&instance_id)
    }

    /// Total hook timeouts observed, for the metrics contract.
    pub fn hook_timeout_count(&self) -> u64 {
        self.hook_timeouts.load(Ordering::Relaxed)
    }
}

/// Per-worker mediation service: decide, act, reply.
#[allow(clippy::too_many_arguments)]
async fn host_call_service(
    plugin: String,
    version: String,
    instance_id: Uuid,
    mut rx: mpsc::UnboundedReceiver<HostCallEnvelope>,
    evaluator: Arc<PermissionEvaluator>,
    services: Arc<HostServices>,
    config: WorkerHostConfig,
    faults: mpsc::UnboundedSender<WorkerFault>,
) {
    // First overshoot inside the grace window is tolerated; a breach that
    // persists past it escalates to force-termination.
    let mut first_breach: Option<Instant> = None;

    while let Some(envelope) = rx.recv().await {
        let reply = match envelope.call {
            // Allocation accounting is handled inline so the breach state
            // can be tracked against the evaluator's actual decision.
            HostCall::MemoryAlloc { bytes } => {
                match evaluator.check(&CapabilityRequest::MemoryAlloc { bytes }) {
                    Ok(()) => {
                        first_breach = None;
                        HostReply::Ok
                    }
                    Err(e @ PermissionDenied::HeapExhausted { .. }) => {
                        let now = Instant::now();
                        match first_breach {
                            None => first_breach = Some(now),
                            Some(first)
                                if now.duration_since(first) > config.heap_breach_grace =>
                            {
                                warn!(plugin, %instance_id, "sustained heap breach, escalating");
                                let _ = faults.send(WorkerFault {
                                    instance_id,
                                    plugin: plugin.clone(),
                                    version: version.clone(),
                                    kind: WorkerFaultKind::HeapLimitExceeded,
                                });
                                first_breach = None;
                            }
                            Some(_) => {}
                        }
                        denied(e)
                    }
                    Err(e) => denied(e),
                }
            }
            call => handle_call(&plugin, instance_id, call, &evaluator, &services).await,
        };

        let _ = envelope.reply.send(reply);
    }
    debug!(plugin, %instance_id, "host-call service stopped");
}

async fn handle_call(
    plugin: &str,
    instance_id: Uuid,
    call: HostCall,
    evaluator: &PermissionEvaluator,
    services: &HostServices,
) -> HostReply {
    match call {
        HostCall::FsRead { path } => {
            if let Err(e) = evaluator.check(&CapabilityRequest::Fs {
                path: path.clone(),
                mode: AccessMode::Read,
            }) {
                return denied(e);
            }
            match tokio::fs::read(&path).await {
                Ok(bytes) => HostReply::Bytes(bytes),
                Err(e) => HostReply::Failed(e.to_string()),
            }
        }

        HostCall::FsWrite { path, bytes } => {
            if let Err(e) = evaluator.check(&CapabilityRequest::Fs {
                path: path.clone(),
                mode: AccessMode::Write,
            }) {
                return denied(e);
            }
            match tokio::fs::write(&path, &bytes).await {
                Ok(()) => HostReply::Ok,
                Err(e) => HostReply::Failed(e.to_string()),
            }
        }

        HostCall::HttpGet { url } => {
            if let Err(e) = evaluator.check(&CapabilityRequest::NetOut { origin: url.clone() }) {
                return denied(e);
            }
            match services.http.get(url.as_str()).send().await {
                Ok(response) => match response.text().await {
                    Ok(body) => HostReply::Text(body),
                    Err(e) => HostReply::Failed(e.to_string()),
                },
                Err(e) => HostReply::Failed(e.to_string()),
            }
        }

        HostCall::NetBind { port, interface } => {
            match evaluator.check(&CapabilityRequest::NetIn { port, interface }) {
                Ok(()) => HostReply::Ok,
                Err(e) => denied(e),
            }
        }

        HostCall::UsbOpen {
            vendor_id,
            product_id,
        } => {
            if let Err(e) = evaluator.check(&CapabilityRequest::UsbOpen {
                vendor_id,
                product_id,
            }) {
                return denied(e);
            }
            match services
                .usb_lookup
                .as_ref()
                .and_then(|lookup| lookup.find(vendor_id, product_id))
            {
                Some(descriptor) => HostReply::Device(descriptor),
                None => HostReply::Failed(format!(
                    "device {vendor_id:04x}:{product_id:04x} is not connected"
                )),
            }
        }

        HostCall::QueuePublish { queue, fields } => {
            if let Err(e) = evaluator.check(&CapabilityRequest::QueuePublish {
                queue: queue.clone(),
            }) {
                return denied(e);
            }
            match &services.publisher {
                Some(publisher) => {
                    publisher.enqueue(&queue_stream(&queue), fields);
                    HostReply::Ok
                }
                None => HostReply::Failed("no queue publisher configured".into()),
            }
        }

        HostCall::MemoryAlloc { bytes } => {
            match evaluator.check(&CapabilityRequest::MemoryAlloc { bytes }) {
                Ok(()) => HostReply::Ok,
                Err(e) => denied(e),
            }
        }

        HostCall::MemoryRelease { bytes } => {
            evaluator.release(bytes);
            HostReply::Ok
        }

        HostCall::WorkerSpawn => match evaluator.check(&CapabilityRequest::WorkerSpawn) {
            Ok(()) => HostReply::Ok,
            Err(e) => denied(e),
        },

        HostCall::WorkerExited => {
            evaluator.worker_exited();
            HostReply::Ok
        }

        HostCall::Log { level, message } => {
            emit_plugin_log(plugin, instance_id, level, &message);
            HostReply::Ok
        }
    }
}

fn denied(reason: PermissionDenied) -> HostReply {
    HostReply::Denied(reason.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{HookTable, PluginEntry};
    use autoweave_permissions::PermissionSet;
    use serde_json::json;

    struct TestEntry {
        calls: Arc<Mutex<Vec<String>>>,
        fail_register: bool,
    }

    impl PluginEntry for TestEntry {
        fn register_hooks(&mut self, table: &mut HookTable) -> anyhow::Result<()> {
            if self.fail_register {
                anyhow::bail!("entry refused to register");
            }
            let calls = Arc::clone(&self.calls);
            table.register("initialize", move |ctx, _payload| {
                ctx.log(crate::hostcall::LogLevel::Info, "initializing");
                calls.lock().push("initialize".into());
                Ok(())
            });
            let calls = Arc::clone(&self.calls);
            table.register("handleScannerAttach", move |_ctx, payload| {
                let signature = payload["device_signature"].as_str().unwrap_or("?");
                calls.lock().push(format!("attach:{signature}"));
                Ok(())
            });
            table.register("explode", |_ctx, _payload| anyhow::bail!("boom"));
            table.register("crawl", |_ctx, _payload| {
                std::thread::sleep(Duration::from_millis(200));
                Ok(())
            });
            table.register("readSecrets", |ctx, _payload| {
                ctx.read_file("/etc/shadow")?;
                Ok(())
            });
            table.register("allocate", |ctx, payload| {
                let bytes = payload["bytes"].as_u64().unwrap_or(0);
                ctx.alloc(bytes)?;
                Ok(())
            });
            Ok(())
        }
    }

    fn manifest(hooks: serde_json::Value) -> PluginManifest {
        serde_json::from_value(json!({
            "name": "usb-scanner-plugin",
            "version": "1.0.0",
            "description": "test plugin",
            "author": { "name": "tests" },
            "entry": "entry.bin",
            "permissions": {
                "usb": { "vendorIds": ["0x04A9"], "productIds": ["0x220E"] },
                "memory": { "maxHeapMB": 10, "maxWorkers": 1 }
            },
            "hooks": hooks,
            "signature": {
                "algorithm": "SHA-256",
                "value": "0".repeat(64),
                "signer": "tests"
            }
        }))
        .expect("test manifest")
    }

    struct Rig {
        host: Arc<WorkerHost>,
        calls: Arc<Mutex<Vec<String>>>,
        faults: mpsc::UnboundedReceiver<WorkerFault>,
    }

    fn rig(config: WorkerHostConfig, fail_register: bool) -> Rig {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let registry = Arc::new(EntryRegistry::new());
        let factory_calls = Arc::clone(&calls);
        registry.register("usb-scanner-plugin", move || {
            Box::new(TestEntry {
                calls: Arc::clone(&factory_calls),
                fail_register,
            })
        });
        let host = Arc::new(WorkerHost::new(
            config,
            registry,
            Arc::new(HostServices::new(None, None)),
        ));
        let faults = host.take_fault_stream().expect("fault stream");
        Rig { host, calls, faults }
    }

    fn evaluator(manifest: &PluginManifest) -> Arc<PermissionEvaluator> {
        Arc::new(PermissionEvaluator::new(PermissionSet::from_declaration(
            &manifest.permissions,
        )))
    }

    #[tokio::test]
    async fn spawn_and_invoke_on_load() {
        let rig = rig(WorkerHostConfig::default(), false);
        let manifest = manifest(json!({ "onLoad": "initialize" }));
        let id = rig
            .host
            .spawn(&manifest, evaluator(&manifest), Duration::from_secs(1))
            .await
            .unwrap();
        rig.host
            .invoke_hook(id, HookKind::OnLoad, json!({}), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(rig.calls.lock().as_slice(), ["initialize"]);
        rig.host.terminate(id, false).await.unwrap();
        assert!(!rig.host.is_running(id));
    }

    #[tokio::test]
    async fn undeclared_hook_is_a_noop() {
        let rig = rig(WorkerHostConfig::default(), false);
        let manifest = manifest(json!({}));
        let id = rig
            .host
            .spawn(&manifest, evaluator(&manifest), Duration::from_secs(1))
            .await
            .unwrap();
        rig.host
            .invoke_hook(id, HookKind::OnUsbAttach, json!({}), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(rig.calls.lock().is_empty());
        rig.host.terminate(id, true).await.unwrap();
    }

    #[tokio::test]
    async fn failing_registration_fails_spawn() {
        let rig = rig(WorkerHostConfig::default(), true);
        let manifest = manifest(json!({}));
        let err = rig
            .host
            .spawn(&manifest, evaluator(&manifest), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::WorkerSpawnFailed { .. }));
        assert_eq!(rig.host.running_count(), 0);
    }

    #[tokio::test]
    async fn unregistered_entry_fails_spawn() {
        let rig = rig(WorkerHostConfig::default(), false);
        let mut manifest = manifest(json!({}));
        manifest.name = "unknown-plugin".into();
        let err = rig
            .host
            .spawn(&manifest, evaluator(&manifest), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::WorkerSpawnFailed { .. }));
    }

    #[tokio::test]
    async fn hook_error_is_reported() {
        let rig = rig(WorkerHostConfig::default(), false);
        let manifest = manifest(json!({ "onUnload": "explode" }));
        let id = rig
            .host
            .spawn(&manifest, evaluator(&manifest), Duration::from_secs(1))
            .await
            .unwrap();
        let err = rig
            .host
            .invoke_hook(id, HookKind::OnUnload, json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::HookError { reason, .. } if reason.contains("boom")));
        rig.host.terminate(id, true).await.unwrap();
    }

    #[tokio::test]
    async fn repeated_timeouts_escalate_to_fault() {
        let rig = rig(
            WorkerHostConfig {
                timeout_strike_limit: 2,
                ..Default::default()
            },
            false,
        );
        let manifest = manifest(json!({ "onUSBAttach": "crawl" }));
        let id = rig
            .host
            .spawn(&manifest, evaluator(&manifest), Duration::from_secs(1))
            .await
            .unwrap();

        let mut faults = rig.faults;
        for _ in 0..2 {
            let err = rig
                .host
                .invoke_hook(id, HookKind::OnUsbAttach, json!({}), Duration::from_millis(20))
                .await
                .unwrap_err();
            assert!(matches!(err, HostError::HookTimeout { .. }));
        }
        let fault = faults.recv().await.expect("fault");
        assert!(matches!(
            fault.kind,
            WorkerFaultKind::RepeatedHookTimeouts { .. }
        ));
        assert_eq!(rig.host.hook_timeout_count(), 2);
        rig.host.terminate(id, true).await.unwrap();
    }

    #[tokio::test]
    async fn denied_capability_surfaces_to_the_hook() {
        let rig = rig(WorkerHostConfig::default(), false);
        let manifest = manifest(json!({ "onLoad": "readSecrets" }));
        let id = rig
            .host
            .spawn(&manifest, evaluator(&manifest), Duration::from_secs(1))
            .await
            .unwrap();
        let err = rig
            .host
            .invoke_hook(id, HookKind::OnLoad, json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(
            matches!(err, HostError::HookError { reason, .. } if reason.contains("permission denied"))
        );
        rig.host.terminate(id, true).await.unwrap();
    }

    #[tokio::test]
    async fn sustained_heap_breach_raises_fault() {
        let rig = rig(
            WorkerHostConfig {
                heap_breach_grace: Duration::from_millis(10),
                ..Default::default()
            },
            false,
        );
        // 10 MB ceiling; each call asks for 20 MB.
        let manifest = manifest(json!({ "onJobReceived": "allocate" }));
        let id = rig
            .host
            .spawn(&manifest, evaluator(&manifest), Duration::from_secs(1))
            .await
            .unwrap();

        let payload = json!({ "bytes": 20_000_000u64 });
        let mut faults = rig.faults;
        // First breach is tolerated inside the grace window.
        let _ = rig
            .host
            .invoke_hook(id, HookKind::OnJobReceived, payload.clone(), Duration::from_secs(1))
            .await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        let _ = rig
            .host
            .invoke_hook(id, HookKind::OnJobReceived, payload, Duration::from_secs(1))
            .await;

        let fault = faults.recv().await.expect("fault");
        assert!(matches!(fault.kind, WorkerFaultKind::HeapLimitExceeded));
        rig.host.terminate(id, true).await.unwrap();
    }
}
