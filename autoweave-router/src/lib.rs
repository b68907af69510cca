//! # AutoWeave Event Router
//!
//! Pure policy: consume hotplug (and job) messages from the bus inside a
//! consumer group, match them against the permissions of every Running
//! plugin instance, and enqueue the corresponding hook on each match.
//!
//! Messages are acknowledged once every dispatch is *enqueued* — hook
//! completion is asynchronous and watched by the worker host, so a slow
//! plugin never stalls the stream. The routing table is an immutable
//! snapshot cloned from the loader per message; a hot reload between two
//! messages is observed atomically.
//!
//! Ordering: the consume loop is sequential and worker command channels
//! are FIFO, so for a given (instance, device signature) hook invocations
//! arrive in bus order. There is no cross-plugin ordering guarantee.
//!
//! When an instance reaches Running (fresh load or hot reload) the router
//! replays a synthetic `onUSBAttach` for every currently-connected device
//! matching its filter, so plugins never miss devices that were plugged in
//! before they were.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use autoweave_bus::streams::{queue_stream, HotplugRecord, UsbAction, HOTPLUG_STREAM};
use autoweave_bus::{BusError, BusMessage, EventBus};
use autoweave_host::{HookKind, WorkerHost};
use autoweave_loader::{PluginLoader, RouteTarget};

#[derive(Debug, Clone)]
pub struct EventRouterConfig {
    pub hotplug_stream: String,
    /// Consumer group shared by router instances.
    pub group: String,
    /// This router's consumer name inside the group.
    pub consumer: String,
    /// Blocking-read timeout per consume call.
    pub block: Duration,
    /// Max messages per consume call.
    pub batch: usize,
    /// Per-event hook timeout handed to the worker host.
    pub event_timeout: Duration,
}

impl Default for EventRouterConfig {
    fn default() -> Self {
        Self {
            hotplug_stream: HOTPLUG_STREAM.to_string(),
            group: "aw-routers".to_string(),
            consumer: "router-1".to_string(),
            block: Duration::from_millis(500),
            batch: 16,
            event_timeout: Duration::from_secs(2),
        }
    }
}

/// Read access to the daemon's currently-connected devices, used for
/// synthetic attach replay. Wired in by the assembly root.
pub trait DeviceCatalog: Send + Sync {
    /// Attach-shaped records for every connected device.
    fn attached_devices(&self) -> Vec<HotplugRecord>;
}

pub struct EventRouter {
    config: EventRouterConfig,
    bus: Arc<dyn EventBus>,
    loader: Arc<PluginLoader>,
    host: Arc<WorkerHost>,
    catalog: Option<Arc<dyn DeviceCatalog>>,
    running: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    dispatched: Arc<AtomicU64>,
}

impl EventRouter {
    pub fn new(
        config: EventRouterConfig,
        bus: Arc<dyn EventBus>,
        loader: Arc<PluginLoader>,
        host: Arc<WorkerHost>,
        catalog: Option<Arc<dyn DeviceCatalog>>,
    ) -> Self {
        Self {
            config,
            bus,
            loader,
            host,
            catalog,
            running: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(Vec::new()),
            dispatched: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Create the consumer group and start the consume and replay loops.
    pub async fn start(self: &Arc<Self>) -> Result<(), BusError> {
        self.bus
            .create_group(&self.config.hotplug_stream, &self.config.group)
            .await?;
        self.running.store(true, Ordering::SeqCst);

        let router = Arc::clone(self);
        let consume_task = tokio::spawn(async move { router.consume_loop().await });

        let router = Arc::clone(self);
        let replay_task = tokio::spawn(async move { router.replay_loop().await });

        let router = Arc::clone(self);
        let jobs_task = tokio::spawn(async move { router.job_loop().await });

        let mut tasks = self.tasks.lock();
        tasks.push(consume_task);
        tasks.push(replay_task);
        tasks.push(jobs_task);
        Ok(())
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
            let _ = task.await;
        }
    }

    /// Total hook dispatches enqueued.
    pub fn dispatched_count(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    async fn consume_loop(self: Arc<Self>) {
        while self.running.load(Ordering::SeqCst) {
            let messages = match self
                .bus
                .consume(
                    &self.config.hotplug_stream,
                    &self.config.group,
                    &self.config.consumer,
                    self.config.block,
                    self.config.batch,
                )
                .await
            {
                Ok(messages) => messages,
                Err(e) => {
                    debug!(error = %e, "hotplug consume failed, backing off");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    continue;
                }
            };

            for message in messages {
                self.route_message(&message);
                // Ack after every dispatch has been enqueued, not after
                // hooks complete.
                if let Err(e) = self
                    .bus
                    .ack(&self.config.hotplug_stream, &self.config.group, message.id)
                    .await
                {
                    warn!(error = %e, id = %message.id, "failed to ack hotplug message");
                }
            }
        }
    }

    fn route_message(&self, message: &BusMessage) {
        let record = match HotplugRecord::from_fields(&message.fields) {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, id = %message.id, "undecodable hotplug message, acking past it");
                return;
            }
        };
        let snapshot = self.loader.routing_snapshot();
        let hook = match record.action {
            UsbAction::Attach => HookKind::OnUsbAttach,
            UsbAction::Detach => HookKind::OnUsbDetach,
        };
        let payload = event_payload(&record);
        for target in matching_targets(&snapshot, &record) {
            match self.host.dispatch_hook(
                target.instance_id,
                hook,
                payload.clone(),
                self.config.event_timeout,
            ) {
                Ok(()) => {
                    self.dispatched.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        plugin = %target.plugin,
                        instance_id = %target.instance_id,
                        signature = %record.device_signature,
                        hook = hook.label(),
                        "dispatched usb event"
                    );
                }
                Err(e) => {
                    // The instance raced away (reload or failure); the
                    // snapshot the next message sees will be current.
                    debug!(plugin = %target.plugin, error = %e, "dispatch skipped");
                }
            }
        }
    }

    /// Replay currently-connected matching devices to instances that just
    /// reached Running.
    async fn replay_loop(self: Arc<Self>) {
        let mut ready_rx = self.loader.subscribe_ready();
        while self.running.load(Ordering::SeqCst) {
            let signal = match ready_rx.recv().await {
                Ok(signal) => signal,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "ready signals lagged, replay may be incomplete");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            };
            let Some(catalog) = &self.catalog else { continue };

            let snapshot = self.loader.routing_snapshot();
            let Some(target) = snapshot
                .iter()
                .find(|t| t.instance_id == signal.instance_id)
            else {
                continue;
            };
            for record in catalog.attached_devices() {
                if !target.usb.matches(record.vendor_id, record.product_id) {
                    continue;
                }
                let payload = event_payload(&record);
                if self
                    .host
                    .dispatch_hook(
                        target.instance_id,
                        HookKind::OnUsbAttach,
                        payload,
                        self.config.event_timeout,
                    )
                    .is_ok()
                {
                    self.dispatched.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        plugin = %target.plugin,
                        signature = %record.device_signature,
                        "replayed attach for connected device"
                    );
                }
            }
        }
    }

    /// Deliver jobs from permitted queues. The union of declared queues is
    /// re-read from the routing snapshot each round, so queue sets follow
    /// plugin loads and reloads.
    async fn job_loop(self: Arc<Self>) {
        let mut known_groups: HashSet<String> = HashSet::new();
        while self.running.load(Ordering::SeqCst) {
            let snapshot = self.loader.routing_snapshot();
            let queues: HashSet<String> = snapshot
                .iter()
                .flat_map(|t| t.queues.iter().cloned())
                .collect();
            if queues.is_empty() {
                tokio::time::sleep(Duration::from_millis(200)).await;
                continue;
            }

            for queue in &queues {
                let stream = queue_stream(queue);
                if !known_groups.contains(&stream) {
                    if let Err(e) = self.bus.create_group(&stream, &self.config.group).await {
                        debug!(error = %e, queue, "queue group creation failed");
                        continue;
                    }
                    known_groups.insert(stream.clone());
                }
                let messages = match self
                    .bus
                    .consume(
                        &stream,
                        &self.config.group,
                        &self.config.consumer,
                        Duration::from_millis(100),
                        self.config.batch,
                    )
                    .await
                {
                    Ok(messages) => messages,
                    Err(_) => continue,
                };
                for message in messages {
                    let payload = json!(message
                        .fields
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect::<std::collections::BTreeMap<_, _>>());
                    for target in snapshot.iter().filter(|t| t.queues.contains(queue)) {
                        if self
                            .host
                            .dispatch_hook(
                                target.instance_id,
                                HookKind::OnJobReceived,
                                payload.clone(),
                                self.config.event_timeout,
                            )
                            .is_ok()
                        {
                            self.dispatched.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    if let Err(e) = self.bus.ack(&stream, &self.config.group, message.id).await {
                        warn!(error = %e, queue, "failed to ack job message");
                    }
                }
            }
        }
    }
}

/// The Running instances whose USB filter admits this event.
pub fn matching_targets<'a>(
    snapshot: &'a [RouteTarget],
    record: &HotplugRecord,
) -> impl Iterator<Item = &'a RouteTarget> {
    let vendor_id = record.vendor_id;
    let product_id = record.product_id;
    snapshot
        .iter()
        .filter(move |target| target.usb.matches(vendor_id, product_id))
}

/// The event snapshot handed to `onUSBAttach`/`onUSBDetach`, mirroring the
/// wire fields.
pub fn event_payload(record: &HotplugRecord) -> serde_json::Value {
    json!({
        "source": record.source.as_str(),
        "action": record.action.as_str(),
        "vendor_id": format!("{:04x}", record.vendor_id),
        "product_id": format!("{:04x}", record.product_id),
        "device_signature": record.device_signature,
        "manufacturer": record.manufacturer,
        "product": record.product,
        "serial_number": record.serial_number,
        "bus_number": record.bus_number,
        "device_address": record.device_address,
        "port_path": record.port_path,
        "timestamp": record.timestamp,
        "device_descriptor": record.device_descriptor,
    })
}
