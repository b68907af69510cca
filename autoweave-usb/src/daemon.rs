//! The daemon: source selection, the event pipeline, and the live index.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use autoweave_bus::streams::{EventSource, UsbAction, HOTPLUG_STREAM};
use autoweave_bus::BufferedPublisher;

use crate::backend::{RawUsbNotification, StringDescriptors, UsbBackend};
use crate::device::{device_signature, UsbDeviceInfo};
use crate::UsbError;

/// Whether the fallback source may be promoted when the primary fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FallbackPolicy {
    /// Promote the fallback when the primary is unusable.
    #[default]
    Auto,
    /// Skip the primary entirely and run on the fallback.
    On,
    /// Never use the fallback; a dead primary means Offline.
    Off,
}

#[derive(Debug, Clone)]
pub struct UsbDaemonConfig {
    /// Suppression window for repeated (signature, action) pairs.
    pub debounce_window: Duration,
    /// Overall bound on string-descriptor extraction per device.
    pub descriptor_timeout: Duration,
    pub fallback: FallbackPolicy,
    /// Stream the pipeline publishes to.
    pub hotplug_stream: String,
}

impl Default for UsbDaemonConfig {
    fn default() -> Self {
        Self {
            debounce_window: Duration::from_millis(50),
            descriptor_timeout: Duration::from_millis(200),
            fallback: FallbackPolicy::Auto,
            hotplug_stream: HOTPLUG_STREAM.to_string(),
        }
    }
}

/// Daemon health, reported through a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbHealth {
    /// Primary source active.
    Healthy,
    /// Fallback source active.
    Degraded,
    /// No source usable.
    Offline,
}

/// Pipeline counters for the metrics contract.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct UsbDaemonCounters {
    pub events_published: u64,
    /// Debounce and state-consistency suppressions.
    pub events_suppressed: u64,
    pub descriptor_timeouts: u64,
}

/// The USB hot-plug daemon. Owns the live-device index exclusively; all
/// index mutation happens on the single pipeline task.
pub struct UsbDaemon {
    config: UsbDaemonConfig,
    publisher: Arc<BufferedPublisher>,
    primary: Arc<dyn UsbBackend>,
    fallback: Option<Arc<dyn UsbBackend>>,
    active: Mutex<Option<Arc<dyn UsbBackend>>>,
    index: Arc<DashMap<String, UsbDeviceInfo>>,
    health_tx: watch::Sender<UsbHealth>,
    health_rx: watch::Receiver<UsbHealth>,
    pipeline: Mutex<Option<JoinHandle<()>>>,
    published: Arc<AtomicU64>,
    suppressed: Arc<AtomicU64>,
    descriptor_timeouts: Arc<AtomicU64>,
}

impl UsbDaemon {
    pub fn new(
        config: UsbDaemonConfig,
        publisher: Arc<BufferedPublisher>,
        primary: Arc<dyn UsbBackend>,
        fallback: Option<Arc<dyn UsbBackend>>,
    ) -> Self {
        let (health_tx, health_rx) = watch::channel(UsbHealth::Offline);
        Self {
            config,
            publisher,
            primary,
            fallback,
            active: Mutex::new(None),
            index: Arc::new(DashMap::new()),
            health_tx,
            health_rx,
            pipeline: Mutex::new(None),
            published: Arc::new(AtomicU64::new(0)),
            suppressed: Arc::new(AtomicU64::new(0)),
            descriptor_timeouts: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Start monitoring: select a source, subscribe to notifications, then
    /// enumerate and emit an attach for every device not already indexed.
    pub async fn start(&self) -> Result<(), UsbError> {
        let (tx, rx) = mpsc::unbounded_channel();

        let (backend, health) = self.select_source(tx).await?;
        info!(source = ?backend.source(), "usb monitoring source active");
        *self.active.lock() = Some(Arc::clone(&backend));
        let _ = self.health_tx.send(health);

        let pipeline = Pipeline {
            config: self.config.clone(),
            publisher: Arc::clone(&self.publisher),
            backend: Arc::clone(&backend),
            index: Arc::clone(&self.index),
            pending: HashMap::new(),
            published: Arc::clone(&self.published),
            suppressed: Arc::clone(&self.suppressed),
            descriptor_timeouts: Arc::clone(&self.descriptor_timeouts),
        };

        // Reconciliation: devices present now that are not in the index get
        // a synthetic attach through the normal pipeline.
        let initial = backend.enumerate().await?;
        let handle = tokio::spawn(pipeline.run(initial, rx));
        *self.pipeline.lock() = Some(handle);
        Ok(())
    }

    async fn select_source(
        &self,
        sink: mpsc::UnboundedSender<RawUsbNotification>,
    ) -> Result<(Arc<dyn UsbBackend>, UsbHealth), UsbError> {
        if self.config.fallback != FallbackPolicy::On {
            match self.primary.start(sink.clone()).await {
                Ok(()) => return Ok((Arc::clone(&self.primary), UsbHealth::Healthy)),
                Err(e) if self.config.fallback == FallbackPolicy::Off => {
                    let _ = self.health_tx.send(UsbHealth::Offline);
                    return Err(e);
                }
                Err(e) => {
                    warn!(error = %e, "primary usb source failed, promoting fallback");
                }
            }
        }

        let Some(fallback) = &self.fallback else {
            let _ = self.health_tx.send(UsbHealth::Offline);
            return Err(UsbError::SourceUnavailable(
                "no fallback usb source is available on this platform".into(),
            ));
        };
        match fallback.start(sink).await {
            Ok(()) => Ok((Arc::clone(fallback), UsbHealth::Degraded)),
            Err(e) => {
                let _ = self.health_tx.send(UsbHealth::Offline);
                Err(e)
            }
        }
    }

    /// Stop monitoring and drain in-flight pipeline state.
    pub async fn stop(&self) {
        let active = self.active.lock().take();
        if let Some(backend) = active {
            backend.stop().await;
        }
        let handle = self.pipeline.lock().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
        let _ = self.health_tx.send(UsbHealth::Offline);
    }

    pub fn health(&self) -> UsbHealth {
        *self.health_rx.borrow()
    }

    pub fn subscribe_health(&self) -> watch::Receiver<UsbHealth> {
        self.health_rx.clone()
    }

    /// Snapshot of the live-device index.
    pub fn connected_devices(&self) -> Vec<UsbDeviceInfo> {
        self.index.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Number of devices currently attached.
    pub fn connected_count(&self) -> usize {
        self.index.len()
    }

    pub fn counters(&self) -> UsbDaemonCounters {
        UsbDaemonCounters {
            events_published: self.published.load(Ordering::Relaxed),
            events_suppressed: self.suppressed.load(Ordering::Relaxed),
            descriptor_timeouts: self.descriptor_timeouts.load(Ordering::Relaxed),
        }
    }
}

/// One observation waiting out the debounce window before it is committed.
struct Pending {
    raw: RawUsbNotification,
    deadline: Instant,
}

/// Single-writer pipeline state. Everything that mutates the index or
/// publishes lives here, on one task.
///
/// Debouncing is deferred-commit: an observation is held for the window
/// before it takes effect. A same-action repeat inside the window is
/// hardware bounce and is dropped; an opposite-action arrival inside the
/// window cancels the held observation entirely, so a detach+reattach
/// bounce nets zero events and the device reads as continuously attached.
struct Pipeline {
    config: UsbDaemonConfig,
    publisher: Arc<BufferedPublisher>,
    backend: Arc<dyn UsbBackend>,
    index: Arc<DashMap<String, UsbDeviceInfo>>,
    pending: HashMap<String, Pending>,
    published: Arc<AtomicU64>,
    suppressed: Arc<AtomicU64>,
    descriptor_timeouts: Arc<AtomicU64>,
}

impl Pipeline {
    async fn run(
        mut self,
        initial: Vec<RawUsbNotification>,
        mut rx: mpsc::UnboundedReceiver<RawUsbNotification>,
    ) {
        for notification in initial {
            self.observe(notification);
        }
        loop {
            let next_deadline = self.pending.values().map(|p| p.deadline).min();
            tokio::select! {
                notification = rx.recv() => {
                    match notification {
                        Some(notification) => self.observe(notification),
                        None => break,
                    }
                }
                _ = sleep_until_or_forever(next_deadline) => {
                    self.flush_due().await;
                }
            }
        }
        // Drain whatever already settled before shutdown.
        self.flush_due().await;
        debug!("usb pipeline channel closed");
    }

    /// Steps 1-3 of the pipeline: signature, debounce, state consistency.
    fn observe(&mut self, raw: RawUsbNotification) {
        let signature = device_signature(
            raw.vendor_id,
            raw.product_id,
            raw.bus_number,
            raw.device_address,
        );

        if let Some(held) = self.pending.get(&signature) {
            if held.raw.action == raw.action {
                // Same-action repeat inside the window: bounce, drop it.
                self.suppressed.fetch_add(1, Ordering::Relaxed);
                debug!(%signature, action = ?raw.action, "suppressed duplicate inside debounce window");
            } else {
                // Opposite action inside the window: the pair annihilates.
                self.pending.remove(&signature);
                self.suppressed.fetch_add(2, Ordering::Relaxed);
                debug!(%signature, "suppressed bounce pair inside debounce window");
            }
            return;
        }

        // State consistency against the committed index.
        let already_attached = self.index.contains_key(&signature);
        let consistent = match raw.action {
            UsbAction::Attach => !already_attached,
            UsbAction::Detach => already_attached,
        };
        if !consistent {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            debug!(%signature, action = ?raw.action, "dropped state-inconsistent notification");
            return;
        }

        self.pending.insert(
            signature,
            Pending {
                raw,
                deadline: Instant::now() + self.config.debounce_window,
            },
        );
    }

    /// Steps 4-6 for every observation whose window has elapsed: descriptor
    /// extraction, index update, publish. Commit order follows deadline
    /// order, which preserves per-signature real order.
    async fn flush_due(&mut self) {
        let now = Instant::now();
        let mut due: Vec<(String, Pending)> = Vec::new();
        let signatures: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(s, _)| s.clone())
            .collect();
        for signature in signatures {
            if let Some(pending) = self.pending.remove(&signature) {
                due.push((signature, pending));
            }
        }
        due.sort_by_key(|(_, p)| p.deadline);
        for (signature, pending) in due {
            self.commit(signature, pending.raw).await;
        }
    }

    async fn commit(&mut self, signature: String, raw: RawUsbNotification) {
        let source = self.backend.source();
        let record = match raw.action {
            UsbAction::Attach => {
                let strings = self.extract_strings(&raw).await;
                let info = UsbDeviceInfo {
                    signature: signature.clone(),
                    vendor_id: raw.vendor_id,
                    product_id: raw.product_id,
                    bus_number: raw.bus_number,
                    device_address: raw.device_address,
                    port_path: raw.port_path.clone(),
                    manufacturer: strings.manufacturer,
                    product: strings.product,
                    serial_number: strings.serial_number,
                    descriptor: raw.descriptor.clone(),
                    first_seen_at: chrono::Utc::now(),
                };
                let record = info.to_record(UsbAction::Attach, source);
                self.index.insert(signature.clone(), info);
                record
            }
            UsbAction::Detach => {
                // Snapshot fields come from the indexed attach-time record.
                // Consistency was checked at observation time and only this
                // task writes the index.
                let Some((_, info)) = self.index.remove(&signature) else {
                    warn!(%signature, "detach for unindexed device slipped past consistency check");
                    return;
                };
                info.to_record(UsbAction::Detach, source)
            }
        };

        self.publisher
            .enqueue(&self.config.hotplug_stream, record.to_fields());
        self.published.fetch_add(1, Ordering::Relaxed);
        debug!(%signature, action = ?raw.action, "published hotplug event");
    }

    async fn extract_strings(&self, raw: &RawUsbNotification) -> StringDescriptors {
        match tokio::time::timeout(
            self.config.descriptor_timeout,
            self.backend.read_strings(raw),
        )
        .await
        {
            Ok(Ok(strings)) => strings,
            Ok(Err(e)) => {
                debug!(error = %e, "string descriptor read failed, proceeding with empty values");
                StringDescriptors::default()
            }
            Err(_) => {
                self.descriptor_timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(
                    vendor_id = format!("{:04x}", raw.vendor_id),
                    product_id = format!("{:04x}", raw.product_id),
                    "string descriptor extraction timed out"
                );
                StringDescriptors::default()
            }
        }
    }
}

async fn sleep_until_or_forever(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MockBackend, MockDevice};
    use autoweave_bus::{streams::HotplugRecord, MemoryBus, PublisherConfig};

    fn scanner() -> MockDevice {
        MockDevice::new(0x04a9, 0x220e, 1, 5).with_strings("Canon", "CanoScan", "S123")
    }

    struct Rig {
        bus: Arc<MemoryBus>,
        backend: Arc<MockBackend>,
        daemon: UsbDaemon,
    }

    async fn rig(config: UsbDaemonConfig) -> Rig {
        let bus = Arc::new(MemoryBus::new());
        let publisher = Arc::new(BufferedPublisher::new(
            bus.clone() as Arc<dyn autoweave_bus::EventBus>,
            PublisherConfig::default(),
        ));
        let backend = Arc::new(MockBackend::new(EventSource::Primary));
        let daemon = UsbDaemon::new(
            config,
            publisher,
            backend.clone() as Arc<dyn UsbBackend>,
            None,
        );
        Rig { bus, backend, daemon }
    }

    async fn wait_for_events(bus: &MemoryBus, count: usize) -> Vec<HotplugRecord> {
        for _ in 0..200 {
            if bus.stream_len(HOTPLUG_STREAM) >= count {
                return bus
                    .snapshot(HOTPLUG_STREAM)
                    .iter()
                    .map(|m| HotplugRecord::from_fields(&m.fields).unwrap())
                    .collect();
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {count} events on {HOTPLUG_STREAM}");
    }

    #[tokio::test]
    async fn enumeration_emits_initial_attach_events() {
        let rig = rig(UsbDaemonConfig::default()).await;
        rig.backend.seed(scanner());
        rig.daemon.start().await.unwrap();

        let events = wait_for_events(&rig.bus, 1).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, UsbAction::Attach);
        assert_eq!(events[0].vendor_id, 0x04a9);
        assert_eq!(events[0].manufacturer, "Canon");
        assert_eq!(rig.daemon.connected_count(), 1);
        assert_eq!(rig.daemon.health(), UsbHealth::Healthy);
        rig.daemon.stop().await;
    }

    #[tokio::test]
    async fn attach_detach_round_trip_empties_index() {
        let rig = rig(UsbDaemonConfig::default()).await;
        rig.daemon.start().await.unwrap();

        rig.backend.plug(scanner());
        wait_for_events(&rig.bus, 1).await;
        assert_eq!(rig.daemon.connected_count(), 1);

        rig.backend.unplug(1, 5);
        let events = wait_for_events(&rig.bus, 2).await;
        assert_eq!(events[1].action, UsbAction::Detach);
        // Detach carries the attach-time snapshot.
        assert_eq!(events[1].manufacturer, "Canon");
        assert_eq!(events[0].device_signature, events[1].device_signature);
        assert_eq!(rig.daemon.connected_count(), 0);
        rig.daemon.stop().await;
    }

    #[tokio::test]
    async fn duplicate_attach_within_window_is_suppressed() {
        let rig = rig(UsbDaemonConfig::default()).await;
        rig.daemon.start().await.unwrap();

        rig.backend.plug(scanner());
        rig.backend.bounce(1, 5);
        wait_for_events(&rig.bus, 1).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(rig.bus.stream_len(HOTPLUG_STREAM), 1);
        assert!(rig.daemon.counters().events_suppressed >= 1);
        rig.daemon.stop().await;
    }

    #[tokio::test]
    async fn detach_reattach_bounce_nets_zero_events() {
        let rig = rig(UsbDaemonConfig::default()).await;
        rig.daemon.start().await.unwrap();

        rig.backend.plug(scanner());
        wait_for_events(&rig.bus, 1).await;

        // A detach immediately followed by a reattach is contact bounce:
        // the pair annihilates inside the debounce window and the device
        // reads as continuously attached.
        rig.backend.unplug(1, 5);
        rig.backend.plug(scanner());
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(rig.bus.stream_len(HOTPLUG_STREAM), 1);
        assert_eq!(rig.daemon.connected_count(), 1);
        assert!(rig.daemon.counters().events_suppressed >= 2);
        rig.daemon.stop().await;
    }

    #[tokio::test]
    async fn detach_without_attach_is_dropped() {
        let rig = rig(UsbDaemonConfig::default()).await;
        rig.daemon.start().await.unwrap();

        rig.backend.plug(scanner());
        rig.backend.unplug(1, 5);
        wait_for_events(&rig.bus, 2).await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        // A stray detach with no matching attach fails the consistency
        // check and is dropped.
        let stray = RawUsbNotification {
            action: UsbAction::Detach,
            vendor_id: 0x04a9,
            product_id: 0x220e,
            bus_number: 1,
            device_address: 5,
            port_path: "1-5".into(),
            descriptor: serde_json::json!({}),
        };
        rig.backend.send_raw(stray);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(rig.bus.stream_len(HOTPLUG_STREAM), 2);
        assert!(rig.daemon.counters().events_suppressed >= 1);
        rig.daemon.stop().await;
    }

    #[tokio::test]
    async fn events_alternate_per_signature() {
        let rig = rig(UsbDaemonConfig {
            debounce_window: Duration::from_millis(1),
            ..Default::default()
        })
        .await;
        rig.daemon.start().await.unwrap();

        for _ in 0..5 {
            rig.backend.plug(scanner());
            tokio::time::sleep(Duration::from_millis(5)).await;
            rig.backend.unplug(1, 5);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let events = wait_for_events(&rig.bus, 10).await;
        for (i, event) in events.iter().enumerate() {
            let expected = if i % 2 == 0 { UsbAction::Attach } else { UsbAction::Detach };
            assert_eq!(event.action, expected, "event {i}");
        }
        assert_eq!(rig.daemon.connected_count(), 0);
        rig.daemon.stop().await;
    }

    #[tokio::test]
    async fn fallback_promotion_reports_degraded() {
        let bus = Arc::new(MemoryBus::new());
        let publisher = Arc::new(BufferedPublisher::new(
            bus.clone() as Arc<dyn autoweave_bus::EventBus>,
            PublisherConfig::default(),
        ));
        let primary = Arc::new(MockBackend::new(EventSource::Primary));
        primary.refuse_start();
        let fallback = Arc::new(MockBackend::new(EventSource::Fallback));
        let daemon = UsbDaemon::new(
            UsbDaemonConfig::default(),
            publisher,
            primary as Arc<dyn UsbBackend>,
            Some(fallback.clone() as Arc<dyn UsbBackend>),
        );
        daemon.start().await.unwrap();
        assert_eq!(daemon.health(), UsbHealth::Degraded);

        fallback.plug(scanner());
        for _ in 0..200 {
            if bus.stream_len(HOTPLUG_STREAM) >= 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let events: Vec<HotplugRecord> = bus
            .snapshot(HOTPLUG_STREAM)
            .iter()
            .map(|m| HotplugRecord::from_fields(&m.fields).unwrap())
            .collect();
        assert_eq!(events[0].source, EventSource::Fallback);
        daemon.stop().await;
    }

    #[tokio::test]
    async fn no_source_means_offline_error() {
        let bus = Arc::new(MemoryBus::new());
        let publisher = Arc::new(BufferedPublisher::new(
            bus as Arc<dyn autoweave_bus::EventBus>,
            PublisherConfig::default(),
        ));
        let primary = Arc::new(MockBackend::new(EventSource::Primary));
        primary.refuse_start();
        let daemon = UsbDaemon::new(
            UsbDaemonConfig::default(),
            publisher,
            primary as Arc<dyn UsbBackend>,
            None,
        );
        assert!(daemon.start().await.is_err());
        assert_eq!(daemon.health(), UsbHealth::Offline);
    }
}
