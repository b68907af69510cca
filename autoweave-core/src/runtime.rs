//! Runtime assembly and lifecycle.

use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tracing::{info, warn};

use autoweave_bus::{
    BufferedPublisher, EventBus, MemoryBus, PublisherHealth, RedisStreamsBus,
};
use autoweave_host::{EntryRegistry, HostServices, UsbDeviceLookup, WorkerHost, WorkerHostConfig};
use autoweave_loader::PluginLoader;
use autoweave_router::{DeviceCatalog, EventRouter};
use autoweave_usb::{LibusbBackend, UsbBackend, UsbDaemon, UsbHealth};

use crate::config::AutoWeaveConfig;

/// Aggregated health across the subsystems.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeHealth {
    pub bus: PublisherHealth,
    pub usb: UsbHealth,
    pub plugins_running: usize,
}

/// The small metrics contract: counters aggregated from every subsystem.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RuntimeMetrics {
    pub events_published: u64,
    pub events_dropped: u64,
    pub events_suppressed: u64,
    pub descriptor_timeouts: u64,
    pub hook_timeouts: u64,
    pub hooks_dispatched: u64,
    pub plugins_running: usize,
}

/// The assembled runtime: one of everything, wired once.
pub struct AutoWeaveRuntime {
    config: AutoWeaveConfig,
    publisher: Arc<BufferedPublisher>,
    daemon: Arc<UsbDaemon>,
    host: Arc<WorkerHost>,
    loader: Arc<PluginLoader>,
    router: Arc<EventRouter>,
}

/// Router-side view of the daemon's live index.
struct DaemonCatalog(Arc<UsbDaemon>);

impl DeviceCatalog for DaemonCatalog {
    fn attached_devices(&self) -> Vec<autoweave_bus::streams::HotplugRecord> {
        self.0
            .connected_devices()
            .iter()
            .map(|device| {
                device.to_record(
                    autoweave_bus::streams::UsbAction::Attach,
                    autoweave_bus::streams::EventSource::Primary,
                )
            })
            .collect()
    }
}

/// Host-side view for the `usb.open` capability.
struct DaemonLookup(Arc<UsbDaemon>);

impl UsbDeviceLookup for DaemonLookup {
    fn find(&self, vendor_id: u16, product_id: u16) -> Option<serde_json::Value> {
        self.0
            .connected_devices()
            .into_iter()
            .find(|d| d.vendor_id == vendor_id && d.product_id == product_id)
            .map(|d| serde_json::to_value(&d).unwrap_or_default())
    }
}

impl AutoWeaveRuntime {
    /// Connect to the configured Redis bus and assemble the runtime with
    /// the platform USB backends.
    pub async fn connect(
        config: AutoWeaveConfig,
        registry: Arc<EntryRegistry>,
    ) -> Result<Self, autoweave_bus::BusError> {
        let bus = RedisStreamsBus::connect(&config.redis).await?;
        bus.ping().await?;
        let primary: Arc<dyn UsbBackend> = match LibusbBackend::new() {
            Ok(backend) => Arc::new(backend),
            Err(e) => {
                // The daemon falls back (or reports Offline) at start; a
                // missing libusb is not fatal here.
                warn!(error = %e, "libusb unavailable, primary usb source will not start");
                Arc::new(DeadBackend)
            }
        };
        Ok(Self::assemble(
            config,
            Arc::new(bus),
            registry,
            primary,
            platform_fallback(),
        ))
    }

    /// Assemble against an in-process bus. Used by tests and single-binary
    /// deployments that do not run Redis.
    pub fn in_memory(
        config: AutoWeaveConfig,
        registry: Arc<EntryRegistry>,
        primary: Arc<dyn UsbBackend>,
        fallback: Option<Arc<dyn UsbBackend>>,
    ) -> (Self, Arc<MemoryBus>) {
        let bus = Arc::new(MemoryBus::new());
        let runtime = Self::assemble(
            config,
            bus.clone() as Arc<dyn EventBus>,
            registry,
            primary,
            fallback,
        );
        (runtime, bus)
    }

    /// Wire every subsystem. Construction order follows the dependency
    /// graph; nothing is global.
    pub fn assemble(
        config: AutoWeaveConfig,
        bus: Arc<dyn EventBus>,
        registry: Arc<EntryRegistry>,
        primary: Arc<dyn UsbBackend>,
        fallback: Option<Arc<dyn UsbBackend>>,
    ) -> Self {
        let publisher = Arc::new(BufferedPublisher::new(
            Arc::clone(&bus),
            config.publisher.clone(),
        ));

        let daemon = Arc::new(UsbDaemon::new(
            config.usb.clone(),
            Arc::clone(&publisher),
            primary,
            fallback,
        ));

        let services = Arc::new(HostServices::new(
            Some(Arc::clone(&publisher)),
            Some(Arc::new(DaemonLookup(Arc::clone(&daemon))) as Arc<dyn UsbDeviceLookup>),
        ));
        let host = Arc::new(WorkerHost::new(
            WorkerHostConfig::default(),
            registry,
            services,
        ));

        let loader = Arc::new(PluginLoader::new(
            config.loader.clone(),
            Arc::clone(&host),
            Arc::clone(&publisher),
        ));

        let router = Arc::new(EventRouter::new(
            config.router(),
            bus,
            Arc::clone(&loader),
            Arc::clone(&host),
            Some(Arc::new(DaemonCatalog(Arc::clone(&daemon))) as Arc<dyn DeviceCatalog>),
        ));

        Self {
            config,
            publisher,
            daemon,
            host,
            loader,
            router,
        }
    }

    /// Start subsystems in dependency order: plugins first so they are
    /// Running before events flow, then the router's consumer group, then
    /// the daemon whose startup enumeration produces the first events.
    pub async fn start(&self) -> Result<()> {
        info!("starting autoweave runtime");
        self.loader.start().await?;
        self.router.start().await?;
        self.daemon.start().await?;
        info!(
            plugins_running = self.loader.running_count(),
            devices_connected = self.daemon.connected_count(),
            "autoweave runtime started"
        );
        Ok(())
    }

    /// Drain in reverse dependency order: Router → Loader (workers drain
    /// inside their shutdown-budget share) → Bus publisher → Daemon.
    pub async fn stop(&self) -> Result<()> {
        info!("stopping autoweave runtime");
        self.router.stop().await;
        self.loader.stop(self.config.shutdown_budget).await;
        self.publisher.shutdown().await;
        self.daemon.stop().await;
        info!("autoweave runtime stopped");
        Ok(())
    }

    pub fn health(&self) -> RuntimeHealth {
        RuntimeHealth {
            bus: self.publisher.health(),
            usb: self.daemon.health(),
            plugins_running: self.loader.running_count(),
        }
    }

    pub fn metrics(&self) -> RuntimeMetrics {
        let publisher = self.publisher.counters();
        let usb = self.daemon.counters();
        RuntimeMetrics {
            events_published: publisher.published,
            events_dropped: publisher.dropped,
            events_suppressed: usb.events_suppressed,
            descriptor_timeouts: usb.descriptor_timeouts,
            hook_timeouts: self.host.hook_timeout_count(),
            hooks_dispatched: self.router.dispatched_count(),
            plugins_running: self.loader.running_count(),
        }
    }

    pub fn loader(&self) -> Arc<PluginLoader> {
        Arc::clone(&self.loader)
    }

    pub fn daemon(&self) -> Arc<UsbDaemon> {
        Arc::clone(&self.daemon)
    }

    pub fn host(&self) -> Arc<WorkerHost> {
        Arc::clone(&self.host)
    }

    pub fn publisher(&self) -> Arc<BufferedPublisher> {
        Arc::clone(&self.publisher)
    }
}

/// Placeholder primary when libusb cannot even initialize; `start` always
/// fails so the daemon promotes the fallback or reports Offline.
struct DeadBackend;

#[async_trait::async_trait]
impl UsbBackend for DeadBackend {
    fn source(&self) -> autoweave_bus::streams::EventSource {
        autoweave_bus::streams::EventSource::Primary
    }

    async fn start(
        &self,
        _sink: tokio::sync::mpsc::UnboundedSender<autoweave_usb::RawUsbNotification>,
    ) -> Result<(), autoweave_usb::UsbError> {
        Err(autoweave_usb::UsbError::SourceUnavailable(
            "libusb failed to initialize".into(),
        ))
    }

    async fn stop(&self) {}

    async fn enumerate(
        &self,
    ) -> Result<Vec<autoweave_usb::RawUsbNotification>, autoweave_usb::UsbError> {
        Err(autoweave_usb::UsbError::EnumerationFailed(
            "libusb failed to initialize".into(),
        ))
    }

    async fn read_strings(
        &self,
        _device: &autoweave_usb::RawUsbNotification,
    ) -> Result<autoweave_usb::StringDescriptors, autoweave_usb::UsbError> {
        Ok(autoweave_usb::StringDescriptors::default())
    }
}

#[cfg(target_os = "linux")]
fn platform_fallback() -> Option<Arc<dyn UsbBackend>> {
    Some(Arc::new(autoweave_usb::SysfsBackend::new(
        std::time::Duration::from_millis(500),
    )))
}

#[cfg(not(target_os = "linux"))]
fn platform_fallback() -> Option<Arc<dyn UsbBackend>> {
    None
}
