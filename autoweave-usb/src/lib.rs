//! # AutoWeave USB Hot-Plug Daemon
//!
//! Exposes a clean, deduplicated, totally-ordered stream of USB
//! attach/detach events for every device visible to the host, published to
//! the hotplug stream through the buffered bus publisher.
//!
//! ## Event pipeline
//!
//! Every raw notification runs through the same six steps regardless of
//! whether it came from startup enumeration, the primary hot-plug source,
//! or the fallback source:
//!
//! 1. Compute the stable device signature from (vendor, product, bus,
//!    address).
//! 2. Debounce: a repeat of the same (signature, action) inside the window
//!    is hardware bounce and is dropped.
//! 3. State consistency: an attach for a device already in the live index,
//!    or a detach for one that is not, is dropped.
//! 4. String descriptors are extracted under a bounded timeout; on timeout
//!    the event proceeds with empty strings.
//! 5. The live-device index is updated.
//! 6. The event is handed to the publisher.
//!
//! Steps 5 and 6 run on a single pipeline task, so publication order always
//! matches index-update order. The hot-plug callback itself never blocks:
//! it only pushes raw notifications onto a channel, and the publisher
//! applies oldest-drop backpressure rather than stalling the pipeline.
//!
//! ## Sources and health
//!
//! The primary source is the OS hot-plug callback (libusb). When it is
//! unsupported or fails, the daemon promotes the fallback source (a sysfs
//! poller on Linux) and reports `Degraded`. With no usable source the
//! daemon is `Offline`; a restart re-enumerates and reconciles the index.

mod backend;
mod daemon;
mod device;
mod libusb;
#[cfg(target_os = "linux")]
mod sysfs;

pub use backend::{MockBackend, MockDevice, RawUsbNotification, StringDescriptors, UsbBackend};
pub use daemon::{FallbackPolicy, UsbDaemon, UsbDaemonConfig, UsbDaemonCounters, UsbHealth};
pub use device::{device_signature, UsbDeviceInfo};
pub use libusb::LibusbBackend;
#[cfg(target_os = "linux")]
pub use sysfs::SysfsBackend;

use thiserror::Error;

/// Closed error set for the USB subsystem.
#[derive(Debug, Error)]
pub enum UsbError {
    /// Initial device enumeration failed.
    #[error("usb enumeration failed: {0}")]
    EnumerationFailed(String),

    /// A monitoring source could not be started or died.
    #[error("usb source unavailable: {0}")]
    SourceUnavailable(String),

    /// String-descriptor extraction exceeded its bounded timeout.
    #[error("usb descriptor read timed out")]
    DescriptorTimeout,
}
