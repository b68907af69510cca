//! Environment-driven configuration for the whole runtime.
//!
//! Every recognized variable is optional with a stated default; an
//! unparseable value is a hard configuration error (process exit code 1),
//! never a silent fallback.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use autoweave_bus::{PublisherConfig, RedisConfig};
use autoweave_loader::PluginLoaderConfig;
use autoweave_router::EventRouterConfig;
use autoweave_usb::{FallbackPolicy, UsbDaemonConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value `{value}` for {variable}: {reason}")]
    Invalid {
        variable: String,
        value: String,
        reason: String,
    },
}

/// Aggregated configuration for every subsystem.
#[derive(Debug, Clone)]
pub struct AutoWeaveConfig {
    pub redis: RedisConfig,
    pub publisher: PublisherConfig,
    pub usb: UsbDaemonConfig,
    pub loader: PluginLoaderConfig,
    pub hook_event_timeout: Duration,
    pub shutdown_budget: Duration,
}

impl Default for AutoWeaveConfig {
    fn default() -> Self {
        Self {
            redis: RedisConfig::default(),
            publisher: PublisherConfig::default(),
            usb: UsbDaemonConfig::default(),
            loader: PluginLoaderConfig::default(),
            hook_event_timeout: Duration::from_secs(2),
            shutdown_budget: Duration::from_secs(30),
        }
    }
}

impl AutoWeaveConfig {
    /// Load configuration from recognized environment variables, falling
    /// back to defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(host) = read_string("REDIS_HOST") {
            config.redis.host = host;
        }
        if let Some(port) = read_parsed::<u16>("REDIS_PORT")? {
            config.redis.port = port;
        }
        if let Some(db) = read_parsed::<i64>("REDIS_DB")? {
            config.redis.db = db;
        }
        config.redis.password = read_string("REDIS_PASSWORD");

        if let Some(ms) = read_parsed::<u64>("USB_DAEMON_DEBOUNCE_MS")? {
            config.usb.debounce_window = Duration::from_millis(ms);
        }
        if let Some(ms) = read_parsed::<u64>("USB_DAEMON_DESCRIPTOR_TIMEOUT_MS")? {
            config.usb.descriptor_timeout = Duration::from_millis(ms);
        }
        if let Some(raw) = read_string("USB_DAEMON_FALLBACK") {
            config.usb.fallback = match raw.as_str() {
                "auto" => FallbackPolicy::Auto,
                "on" => FallbackPolicy::On,
                "off" => FallbackPolicy::Off,
                other => {
                    return Err(ConfigError::Invalid {
                        variable: "USB_DAEMON_FALLBACK".into(),
                        value: other.to_string(),
                        reason: "expected auto, on, or off".into(),
                    });
                }
            };
        }

        if let Some(dir) = read_string("PLUGIN_DIR") {
            config.loader.plugin_dir = PathBuf::from(dir);
        }
        if let Some(ms) = read_parsed::<u64>("PLUGIN_RELOAD_DEBOUNCE_MS")? {
            config.loader.reload_debounce = Duration::from_millis(ms);
        }
        if let Some(ms) = read_parsed::<u64>("HOOK_ONLOAD_TIMEOUT_MS")? {
            config.loader.onload_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = read_parsed::<u64>("HOOK_ONUNLOAD_TIMEOUT_MS")? {
            config.loader.onunload_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = read_parsed::<u64>("HOOK_EVENT_TIMEOUT_MS")? {
            config.hook_event_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = read_parsed::<u64>("SHUTDOWN_BUDGET_MS")? {
            config.shutdown_budget = Duration::from_millis(ms);
        }

        Ok(config)
    }

    /// Router configuration derived from this config.
    pub fn router(&self) -> EventRouterConfig {
        EventRouterConfig {
            hotplug_stream: self.usb.hotplug_stream.clone(),
            event_timeout: self.hook_event_timeout,
            ..Default::default()
        }
    }
}

fn read_string(variable: &str) -> Option<String> {
    std::env::var(variable).ok().filter(|v| !v.is_empty())
}

fn read_parsed<T: std::str::FromStr>(variable: &str) -> Result<Option<T>, ConfigError> {
    match read_string(variable) {
        None => Ok(None),
        Some(raw) => raw.parse().map(Some).map_err(|_| ConfigError::Invalid {
            variable: variable.to_string(),
            value: raw,
            reason: format!("expected {}", std::any::type_name::<T>()),
        }),
    }
}
