// AutoWeave - Plugin runtime for the agent-orchestration platform.
//
// The daemon binary: loads configuration from the environment, connects to
// the event bus, starts the USB hot-plug daemon, the plugin loader, and
// the event router, then runs until a shutdown signal arrives.
//
// Plugin entry points are registered explicitly at build time (see the
// EntryRegistry); a deployment links its plugin crates into this binary
// and registers them here before the runtime starts.

use std::process::ExitCode;
use std::sync::Arc;

use autoweave_core::{exit_codes, AutoWeaveConfig, AutoWeaveRuntime};
use autoweave_host::EntryRegistry;
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    // Structured JSON logging with environment-based filtering
    // (RUST_LOG=debug,autoweave=trace).
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .init();

    info!("starting autoweave");

    let config = match AutoWeaveConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("configuration error: {e}");
            return ExitCode::from(exit_codes::CONFIG_ERROR as u8);
        }
    };

    // Deployments register their linked-in plugin entries here.
    let registry = Arc::new(EntryRegistry::new());

    let runtime = match AutoWeaveRuntime::connect(config, registry).await {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("event bus unavailable at start: {e}");
            return ExitCode::from(exit_codes::BUS_UNAVAILABLE as u8);
        }
    };

    if let Err(e) = runtime.start().await {
        error!("failed to start runtime: {e}");
        let _ = runtime.stop().await;
        // The loader and router only fail on bus errors at start; a start
        // failure past the bus gate is the USB subsystem.
        return ExitCode::from(exit_codes::USB_UNAVAILABLE as u8);
    }

    let health = runtime.health();
    info!(?health, "autoweave running");

    match signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => error!("unable to listen for shutdown signal: {e}"),
    }

    if let Err(e) = runtime.stop().await {
        error!("error during shutdown: {e}");
    }

    let metrics = runtime.metrics();
    info!(
        events_published = metrics.events_published,
        events_dropped = metrics.events_dropped,
        hooks_dispatched = metrics.hooks_dispatched,
        "autoweave stopped"
    );
    ExitCode::from(exit_codes::CLEAN as u8)
}
