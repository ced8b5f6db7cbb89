//! Presence gate - opens a gate when known phones arrive or leave
//!
//! Polls the wireless network controller, tracks which access point each
//! configured device is on, and triggers the gate actuator when a device
//! connects to or roams across the gate AP.
//!
//! Module structure:
//! - `domain/` - Core types (MacAddress, DeviceState, LogEntry)
//! - `io/` - External interfaces (controller, actuator, SQLite, HTTP API)
//! - `services/` - Business logic (Monitor, presence diffing, gate trigger)
//! - `infra/` - Infrastructure (Config, Metrics)

use clap::Parser;
use presence_gate::infra::{Config, Metrics};
use presence_gate::io::{
    start_api_server, ApiState, ControllerClient, HttpActuator, PresenceStore, SnapshotSource,
    SqliteStore,
};
use presence_gate::services::{Monitor, MonitorSettings};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

const METRICS_INTERVAL: Duration = Duration::from_secs(60);

/// Presence gate - Wi-Fi presence driven gate opener
#[derive(Parser, Debug)]
#[command(name = "presence-gate", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, env = "CONFIG_FILE", default_value = presence_gate::infra::config::DEFAULT_CONFIG_PATH)]
    config: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Load configuration and serve the API without starting monitoring
    #[arg(long)]
    no_monitor: bool,
}

fn init_tracing(json: bool) {
    // Default: INFO, use RUST_LOG=debug for per-poll visibility
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    info!(version = env!("CARGO_PKG_VERSION"), git_hash = env!("GIT_HASH"), "presence-gate starting");

    let config = Config::load_from_path(&args.config);
    info!(
        config_file = %config.config_file(),
        controller_url = %config.controller_url(),
        site_id = %config.site_id(),
        gate_ap = %config.gate_ap_mac(),
        poll_interval_secs = %config.poll_interval_secs(),
        open_duration_mins = %config.open_duration_mins(),
        log_activity = %config.log_activity(),
        devices = config.devices().len(),
        "config_loaded"
    );
    if !config.is_configured() {
        warn!("controller_url_or_gate_ap_missing");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Shared components
    let metrics = Arc::new(Metrics::new());
    let store: Arc<dyn PresenceStore> = Arc::new(SqliteStore::new(config.database_path())?);
    let controller = Arc::new(ControllerClient::new(
        config.controller_url(),
        config.controller_username(),
        config.controller_password(),
        Duration::from_secs(config.controller_timeout_secs()),
        config.accept_invalid_certs(),
    )?);
    let actuator = Arc::new(HttpActuator::new(
        config.trigger_url(),
        Duration::from_secs(config.actuator_timeout_secs()),
    )?);
    if !actuator.is_configured() {
        warn!("gate_trigger_url_missing");
    }

    let monitor = Arc::new(Monitor::new(
        MonitorSettings::from_config(&config),
        controller.clone(),
        actuator.clone(),
        store.clone(),
        metrics.clone(),
        Duration::from_secs(config.actuator_timeout_secs()),
    ));

    // Initial login; failures are retried with backoff by the poll loop
    if let Err(e) = controller.login().await {
        error!(error = %e, "initial_login_failed");
    }

    if !args.no_monitor {
        monitor.start(config.devices());
    }

    // Control-plane HTTP server
    let bind_address = config.server_bind_address().to_string();
    let port = config.server_port();
    let config = Arc::new(parking_lot::Mutex::new(config));
    let api_state = Arc::new(ApiState::new(monitor.clone(), config, store, actuator));
    let api_shutdown = shutdown_rx.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(&bind_address, port, api_state, api_shutdown).await {
            error!(error = %e, "api_server_error");
        }
    });

    // Periodic metrics log
    let reporter = monitor.clone();
    let mut reporter_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(METRICS_INTERVAL);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let (tracked, connected) = reporter.device_counts();
                    reporter.metrics().report(tracked, connected).log();
                }
                _ = reporter_shutdown.changed() => {
                    if *reporter_shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown_signal_received");

    monitor.stop();
    let _ = shutdown_tx.send(true);
    let _ = api_handle.await;

    info!("presence-gate shutdown complete");
    Ok(())
}
