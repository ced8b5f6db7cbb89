//! Presence monitor - session lifecycle, polling and device registry
//!
//! The Monitor owns one monitoring session at a time:
//! - Session state (monitoring flag, stop signal, registry) behind a single lock
//! - A poll loop that fetches snapshots and turns transitions into gate requests
//! - Hourly activity-log retention
//!
//! Registry mutations from the control plane (add/update/remove device)
//! go through the same lock as the poll loop, so a poll never observes a
//! half-applied edit.

mod handlers;

use crate::domain::types::{DeviceState, MacAddress, PresenceState};
use crate::infra::config::{Config, DeviceConfig};
use crate::infra::metrics::Metrics;
use crate::io::actuator::{Actuator, ActuatorError};
use crate::io::controller::SnapshotSource;
use crate::io::store::PresenceStore;
use crate::services::activity::ActivityLog;
use crate::services::auth::AuthResilience;
use crate::services::gate_trigger::GateTrigger;
use crate::services::presence::Registry;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// How often old activity-log entries are purged
const RETENTION_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Runtime-adjustable monitoring parameters
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorSettings {
    pub site_id: String,
    pub gate_ap: MacAddress,
    /// Applied at the next session start
    pub poll_interval: Duration,
    /// Gate open time, also the per-device re-trigger cooldown
    pub open_duration_mins: u64,
    pub log_activity: bool,
    /// Zero disables retention
    pub retention_days: u32,
    pub fetch_timeout: Duration,
}

impl MonitorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            site_id: config.site_id().to_string(),
            gate_ap: config.gate_ap_mac().clone(),
            poll_interval: Duration::from_secs(config.poll_interval_secs().max(1)),
            open_duration_mins: config.open_duration_mins(),
            log_activity: config.log_activity(),
            retention_days: config.retention_days(),
            fetch_timeout: Duration::from_secs(config.controller_timeout_secs().max(1)),
        }
    }

    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.open_duration_mins.min(i64::MAX as u64 / 60_000) as i64)
    }
}

/// Why a poll tick produced no transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    FetchFailed,
    AuthBackoff,
    AuthFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Applied { transitions: usize },
    Skipped(SkipReason),
    /// No session, or the session changed while the poll was in flight
    Inactive,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatus {
    pub mac: MacAddress,
    pub name: String,
    pub state: &'static str,
    pub current_ap: Option<MacAddress>,
    pub previous_ap: Option<MacAddress>,
    pub last_seen: Option<DateTime<Utc>>,
    pub last_gate_trigger: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorStatus {
    pub is_monitoring: bool,
    pub gate_ap: MacAddress,
    pub poll_interval_secs: u64,
    pub open_duration_mins: u64,
    pub log_activity: bool,
    pub devices: Vec<DeviceStatus>,
}

#[derive(Default)]
struct Session {
    monitoring: bool,
    stop_tx: Option<watch::Sender<bool>>,
    registry: Registry,
    /// Bumped on every start; in-flight polls from older sessions are dropped
    generation: u64,
}

pub struct Monitor {
    session: RwLock<Session>,
    settings: RwLock<MonitorSettings>,
    pub(crate) source: Arc<dyn SnapshotSource>,
    pub(crate) auth: AuthResilience,
    pub(crate) gate: GateTrigger,
    pub(crate) store: Arc<dyn PresenceStore>,
    pub(crate) activity: ActivityLog,
    pub(crate) metrics: Arc<Metrics>,
}

impl Monitor {
    pub fn new(
        settings: MonitorSettings,
        source: Arc<dyn SnapshotSource>,
        actuator: Arc<dyn Actuator>,
        store: Arc<dyn PresenceStore>,
        metrics: Arc<Metrics>,
        actuator_timeout: Duration,
    ) -> Self {
        let auth = AuthResilience::new(settings.fetch_timeout);
        let gate = GateTrigger::new(actuator, store.clone(), metrics.clone(), actuator_timeout);
        let activity = ActivityLog::new(store.clone(), metrics.clone());

        Self {
            session: RwLock::new(Session::default()),
            settings: RwLock::new(settings),
            source,
            auth,
            gate,
            store,
            activity,
            metrics,
        }
    }

    /// Start monitoring and spawn the poll loop
    ///
    /// Returns false if already monitoring. The first poll runs immediately.
    pub fn start(self: &Arc<Self>, devices: &[DeviceConfig]) -> bool {
        let Some((stop_rx, generation)) = self.begin_session(devices) else {
            return false;
        };

        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            monitor.run(stop_rx, generation).await;
        });
        true
    }

    /// Open a session without spawning the poll loop
    ///
    /// Polls are then driven by the caller through [`Monitor::poll_at`].
    pub fn open_session(&self, devices: &[DeviceConfig]) -> bool {
        self.begin_session(devices).is_some()
    }

    fn begin_session(&self, devices: &[DeviceConfig]) -> Option<(watch::Receiver<bool>, u64)> {
        let mut session = self.session.write();
        if session.monitoring {
            debug!("monitor_already_running");
            return None;
        }

        let registry = self.seed_registry(devices);
        let (stop_tx, stop_rx) = watch::channel(false);

        session.generation += 1;
        session.monitoring = true;
        session.stop_tx = Some(stop_tx);
        info!(devices = registry.len(), generation = session.generation, "monitor_session_opened");
        session.registry = registry;

        Some((stop_rx, session.generation))
    }

    /// Registry for enabled devices, restored from the store where possible
    fn seed_registry(&self, devices: &[DeviceConfig]) -> Registry {
        let mut registry = Registry::new();

        for device in devices.iter().filter(|d| d.enabled) {
            let state = match self.store.load_device_state(&device.mac) {
                Ok(Some(stored)) => stored.into_device_state(device.mac.clone(), &device.name),
                Ok(None) => DeviceState::new(device.mac.clone(), &device.name),
                Err(e) => {
                    warn!(mac = %device.mac, error = %e, "device_state_load_failed");
                    DeviceState::new(device.mac.clone(), &device.name)
                }
            };
            registry.insert(state);
        }

        registry
    }

    /// Signal the poll loop to stop; the current tick finishes first
    pub fn stop(&self) -> bool {
        let mut session = self.session.write();
        if !session.monitoring {
            return false;
        }

        session.monitoring = false;
        if let Some(stop_tx) = session.stop_tx.take() {
            let _ = stop_tx.send(true);
        }
        session.registry = Registry::new();
        info!(generation = session.generation, "monitor_stop_requested");
        true
    }

    pub fn is_monitoring(&self) -> bool {
        self.session.read().monitoring
    }

    async fn run(self: Arc<Self>, mut stop_rx: watch::Receiver<bool>, generation: u64) {
        let poll_interval = self.settings.read().poll_interval;

        let mut poll_ticker = interval(poll_interval);
        poll_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut retention_ticker = interval(RETENTION_INTERVAL);
        retention_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(generation, interval_ms = poll_interval.as_millis() as u64, "monitor_started");

        loop {
            tokio::select! {
                biased;
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }
                _ = poll_ticker.tick() => {
                    self.poll_cycle(Utc::now(), generation).await;
                }
                _ = retention_ticker.tick() => {
                    self.run_retention(Utc::now());
                }
            }
        }

        info!(generation, "monitor_stopped");
    }

    pub async fn poll_once(&self) -> PollOutcome {
        self.poll_at(Utc::now()).await
    }

    /// Run one poll against the current session as if at `now`
    pub async fn poll_at(&self, now: DateTime<Utc>) -> PollOutcome {
        let generation = self.session.read().generation;
        self.poll_cycle(now, generation).await
    }

    fn is_current(&self, generation: u64) -> bool {
        let session = self.session.read();
        session.monitoring && session.generation == generation
    }

    /// Start tracking a newly configured device (no-op when idle)
    pub fn add_device(&self, mac: &MacAddress, name: &str) -> bool {
        let mut session = self.session.write();
        if !session.monitoring || session.registry.contains(mac) {
            return false;
        }
        session.registry.insert(DeviceState::new(mac.clone(), name));
        debug!(mac = %mac, name = %name, "device_tracking_started");
        true
    }

    /// Rename a tracked device, or drop it when disabled
    ///
    /// Re-enabling an untracked device starts tracking it from disconnected.
    pub fn update_device(&self, mac: &MacAddress, name: &str, enabled: bool) -> bool {
        let mut session = self.session.write();
        if !session.monitoring {
            return false;
        }

        if !enabled {
            return session.registry.remove(mac).is_some();
        }

        let registry = &mut session.registry;
        if !registry.contains(mac) {
            registry.insert(DeviceState::new(mac.clone(), name));
        } else if let Some(state) = registry.get_mut(mac) {
            state.name = name.to_string();
        }
        true
    }

    pub fn remove_device(&self, mac: &MacAddress) -> bool {
        let mut session = self.session.write();
        session.monitoring && session.registry.remove(mac).is_some()
    }

    /// (tracked, connected) device counts
    pub fn device_counts(&self) -> (usize, usize) {
        let session = self.session.read();
        (session.registry.len(), session.registry.connected_count())
    }

    /// Snapshot of the session for the control plane
    ///
    /// The device list is the live registry, so it is empty while idle.
    /// Last known positions survive in the store and come back on start.
    pub fn status(&self) -> MonitorStatus {
        let settings = self.settings();
        let session = self.session.read();

        let devices = session
            .registry
            .devices()
            .into_iter()
            .map(|state| DeviceStatus {
                mac: state.mac.clone(),
                name: state.name.clone(),
                state: state.presence(&settings.gate_ap).as_str(),
                current_ap: state.current_ap.clone(),
                previous_ap: state.previous_ap.clone(),
                last_seen: state.last_seen,
                last_gate_trigger: state.last_gate_trigger,
            })
            .collect();

        MonitorStatus {
            is_monitoring: session.monitoring,
            gate_ap: settings.gate_ap.clone(),
            poll_interval_secs: settings.poll_interval.as_secs(),
            open_duration_mins: settings.open_duration_mins,
            log_activity: settings.log_activity,
            devices,
        }
    }

    /// Current presence of one tracked device
    pub fn presence_of(&self, mac: &MacAddress) -> Option<PresenceState> {
        let gate_ap = self.settings.read().gate_ap.clone();
        self.session.read().registry.get(mac).map(|state| state.presence(&gate_ap))
    }

    pub fn settings(&self) -> MonitorSettings {
        self.settings.read().clone()
    }

    /// Replace settings; gate AP, cooldown and logging apply from the next poll
    pub fn update_settings(&self, settings: MonitorSettings) {
        info!(
            gate_ap = %settings.gate_ap,
            open_duration_mins = settings.open_duration_mins,
            log_activity = settings.log_activity,
            "monitor_settings_updated"
        );
        *self.settings.write() = settings;
    }

    /// Open the gate on operator request, bypassing the cooldown
    pub async fn trigger_manual(&self) -> Result<(), ActuatorError> {
        let log_activity = self.settings.read().log_activity;
        self.gate.trigger_manual(Utc::now(), log_activity).await
    }

    /// Delete activity-log entries older than the retention period
    pub fn cleanup_old_logs(&self, now: DateTime<Utc>) -> anyhow::Result<usize> {
        let retention_days = self.settings.read().retention_days;
        if retention_days == 0 {
            return Ok(0);
        }
        let cutoff = now - chrono::Duration::days(i64::from(retention_days));
        self.store.delete_logs_older_than(cutoff)
    }

    fn run_retention(&self, now: DateTime<Utc>) {
        match self.cleanup_old_logs(now) {
            Ok(0) => {}
            Ok(deleted) => info!(deleted, "activity_log_pruned"),
            Err(e) => warn!(error = %e, "activity_log_prune_failed"),
        }
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }
}
