//! Poll cycle and transition handlers for the Monitor
//!
//! One cycle: fetch a snapshot (re-authenticating once if the session
//! expired), diff it against the registry, persist touched devices, then
//! log each transition and hand gate-related ones to the gate trigger.

use super::{Monitor, MonitorSettings, PollOutcome, SkipReason};
use crate::domain::events::LogEntry;
use crate::domain::types::{EventKind, MacAddress, WirelessClient};
use crate::io::controller::FetchError;
use crate::services::auth::{is_auth_error, ReauthError};
use crate::services::direction;
use crate::services::gate_trigger::{GateOutcome, GateRequest};
use crate::services::presence::{Snapshot, Transition, TransitionKind};
use chrono::{DateTime, Utc};
use std::time::Instant;
use tracing::{debug, error, info, warn};

fn ap_label(ap: Option<&MacAddress>) -> &str {
    ap.map_or("nowhere", |ap| ap.as_str())
}

impl Monitor {
    pub(crate) async fn poll_cycle(&self, now: DateTime<Utc>, generation: u64) -> PollOutcome {
        if !self.is_current(generation) {
            return PollOutcome::Inactive;
        }

        let started = Instant::now();
        let settings = self.settings();

        let clients = match self.fetch_snapshot(&settings.site_id).await {
            Ok(clients) => clients,
            Err(reason) => {
                self.metrics.record_poll_failure();
                return PollOutcome::Skipped(reason);
            }
        };
        let snapshot = Snapshot::from_clients(clients);

        let diff = {
            let mut session = self.session.write();
            if !session.monitoring || session.generation != generation {
                return PollOutcome::Inactive;
            }
            session.registry.apply_snapshot(&snapshot, &settings.gate_ap, now)
        };

        for state in &diff.touched {
            if let Err(e) = self.store.save_device_state(state) {
                warn!(mac = %state.mac, error = %e, "device_state_save_failed");
            }
        }

        let transitions = diff.transitions.len();
        for transition in diff.transitions {
            self.handle_transition(transition, &settings, now, generation).await;
        }

        self.metrics.record_poll(started.elapsed().as_millis() as u64);
        debug!(clients = snapshot.len(), transitions, "poll_completed");
        PollOutcome::Applied { transitions }
    }

    async fn fetch_once(
        &self,
        site_id: &str,
        timeout: std::time::Duration,
    ) -> Result<Vec<WirelessClient>, FetchError> {
        match tokio::time::timeout(timeout, self.source.active_clients(site_id)).await {
            Ok(result) => result,
            Err(_) => Err(FetchError("request timed out".to_string())),
        }
    }

    /// Fetch the client list, re-authenticating and retrying once on auth errors
    async fn fetch_snapshot(&self, site_id: &str) -> Result<Vec<WirelessClient>, SkipReason> {
        let timeout = self.settings.read().fetch_timeout;

        let err = match self.fetch_once(site_id, timeout).await {
            Ok(clients) => return Ok(clients),
            Err(e) => e,
        };

        if !is_auth_error(&err.0) {
            error!(error = %err, "snapshot_fetch_failed");
            return Err(SkipReason::FetchFailed);
        }

        warn!(error = %err, "snapshot_auth_expired");
        match self.auth.reauthenticate(self.source.as_ref()).await {
            Ok(()) => {
                self.metrics.record_auth_success();
            }
            Err(ReauthError::BackoffActive { remaining }) => {
                self.metrics.record_auth_backoff_skip();
                debug!(remaining_ms = remaining.as_millis() as u64, "reauth_backoff_active");
                return Err(SkipReason::AuthBackoff);
            }
            Err(ReauthError::Failed(e)) => {
                self.metrics.record_auth_failure();
                error!(error = %e, "reauth_failed_skipping_poll");
                return Err(SkipReason::AuthFailed);
            }
        }

        self.fetch_once(site_id, timeout).await.map_err(|e| {
            error!(error = %e, "snapshot_fetch_failed_after_reauth");
            SkipReason::FetchFailed
        })
    }

    /// Log one transition and, if it touches the gate AP, request a trigger
    async fn handle_transition(
        &self,
        transition: Transition,
        settings: &MonitorSettings,
        now: DateTime<Utc>,
        generation: u64,
    ) {
        let Transition { kind, mac, name, from_ap, to_ap, uptime_secs, last_gate_trigger } =
            transition;
        let direction =
            direction::classify(kind, from_ap.as_ref(), to_ap.as_ref(), &settings.gate_ap);
        let direction_label = direction.map_or("-", |d| d.as_str());

        let (event, message) = match kind {
            TransitionKind::Connected => {
                self.metrics.record_connect();
                info!(
                    mac = %mac,
                    name = %name,
                    to_ap = %ap_label(to_ap.as_ref()),
                    uptime_secs = uptime_secs.unwrap_or(0),
                    direction = %direction_label,
                    "device_connected"
                );
                (EventKind::Connected, format!("{} connected to {}", name, ap_label(to_ap.as_ref())))
            }
            TransitionKind::Disconnected => {
                self.metrics.record_disconnect();
                info!(
                    mac = %mac,
                    name = %name,
                    from_ap = %ap_label(from_ap.as_ref()),
                    "device_disconnected"
                );
                (
                    EventKind::Disconnected,
                    format!("{} disconnected from {}", name, ap_label(from_ap.as_ref())),
                )
            }
            TransitionKind::Roamed => {
                self.metrics.record_roam();
                info!(
                    mac = %mac,
                    name = %name,
                    from_ap = %ap_label(from_ap.as_ref()),
                    to_ap = %ap_label(to_ap.as_ref()),
                    direction = %direction_label,
                    "device_roamed"
                );
                (
                    EventKind::Roamed,
                    format!(
                        "{} roamed from {} to {}",
                        name,
                        ap_label(from_ap.as_ref()),
                        ap_label(to_ap.as_ref())
                    ),
                )
            }
        };

        let mut entry =
            LogEntry::new(now, &mac, &name, event, &message).with_aps(from_ap.as_ref(), to_ap.as_ref());
        if let Some(direction) = direction {
            entry = entry.with_direction(direction);
        }
        self.activity.record(settings.log_activity, entry);

        let Some(direction) = direction else {
            return;
        };
        if !direction::involves_gate(from_ap.as_ref(), to_ap.as_ref(), &settings.gate_ap) {
            return;
        }

        let request = GateRequest {
            mac,
            name,
            direction,
            from_ap,
            to_ap,
            last_trigger: last_gate_trigger,
        };
        let outcome =
            self.gate.handle(&request, now, settings.cooldown(), settings.log_activity).await;

        if outcome == GateOutcome::Triggered {
            let mut session = self.session.write();
            if session.monitoring && session.generation == generation {
                if let Some(state) = session.registry.get_mut(&request.mac) {
                    state.mark_triggered(now);
                }
            }
        }
    }
}
