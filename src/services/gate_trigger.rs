//! Gate trigger controller - cooldown, actuation and bookkeeping
//!
//! For a gate-related transition:
//! 1. Inside the cooldown window (open duration since the last successful
//!    trigger) the request is skipped and logged as `gate_skipped`.
//! 2. Otherwise the actuator is called once.
//! 3. Success persists the trigger time and logs `gate_triggered`.
//! 4. Failure logs `gate_error` and leaves the cooldown untouched, so the
//!    next transition may retry immediately.

use crate::domain::events::{LogEntry, MANUAL_DEVICE};
use crate::domain::types::{Direction, EventKind, MacAddress};
use crate::infra::metrics::Metrics;
use crate::io::actuator::{Actuator, ActuatorError};
use crate::io::store::PresenceStore;
use crate::services::activity::ActivityLog;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CooldownDecision {
    Trigger,
    Skip { remaining: Duration },
}

/// Decide whether a trigger at `now` is allowed
///
/// Never triggered means allowed; a trigger time in the future (clock
/// adjustment) counts as inside the window.
pub fn check_cooldown(
    last_trigger: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    cooldown: Duration,
) -> CooldownDecision {
    let Some(last) = last_trigger else {
        return CooldownDecision::Trigger;
    };

    let elapsed = now - last;
    if elapsed < cooldown {
        CooldownDecision::Skip { remaining: cooldown - elapsed }
    } else {
        CooldownDecision::Trigger
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    Triggered,
    Skipped { remaining: Duration },
    Failed(ActuatorError),
}

/// Everything needed to decide on one device's gate request
#[derive(Debug, Clone)]
pub struct GateRequest {
    pub mac: MacAddress,
    pub name: String,
    pub direction: Direction,
    pub from_ap: Option<MacAddress>,
    pub to_ap: Option<MacAddress>,
    pub last_trigger: Option<DateTime<Utc>>,
}

fn describe(direction: Direction) -> &'static str {
    match direction {
        Direction::Arriving => "arriving",
        Direction::Leaving => "leaving",
        Direction::Unknown => "passing the gate",
        Direction::Manual => "manual",
    }
}

pub struct GateTrigger {
    actuator: Arc<dyn Actuator>,
    store: Arc<dyn PresenceStore>,
    activity: ActivityLog,
    metrics: Arc<Metrics>,
    timeout: std::time::Duration,
}

impl GateTrigger {
    pub fn new(
        actuator: Arc<dyn Actuator>,
        store: Arc<dyn PresenceStore>,
        metrics: Arc<Metrics>,
        timeout: std::time::Duration,
    ) -> Self {
        let activity = ActivityLog::new(store.clone(), metrics.clone());
        Self { actuator, store, activity, metrics, timeout }
    }

    async fn call_actuator(&self) -> Result<(), ActuatorError> {
        match tokio::time::timeout(self.timeout, self.actuator.trigger()).await {
            Ok(result) => result,
            Err(_) => Err(ActuatorError::Timeout),
        }
    }

    /// Apply the cooldown and, if allowed, open the gate for `request`
    ///
    /// On success the caller must also advance the device's in-memory
    /// trigger time; the persisted copy is updated here.
    pub async fn handle(
        &self,
        request: &GateRequest,
        now: DateTime<Utc>,
        cooldown: Duration,
        log_activity: bool,
    ) -> GateOutcome {
        let entry = |kind: EventKind, message: String| {
            LogEntry::new(now, &request.mac, &request.name, kind, &message)
                .with_direction(request.direction)
                .with_aps(request.from_ap.as_ref(), request.to_ap.as_ref())
        };

        if let CooldownDecision::Skip { remaining } =
            check_cooldown(request.last_trigger, now, cooldown)
        {
            self.metrics.record_gate_skip();
            info!(
                mac = %request.mac,
                name = %request.name,
                direction = %request.direction.as_str(),
                remaining_secs = %remaining.num_seconds(),
                "gate_skipped"
            );
            self.activity.record(
                log_activity,
                entry(
                    EventKind::GateSkipped,
                    format!("Gate trigger skipped ({}s cooldown remaining)", remaining.num_seconds()),
                ),
            );
            return GateOutcome::Skipped { remaining };
        }

        match self.call_actuator().await {
            Ok(()) => {
                self.metrics.record_gate_trigger();
                if let Err(e) = self.store.record_gate_trigger(&request.mac, now) {
                    warn!(mac = %request.mac, error = %e, "gate_trigger_persist_failed");
                }
                info!(
                    mac = %request.mac,
                    name = %request.name,
                    direction = %request.direction.as_str(),
                    "gate_triggered"
                );
                self.activity.record(
                    log_activity,
                    entry(
                        EventKind::GateTriggered,
                        format!("Gate opened for {} ({})", request.name, describe(request.direction)),
                    )
                    .with_gate_opened(true),
                );
                GateOutcome::Triggered
            }
            Err(e) => {
                self.metrics.record_gate_error();
                error!(
                    mac = %request.mac,
                    name = %request.name,
                    direction = %request.direction.as_str(),
                    error = %e,
                    "gate_error"
                );
                self.activity.record(
                    log_activity,
                    entry(EventKind::GateError, format!("Failed to trigger gate: {e}")),
                );
                GateOutcome::Failed(e)
            }
        }
    }

    /// Operator-initiated trigger, bypasses the cooldown
    ///
    /// Does not touch any device's trigger time.
    pub async fn trigger_manual(
        &self,
        now: DateTime<Utc>,
        log_activity: bool,
    ) -> Result<(), ActuatorError> {
        let result = self.call_actuator().await;

        let entry = match &result {
            Ok(()) => {
                self.metrics.record_gate_trigger();
                info!(device = %MANUAL_DEVICE, "gate_triggered");
                LogEntry::manual(now, EventKind::GateTriggered, "Gate manually triggered")
                    .with_gate_opened(true)
            }
            Err(e) => {
                self.metrics.record_gate_error();
                error!(device = %MANUAL_DEVICE, error = %e, "gate_error");
                LogEntry::manual(now, EventKind::GateError, &format!("Manual gate trigger failed: {e}"))
            }
        };
        self.activity.record(log_activity, entry);

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::store::SqliteStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingActuator {
        calls: AtomicUsize,
        fail: AtomicBool,
    }

    #[async_trait]
    impl Actuator for RecordingActuator {
        async fn trigger(&self) -> Result<(), ActuatorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                Err(ActuatorError::Status(503))
            } else {
                Ok(())
            }
        }
    }

    struct Harness {
        trigger: GateTrigger,
        actuator: Arc<RecordingActuator>,
        store: Arc<SqliteStore>,
    }

    fn harness() -> Harness {
        let actuator = Arc::new(RecordingActuator::default());
        let store = Arc::new(SqliteStore::new_in_memory().unwrap());
        let trigger = GateTrigger::new(
            actuator.clone(),
            store.clone(),
            Arc::new(Metrics::new()),
            std::time::Duration::from_secs(1),
        );
        Harness { trigger, actuator, store }
    }

    fn request(last_trigger: Option<DateTime<Utc>>) -> GateRequest {
        GateRequest {
            mac: MacAddress::new("aa:bb:cc:dd:ee:01"),
            name: "phone".to_string(),
            direction: Direction::Arriving,
            from_ap: None,
            to_ap: Some(MacAddress::new("GATE-MAC")),
            last_trigger,
        }
    }

    #[test]
    fn test_cooldown_boundaries() {
        let now = Utc::now();
        let cooldown = Duration::minutes(10);

        assert_eq!(check_cooldown(None, now, cooldown), CooldownDecision::Trigger);
        assert_eq!(
            check_cooldown(Some(now - Duration::minutes(3)), now, cooldown),
            CooldownDecision::Skip { remaining: Duration::minutes(7) }
        );
        assert_eq!(check_cooldown(Some(now - cooldown), now, cooldown), CooldownDecision::Trigger);
        assert!(matches!(
            check_cooldown(Some(now + Duration::seconds(5)), now, cooldown),
            CooldownDecision::Skip { .. }
        ));
    }

    #[tokio::test]
    async fn test_success_persists_and_logs() {
        let h = harness();
        let now = Utc::now();

        let outcome = h.trigger.handle(&request(None), now, Duration::minutes(10), true).await;
        assert_eq!(outcome, GateOutcome::Triggered);
        assert_eq!(h.actuator.calls.load(Ordering::SeqCst), 1);

        let stored = h.store.load_device_state(&request(None).mac).unwrap().unwrap();
        assert_eq!(stored.last_gate_trigger.map(|t| t.timestamp_millis()), Some(now.timestamp_millis()));

        let logs = h.store.recent_logs(10, 0).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].event, EventKind::GateTriggered);
        assert!(logs[0].gate_opened);
    }

    #[tokio::test]
    async fn test_skip_inside_cooldown_does_not_call_actuator() {
        let h = harness();
        let now = Utc::now();

        let outcome = h
            .trigger
            .handle(&request(Some(now - Duration::minutes(3))), now, Duration::minutes(10), true)
            .await;
        assert!(matches!(outcome, GateOutcome::Skipped { .. }));
        assert_eq!(h.actuator.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.store.recent_logs(10, 0).unwrap()[0].event, EventKind::GateSkipped);
    }

    #[tokio::test]
    async fn test_failure_does_not_consume_cooldown() {
        let h = harness();
        h.actuator.fail.store(true, Ordering::SeqCst);
        let now = Utc::now();

        let outcome = h.trigger.handle(&request(None), now, Duration::minutes(10), true).await;
        assert_eq!(outcome, GateOutcome::Failed(ActuatorError::Status(503)));
        assert_eq!(h.store.load_device_state(&request(None).mac).unwrap(), None);

        let logs = h.store.recent_logs(10, 0).unwrap();
        assert_eq!(logs[0].event, EventKind::GateError);
        assert!(!logs[0].gate_opened);
    }

    #[tokio::test]
    async fn test_activity_logging_disabled_writes_nothing() {
        let h = harness();
        h.trigger.handle(&request(None), Utc::now(), Duration::minutes(10), false).await;
        assert_eq!(h.actuator.calls.load(Ordering::SeqCst), 1);
        assert!(h.store.recent_logs(10, 0).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_manual_trigger_logged_as_manual() {
        let h = harness();
        h.trigger.trigger_manual(Utc::now(), true).await.unwrap();

        let logs = h.store.recent_logs(10, 0).unwrap();
        assert_eq!(logs[0].device_mac, MANUAL_DEVICE);
        assert_eq!(logs[0].direction, Some(Direction::Manual));
        assert!(logs[0].gate_opened);
    }
}
