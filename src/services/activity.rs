//! Best-effort activity log writer
//!
//! Write failures are logged and counted, never propagated: a broken
//! database must not stop the gate from opening.

use crate::domain::events::LogEntry;
use crate::infra::metrics::Metrics;
use crate::io::store::PresenceStore;
use std::sync::Arc;
use tracing::warn;

#[derive(Clone)]
pub struct ActivityLog {
    store: Arc<dyn PresenceStore>,
    metrics: Arc<Metrics>,
}

impl ActivityLog {
    pub fn new(store: Arc<dyn PresenceStore>, metrics: Arc<Metrics>) -> Self {
        Self { store, metrics }
    }

    /// Append `entry` when activity logging is enabled
    pub fn record(&self, enabled: bool, entry: LogEntry) {
        if !enabled {
            return;
        }
        if let Err(e) = self.store.append_log(&entry) {
            self.metrics.record_log_write_failure();
            warn!(
                device = %entry.device_mac,
                event = %entry.event.as_str(),
                error = %e,
                "activity_log_write_failed"
            );
        }
    }
}
