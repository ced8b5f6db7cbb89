//! Event log records
//!
//! One `LogEntry` per notable transition. Entries are only persisted when
//! activity logging is enabled.

use crate::domain::types::{Direction, EventKind, MacAddress};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Device identifier used for operator-initiated triggers
pub const MANUAL_DEVICE: &str = "manual";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    /// Assigned by the store on insert
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub timestamp: DateTime<Utc>,
    pub device_mac: String,
    pub device_name: String,
    pub event: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction: Option<Direction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_ap: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_ap: Option<String>,
    pub gate_opened: bool,
    pub message: String,
}

impl LogEntry {
    pub fn new(
        timestamp: DateTime<Utc>,
        device_mac: &MacAddress,
        device_name: &str,
        event: EventKind,
        message: &str,
    ) -> Self {
        Self {
            id: None,
            timestamp,
            device_mac: device_mac.to_string(),
            device_name: device_name.to_string(),
            event,
            direction: None,
            from_ap: None,
            to_ap: None,
            gate_opened: false,
            message: message.to_string(),
        }
    }

    /// Entry for an operator-initiated trigger
    pub fn manual(timestamp: DateTime<Utc>, event: EventKind, message: &str) -> Self {
        Self {
            id: None,
            timestamp,
            device_mac: MANUAL_DEVICE.to_string(),
            device_name: "Manual Test".to_string(),
            event,
            direction: Some(Direction::Manual),
            from_ap: None,
            to_ap: None,
            gate_opened: false,
            message: message.to_string(),
        }
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = Some(direction);
        self
    }

    pub fn with_aps(mut self, from_ap: Option<&MacAddress>, to_ap: Option<&MacAddress>) -> Self {
        self.from_ap = from_ap.map(|ap| ap.to_string());
        self.to_ap = to_ap.map(|ap| ap.to_string());
        self
    }

    pub fn with_gate_opened(mut self, opened: bool) -> Self {
        self.gate_opened = opened;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_entry_json_shape() {
        let mac = MacAddress::new("aa:bb:cc:dd:ee:01");
        let entry = LogEntry::new(Utc::now(), &mac, "phone", EventKind::GateTriggered, "opened")
            .with_direction(Direction::Arriving)
            .with_aps(None, Some(&MacAddress::new("gate-mac")))
            .with_gate_opened(true);

        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["device_mac"], "AA:BB:CC:DD:EE:01");
        assert_eq!(json["event"], "gate_triggered");
        assert_eq!(json["direction"], "arriving");
        assert_eq!(json["to_ap"], "GATE-MAC");
        assert_eq!(json["gate_opened"], true);
        assert!(json.get("from_ap").is_none());
        assert!(json.get("id").is_none());
    }
}
