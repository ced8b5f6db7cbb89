//! Shared types for presence tracking

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Hardware address normalized to uppercase, colon-separated form.
///
/// Twelve hex digits with any of `:`, `-`, `.` or no separators are rewritten
/// as `AA:BB:CC:DD:EE:FF`. Anything else (e.g. a controller-specific AP label)
/// is kept verbatim but uppercased, so comparisons stay case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct MacAddress(String);

impl MacAddress {
    pub fn new(raw: &str) -> Self {
        let trimmed = raw.trim();
        let hex: String =
            trimmed.chars().filter(|c| !matches!(c, ':' | '-' | '.')).collect::<String>();

        if hex.len() == 12 && hex.chars().all(|c| c.is_ascii_hexdigit()) {
            let upper = hex.to_ascii_uppercase();
            let octets: Vec<&str> = (0..6).map(|i| &upper[i * 2..i * 2 + 2]).collect();
            return Self(octets.join(":"));
        }

        Self(trimmed.to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for MacAddress {
    fn from(raw: String) -> Self {
        Self::new(&raw)
    }
}

impl From<&str> for MacAddress {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<MacAddress> for String {
    fn from(mac: MacAddress) -> Self {
        mac.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One entry of a controller snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WirelessClient {
    pub mac: MacAddress,
    pub ap_mac: MacAddress,
    /// Seconds since the client associated
    pub uptime_secs: u64,
    pub hostname: Option<String>,
}

impl WirelessClient {
    pub fn new(mac: &str, ap_mac: &str, uptime_secs: u64) -> Self {
        Self {
            mac: MacAddress::new(mac),
            ap_mac: MacAddress::new(ap_mac),
            uptime_secs,
            hostname: None,
        }
    }
}

/// Coarse presence of a device relative to the gate AP
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceState {
    Disconnected,
    ConnectedAtGate,
    ConnectedElsewhere,
}

impl PresenceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceState::Disconnected => "disconnected",
            PresenceState::ConnectedAtGate => "connected_at_gate",
            PresenceState::ConnectedElsewhere => "connected_elsewhere",
        }
    }
}

/// Inferred travel direction through the gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Arriving,
    Leaving,
    Unknown,
    /// Operator-initiated trigger, never produced by classification
    Manual,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Arriving => "arriving",
            Direction::Leaving => "leaving",
            Direction::Unknown => "unknown",
            Direction::Manual => "manual",
        }
    }
}

impl std::str::FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "arriving" => Ok(Direction::Arriving),
            "leaving" => Ok(Direction::Leaving),
            "unknown" => Ok(Direction::Unknown),
            "manual" => Ok(Direction::Manual),
            other => Err(format!("unknown direction: {other}")),
        }
    }
}

/// Kind of a notable transition written to the event log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Connected,
    Disconnected,
    Roamed,
    GateTriggered,
    GateSkipped,
    GateError,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Connected => "connected",
            EventKind::Disconnected => "disconnected",
            EventKind::Roamed => "roamed",
            EventKind::GateTriggered => "gate_triggered",
            EventKind::GateSkipped => "gate_skipped",
            EventKind::GateError => "gate_error",
        }
    }
}

impl std::str::FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "connected" => EventKind::Connected,
            "disconnected" => EventKind::Disconnected,
            "roamed" => EventKind::Roamed,
            "gate_triggered" => EventKind::GateTriggered,
            "gate_skipped" => EventKind::GateSkipped,
            "gate_error" => EventKind::GateError,
            other => return Err(format!("unknown event kind: {other}")),
        })
    }
}

/// Tracked device state, one per enabled device while monitoring
///
/// `current_ap` is `None` exactly when the device is disconnected.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceState {
    pub mac: MacAddress,
    pub name: String,
    pub current_ap: Option<MacAddress>,
    pub previous_ap: Option<MacAddress>,
    pub last_seen: Option<DateTime<Utc>>,
    /// Last successful actuator call; `None` means never triggered
    pub last_gate_trigger: Option<DateTime<Utc>>,
}

impl DeviceState {
    #[inline]
    pub fn new(mac: MacAddress, name: &str) -> Self {
        Self {
            mac,
            name: name.to_string(),
            current_ap: None,
            previous_ap: None,
            last_seen: None,
            last_gate_trigger: None,
        }
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.current_ap.is_some()
    }

    pub fn presence(&self, gate_ap: &MacAddress) -> PresenceState {
        match &self.current_ap {
            None => PresenceState::Disconnected,
            Some(ap) if ap == gate_ap => PresenceState::ConnectedAtGate,
            Some(_) => PresenceState::ConnectedElsewhere,
        }
    }

    /// Record a successful trigger; never moves the timestamp backwards
    pub fn mark_triggered(&mut self, at: DateTime<Utc>) {
        match self.last_gate_trigger {
            Some(prev) if prev >= at => {}
            _ => self.last_gate_trigger = Some(at),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_mac_normalization() {
        assert_eq!(MacAddress::new("aa:bb:cc:dd:ee:01").as_str(), "AA:BB:CC:DD:EE:01");
        assert_eq!(MacAddress::new("AA-BB-CC-DD-EE-01").as_str(), "AA:BB:CC:DD:EE:01");
        assert_eq!(MacAddress::new("aabb.ccdd.ee01").as_str(), "AA:BB:CC:DD:EE:01");
        assert_eq!(MacAddress::new(" aabbccddee01 ").as_str(), "AA:BB:CC:DD:EE:01");
        assert_eq!(MacAddress::new("aa:bb:cc:dd:ee:01"), MacAddress::new("AA:BB:CC:DD:EE:01"));
    }

    #[test]
    fn test_non_mac_identifier_is_uppercased() {
        assert_eq!(MacAddress::new("gate-mac").as_str(), "GATE-MAC");
        assert!(MacAddress::new("  ").is_empty());
    }

    #[test]
    fn test_presence_state() {
        let gate = MacAddress::new("GATE-MAC");
        let mut state = DeviceState::new(MacAddress::new("aa:bb:cc:dd:ee:01"), "phone");
        assert_eq!(state.presence(&gate), PresenceState::Disconnected);
        assert!(!state.is_connected());

        state.current_ap = Some(gate.clone());
        assert_eq!(state.presence(&gate), PresenceState::ConnectedAtGate);

        state.current_ap = Some(MacAddress::new("INSIDE-AP"));
        assert_eq!(state.presence(&gate), PresenceState::ConnectedElsewhere);
    }

    #[test]
    fn test_mark_triggered_is_monotonic() {
        let mut state = DeviceState::new(MacAddress::new("aa:bb:cc:dd:ee:01"), "phone");
        let now = Utc::now();

        state.mark_triggered(now);
        state.mark_triggered(now - Duration::seconds(30));
        assert_eq!(state.last_gate_trigger, Some(now));

        state.mark_triggered(now + Duration::seconds(30));
        assert_eq!(state.last_gate_trigger, Some(now + Duration::seconds(30)));
    }

    #[test]
    fn test_event_kind_round_trip_names() {
        assert_eq!("gate_skipped".parse::<EventKind>().unwrap(), EventKind::GateSkipped);
        assert_eq!(EventKind::GateError.as_str(), "gate_error");
        assert!("bogus".parse::<EventKind>().is_err());
    }
}
