//! Presence tracking - diff controller snapshots against the registry
//!
//! Per tracked device and poll, exactly one of:
//! - connect: absent before, present now (at the gate only if freshly associated)
//! - disconnect: present before, absent now
//! - roam: present on a different AP than before
//! - unchanged
//!
//! A device found at the gate AP with an old association is treated as
//! having been there all along, not as an arrival.

use crate::domain::types::{DeviceState, MacAddress, WirelessClient};
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use tracing::info;

/// Gate-AP associations younger than this count as fresh arrivals
pub const FRESH_ARRIVAL_MAX_UPTIME_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionKind {
    Connected,
    Disconnected,
    Roamed,
}

impl TransitionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionKind::Connected => "connected",
            TransitionKind::Disconnected => "disconnected",
            TransitionKind::Roamed => "roamed",
        }
    }
}

/// A presence change detected for one device
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub kind: TransitionKind,
    pub mac: MacAddress,
    pub name: String,
    pub from_ap: Option<MacAddress>,
    pub to_ap: Option<MacAddress>,
    /// Association age reported by the controller (connect/roam only)
    pub uptime_secs: Option<u64>,
    /// Trigger time as of this poll, for the cooldown check
    pub last_gate_trigger: Option<DateTime<Utc>>,
}

/// Latest controller view, indexed by client MAC
#[derive(Debug, Default)]
pub struct Snapshot {
    clients: FxHashMap<MacAddress, WirelessClient>,
}

impl Snapshot {
    pub fn from_clients(clients: Vec<WirelessClient>) -> Self {
        // Later duplicates win
        let clients = clients.into_iter().map(|c| (c.mac.clone(), c)).collect();
        Self { clients }
    }

    pub fn get(&self, mac: &MacAddress) -> Option<&WirelessClient> {
        self.clients.get(mac)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

/// Result of applying one snapshot
#[derive(Debug, Default)]
pub struct PollDiff {
    pub transitions: Vec<Transition>,
    /// Devices whose state was touched this poll, to persist
    pub touched: Vec<DeviceState>,
}

/// Tracked devices keyed by MAC
#[derive(Debug, Default)]
pub struct Registry {
    devices: FxHashMap<MacAddress, DeviceState>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, state: DeviceState) {
        self.devices.insert(state.mac.clone(), state);
    }

    pub fn remove(&mut self, mac: &MacAddress) -> Option<DeviceState> {
        self.devices.remove(mac)
    }

    pub fn get(&self, mac: &MacAddress) -> Option<&DeviceState> {
        self.devices.get(mac)
    }

    pub fn get_mut(&mut self, mac: &MacAddress) -> Option<&mut DeviceState> {
        self.devices.get_mut(mac)
    }

    pub fn contains(&self, mac: &MacAddress) -> bool {
        self.devices.contains_key(mac)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn connected_count(&self) -> usize {
        self.devices.values().filter(|d| d.is_connected()).count()
    }

    /// Devices sorted by MAC
    pub fn devices(&self) -> Vec<&DeviceState> {
        let mut devices: Vec<&DeviceState> = self.devices.values().collect();
        devices.sort_by(|a, b| a.mac.cmp(&b.mac));
        devices
    }

    /// Diff `snapshot` against every tracked device and commit the new states
    ///
    /// Untracked clients in the snapshot are ignored. Applying the same
    /// snapshot twice yields no transitions the second time.
    pub fn apply_snapshot(
        &mut self,
        snapshot: &Snapshot,
        gate_ap: &MacAddress,
        now: DateTime<Utc>,
    ) -> PollDiff {
        let mut diff = PollDiff::default();

        for state in self.devices.values_mut() {
            let client = snapshot.get(&state.mac);

            let transition = match (client, state.current_ap.as_ref()) {
                (Some(client), None) => {
                    let at_gate = &client.ap_mac == gate_ap;
                    if at_gate && client.uptime_secs >= FRESH_ARRIVAL_MAX_UPTIME_SECS {
                        info!(
                            mac = %state.mac,
                            name = %state.name,
                            uptime_secs = %client.uptime_secs,
                            "device_already_at_gate"
                        );
                        None
                    } else {
                        Some(TransitionKind::Connected)
                    }
                }
                (Some(client), Some(current)) if current != &client.ap_mac => {
                    Some(TransitionKind::Roamed)
                }
                (Some(_), Some(_)) => None,
                (None, Some(_)) => Some(TransitionKind::Disconnected),
                (None, None) => {
                    continue;
                }
            };

            if let Some(kind) = transition {
                diff.transitions.push(Transition {
                    kind,
                    mac: state.mac.clone(),
                    name: state.name.clone(),
                    from_ap: state.current_ap.clone(),
                    to_ap: client.map(|c| c.ap_mac.clone()),
                    uptime_secs: client.map(|c| c.uptime_secs),
                    last_gate_trigger: state.last_gate_trigger,
                });
            }

            match client {
                Some(client) => {
                    state.current_ap = Some(client.ap_mac.clone());
                    state.last_seen = Some(now);
                }
                None => {
                    state.previous_ap = state.current_ap.take();
                }
            }
            diff.touched.push(state.clone());
        }

        diff.transitions.sort_by(|a, b| a.mac.cmp(&b.mac));
        diff
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    const PHONE: &str = "aa:bb:cc:dd:ee:01";

    fn gate() -> MacAddress {
        MacAddress::new("GATE-MAC")
    }

    fn registry_with_phone() -> Registry {
        let mut registry = Registry::new();
        registry.insert(DeviceState::new(MacAddress::new(PHONE), "phone"));
        registry
    }

    fn snapshot(ap: &str, uptime: u64) -> Snapshot {
        Snapshot::from_clients(vec![WirelessClient::new(PHONE, ap, uptime)])
    }

    fn phone_state(registry: &Registry) -> &DeviceState {
        registry.get(&MacAddress::new(PHONE)).unwrap()
    }

    #[test]
    fn test_fresh_connect_at_gate() {
        let mut registry = registry_with_phone();
        let now = Utc::now();

        let diff = registry.apply_snapshot(&snapshot("GATE-MAC", 5), &gate(), now);
        assert_eq!(diff.transitions.len(), 1);
        let t = &diff.transitions[0];
        assert_eq!(t.kind, TransitionKind::Connected);
        assert_eq!(t.from_ap, None);
        assert_eq!(t.to_ap, Some(gate()));
        assert_eq!(t.uptime_secs, Some(5));

        let state = phone_state(&registry);
        assert_eq!(state.current_ap, Some(gate()));
        assert_eq!(state.last_seen, Some(now));
    }

    #[test]
    fn test_stale_association_at_gate_is_not_an_arrival() {
        let mut registry = registry_with_phone();
        let diff = registry.apply_snapshot(
            &snapshot("GATE-MAC", FRESH_ARRIVAL_MAX_UPTIME_SECS),
            &gate(),
            Utc::now(),
        );
        assert!(diff.transitions.is_empty());
        // Still recorded as present so a later roam is detected
        assert_eq!(phone_state(&registry).current_ap, Some(gate()));
        assert_eq!(diff.touched.len(), 1);
    }

    #[test]
    fn test_connect_elsewhere_ignores_uptime() {
        let mut registry = registry_with_phone();
        let diff = registry.apply_snapshot(&snapshot("INSIDE-AP", 3600), &gate(), Utc::now());
        assert_eq!(diff.transitions[0].kind, TransitionKind::Connected);
    }

    #[test]
    fn test_roam_and_disconnect() {
        let mut registry = registry_with_phone();
        let t0 = Utc::now();
        registry.apply_snapshot(&snapshot("INSIDE-AP", 10), &gate(), t0);

        let diff = registry.apply_snapshot(&snapshot("GATE-MAC", 40), &gate(), t0 + Duration::seconds(1));
        let roam = &diff.transitions[0];
        assert_eq!(roam.kind, TransitionKind::Roamed);
        assert_eq!(roam.from_ap, Some(MacAddress::new("INSIDE-AP")));
        assert_eq!(roam.to_ap, Some(gate()));

        let diff = registry.apply_snapshot(&Snapshot::default(), &gate(), t0 + Duration::seconds(2));
        let gone = &diff.transitions[0];
        assert_eq!(gone.kind, TransitionKind::Disconnected);
        assert_eq!(gone.from_ap, Some(gate()));
        assert_eq!(gone.to_ap, None);

        let state = phone_state(&registry);
        assert_eq!(state.current_ap, None);
        assert_eq!(state.previous_ap, Some(gate()));
        assert_eq!(state.last_seen, Some(t0 + Duration::seconds(1)));
    }

    #[test]
    fn test_same_snapshot_twice_is_idempotent() {
        let mut registry = registry_with_phone();
        let now = Utc::now();
        let snap = snapshot("GATE-MAC", 5);

        assert_eq!(registry.apply_snapshot(&snap, &gate(), now).transitions.len(), 1);
        assert!(registry.apply_snapshot(&snap, &gate(), now).transitions.is_empty());
    }

    #[test]
    fn test_untracked_clients_are_ignored() {
        let mut registry = registry_with_phone();
        let snap = Snapshot::from_clients(vec![WirelessClient::new("aa:bb:cc:dd:ee:99", "GATE-MAC", 1)]);
        let diff = registry.apply_snapshot(&snap, &gate(), Utc::now());
        assert!(diff.transitions.is_empty());
        assert!(diff.touched.is_empty());
    }

    #[test]
    fn test_snapshot_mac_case_is_normalized() {
        let mut registry = registry_with_phone();
        let snap = Snapshot::from_clients(vec![WirelessClient::new("AA-BB-CC-DD-EE-01", "gate-mac", 2)]);
        let diff = registry.apply_snapshot(&snap, &gate(), Utc::now());
        assert_eq!(diff.transitions.len(), 1);
    }

    #[test]
    fn test_transition_carries_last_trigger() {
        let mut registry = registry_with_phone();
        let earlier = Utc::now() - Duration::minutes(2);
        registry.get_mut(&MacAddress::new(PHONE)).unwrap().mark_triggered(earlier);

        let diff = registry.apply_snapshot(&snapshot("GATE-MAC", 1), &gate(), Utc::now());
        assert_eq!(diff.transitions[0].last_gate_trigger, Some(earlier));
    }
}
