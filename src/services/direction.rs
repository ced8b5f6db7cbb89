//! Direction classification for presence transitions
//!
//! The gate AP sits outside; roaming onto it from another AP means the
//! device is heading out, while appearing on it from nowhere means it
//! just arrived from the street.

use crate::domain::types::{Direction, MacAddress};
use crate::services::presence::TransitionKind;

pub fn classify_connect(to_ap: &MacAddress, gate_ap: &MacAddress) -> Direction {
    if to_ap == gate_ap {
        Direction::Arriving
    } else {
        Direction::Unknown
    }
}

pub fn classify_roam(
    from_ap: Option<&MacAddress>,
    to_ap: &MacAddress,
    gate_ap: &MacAddress,
) -> Direction {
    let from_gate = from_ap.is_some_and(|ap| ap == gate_ap);

    if to_ap == gate_ap {
        match from_ap {
            Some(ap) if !ap.is_empty() => Direction::Leaving,
            _ => Direction::Arriving,
        }
    } else if from_gate {
        Direction::Arriving
    } else {
        Direction::Unknown
    }
}

/// Classify a transition; disconnects carry no direction
pub fn classify(
    kind: TransitionKind,
    from_ap: Option<&MacAddress>,
    to_ap: Option<&MacAddress>,
    gate_ap: &MacAddress,
) -> Option<Direction> {
    match (kind, to_ap) {
        (TransitionKind::Connected, Some(to)) => Some(classify_connect(to, gate_ap)),
        (TransitionKind::Roamed, Some(to)) => Some(classify_roam(from_ap, to, gate_ap)),
        _ => None,
    }
}

/// Whether the gate AP is on either side of the transition
pub fn involves_gate(
    from_ap: Option<&MacAddress>,
    to_ap: Option<&MacAddress>,
    gate_ap: &MacAddress,
) -> bool {
    !gate_ap.is_empty() && (from_ap == Some(gate_ap) || to_ap == Some(gate_ap))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> MacAddress {
        MacAddress::new("GATE-MAC")
    }

    fn inside() -> MacAddress {
        MacAddress::new("INSIDE-AP")
    }

    #[test]
    fn test_connect_at_gate_is_arriving() {
        assert_eq!(classify_connect(&gate(), &gate()), Direction::Arriving);
        assert_eq!(classify_connect(&inside(), &gate()), Direction::Unknown);
    }

    #[test]
    fn test_roam_onto_gate_is_leaving() {
        assert_eq!(classify_roam(Some(&inside()), &gate(), &gate()), Direction::Leaving);
    }

    #[test]
    fn test_roam_onto_gate_from_nowhere_is_arriving() {
        assert_eq!(classify_roam(None, &gate(), &gate()), Direction::Arriving);
        assert_eq!(classify_roam(Some(&MacAddress::new("")), &gate(), &gate()), Direction::Arriving);
    }

    #[test]
    fn test_roam_off_gate_is_arriving() {
        assert_eq!(classify_roam(Some(&gate()), &inside(), &gate()), Direction::Arriving);
    }

    #[test]
    fn test_roam_between_inside_aps_is_unknown() {
        let other = MacAddress::new("GARAGE-AP");
        assert_eq!(classify_roam(Some(&inside()), &other, &gate()), Direction::Unknown);
    }

    #[test]
    fn test_disconnect_is_not_classified() {
        assert_eq!(classify(TransitionKind::Disconnected, Some(&gate()), None, &gate()), None);
        assert_eq!(
            classify(TransitionKind::Roamed, Some(&inside()), Some(&gate()), &gate()),
            Some(Direction::Leaving)
        );
    }

    #[test]
    fn test_involves_gate() {
        assert!(involves_gate(None, Some(&gate()), &gate()));
        assert!(involves_gate(Some(&gate()), Some(&inside()), &gate()));
        assert!(!involves_gate(Some(&inside()), Some(&MacAddress::new("GARAGE-AP")), &gate()));
        // Unset gate AP never matches
        let unset = MacAddress::new("");
        assert!(!involves_gate(None, Some(&unset), &unset));
    }
}
