//! Domain models - core types for presence tracking
//!
//! This module contains the canonical data types used throughout the system:
//! - `MacAddress` - normalized hardware identifier for devices and APs
//! - `DeviceState` - per-device presence record held by the registry
//! - `WirelessClient` - one entry of a controller snapshot
//! - `Direction` / `EventKind` - classification of presence transitions
//! - `LogEntry` - event log record

pub mod events;
pub mod types;

pub use events::LogEntry;
pub use types::{DeviceState, Direction, EventKind, MacAddress, PresenceState, WirelessClient};
