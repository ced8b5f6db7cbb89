//! Services - business logic and state management
//!
//! This module contains the core business logic services:
//! - `monitor` - Session lifecycle, poll loop and device registry
//! - `presence` - Snapshot diffing into connect/disconnect/roam transitions
//! - `direction` - Arriving/leaving classification relative to the gate AP
//! - `gate_trigger` - Cooldown-guarded gate actuation
//! - `auth` - Controller re-authentication with exponential backoff
//! - `activity` - Best-effort activity log writer

pub mod activity;
pub mod auth;
pub mod direction;
pub mod gate_trigger;
pub mod monitor;
pub mod presence;

// Re-export commonly used types
pub use auth::AuthResilience;
pub use gate_trigger::GateTrigger;
pub use monitor::{Monitor, MonitorSettings, MonitorStatus, PollOutcome};
pub use presence::{Registry, Snapshot, Transition, TransitionKind};
