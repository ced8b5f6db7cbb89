//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `controller` - Network controller client (wireless client snapshots)
//! - `actuator` - HTTP gate actuator
//! - `store` - SQLite persistence for device state and the activity log
//! - `prometheus` - Prometheus text exposition
//! - `http_api` - Control-plane HTTP server

pub mod actuator;
pub mod controller;
pub mod http_api;
pub mod prometheus;
pub mod store;

// Re-export commonly used types
pub use actuator::{Actuator, ActuatorError, HttpActuator};
pub use controller::{AuthError, ControllerClient, FetchError, SnapshotSource};
pub use http_api::{start_api_server, ApiState};
pub use store::{PresenceStore, SqliteStore, StoredDeviceState};
