//! Network controller client - source of wireless client snapshots
//!
//! Talks to the controller's classic JSON API:
//! - `POST {url}/api/login` with username/password, session kept in a cookie
//! - `GET {url}/api/s/{site}/stat/sta` for currently associated clients
//!
//! Only wireless clients seen within the last five minutes are returned.

use crate::domain::types::WirelessClient;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, error, info};

/// Clients not seen for this long are treated as gone
const ACTIVE_WINDOW_SECS: i64 = 5 * 60;

/// Login against the controller failed
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct AuthError(pub String);

/// Snapshot fetch failed
///
/// Covers both transient failures and expired sessions; callers classify
/// by inspecting the message text.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct FetchError(pub String);

/// Source of wireless client snapshots
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn login(&self) -> Result<(), AuthError>;

    async fn active_clients(&self, site_id: &str) -> Result<Vec<WirelessClient>, FetchError>;
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct RawClient {
    mac: String,
    #[serde(default)]
    ap_mac: Option<String>,
    #[serde(default)]
    uptime: Option<i64>,
    #[serde(default)]
    last_seen: Option<i64>,
    #[serde(default)]
    is_wired: bool,
    #[serde(default)]
    hostname: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

fn epoch_secs() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

/// Keep wireless clients that have an AP and were seen recently
fn filter_active(raw: Vec<RawClient>, now_secs: i64) -> Vec<WirelessClient> {
    raw.into_iter()
        .filter(|c| !c.is_wired)
        .filter(|c| {
            c.last_seen.map_or(true, |seen| now_secs.saturating_sub(seen) < ACTIVE_WINDOW_SECS)
        })
        .filter_map(|c| {
            let ap_mac = c.ap_mac.filter(|ap| !ap.trim().is_empty())?;
            let mut client =
                WirelessClient::new(&c.mac, &ap_mac, c.uptime.unwrap_or(0).max(0) as u64);
            client.hostname = c.name.or(c.hostname);
            Some(client)
        })
        .collect()
}

pub struct ControllerClient {
    base_url: String,
    username: String,
    password: String,
    http_client: reqwest::Client,
    logged_in: AtomicBool,
}

impl ControllerClient {
    pub fn new(
        base_url: &str,
        username: &str,
        password: &str,
        timeout: Duration,
        accept_invalid_certs: bool,
    ) -> anyhow::Result<Self> {
        // Session cookie is reused across polls
        let http_client = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(timeout)
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            username: username.to_string(),
            password: password.to_string(),
            http_client,
            logged_in: AtomicBool::new(false),
        })
    }

    fn clients_url(&self, site_id: &str) -> String {
        format!("{}/api/s/{}/stat/sta", self.base_url, site_id)
    }
}

#[async_trait]
impl SnapshotSource for ControllerClient {
    async fn login(&self) -> Result<(), AuthError> {
        debug!(url = %self.base_url, username = %self.username, "controller_login_attempt");

        let response = self
            .http_client
            .post(format!("{}/api/login", self.base_url))
            .json(&serde_json::json!({
                "username": self.username,
                "password": self.password,
            }))
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, "controller_login_failed");
                AuthError(format!("failed to login: {e}"))
            })?;

        let status = response.status();
        if !status.is_success() {
            self.logged_in.store(false, Ordering::Relaxed);
            error!(status = %status.as_u16(), "controller_login_rejected");
            return Err(AuthError(format!("failed to login: status {}", status.as_u16())));
        }

        self.logged_in.store(true, Ordering::Relaxed);
        info!(url = %self.base_url, "controller_login_ok");
        Ok(())
    }

    async fn active_clients(&self, site_id: &str) -> Result<Vec<WirelessClient>, FetchError> {
        if !self.logged_in.load(Ordering::Relaxed) {
            return Err(FetchError("not logged in".to_string()));
        }

        let response = self
            .http_client
            .get(self.clients_url(site_id))
            .send()
            .await
            .map_err(|e| FetchError(format!("failed to get clients: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            self.logged_in.store(false, Ordering::Relaxed);
            return Err(FetchError("failed to get clients: 401 unauthorized".to_string()));
        }
        if !status.is_success() {
            return Err(FetchError(format!("failed to get clients: status {}", status.as_u16())));
        }

        let body: ApiResponse<RawClient> = response
            .json()
            .await
            .map_err(|e| FetchError(format!("failed to decode clients: {e}")))?;

        let clients = filter_active(body.data, epoch_secs());
        debug!(site = %site_id, count = clients.len(), "controller_clients_fetched");
        Ok(clients)
    }
}
