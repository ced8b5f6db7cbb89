//! Control-plane HTTP server
//!
//! JSON endpoints for device management, status, settings and the
//! activity log, plus `/metrics` in Prometheus format. Uses hyper for the
//! HTTP server.
//!
//! Device and settings edits are written to the config file before they
//! take effect, so a failed save leaves both the file and the running
//! monitor unchanged.

use crate::domain::types::MacAddress;
use crate::infra::config::{Config, DeviceError};
use crate::io::actuator::{ActuatorError, HttpActuator};
use crate::io::prometheus::format_prometheus_metrics;
use crate::io::store::PresenceStore;
use crate::services::monitor::{Monitor, MonitorSettings};
use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

const MAX_BODY_BYTES: usize = 64 * 1024;
const DEFAULT_LOG_LIMIT: usize = 100;
const MAX_LOG_LIMIT: usize = 1000;

#[derive(Debug, Error)]
enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    BadGateway(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<DeviceError> for ApiError {
    fn from(e: DeviceError) -> Self {
        match e {
            DeviceError::AlreadyExists(_) => ApiError::Conflict(e.to_string()),
            DeviceError::NotFound(_) => ApiError::NotFound(e.to_string()),
            DeviceError::InvalidMac => ApiError::BadRequest(e.to_string()),
        }
    }
}

impl From<ActuatorError> for ApiError {
    fn from(e: ActuatorError) -> Self {
        match e {
            ActuatorError::NotConfigured => ApiError::BadRequest(e.to_string()),
            _ => ApiError::BadGateway(e.to_string()),
        }
    }
}

type ApiResult = Result<Response<Full<Bytes>>, ApiError>;

#[derive(Debug, Deserialize)]
struct NewDevice {
    mac: String,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct DeviceUpdate {
    name: String,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Partial settings change; omitted fields keep their value
#[derive(Debug, Default, Deserialize)]
pub struct SettingsUpdate {
    pub gate_ap_mac: Option<String>,
    pub open_duration_mins: Option<u64>,
    pub log_activity: Option<bool>,
    pub poll_interval_secs: Option<u64>,
    pub trigger_url: Option<String>,
}

impl SettingsUpdate {
    fn apply_to(&self, config: &mut Config) {
        if let Some(ref gate_ap_mac) = self.gate_ap_mac {
            config.set_gate_ap_mac(gate_ap_mac);
        }
        if let Some(mins) = self.open_duration_mins {
            config.set_open_duration_mins(mins);
        }
        if let Some(enabled) = self.log_activity {
            config.set_log_activity(enabled);
        }
        if let Some(secs) = self.poll_interval_secs {
            config.set_poll_interval_secs(secs);
        }
        if let Some(ref url) = self.trigger_url {
            config.set_trigger_url(url);
        }
    }
}

/// Settings as exposed over the API; credentials are never returned
#[derive(Debug, Serialize)]
struct SettingsView {
    site_id: String,
    gate_ap_mac: MacAddress,
    open_duration_mins: u64,
    log_activity: bool,
    poll_interval_secs: u64,
    trigger_configured: bool,
}

impl SettingsView {
    fn from_config(config: &Config) -> Self {
        Self {
            site_id: config.site_id().to_string(),
            gate_ap_mac: config.gate_ap_mac().clone(),
            open_duration_mins: config.open_duration_mins(),
            log_activity: config.log_activity(),
            poll_interval_secs: config.poll_interval_secs(),
            trigger_configured: !config.trigger_url().is_empty(),
        }
    }
}

/// Shared state behind every request
pub struct ApiState {
    monitor: Arc<Monitor>,
    config: Arc<Mutex<Config>>,
    store: Arc<dyn PresenceStore>,
    actuator: Arc<HttpActuator>,
}

impl ApiState {
    pub fn new(
        monitor: Arc<Monitor>,
        config: Arc<Mutex<Config>>,
        store: Arc<dyn PresenceStore>,
        actuator: Arc<HttpActuator>,
    ) -> Self {
        Self { monitor, config, store, actuator }
    }

    /// Apply `edit` to a copy of the config, save it, then commit
    ///
    /// `apply` runs while the config lock is still held, so registry edits
    /// are ordered the same way as the config commits they belong to.
    fn edit_config<T>(
        &self,
        edit: impl FnOnce(&mut Config) -> Result<T, DeviceError>,
        apply: impl FnOnce(&T, &Config),
    ) -> Result<(T, Config), ApiError> {
        let mut config = self.config.lock();
        let mut updated = config.clone();
        let value = edit(&mut updated)?;

        updated.save().map_err(|e| {
            error!(error = %e, path = %updated.config_file(), "config_save_failed");
            ApiError::Internal(format!("failed to save config: {e}"))
        })?;

        *config = updated.clone();
        apply(&value, &updated);
        Ok((value, updated))
    }
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> ApiResult {
    let body = serde_json::to_vec(value).map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .body(Full::new(Bytes::from(body)))
        .expect("static response should not fail"))
}

fn error_response(err: &ApiError) -> Response<Full<Bytes>> {
    let body = serde_json::json!({ "error": err.to_string() }).to_string();
    Response::builder()
        .status(err.status())
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .body(Full::new(Bytes::from(body)))
        .expect("static response should not fail")
}

fn parse_json<'a, T: Deserialize<'a>>(body: &'a [u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("invalid JSON body: {e}")))
}

/// Query string value for `key`, percent-decoded
fn query_param(query: Option<&str>, key: &str) -> Option<String> {
    let url = reqwest::Url::parse(&format!("http://localhost/?{}", query?)).ok()?;
    url.query_pairs().find(|(k, _)| k == key).map(|(_, v)| v.into_owned())
}

fn query_usize(query: Option<&str>, key: &str, default: usize) -> Result<usize, ApiError> {
    match query_param(query, key) {
        None => Ok(default),
        Some(raw) => {
            raw.parse().map_err(|_| ApiError::BadRequest(format!("invalid {key}: {raw}")))
        }
    }
}

/// Dispatch one request; body is already collected
async fn route(
    state: &ApiState,
    method: &Method,
    path: &str,
    query: Option<&str>,
    body: &[u8],
) -> ApiResult {
    let device_mac = path.strip_prefix("/api/devices/").filter(|rest| !rest.is_empty());

    match (method, path, device_mac) {
        (&Method::GET, "/health", _) => Ok(Response::builder()
            .status(StatusCode::OK)
            .body(Full::new(Bytes::from("ok")))
            .expect("static response should not fail")),
        (&Method::GET, "/metrics", _) => {
            let (tracked, connected) = state.monitor.device_counts();
            let site_id = state.config.lock().site_id().to_string();
            let body = format_prometheus_metrics(
                state.monitor.metrics(),
                tracked,
                connected,
                state.monitor.is_monitoring(),
                &site_id,
            );
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
                .body(Full::new(Bytes::from(body)))
                .expect("static response should not fail"))
        }
        (&Method::GET, "/api/status", _) => json_response(StatusCode::OK, &state.monitor.status()),
        (&Method::POST, "/api/monitoring/start", _) => {
            // Seed under the config lock so a concurrent device edit lands
            // either before the snapshot or after the session is open
            let started = {
                let config = state.config.lock();
                state.monitor.start(config.devices())
            };
            json_response(StatusCode::OK, &serde_json::json!({ "started": started }))
        }
        (&Method::POST, "/api/monitoring/stop", _) => {
            let stopped = state.monitor.stop();
            json_response(StatusCode::OK, &serde_json::json!({ "stopped": stopped }))
        }
        (&Method::GET, "/api/devices", _) => {
            let devices = state.config.lock().devices().to_vec();
            json_response(StatusCode::OK, &devices)
        }
        (&Method::POST, "/api/devices", _) => {
            let new: NewDevice = parse_json(body)?;
            let (mac, config) = state.edit_config(
                |c| c.add_device(&new.mac, &new.name),
                |mac, _| {
                    state.monitor.add_device(mac, &new.name);
                },
            )?;
            info!(mac = %mac, name = %new.name, "device_added");
            json_response(StatusCode::CREATED, &config.device(&mac))
        }
        (&Method::PUT, _, Some(raw_mac)) => {
            let update: DeviceUpdate = parse_json(body)?;
            let mac = MacAddress::new(raw_mac);
            let ((), config) = state.edit_config(
                |c| c.update_device(&mac, &update.name, update.enabled),
                |_, _| {
                    state.monitor.update_device(&mac, &update.name, update.enabled);
                },
            )?;
            info!(mac = %mac, name = %update.name, enabled = update.enabled, "device_updated");
            json_response(StatusCode::OK, &config.device(&mac))
        }
        (&Method::DELETE, _, Some(raw_mac)) => {
            let mac = MacAddress::new(raw_mac);
            let (removed, _) = state.edit_config(
                |c| c.remove_device(&mac),
                |_, _| {
                    state.monitor.remove_device(&mac);
                },
            )?;
            info!(mac = %mac, "device_removed");
            json_response(StatusCode::OK, &removed)
        }
        (&Method::GET, "/api/logs", _) => {
            let limit = query_usize(query, "limit", DEFAULT_LOG_LIMIT)?.min(MAX_LOG_LIMIT);
            let logs = match query_param(query, "device") {
                Some(device) => {
                    let device = MacAddress::new(&device);
                    state.store.logs_for_device(device.as_str(), limit)
                }
                None => state.store.recent_logs(limit, query_usize(query, "offset", 0)?),
            }
            .map_err(|e| ApiError::Internal(e.to_string()))?;
            json_response(StatusCode::OK, &logs)
        }
        (&Method::GET, "/api/settings", _) => {
            let view = SettingsView::from_config(&state.config.lock());
            json_response(StatusCode::OK, &view)
        }
        (&Method::PUT, "/api/settings", _) => {
            let update: SettingsUpdate = parse_json(body)?;
            let ((), config) = state.edit_config(
                |c| {
                    update.apply_to(c);
                    Ok(())
                },
                |_, committed| {
                    if update.trigger_url.is_some() {
                        state.actuator.set_url(committed.trigger_url());
                    }
                    state.monitor.update_settings(MonitorSettings::from_config(committed));
                },
            )?;
            json_response(StatusCode::OK, &SettingsView::from_config(&config))
        }
        (&Method::POST, "/api/test-gate", _) => {
            state.monitor.trigger_manual().await?;
            json_response(StatusCode::OK, &serde_json::json!({ "ok": true }))
        }
        (&Method::POST, "/api/test-connection", _) => {
            state.actuator.test_connection().await?;
            json_response(StatusCode::OK, &serde_json::json!({ "ok": true }))
        }
        (&Method::OPTIONS, _, _) => Ok(Response::builder()
            .status(StatusCode::OK)
            .header("Access-Control-Allow-Origin", "*")
            .header("Access-Control-Allow-Methods", "GET, POST, PUT, DELETE, OPTIONS")
            .header("Access-Control-Allow-Headers", "Content-Type")
            .body(Full::new(Bytes::new()))
            .expect("static response should not fail")),
        _ => Err(ApiError::NotFound(format!("no route for {method} {path}"))),
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: Arc<ApiState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let (parts, body) = req.into_parts();

    let body = match Limited::new(body, MAX_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            let err = ApiError::BadRequest(format!("failed to read body: {e}"));
            return Ok(error_response(&err));
        }
    };

    let result = route(&state, &parts.method, parts.uri.path(), parts.uri.query(), &body).await;
    Ok(match result {
        Ok(response) => response,
        Err(err) => {
            if err.status().is_server_error() {
                warn!(method = %parts.method, path = %parts.uri.path(), error = %err, "api_request_failed");
            } else {
                debug!(method = %parts.method, path = %parts.uri.path(), error = %err, "api_request_rejected");
            }
            error_response(&err)
        }
    })
}

/// Start the control-plane HTTP server
pub async fn start_api_server(
    bind_address: &str,
    port: u16,
    state: Arc<ApiState>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind((bind_address, port)).await?;

    info!(bind = %bind_address, port = %port, "api_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let state = state.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let state = state.clone();
                                async move { handle_request(req, state).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "api_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "api_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("api_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}
