//! Re-authentication with exponential backoff
//!
//! When a snapshot fetch fails with an auth-looking error, the poller asks
//! `AuthResilience` to log in again. Consecutive failures back off
//! 1s, 2s, 4s ... capped at 64s; any success resets the state.
//! Attempts are serialized so concurrent callers never log in twice.

use crate::io::controller::{AuthError, SnapshotSource};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub const MAX_AUTH_BACKOFF: Duration = Duration::from_secs(64);

/// Case-insensitive markers of an expired or rejected session
const AUTH_ERROR_MARKERS: [&str; 5] =
    ["401", "unauthorized", "not logged in", "authentication", "invalid token"];

/// Whether a fetch error message looks like an authentication failure
pub fn is_auth_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    AUTH_ERROR_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Backoff after the `retry_count`-th consecutive failure
pub fn backoff_for(retry_count: u32) -> Duration {
    if retry_count == 0 {
        return Duration::ZERO;
    }
    let exp = (retry_count - 1).min(6);
    Duration::from_secs(1u64 << exp).min(MAX_AUTH_BACKOFF)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthRetryState {
    pub retry_count: u32,
    pub last_attempt: Option<Instant>,
    pub current_backoff: Duration,
}

impl AuthRetryState {
    /// Time left in the backoff window, if still inside it
    pub fn backoff_remaining(&self, now: Instant) -> Option<Duration> {
        let last = self.last_attempt?;
        let elapsed = now.saturating_duration_since(last);
        (elapsed < self.current_backoff).then(|| self.current_backoff - elapsed)
    }

    fn record_failure(&mut self) {
        self.retry_count = self.retry_count.saturating_add(1);
        self.current_backoff = backoff_for(self.retry_count);
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReauthError {
    #[error("authentication retry backoff in effect (wait {remaining:?})")]
    BackoffActive { remaining: Duration },
    #[error(transparent)]
    Failed(#[from] AuthError),
}

pub struct AuthResilience {
    state: Mutex<AuthRetryState>,
    login_timeout: Duration,
}

impl AuthResilience {
    pub fn new(login_timeout: Duration) -> Self {
        Self { state: Mutex::new(AuthRetryState::default()), login_timeout }
    }

    pub async fn reauthenticate(&self, source: &dyn SnapshotSource) -> Result<(), ReauthError> {
        self.reauthenticate_at(source, Instant::now()).await
    }

    /// Attempt a login unless still backing off from a previous failure
    ///
    /// The lock is held across the login call.
    pub async fn reauthenticate_at(
        &self,
        source: &dyn SnapshotSource,
        now: Instant,
    ) -> Result<(), ReauthError> {
        let mut state = self.state.lock().await;

        if let Some(remaining) = state.backoff_remaining(now) {
            return Err(ReauthError::BackoffActive { remaining });
        }

        state.last_attempt = Some(now);

        let result = match tokio::time::timeout(self.login_timeout, source.login()).await {
            Ok(result) => result,
            Err(_) => Err(AuthError("login timed out".to_string())),
        };

        match result {
            Ok(()) => {
                if state.retry_count > 0 {
                    info!(retries = %state.retry_count, "reauth_recovered");
                } else {
                    info!("reauth_ok");
                }
                state.reset();
                Ok(())
            }
            Err(e) => {
                state.record_failure();
                warn!(
                    error = %e,
                    retry_count = %state.retry_count,
                    backoff_secs = %state.current_backoff.as_secs(),
                    "reauth_failed"
                );
                Err(ReauthError::Failed(e))
            }
        }
    }

    pub async fn state(&self) -> AuthRetryState {
        self.state.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::WirelessClient;
    use crate::io::controller::FetchError;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Login results are popped in order; empty queue means success
    struct ScriptedLogin {
        results: parking_lot::Mutex<VecDeque<Result<(), AuthError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedLogin {
        fn new(results: Vec<Result<(), AuthError>>) -> Self {
            Self { results: parking_lot::Mutex::new(results.into()), calls: AtomicUsize::new(0) }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SnapshotSource for ScriptedLogin {
        async fn login(&self) -> Result<(), AuthError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.results.lock().pop_front().unwrap_or(Ok(()))
        }

        async fn active_clients(&self, _site_id: &str) -> Result<Vec<WirelessClient>, FetchError> {
            Ok(Vec::new())
        }
    }

    fn denied() -> Result<(), AuthError> {
        Err(AuthError("failed to login: status 400".to_string()))
    }

    #[test]
    fn test_is_auth_error() {
        assert!(is_auth_error("failed to get clients: 401 unauthorized"));
        assert!(is_auth_error("Not Logged In"));
        assert!(is_auth_error("AUTHENTICATION required"));
        assert!(is_auth_error("api.err.Invalid Token"));
        assert!(!is_auth_error("connection refused"));
        assert!(!is_auth_error("request timed out"));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let secs: Vec<u64> = (1..=9).map(|n| backoff_for(n).as_secs()).collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 16, 32, 64, 64, 64]);
        assert_eq!(backoff_for(0), Duration::ZERO);
        assert_eq!(backoff_for(u32::MAX), MAX_AUTH_BACKOFF);
    }

    #[tokio::test]
    async fn test_consecutive_failures_back_off_then_reset() {
        let source = ScriptedLogin::new(vec![denied(), denied(), denied()]);
        let auth = AuthResilience::new(Duration::from_secs(5));
        let t0 = Instant::now();

        assert!(matches!(auth.reauthenticate_at(&source, t0).await, Err(ReauthError::Failed(_))));
        assert_eq!(auth.state().await.current_backoff, Duration::from_secs(1));

        let t1 = t0 + Duration::from_secs(1);
        assert!(auth.reauthenticate_at(&source, t1).await.is_err());
        assert_eq!(auth.state().await.current_backoff, Duration::from_secs(2));

        let t2 = t1 + Duration::from_secs(2);
        assert!(auth.reauthenticate_at(&source, t2).await.is_err());
        let state = auth.state().await;
        assert_eq!(state.retry_count, 3);
        assert_eq!(state.current_backoff, Duration::from_secs(4));

        let t3 = t2 + Duration::from_secs(4);
        auth.reauthenticate_at(&source, t3).await.unwrap();
        assert_eq!(auth.state().await, AuthRetryState::default());
        assert_eq!(source.calls(), 4);
    }

    #[tokio::test]
    async fn test_attempt_inside_backoff_skips_login() {
        let source = ScriptedLogin::new(vec![denied(), denied()]);
        let auth = AuthResilience::new(Duration::from_secs(5));
        let t0 = Instant::now();

        let _ = auth.reauthenticate_at(&source, t0).await;
        let _ = auth.reauthenticate_at(&source, t0 + Duration::from_secs(1)).await;
        assert_eq!(source.calls(), 2);

        // 2s window, only 500ms elapsed
        let result = auth.reauthenticate_at(&source, t0 + Duration::from_millis(1500)).await;
        match result {
            Err(ReauthError::BackoffActive { remaining }) => {
                assert_eq!(remaining, Duration::from_millis(1500));
            }
            other => panic!("expected backoff, got {other:?}"),
        }
        assert_eq!(source.calls(), 2);
        assert_eq!(auth.state().await.retry_count, 2);
    }

    #[tokio::test]
    async fn test_first_attempt_is_never_blocked() {
        let source = ScriptedLogin::new(vec![]);
        let auth = AuthResilience::new(Duration::from_secs(5));
        auth.reauthenticate(&source).await.unwrap();
        assert_eq!(source.calls(), 1);
    }
}
