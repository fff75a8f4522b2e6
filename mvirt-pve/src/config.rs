//! Connection settings and reconcile timing.
//!
//! Both are plain values handed to constructors; nothing in the library reads
//! the environment or a config file on its own.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How to reach and authenticate against a Proxmox VE API.
#[derive(Clone)]
pub struct ClientConfig {
    /// API base URL, e.g. `https://pve.example.com:8006/api2/json`.
    pub endpoint: String,
    /// User for ticket authentication, e.g. `root@pam`.
    pub username: String,
    pub password: Option<String>,
    /// API token ID (`user@realm!name`). Takes precedence over the password.
    pub token_id: Option<String>,
    pub token_secret: Option<String>,
    /// Skip TLS certificate verification.
    pub insecure: bool,
    pub request_timeout: Duration,
}

impl ClientConfig {
    pub fn new(endpoint: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            username: username.into(),
            password: None,
            token_id: None,
            token_secret: None,
            insecure: false,
            request_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_token(mut self, id: impl Into<String>, secret: impl Into<String>) -> Self {
        self.token_id = Some(id.into());
        self.token_secret = Some(secret.into());
        self
    }

    /// `<token_id>=<token_secret>` when token auth is configured.
    pub fn api_token(&self) -> Option<String> {
        match (&self.token_id, &self.token_secret) {
            (Some(id), Some(secret)) => Some(format!("{id}={secret}")),
            _ => None,
        }
    }

    pub fn uses_token_auth(&self) -> bool {
        self.api_token().is_some()
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("endpoint", &self.endpoint)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("token_id", &self.token_id)
            .field("token_secret", &self.token_secret.as_ref().map(|_| "<redacted>"))
            .field("insecure", &self.insecure)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

/// Poll intervals, attempt budgets and backoff used by the reconciler.
///
/// Durations are (de)serialized as seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilePolicy {
    /// Spacing between status polls.
    #[serde(with = "duration_secs")]
    pub poll_interval: Duration,
    /// Polls while waiting for a guest lock to clear.
    pub unlock_attempts: u32,
    /// Polls after the first stop request during delete.
    pub stop_attempts: u32,
    /// Polls after the shutdown request that follows a stop that didn't land.
    pub forced_stop_attempts: u32,
    /// Polls after the shutdown issued between delete retries.
    pub retry_stop_attempts: u32,
    /// Upper bound on DELETE calls.
    pub delete_attempts: u32,
    /// Backoff after failed delete attempt `k` is `k * delete_backoff_step`.
    #[serde(with = "duration_secs")]
    pub delete_backoff_step: Duration,
    /// Pause after starting a freshly created guest before reading status.
    #[serde(with = "duration_secs")]
    pub start_settle: Duration,
}

impl Default for ReconcilePolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            unlock_attempts: 30,
            stop_attempts: 60,
            forced_stop_attempts: 30,
            retry_stop_attempts: 15,
            delete_attempts: 10,
            delete_backoff_step: Duration::from_secs(3),
            start_settle: Duration::from_secs(3),
        }
    }
}

impl ReconcilePolicy {
    /// Wait after the `attempt`-th (1-based) failed delete.
    pub fn delete_backoff(&self, attempt: u32) -> Duration {
        self.delete_backoff_step.saturating_mul(attempt)
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
