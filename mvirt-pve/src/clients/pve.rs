//! Client for the Proxmox VE management API.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, COOKIE};
use reqwest::StatusCode;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

pub use reqwest::Method;

use super::error::{ApiError, ErrorKind};
use crate::config::ClientConfig;
use crate::descriptor::{ResourceKind, ResourceRef, ResourceStatus};

/// Request parameters; query string for GET/DELETE, form body otherwise.
pub type Params = BTreeMap<String, String>;

const CSRF_HEADER: &str = "CSRFPreventionToken";

/// Run-state transitions under `/status/{action}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunAction {
    Start,
    Stop,
    Shutdown,
}

impl RunAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunAction::Start => "start",
            RunAction::Stop => "stop",
            RunAction::Shutdown => "shutdown",
        }
    }
}

/// Endpoint paths for one guest, relative to the API base URL.
impl ResourceRef {
    pub fn create_path(node: &str, kind: ResourceKind) -> String {
        format!("nodes/{}/{}", node, kind)
    }

    pub fn guest_path(&self) -> String {
        format!("nodes/{}/{}/{}", self.node, self.kind, self.id)
    }

    pub fn status_path(&self) -> String {
        format!("{}/status/current", self.guest_path())
    }

    pub fn config_path(&self) -> String {
        format!("{}/config", self.guest_path())
    }

    pub fn resize_path(&self) -> String {
        format!("{}/resize", self.guest_path())
    }

    pub fn action_path(&self, action: RunAction) -> String {
        format!("{}/status/{}", self.guest_path(), action.as_str())
    }
}

/// Payload of `GET .../status/current`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct StatusReport {
    #[serde(default)]
    pub status: Option<String>,
    /// Present while an operation holds the guest lock (`backup`, `create`, ...).
    #[serde(default)]
    pub lock: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub uptime: Option<u64>,
}

impl StatusReport {
    /// Run status, ignoring any lock.
    pub fn run_status(&self) -> ResourceStatus {
        match self.status.as_deref() {
            Some("running") => ResourceStatus::Running,
            Some("stopped") => ResourceStatus::Stopped,
            _ => ResourceStatus::Unknown,
        }
    }

    /// Status to report to callers; a held lock wins over the run status.
    pub fn observed(&self) -> ResourceStatus {
        match self.lock.as_deref() {
            Some(lock) if !lock.is_empty() => ResourceStatus::Locked,
            _ => self.run_status(),
        }
    }
}

/// Entry of `GET /nodes/{node}/storage/{storage}/content`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TemplateEntry {
    pub volid: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub format: Option<String>,
}

/// Entry of `GET /nodes/{node}/{qemu|lxc}`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GuestSummary {
    #[serde(deserialize_with = "vmid_from_any")]
    pub vmid: u32,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub cpus: Option<f64>,
    #[serde(default)]
    pub maxmem: Option<u64>,
    #[serde(default)]
    pub lock: Option<String>,
}

// Container listings report vmid as a string, VM listings as a number.
fn vmid_from_any<'de, D: Deserializer<'de>>(d: D) -> Result<u32, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Vmid {
        Num(u32),
        Str(String),
    }
    match Vmid::deserialize(d)? {
        Vmid::Num(n) => Ok(n),
        Vmid::Str(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

fn decode<T: serde::de::DeserializeOwned>(data: Value, what: &str) -> Result<T, ApiError> {
    serde_json::from_value(data)
        .map_err(|e| ApiError::new(ErrorKind::Other, format!("malformed {what}: {e}")))
}

/// Transport to a PVE API.
///
/// `request` returns the `data` member of the response envelope. Failures are
/// classified once, here; nothing is retried.
#[async_trait]
pub trait PveApi: Send + Sync {
    async fn request(
        &self,
        method: Method,
        path: &str,
        params: Option<&Params>,
    ) -> Result<Value, ApiError>;

    /// Read `status/current` for a guest.
    async fn current_status(&self, target: &ResourceRef) -> Result<StatusReport, ApiError> {
        let data = self
            .request(Method::GET, &target.status_path(), None)
            .await?;
        decode(data, "status report")
    }

    /// List container templates on a storage.
    async fn list_templates(
        &self,
        node: &str,
        storage: &str,
    ) -> Result<Vec<TemplateEntry>, ApiError> {
        let params = Params::from([("content".to_string(), "vztmpl".to_string())]);
        let data = self
            .request(
                Method::GET,
                &format!("nodes/{node}/storage/{storage}/content"),
                Some(&params),
            )
            .await?;
        decode(data, "template listing")
    }

    /// List guests of one kind on a node.
    async fn list_guests(
        &self,
        node: &str,
        kind: ResourceKind,
    ) -> Result<Vec<GuestSummary>, ApiError> {
        let data = self
            .request(Method::GET, &ResourceRef::create_path(node, kind), None)
            .await?;
        decode(data, "guest listing")
    }
}

#[async_trait]
impl<T: PveApi + ?Sized> PveApi for Arc<T> {
    async fn request(
        &self,
        method: Method,
        path: &str,
        params: Option<&Params>,
    ) -> Result<Value, ApiError> {
        (**self).request(method, path, params).await
    }
}

#[derive(Debug, Clone)]
struct Session {
    ticket: String,
    csrf_token: String,
}

#[derive(Deserialize)]
struct TicketEnvelope {
    data: Option<TicketData>,
}

#[derive(Deserialize)]
struct TicketData {
    ticket: String,
    #[serde(rename = "CSRFPreventionToken")]
    csrf_token: String,
}

/// HTTP client for a PVE cluster.
///
/// With password auth a ticket is fetched lazily before the first call and
/// again whenever none is held; a 401 drops the held ticket.
pub struct PveClient {
    config: ClientConfig,
    http: reqwest::Client,
    session: RwLock<Option<Session>>,
}

impl PveClient {
    pub fn new(config: ClientConfig) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.insecure)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ApiError::new(ErrorKind::Other, format!("failed to build HTTP client: {e}")))?;

        if config.insecure {
            warn!(endpoint = %config.endpoint, "TLS certificate verification disabled");
        }

        Ok(Self {
            config,
            http,
            session: RwLock::new(None),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.endpoint.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    async fn authenticate(&self) -> Result<Session, ApiError> {
        let password = self.config.password.as_deref().ok_or_else(|| {
            ApiError::new(
                ErrorKind::Auth,
                "no password or API token configured",
            )
        })?;

        info!(endpoint = %self.config.endpoint, username = %self.config.username, "Authenticating");

        let form = Params::from([
            ("username".to_string(), self.config.username.clone()),
            ("password".to_string(), password.to_string()),
        ]);
        let response = self
            .http
            .post(self.url("access/ticket"))
            .form(&form)
            .send()
            .await
            .map_err(auth_failure)?;

        let status = response.status();
        let text = response.text().await.map_err(auth_failure)?;
        if !status.is_success() {
            let mut err = ApiError::from_response(status, &text);
            err.kind = ErrorKind::Auth;
            return Err(err);
        }

        let envelope: TicketEnvelope = serde_json::from_str(&text).map_err(|e| {
            ApiError::new(ErrorKind::Auth, format!("malformed ticket response: {e}"))
        })?;
        let data = envelope
            .data
            .ok_or_else(|| ApiError::new(ErrorKind::Auth, "authentication rejected"))?;

        debug!("Obtained PVE ticket");
        Ok(Session {
            ticket: data.ticket,
            csrf_token: data.csrf_token,
        })
    }

    async fn session(&self) -> Result<Session, ApiError> {
        if let Some(session) = self.session.read().await.clone() {
            return Ok(session);
        }

        let mut guard = self.session.write().await;
        if let Some(session) = guard.clone() {
            return Ok(session);
        }
        let session = self.authenticate().await?;
        *guard = Some(session.clone());
        Ok(session)
    }

    async fn invalidate_session(&self) {
        *self.session.write().await = None;
    }
}

fn auth_failure(err: reqwest::Error) -> ApiError {
    let mut err = ApiError::from_transport(err);
    err.kind = ErrorKind::Auth;
    err
}

#[async_trait]
impl PveApi for PveClient {
    async fn request(
        &self,
        method: Method,
        path: &str,
        params: Option<&Params>,
    ) -> Result<Value, ApiError> {
        let url = self.url(path);
        debug!(%method, %url, "PVE request");

        let mut builder = self.http.request(method.clone(), &url);
        if let Some(params) = params {
            builder = if method == Method::GET || method == Method::DELETE {
                builder.query(params)
            } else {
                builder.form(params)
            };
        }

        let token = self.config.api_token();
        builder = match &token {
            Some(token) => builder.header(AUTHORIZATION, format!("PVEAPIToken={token}")),
            None => {
                let session = self.session().await?;
                let builder = builder.header(COOKIE, format!("PVEAuthCookie={}", session.ticket));
                if method == Method::GET {
                    builder
                } else {
                    builder.header(CSRF_HEADER, session.csrf_token)
                }
            }
        };

        let response = builder.send().await.map_err(ApiError::from_transport)?;
        let status = response.status();
        let text = response.text().await.map_err(ApiError::from_transport)?;

        if !status.is_success() {
            if status == StatusCode::UNAUTHORIZED && token.is_none() {
                self.invalidate_session().await;
            }
            let err = ApiError::from_response(status, &text);
            debug!(%method, %url, kind = %err.kind, error = %err.message, "PVE request failed");
            return Err(err);
        }

        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        let envelope: Value = serde_json::from_str(&text).map_err(|e| ApiError {
            kind: ErrorKind::Other,
            status: Some(status.as_u16()),
            body: None,
            message: format!("malformed response from {url}: {e}"),
        })?;
        Ok(envelope.get("data").cloned().unwrap_or(Value::Null))
    }
}
