//! Shared test utilities for mvirt-pve integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{Form, Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde_json::{Value, json};
use tokio::net::TcpListener;

use mvirt_pve::clients::{ApiError, ErrorKind, Method, Params, PveApi, PveClient};
use mvirt_pve::wait::Clock;
use mvirt_pve::{ClientConfig, LifecycleController, ReconcilePolicy};

// =============================================================================
// In-memory PVE fake
// =============================================================================

/// One request seen by [`FakePve`].
#[derive(Debug, Clone)]
pub struct Call {
    pub method: Method,
    pub path: String,
    pub params: Option<Params>,
}

impl Call {
    pub fn is(&self, method: Method, suffix: &str) -> bool {
        self.method == method && self.path.ends_with(suffix)
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.as_ref()?.get(key).map(String::as_str)
    }
}

type Handler = Box<dyn Fn(&Call) -> Result<Value, ApiError> + Send + Sync>;

/// Scripted `PveApi`: every request goes through `handler` and is recorded.
pub struct FakePve {
    handler: Handler,
    calls: Mutex<Vec<Call>>,
}

impl FakePve {
    pub fn new(
        handler: impl Fn(&Call) -> Result<Value, ApiError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, method: Method, suffix: &str) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| c.is(method.clone(), suffix))
            .collect()
    }

    pub fn count(&self, method: Method, suffix: &str) -> usize {
        self.calls_to(method, suffix).len()
    }
}

#[async_trait]
impl PveApi for FakePve {
    async fn request(
        &self,
        method: Method,
        path: &str,
        params: Option<&Params>,
    ) -> Result<Value, ApiError> {
        let call = Call {
            method,
            path: path.to_string(),
            params: params.cloned(),
        };
        let result = (self.handler)(&call);
        self.calls.lock().unwrap().push(call);
        result
    }
}

pub fn status(status: &str) -> Result<Value, ApiError> {
    Ok(json!({ "status": status }))
}

pub fn api_err(kind: ErrorKind, message: &str) -> Result<Value, ApiError> {
    Err(ApiError::new(kind, message))
}

/// Clock that records requested sleeps and returns immediately.
#[derive(Default)]
pub struct RecordingClock {
    sleeps: Mutex<Vec<Duration>>,
}

impl RecordingClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap().clone()
    }

    /// Sleeps other than zero-length poll spacing.
    pub fn nonzero_sleeps(&self) -> Vec<Duration> {
        self.sleeps()
            .into_iter()
            .filter(|d| !d.is_zero())
            .collect()
    }

    pub fn total(&self) -> Duration {
        self.sleeps().iter().sum()
    }
}

#[async_trait]
impl Clock for RecordingClock {
    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().unwrap().push(duration);
    }
}

/// Default policy with zero poll spacing so only backoff and settle waits show up.
pub fn test_policy() -> ReconcilePolicy {
    ReconcilePolicy {
        poll_interval: Duration::ZERO,
        ..ReconcilePolicy::default()
    }
}

pub type TestController = LifecycleController<Arc<FakePve>, Arc<RecordingClock>>;

pub fn controller(api: &Arc<FakePve>, clock: &Arc<RecordingClock>) -> TestController {
    LifecycleController::with_clock(api.clone(), clock.clone(), test_policy())
}

// =============================================================================
// Mock PVE HTTP server
// =============================================================================

pub const TICKET: &str = "PVE:root@pam:ABC";
pub const CSRF_TOKEN: &str = "csrf-1";
pub const PASSWORD: &str = "secret";
pub const TOKEN_ID: &str = "root@pam!ci";
pub const TOKEN_SECRET: &str = "tok-secret";

/// Allocate an available port for testing.
pub fn allocate_port() -> u16 {
    portpicker::pick_unused_port().expect("No available port")
}

#[derive(Debug, Clone)]
pub struct ConfigUpdate {
    pub csrf: Option<String>,
    pub form: HashMap<String, String>,
}

/// What the mock server has seen, plus knobs to change its answers.
#[derive(Default)]
pub struct MockState {
    pub ticket_requests: AtomicUsize,
    /// Answer the next guest request with 401, as if the ticket expired.
    pub expire_next: AtomicBool,
    pub config_updates: Mutex<Vec<ConfigUpdate>>,
}

/// Mock Proxmox API serving a handful of container endpoints.
pub struct MockPve {
    pub addr: SocketAddr,
    pub state: Arc<MockState>,
    shutdown_tx: tokio::sync::oneshot::Sender<()>,
}

impl MockPve {
    pub async fn spawn() -> Self {
        let state = Arc::new(MockState::default());

        let router = Router::new()
            .route("/api2/json/access/ticket", post(issue_ticket))
            .route(
                "/api2/json/nodes/{node}/lxc/{vmid}/status/current",
                get(container_status),
            )
            .route(
                "/api2/json/nodes/{node}/lxc/{vmid}/config",
                put(update_config),
            )
            .route(
                "/api2/json/nodes/{node}/lxc/{vmid}",
                axum::routing::delete(delete_container),
            )
            .route(
                "/api2/json/nodes/{node}/storage/{storage}/content",
                get(storage_content),
            )
            .with_state(state.clone());

        let addr: SocketAddr = format!("127.0.0.1:{}", allocate_port()).parse().unwrap();
        let listener = TcpListener::bind(&addr).await.expect("Failed to bind");

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .expect("Server error");
        });

        Self {
            addr,
            state,
            shutdown_tx,
        }
    }

    pub fn endpoint(&self) -> String {
        format!("http://{}/api2/json", self.addr)
    }

    pub fn password_client(&self, password: &str) -> PveClient {
        PveClient::new(ClientConfig::new(self.endpoint(), "root@pam").with_password(password))
            .expect("Failed to build client")
    }

    pub fn token_client(&self) -> PveClient {
        PveClient::new(
            ClientConfig::new(self.endpoint(), "root@pam").with_token(TOKEN_ID, TOKEN_SECRET),
        )
        .expect("Failed to build client")
    }

    pub fn ticket_requests(&self) -> usize {
        self.state.ticket_requests.load(Ordering::SeqCst)
    }

    pub fn config_updates(&self) -> Vec<ConfigUpdate> {
        self.state.config_updates.lock().unwrap().clone()
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn authorized(headers: &HeaderMap) -> bool {
    let cookie = format!("PVEAuthCookie={TICKET}");
    let token = format!("PVEAPIToken={TOKEN_ID}={TOKEN_SECRET}");
    header_str(headers, header::COOKIE.as_str()) == Some(cookie.as_str())
        || header_str(headers, header::AUTHORIZATION.as_str()) == Some(token.as_str())
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "data": null, "message": "authentication failure" })),
    )
        .into_response()
}

fn data(value: Value) -> Response {
    Json(json!({ "data": value })).into_response()
}

async fn issue_ticket(
    State(state): State<Arc<MockState>>,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    state.ticket_requests.fetch_add(1, Ordering::SeqCst);
    if form.get("password").map(String::as_str) != Some(PASSWORD) {
        return unauthorized();
    }
    data(json!({
        "username": form.get("username"),
        "ticket": TICKET,
        "CSRFPreventionToken": CSRF_TOKEN,
    }))
}

async fn container_status(
    State(state): State<Arc<MockState>>,
    Path((_node, vmid)): Path<(String, u32)>,
    headers: HeaderMap,
) -> Response {
    if state.expire_next.swap(false, Ordering::SeqCst) || !authorized(&headers) {
        return unauthorized();
    }
    match vmid {
        215 => data(json!({ "status": "running", "name": "web", "uptime": 42 })),
        216 => data(json!({ "status": "stopped", "lock": "backup" })),
        _ => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "data": null,
                "message": format!("Configuration file 'nodes/pve/lxc/{vmid}.conf' does not exist"),
            })),
        )
            .into_response(),
    }
}

async fn update_config(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    state.config_updates.lock().unwrap().push(ConfigUpdate {
        csrf: header_str(&headers, "CSRFPreventionToken").map(str::to_string),
        form,
    });
    data(Value::Null)
}

async fn delete_container(
    Path((_node, vmid)): Path<(String, u32)>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "data": null, "message": format!("CT {vmid} is locked (backup)") })),
    )
        .into_response()
}

async fn storage_content(
    Path((_node, storage)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    if query.get("content").map(String::as_str) != Some("vztmpl") {
        return data(json!([]));
    }
    data(json!([
        {
            "volid": format!("{storage}:vztmpl/ubuntu-24.04-standard_24.04-2_amd64.tar.zst"),
            "format": "tzst",
            "size": 141_557_760u64,
        },
        {
            "volid": format!("{storage}:vztmpl/debian-12-standard_12.7-1_amd64.tar.zst"),
            "format": "tzst",
            "size": 126_000_000u64,
        }
    ]))
}
