//! Classified failures from the Proxmox VE API.

use std::fmt;

use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;

/// Coarse failure classes, decided once where the failure is observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Credentials rejected, ticket expired or permission denied.
    Auth,
    /// The request or a remote worker timed out.
    Timeout,
    /// The guest is locked, busy or still running.
    Conflict,
    /// The guest or endpoint does not exist.
    NotFound,
    Other,
}

impl ErrorKind {
    /// Whether waiting and trying again can make the same call succeed.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Timeout | ErrorKind::Conflict)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Auth => "auth",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Conflict => "conflict",
            ErrorKind::NotFound => "not-found",
            ErrorKind::Other => "other",
        };
        f.write_str(s)
    }
}

/// A failed API call.
#[derive(Debug, Error)]
#[error("{kind} failure: {message}")]
pub struct ApiError {
    pub kind: ErrorKind,
    /// HTTP status, if the server answered at all.
    pub status: Option<u16>,
    /// Response body, if it was JSON.
    pub body: Option<Value>,
    pub message: String,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            body: None,
            message: message.into(),
        }
    }

    /// Build from a non-success HTTP response.
    ///
    /// PVE reports the reason in the `message` field of the JSON envelope and
    /// parameter problems in `errors`; fall back to the raw text, then the
    /// canonical reason phrase.
    pub fn from_response(status: StatusCode, text: &str) -> Self {
        let body: Option<Value> = serde_json::from_str(text).ok();

        let message = body
            .as_ref()
            .and_then(message_from_body)
            .or_else(|| {
                let trimmed = text.trim();
                (!trimmed.is_empty() && body.is_none()).then(|| trimmed.to_string())
            })
            .unwrap_or_else(|| {
                status
                    .canonical_reason()
                    .unwrap_or("unknown error")
                    .to_string()
            });

        Self {
            kind: classify(Some(status.as_u16()), &message),
            status: Some(status.as_u16()),
            body,
            message: format!("HTTP {}: {}", status.as_u16(), message),
        }
    }

    /// Build from a transport-level failure (connect, TLS, timeout, decode).
    pub fn from_transport(err: reqwest::Error) -> Self {
        let status = err.status().map(|s| s.as_u16());
        let message = err.to_string();
        let kind = if err.is_timeout() {
            ErrorKind::Timeout
        } else {
            classify(status, &message)
        };
        Self {
            kind,
            status,
            body: None,
            message,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

fn message_from_body(body: &Value) -> Option<String> {
    if let Some(msg) = body.get("message").and_then(Value::as_str) {
        let msg = msg.trim();
        if !msg.is_empty() {
            return Some(msg.to_string());
        }
    }

    let errors = body.get("errors")?.as_object()?;
    let joined = errors
        .iter()
        .map(|(param, err)| match err.as_str() {
            Some(s) => format!("{param}: {}", s.trim()),
            None => format!("{param}: {err}"),
        })
        .collect::<Vec<_>>()
        .join("; ");
    (!joined.is_empty()).then_some(joined)
}

/// Phrases PVE uses when a guest is locked, running or otherwise busy.
const CONFLICT_PHRASES: &[&str] = &[
    "is locked",
    "can't lock",
    "cannot lock",
    "unable to lock",
    "lock file",
    "is running",
    "resource busy",
];

/// Map an HTTP status and remote message to an [`ErrorKind`].
///
/// PVE answers most guest-state problems with a plain 500, so the message is
/// consulted when the status alone is not conclusive.
pub fn classify(status: Option<u16>, message: &str) -> ErrorKind {
    match status {
        Some(401) | Some(403) => return ErrorKind::Auth,
        Some(404) => return ErrorKind::NotFound,
        Some(408) | Some(504) | Some(596) => return ErrorKind::Timeout,
        Some(409) | Some(423) => return ErrorKind::Conflict,
        _ => {}
    }

    let msg = message.to_ascii_lowercase();
    if msg.contains("timeout") || msg.contains("timed out") {
        ErrorKind::Timeout
    } else if CONFLICT_PHRASES.iter().any(|p| msg.contains(p)) {
        ErrorKind::Conflict
    } else if msg.contains("does not exist") || msg.contains("not found") {
        ErrorKind::NotFound
    } else {
        ErrorKind::Other
    }
}
