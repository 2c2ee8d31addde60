//! # Response Envelope
//!
//! Every HTTP response from a syndic endpoint — internal, public, unix,
//! or extension-served — is wrapped in the same JSON envelope:
//!
//! ```json
//! {"type": "sync", "status": 200, "status_code": 200,
//!  "metadata": {...}, "error": ""}
//! ```
//!
//! Errors use `type: "error"` with the message in `error` and a `null`
//! `metadata`. The envelope implements [`axum::response::IntoResponse`]
//! so handlers can return it directly; the HTTP status line always
//! matches `status_code`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Envelope discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseKind {
    Sync,
    Async,
    Error,
}

/// The wire envelope for every endpoint response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: ResponseKind,
    pub status: u16,
    pub status_code: u16,
    pub metadata: Value,
    pub error: String,
}

impl Envelope {
    /// A successful synchronous response carrying `metadata`.
    pub fn sync<T: Serialize>(metadata: &T) -> Self {
        Self {
            kind: ResponseKind::Sync,
            status: 200,
            status_code: 200,
            metadata: serde_json::to_value(metadata).unwrap_or(Value::Null),
            error: String::new(),
        }
    }

    /// A successful synchronous response with no payload.
    pub fn empty_sync() -> Self {
        Self {
            kind: ResponseKind::Sync,
            status: 200,
            status_code: 200,
            metadata: Value::Null,
            error: String::new(),
        }
    }

    /// An error response with the given HTTP status.
    pub fn error(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            kind: ResponseKind::Error,
            status: status.as_u16(),
            status_code: status.as_u16(),
            metadata: Value::Null,
            error: message.into(),
        }
    }

    /// The canonical top-level 404 body.
    pub fn not_found() -> Self {
        Self::error(StatusCode::NOT_FOUND, "Not Found")
    }

    /// `503 Service Unavailable`, used by peers to signal "still
    /// joining" during the new-member broadcast.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::error(StatusCode::SERVICE_UNAVAILABLE, message)
    }

    pub fn is_error(&self) -> bool {
        self.kind == ResponseKind::Error
    }

    /// Deserializes `metadata` into a typed payload.
    pub fn metadata_as<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.metadata.clone())
    }
}

impl IntoResponse for Envelope {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}
