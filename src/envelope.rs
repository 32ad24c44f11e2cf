//! Wire-level request and response envelopes.
//!
//! ```text
//! Request:  {"endpoint": "<name>", "data": <any>, "auth": "<secret>"}
//! Response: {"status": {"code": <int>, "message": "<text>"}, "data": <any>}
//! ```
//!
//! `data` is optional in both directions and `auth` is only required on the
//! first request of a connection.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::error;

/// A decoded client request.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Request {
    /// Registry key of the endpoint to call.
    pub endpoint: String,
    /// Endpoint-specific payload. `null` is treated as absent.
    #[serde(default)]
    pub data: Option<Value>,
    /// Shared secret, checked only while the session is unauthenticated.
    #[serde(default)]
    pub auth: Option<String>,
}

/// Reasons a frame could not be turned into a [`Request`].
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("invalid request: {0}")]
    Json(#[from] serde_json::Error),
    #[error("request must be a JSON object")]
    NotAnObject,
    #[error("endpoint must be a non-empty string")]
    EmptyEndpoint,
}

impl Request {
    /// Decode a raw frame as a UTF-8 JSON request object.
    ///
    /// Only objects are accepted; serde would otherwise read an array
    /// positionally into the struct fields.
    pub fn decode(frame: &[u8]) -> Result<Self, RequestError> {
        let value: Value = serde_json::from_slice(frame)?;
        if !value.is_object() {
            return Err(RequestError::NotAnObject);
        }
        let request = Request::deserialize(value)?;
        if request.endpoint.is_empty() {
            return Err(RequestError::EmptyEndpoint);
        }
        Ok(request)
    }
}

/// Status block of a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub code: u16,
    pub message: String,
}

/// A response envelope. Exactly one is written per request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Sent when a response cannot be serialized.
const FALLBACK_INTERNAL_ERROR: &[u8] =
    br#"{"status":{"code":500,"message":"Internal server error."}}"#;

impl Response {
    /// Build a response with an arbitrary status.
    pub fn status(code: u16, message: impl Into<String>) -> Self {
        Response {
            status: Status {
                code,
                message: message.into(),
            },
            data: None,
        }
    }

    /// 200 with no payload.
    pub fn success() -> Self {
        Self::status(200, "Success")
    }

    /// 200 carrying a handler's return value.
    pub fn success_with(data: Value) -> Self {
        Response {
            data: Some(data),
            ..Self::success()
        }
    }

    /// 400 for frames that are not a well-formed request object.
    pub fn bad_request() -> Self {
        Self::status(400, "Bad request.")
    }

    /// 400 for requests naming an unregistered endpoint.
    pub fn endpoint_not_found() -> Self {
        Self::status(400, "Endpoint not found.")
    }

    /// 400 for payloads the endpoint cannot accept.
    pub fn bad_arguments() -> Self {
        Self::status(400, "Bad arguments.")
    }

    /// 400 for frames over the configured size cap.
    pub fn too_large() -> Self {
        Self::status(400, "Request too large.")
    }

    /// 401 for a failed authentication handshake.
    pub fn unauthorized() -> Self {
        Self::status(401, "Unauthorized.")
    }

    /// 500 for unexpected handler faults.
    pub fn internal_error() -> Self {
        Self::status(500, "Internal server error.")
    }

    /// 503 when an endpoint's upstream is unavailable.
    pub fn unavailable() -> Self {
        Self::status(503, "Service unavailable.")
    }

    /// Serialize to JSON bytes for the frame writer.
    pub fn encode(&self) -> Bytes {
        match serde_json::to_vec(self) {
            Ok(encoded) => Bytes::from(encoded),
            Err(e) => {
                error!(error = %e, "Failed to serialize response");
                Bytes::from_static(FALLBACK_INTERNAL_ERROR)
            }
        }
    }
}
