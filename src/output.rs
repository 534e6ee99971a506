//! Result envelopes
//!
//! The CLI prints one envelope per invocation, and the REST API uses the failure
//! envelope as the body of every error response.
//!
//! ```json
//! {"ok":true,"resource":"schema","command":"list","data":[...],"meta":{"execution_ms":3,"count":40}}
//! {"ok":false,"resource":"schema","command":"get","error":{"code":"NOT_FOUND","message":"..."}}
//! ```
//!
//! `error.code` is [`AdminError::error_code`]. When a create was compensated,
//! `error.cause` names the code of the failure that started the rollback.

use serde::{Deserialize, Serialize};

use crate::error::AdminError;

/// Envelope for a command that succeeded
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessEnvelope<T> {
    /// `true`
    pub ok: bool,

    /// Resource kind (database, schema, ...) or empty for connection commands
    pub resource: String,

    /// Command that was executed (list, get, create, update, delete, ...)
    pub command: String,

    /// The resource, page or report the command produced
    pub data: T,

    pub meta: Metadata,
}

impl<T> SuccessEnvelope<T> {
    pub fn new(resource: impl Into<String>, command: impl Into<String>, data: T, meta: Metadata) -> Self {
        Self { ok: true, resource: resource.into(), command: command.into(), data, meta }
    }
}

/// Envelope for a command that failed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    /// `false`
    pub ok: bool,

    pub resource: String,

    pub command: String,

    pub error: ErrorInfo,
}

impl ErrorEnvelope {
    pub fn new(resource: impl Into<String>, command: impl Into<String>, error: ErrorInfo) -> Self {
        Self { ok: false, resource: resource.into(), command: command.into(), error }
    }

    /// Create error envelope from an [`AdminError`]
    pub fn from_error(
        resource: impl Into<String>,
        command: impl Into<String>,
        err: &AdminError,
    ) -> Self {
        Self::new(resource, command, ErrorInfo::from(err))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Stable error code (e.g., "NOT_FOUND", "ROLLBACK_FAILED")
    pub code: String,

    /// Human-readable error message (no credentials)
    pub message: String,

    /// Code of the error that triggered a compensating rollback
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl ErrorInfo {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { code: code.into(), message: message.into(), cause: None }
    }
}

impl From<&AdminError> for ErrorInfo {
    fn from(err: &AdminError) -> Self {
        let root = err.root_cause();
        let cause = (!std::ptr::eq(root, err)).then(|| root.error_code().to_string());
        Self { code: err.error_code().to_string(), message: err.message(), cause }
    }
}

/// Timing, plus the total match count of a list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    /// Wall-clock milliseconds
    pub execution_ms: u64,

    /// Total matches for list commands (the page may hold fewer)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
}

impl Metadata {
    pub fn new(execution_ms: u64) -> Self {
        Self { execution_ms, count: None }
    }

    pub fn with_count(execution_ms: u64, count: u64) -> Self {
        Self { execution_ms, count: Some(count) }
    }
}
