//! Error Handling Infrastructure
//!
//! This module defines all error types used throughout pgctl.
//! All errors are structured and map to stable error codes for JSON output and HTTP status codes.
//!
//! # Error Categories
//! - `BadParameter`: Invalid identifier, reserved name, malformed ACL token (client error, never retried)
//! - `NotFound`: The addressed resource does not exist
//! - `NotAvailable`: An optional server capability is missing, or the connection is read-only
//! - `ConnectionFailed`: The server could not be reached
//! - `Internal`: Anything reported by the query-execution layer, wrapped but not reinterpreted
//! - `Cancelled`: The caller's context was cancelled or its deadline passed
//! - `ConfigError`: Configuration file or connection registry errors
//! - `RolledBack` / `RollbackFailed`: A multi-step create failed after its first step and the
//!   compensating delete either succeeded or failed as well

use thiserror::Error;

/// Main error type for pgctl operations
#[derive(Error, Debug)]
pub enum AdminError {
    /// Invalid or malformed caller input
    #[error("Bad parameter: {0}")]
    BadParameter(String),

    /// Resource does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Optional server capability missing (or mutations disabled)
    #[error("Not available: {0}")]
    NotAvailable(String),

    /// Could not establish a server connection
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Error reported by the server or the driver
    #[error("Internal error: {0}")]
    Internal(String),

    /// Context cancelled or deadline exceeded
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Configuration error (file not found, invalid JSON, etc.)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Post-create setup failed; the created resource was removed again.
    #[error("{resource} was created but could not be configured and has been removed: {cause}")]
    RolledBack {
        resource: String,
        #[source]
        cause: Box<AdminError>,
    },

    /// Post-create setup failed and removing the resource failed too.
    /// The resource is left behind and needs manual attention.
    #[error(
        "{resource} was created but could not be configured ({cause}); removing it failed ({rollback}), manual cleanup required"
    )]
    RollbackFailed {
        resource: String,
        #[source]
        cause: Box<AdminError>,
        rollback: Box<AdminError>,
    },
}

impl AdminError {
    /// Convert error to error code string for JSON output
    ///
    /// Error codes are stable and suitable for programmatic handling.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::BadParameter(_) => "BAD_PARAMETER",
            Self::NotFound(_) => "NOT_FOUND",
            Self::NotAvailable(_) => "NOT_AVAILABLE",
            Self::ConnectionFailed(_) => "CONNECTION_FAILED",
            Self::Internal(_) => "INTERNAL",
            Self::Cancelled(_) => "CANCELLED",
            Self::ConfigError(_) => "CONFIG_ERROR",
            Self::RolledBack { .. } => "ROLLED_BACK",
            Self::RollbackFailed { .. } => "ROLLBACK_FAILED",
        }
    }

    /// Get human-readable error message (no credentials)
    #[must_use]
    pub fn message(&self) -> String {
        self.to_string()
    }

    /// The error that triggered a compensation, or `self` for every other variant
    #[must_use]
    pub fn root_cause(&self) -> &AdminError {
        match self {
            Self::RolledBack { cause, .. } | Self::RollbackFailed { cause, .. } => cause.root_cause(),
            other => other,
        }
    }

    /// True if a failed create left the resource behind
    #[must_use]
    pub const fn is_dirty_rollback(&self) -> bool {
        matches!(self, Self::RollbackFailed { .. })
    }

    /// Create a bad parameter error
    pub fn bad_parameter(message: impl Into<String>) -> Self {
        Self::BadParameter(message.into())
    }

    /// Create a not found error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// Create a not available error
    pub fn not_available(message: impl Into<String>) -> Self {
        Self::NotAvailable(message.into())
    }

    /// Create a connection failed error
    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::ConnectionFailed(message.into())
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Create a cancellation error
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::Cancelled(message.into())
    }

    /// Create a configuration error
    pub fn config_error(message: impl Into<String>) -> Self {
        Self::ConfigError(message.into())
    }

    /// Join a create failure with the outcome of its compensating delete
    pub fn compensated(
        resource: impl Into<String>,
        cause: AdminError,
        rollback: std::result::Result<(), AdminError>,
    ) -> Self {
        match rollback {
            Ok(()) => Self::RolledBack { resource: resource.into(), cause: Box::new(cause) },
            Err(rollback) => Self::RollbackFailed {
                resource: resource.into(),
                cause: Box::new(cause),
                rollback: Box::new(rollback),
            },
        }
    }
}

/// Result type alias for pgctl operations
pub type Result<T> = std::result::Result<T, AdminError>;
