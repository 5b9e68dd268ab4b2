//! Error types for mailwarden.

use std::time::Duration;

use uuid::Uuid;

/// Short, non-sensitive name for an error, safe to persist or return.
///
/// This is the only thing the sanitizer exposes in production mode.
pub trait ErrorKind {
    fn kind(&self) -> &'static str;
}

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

impl ErrorKind for Error {
    fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "ConfigError",
            Self::Database(e) => e.kind(),
        }
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Illegal status transition {from} -> {to}")]
    IllegalTransition { from: String, to: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl ErrorKind for DatabaseError {
    fn kind(&self) -> &'static str {
        "DatabaseError"
    }
}

/// Mailbox gateway errors.
///
/// `Connect` is only produced while opening a session, so callers can tell
/// an unreachable server apart from a mutation the server refused.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Failed to connect to mailbox: {reason}")]
    Connect { reason: String },

    #[error("Mailbox {op} timed out after {timeout:?}")]
    Timeout { op: String, timeout: Duration },

    #[error("Mailbox {op} failed: {reason}")]
    Operation { op: String, reason: String },

    #[error("Mailbox protocol error: {0}")]
    Protocol(String),
}

impl ErrorKind for GatewayError {
    fn kind(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "ConnectionError",
            Self::Timeout { .. } => "TimeoutError",
            Self::Operation { .. } => "MailboxOperationError",
            Self::Protocol(_) => "ProtocolError",
        }
    }
}

/// Errors from enqueue/approve/reject.
#[derive(Debug, thiserror::Error)]
pub enum ApprovalError {
    #[error("MOVE_FOLDER action requires a target folder")]
    MissingTargetFolder,

    #[error("Email {id} not found")]
    EmailNotFound { id: String },

    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Refusals from the preview/apply pipeline.
///
/// The token and lock refusals are returned before anything is written.
/// `GatewayUnavailable` and a lost token race come after policy refusals
/// have been persisted, and `Database` can surface mid-batch.
#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("SAFE_MODE enabled: mailbox mutations are disabled")]
    SafeMode,

    #[error("Apply token required. Call preview first")]
    TokenMissing,

    #[error("Invalid or already used apply token")]
    TokenInvalid,

    #[error("Apply token expired. Request a new preview")]
    TokenExpired,

    #[error("Apply token not valid for this action: {action_id}")]
    TokenMismatch { action_id: Uuid },

    #[error("Another apply is already running")]
    ConcurrentApply,

    #[error("No approved actions to apply")]
    NothingToApply,

    #[error("Mailbox unavailable: {reason}")]
    GatewayUnavailable { reason: String },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl ApplyError {
    /// Stable machine-readable code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::SafeMode => "SAFE_MODE",
            Self::TokenMissing => "TOKEN_REQUIRED",
            Self::TokenInvalid => "TOKEN_INVALID",
            Self::TokenExpired => "TOKEN_EXPIRED",
            Self::TokenMismatch { .. } => "TOKEN_MISMATCH",
            Self::ConcurrentApply => "CONCURRENT_APPLY",
            Self::NothingToApply => "NOTHING_TO_APPLY",
            Self::GatewayUnavailable { .. } => "GATEWAY_UNAVAILABLE",
            Self::Database(_) => "DATABASE_ERROR",
        }
    }
}

impl ErrorKind for ApplyError {
    fn kind(&self) -> &'static str {
        match self {
            Self::Database(e) => e.kind(),
            Self::GatewayUnavailable { .. } => "ConnectionError",
            _ => "ApplyError",
        }
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_hide_details() {
        let err = GatewayError::Connect {
            reason: "LOGIN bob hunter2".into(),
        };
        assert_eq!(err.kind(), "ConnectionError");

        let top: Error = DatabaseError::Query("insert_action: disk full".into()).into();
        assert_eq!(top.kind(), "DatabaseError");

        let top: Error = ConfigError::InvalidValue {
            key: "MAILWARDEN_IMAP_PASSWORD".into(),
            message: "hunter2".into(),
        }
        .into();
        assert_eq!(top.kind(), "ConfigError");

        let apply = ApplyError::GatewayUnavailable {
            reason: "ConnectionError".into(),
        };
        assert_eq!(apply.kind(), "ConnectionError");
        assert_eq!(apply.code(), "GATEWAY_UNAVAILABLE");
    }

    #[test]
    fn timeout_kind() {
        let err = GatewayError::Timeout {
            op: "UID MOVE".into(),
            timeout: Duration::from_secs(30),
        };
        assert_eq!(err.kind(), "TimeoutError");
    }
}
