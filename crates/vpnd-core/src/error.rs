//! Error types for the daemon core.

use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use thiserror::Error;
use vpnd_common::shell::ShellError;

/// Boxed error type used for error chaining across crate boundaries.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Context wrapper that preserves an optional underlying source error.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ErrorContext {
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl ErrorContext {
    /// Create context-only error (no underlying source).
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Create context error with an underlying source.
    pub fn with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Daemon core errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum VpnError {
    /// No account session available.
    #[error("Not logged in")]
    NotLoggedIn,

    /// Caller supplied an invalid value.
    #[error("Bad parameter: {field}")]
    BadParameter { field: String },

    /// Request conflicts with current state.
    #[error("{reason}")]
    Conflict { reason: String },

    /// A routing, firewall or tunnel helper failed.
    #[error("{tool} failed (exit code {exit_code:?}): {stderr}")]
    ExternalToolFailed {
        tool: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    /// WireGuard handshake did not arrive in time.
    #[error("Handshake timeout")]
    HandshakeTimeout,

    /// Server rejected the credentials.
    #[error("Authentication failed")]
    AuthFailed,

    /// The protected interface no longer carries tunnel traffic.
    #[error("Routing changed")]
    RoutingChanged,

    /// The owning session must reinitiate the connection.
    #[error("Reconnection required")]
    ReconnectionRequired {
        #[source]
        cause: Option<BoxError>,
    },

    /// Feature not supported on this platform or configuration.
    #[error("Not available: {feature}")]
    NotAvailable { feature: String },

    /// Operation was cancelled by the manager.
    #[error("Cancelled")]
    Cancelled,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(#[source] ErrorContext),

    /// Local I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed IPC or management-channel traffic.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Last resort.
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Stable error kind reported to frontends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    NotLoggedIn,
    BadParameter,
    Conflict,
    ExternalToolFailed,
    HandshakeTimeout,
    AuthFailed,
    RoutingChanged,
    ReconnectionRequired,
    NotAvailable,
    Cancelled,
    InternalError,
}

impl VpnError {
    pub fn bad_parameter(field: impl Into<String>) -> Self {
        Self::BadParameter {
            field: field.into(),
        }
    }

    pub fn conflict(reason: impl Into<String>) -> Self {
        Self::Conflict {
            reason: reason.into(),
        }
    }

    pub fn not_available(feature: impl Into<String>) -> Self {
        Self::NotAvailable {
            feature: feature.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn tool_failed(tool: impl Into<String>, exit_code: Option<i32>, stderr: impl Into<String>) -> Self {
        Self::ExternalToolFailed {
            tool: tool.into(),
            exit_code,
            stderr: stderr.into(),
        }
    }

    pub fn reconnection_required() -> Self {
        Self::ReconnectionRequired { cause: None }
    }

    pub fn reconnection_required_by<E>(cause: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::ReconnectionRequired {
            cause: Some(Box::new(cause)),
        }
    }

    /// Create a configuration error with context only.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(ErrorContext::new(message))
    }

    /// Create a configuration error with preserved source.
    pub fn config_with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Config(ErrorContext::with_source(message, source))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            VpnError::NotLoggedIn => ErrorKind::NotLoggedIn,
            VpnError::BadParameter { .. } => ErrorKind::BadParameter,
            VpnError::Conflict { .. } => ErrorKind::Conflict,
            VpnError::ExternalToolFailed { .. } => ErrorKind::ExternalToolFailed,
            VpnError::HandshakeTimeout => ErrorKind::HandshakeTimeout,
            VpnError::AuthFailed => ErrorKind::AuthFailed,
            VpnError::RoutingChanged => ErrorKind::RoutingChanged,
            VpnError::ReconnectionRequired { .. } => ErrorKind::ReconnectionRequired,
            VpnError::NotAvailable { .. } => ErrorKind::NotAvailable,
            VpnError::Cancelled => ErrorKind::Cancelled,
            VpnError::Config(_) | VpnError::Io(_) | VpnError::Protocol(_) | VpnError::Internal { .. } => {
                ErrorKind::InternalError
            }
        }
    }

    /// Returns true if the manager may retry the connection after this error.
    ///
    /// **Recoverable:** handshake timeouts, helper failures, local I/O,
    /// routing changes and explicit reconnection requests.
    ///
    /// **Terminal:** authentication failures, bad parameters, conflicts,
    /// unavailable features, configuration problems and cancellation.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            VpnError::HandshakeTimeout
                | VpnError::ExternalToolFailed { .. }
                | VpnError::Io(_)
                | VpnError::RoutingChanged
                | VpnError::ReconnectionRequired { .. }
        )
    }
}

impl From<ShellError> for VpnError {
    fn from(err: ShellError) -> Self {
        match err {
            ShellError::NonZeroExit {
                program,
                code,
                stderr,
            } => VpnError::tool_failed(program, Some(code), stderr),
            ShellError::Killed { program } => VpnError::tool_failed(program, None, "killed"),
            ShellError::SpawnError { program, source } | ShellError::Io { program, source } => {
                VpnError::tool_failed(program, None, source.to_string())
            }
        }
    }
}

/// Result type alias for core operations.
pub type VpnResult<T> = Result<T, VpnError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_error_conversion() {
        let err: VpnError = ShellError::NonZeroExit {
            program: "nft".into(),
            code: 1,
            stderr: "syntax error".into(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::ExternalToolFailed);
        assert!(err.to_string().contains("nft"));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_terminal_errors() {
        assert!(!VpnError::AuthFailed.is_recoverable());
        assert!(!VpnError::bad_parameter("port").is_recoverable());
        assert!(!VpnError::Cancelled.is_recoverable());
        assert!(VpnError::reconnection_required().is_recoverable());
    }

    #[test]
    fn test_kind_serializes_as_name() {
        let json = serde_json::to_string(&VpnError::conflict("x").kind()).unwrap();
        assert_eq!(json, "\"Conflict\"");
        assert_eq!(
            VpnError::config("bad").kind(),
            ErrorKind::InternalError
        );
    }
}
