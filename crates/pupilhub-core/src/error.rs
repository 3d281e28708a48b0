//! Error types for PupilHub.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The shared error type for every PupilHub crate.
///
/// Network and authentication failures propagate to callers as these typed
/// variants; raw transport errors are always converted before they leave the
/// transport boundary.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HubError {
    /// Transport unreachable or timed out. Retryable by the caller.
    #[error("Connection error: {message}")]
    Connection { message: String, timed_out: bool },

    /// Credentials rejected or the login flow failed terminally.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// The server answered with its session-expired signature.
    #[error("Session expired: {0}")]
    SessionExpired(String),

    /// Login refused locally after repeated credential rejections.
    #[error("Backing off after {failures} authentication failures, retry in {retry_after_secs}s")]
    Backoff { failures: u32, retry_after_secs: u64 },

    /// HTTP 401/403. Callers may re-login once instead of aborting.
    #[error("Unauthorized: HTTP {status}")]
    Unauthorized { status: u16 },

    /// Any other non-success HTTP status.
    #[error("HTTP error {status}: {message}")]
    TransientHttp { status: u16, message: String },

    /// Identity id is not present in the registry
    #[error("Unknown identity '{0}'")]
    UnknownIdentity(String),

    /// Unexpected response shape from a trusted endpoint
    #[error("Parse error in {context}: {message}")]
    Parse { context: String, message: String },

    /// Persistence failure (contained inside the cache layer)
    #[error("Store write error: {0}")]
    StoreWrite(String),

    /// IO error (file system operations)
    #[error("IO error: {message}")]
    Io { message: String },

    /// Serialization/deserialization error
    #[error("Serialization error: {format} - {message}")]
    Serialization {
        format: String, // "TOML", "JSON", etc.
        message: String,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error (should not happen in normal operation)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl HubError {
    // ============================================================================
    // Constructor helpers
    // ============================================================================

    /// Creates a Connection error that is not a timeout
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            timed_out: false,
        }
    }

    /// Creates a Connection error caused by an exceeded request timeout
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            timed_out: true,
        }
    }

    /// Creates an Auth error
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth(message.into())
    }

    /// Creates a SessionExpired error
    pub fn session_expired(message: impl Into<String>) -> Self {
        Self::SessionExpired(message.into())
    }

    /// Creates a TransientHttp error
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::TransientHttp {
            status,
            message: message.into(),
        }
    }

    /// Creates a Parse error
    pub fn parse(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Parse {
            context: context.into(),
            message: message.into(),
        }
    }

    /// Creates a StoreWrite error
    pub fn store_write(message: impl Into<String>) -> Self {
        Self::StoreWrite(message.into())
    }

    /// Creates an IO error
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Creates a Config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Creates an Internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    // ============================================================================
    // Type checking methods
    // ============================================================================

    /// Check if this is a Connection error
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }

    /// Check if this is an Auth error
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }

    /// Check if this is a Backoff error
    pub fn is_backoff(&self) -> bool {
        matches!(self, Self::Backoff { .. })
    }

    /// Check if this is a SessionExpired error
    pub fn is_session_expired(&self) -> bool {
        matches!(self, Self::SessionExpired(_))
    }

    /// Check if this is a Parse error
    pub fn is_parse(&self) -> bool {
        matches!(self, Self::Parse { .. })
    }

    /// Returns true when one silent re-authentication is the right reaction.
    ///
    /// Covers the session-expired signature and HTTP 401/403.
    pub fn needs_relogin(&self) -> bool {
        matches!(self, Self::SessionExpired(_) | Self::Unauthorized { .. })
    }

    /// Returns true for errors a caller may retry without new credentials.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { .. } => true,
            Self::TransientHttp { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

// ============================================================================
// From implementations for automatic conversion
// ============================================================================

impl From<std::io::Error> for HubError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: format!("{} (kind: {:?})", err, err.kind()),
        }
    }
}

impl From<serde_json::Error> for HubError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            format: "JSON".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<toml::de::Error> for HubError {
    fn from(err: toml::de::Error) -> Self {
        Self::Serialization {
            format: "TOML".to_string(),
            message: err.to_string(),
        }
    }
}

/// A type alias for `Result<T, HubError>`.
pub type Result<T> = std::result::Result<T, HubError>;
