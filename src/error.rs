//! Error taxonomy for the Sydpower client
//!
//! Every layer owns a focused error enum; [`SydpowerError`] folds them together
//! and answers the two questions callers branch on: "was this an authorization
//! failure?" (drives the silent re-auth cycle) and "did the MQTT session break?"
//! (drives pool teardown).

use crate::api::ApiError;
use crate::auth::AuthError;
use crate::auth::token_cache::CacheError;
use crate::config::ConfigError;
use crate::protocol::{CommandRejected, ProtocolError};
use crate::transport::TransportError;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Main error type for Sydpower client operations
#[derive(Debug, Error)]
pub enum SydpowerError {
    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("API request failed: {0}")]
    Api(#[from] ApiError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Command rejected: {0}")]
    CommandRejected(#[from] CommandRejected),

    #[error("Lock timeout on '{resource}' after {waited_ms}ms")]
    LockTimeout { resource: String, waited_ms: u64 },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Token cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Unknown device: {device_id}")]
    UnknownDevice { device_id: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl SydpowerError {
    /// Whether this failure looks like a rejected or expired authorization.
    ///
    /// HTTP 401/403, API responses missing their expected top-level keys and
    /// broker connects refused for bad credentials all count.
    pub fn is_auth_failure(&self) -> bool {
        match self {
            SydpowerError::Auth(_) => true,
            SydpowerError::Api(e) => e.is_auth_failure(),
            SydpowerError::Transport(e) => e.is_auth_failure(),
            _ => false,
        }
    }

    /// Whether the underlying MQTT session is unusable after this failure
    pub fn is_transport_failure(&self) -> bool {
        matches!(self, SydpowerError::Transport(_))
    }

    pub fn lock_timeout<S: Into<String>>(resource: S, waited_ms: u64) -> Self {
        Self::LockTimeout {
            resource: resource.into(),
            waited_ms,
        }
    }

    pub fn unknown_device<S: Into<String>>(device_id: S) -> Self {
        Self::UnknownDevice {
            device_id: device_id.into(),
        }
    }

    pub fn internal_error<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Error text safe to hand to logs or collaborators
    pub fn sanitized_message(&self) -> String {
        sanitize_error_message(&self.to_string())
    }
}

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|token|secret|sign)[=:]\s*\S+").expect("static regex is valid")
});

static JWT_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"eyJ[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+").expect("static regex is valid")
});

/// Redact secrets and bearer tokens from error text and cap its length
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = SECRET_PATTERN
        .replace_all(message, "${1}=***")
        .to_string();
    sanitized = JWT_PATTERN.replace_all(&sanitized, "***JWT***").to_string();

    if sanitized.len() > 500 {
        let truncate_suffix = "...[truncated]";
        let mut cut = 500 - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}

/// Result type for Sydpower operations
pub type SydpowerResult<T> = Result<T, SydpowerError>;
