//! Account authorization against the Sydpower cloud
//!
//! A session is three signed REST calls (anonymous authorize, login, broker
//! token exchange) whose results are cached on disk per account until the
//! broker token gets close to expiry.

pub mod session;
pub mod signing;
pub mod token_cache;

pub use session::{AuthSession, CallContext};
pub use token_cache::{CacheError, TokenCache};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

/// Authorization failures that are not plain API errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Credential is incomplete: {0}")]
    InvalidCredential(String),

    #[error("Malformed token: {0}")]
    MalformedToken(String),

    #[error("Broker token expires too soon to be usable")]
    TokenExpiring,
}

/// Account username and password.
///
/// `Debug` only ever shows masked values.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    username: String,
    password: String,
}

impl Credential {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn validate(&self) -> Result<(), AuthError> {
        if self.username.trim().is_empty() {
            return Err(AuthError::InvalidCredential("username is empty".to_string()));
        }
        if self.password.is_empty() {
            return Err(AuthError::InvalidCredential("password is empty".to_string()));
        }
        Ok(())
    }

    /// Hex SHA-256 of the username; stable, non-reversible account key
    pub fn account_hash(&self) -> String {
        hex::encode(Sha256::digest(self.username.as_bytes()))
    }

    /// Username reduced to its first two characters plus length
    pub fn masked_username(&self) -> String {
        let prefix: String = self.username.chars().take(2).collect();
        format!("{prefix}***({})", self.username.chars().count())
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.masked_username())
            .field(
                "password",
                &format_args!("***({})", self.password.chars().count()),
            )
            .finish()
    }
}

/// Bearer token plus broker token from one successful handshake
#[derive(Clone, PartialEq, Eq)]
pub struct AuthTokens {
    pub access_token: String,
    pub mqtt_access_token: String,
    pub issued_at: DateTime<Utc>,
}

impl AuthTokens {
    pub fn new(access_token: impl Into<String>, mqtt_access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            mqtt_access_token: mqtt_access_token.into(),
            issued_at: Utc::now(),
        }
    }
}

/// First characters of a token, for logs
pub fn token_prefix(token: &str) -> String {
    let prefix: String = token.chars().take(8).collect();
    format!("{prefix}...")
}

impl fmt::Debug for AuthTokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthTokens")
            .field("access_token", &token_prefix(&self.access_token))
            .field("mqtt_access_token", &token_prefix(&self.mqtt_access_token))
            .field("issued_at", &self.issued_at)
            .finish()
    }
}
