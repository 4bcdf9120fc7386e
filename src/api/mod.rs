//! REST seam to the Sydpower serverless backend
//!
//! [`CloudApi`] is what the auth session and device client talk to;
//! [`HttpCloudApi`] is the signed reqwest implementation.

pub mod http;

pub use http::{ClientFingerprint, HttpCloudApi};

use crate::auth::Credential;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// REST failures
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP error: {status}")]
    Http { status: u16 },

    #[error("Response is missing '{field}'")]
    MissingField { field: String },

    #[error("Request failed: {0}")]
    Request(String),

    #[error("Response is not valid JSON: {0}")]
    Decode(String),
}

impl ApiError {
    /// Rejected or stale authorization.
    ///
    /// The backend answers expired tokens with a 200 whose body lacks the
    /// expected keys, so a missing field counts too.
    pub fn is_auth_failure(&self) -> bool {
        match self {
            ApiError::Http { status } => matches!(status, 401 | 403),
            ApiError::MissingField { .. } => true,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(error: reqwest::Error) -> Self {
        match error.status() {
            Some(status) => ApiError::Http {
                status: status.as_u16(),
            },
            None if error.is_decode() => ApiError::Decode(error.to_string()),
            None => ApiError::Request(error.to_string()),
        }
    }
}

/// A power station registered to the account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// MAC-style id with the colons stripped, e.g. `7C2C67AB5F0E`
    pub device_id: String,
    pub display_name: String,
}

impl DeviceRecord {
    pub fn new(raw_device_id: &str, display_name: impl Into<String>) -> Self {
        Self {
            device_id: normalize_device_id(raw_device_id),
            display_name: display_name.into(),
        }
    }
}

/// Strip the colons from a MAC-style device id
pub fn normalize_device_id(raw: &str) -> String {
    raw.replace(':', "")
}

/// The four calls the client makes against the backend
#[async_trait]
pub trait CloudApi: Send + Sync {
    /// Step one: short-lived authorization token
    async fn anonymous_authorize(&self) -> Result<String, ApiError>;

    /// Step two: account bearer token
    async fn login(
        &self,
        authorize_token: &str,
        credential: &Credential,
    ) -> Result<String, ApiError>;

    /// Step three: broker token for the MQTT session
    async fn mqtt_token(
        &self,
        authorize_token: Option<&str>,
        access_token: &str,
    ) -> Result<String, ApiError>;

    async fn device_list(
        &self,
        authorize_token: Option<&str>,
        access_token: &str,
    ) -> Result<Vec<DeviceRecord>, ApiError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_device_id() {
        assert_eq!(normalize_device_id("7C:2C:67:AB:5F:0E"), "7C2C67AB5F0E");
        assert_eq!(normalize_device_id("7C2C67AB5F0E"), "7C2C67AB5F0E");
    }

    #[test]
    fn test_auth_failure_classification() {
        assert!(ApiError::Http { status: 401 }.is_auth_failure());
        assert!(ApiError::Http { status: 403 }.is_auth_failure());
        assert!(!ApiError::Http { status: 502 }.is_auth_failure());
        assert!(ApiError::MissingField {
            field: "data.token".to_string()
        }
        .is_auth_failure());
        assert!(!ApiError::Request("dns".to_string()).is_auth_failure());
        assert!(!ApiError::Decode("eof".to_string()).is_auth_failure());
    }
}
