//! Testing utilities and mock implementations
//!
//! This module provides mocks for the broker and the cloud backend, frame
//! builders, and token helpers, so the client can be tested without network
//! access.

pub mod frames;
pub mod mocks;

pub use mocks::*;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::{json, Value};

/// Unsigned JWT carrying `claims`
pub fn jwt_with_claims(claims: &Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{header}.{payload}.signature")
}

/// Unsigned JWT expiring at the given unix second
pub fn jwt_with_exp(exp: i64) -> String {
    jwt_with_claims(&json!({ "exp": exp }))
}

/// Connected mock client plus the directory holding its token cache
#[cfg(test)]
pub(crate) async fn test_client(
    transport: MockTransport,
) -> (crate::device::DeviceClient, tempfile::TempDir) {
    let dir = tempfile::TempDir::new().expect("temp dir");
    let api = std::sync::Arc::new(MockCloudApi::new());
    let client = connected_client(dir.path(), transport, api)
        .await
        .expect("mock client connects");
    (client, dir)
}
