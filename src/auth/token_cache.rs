//! On-disk token cache, one file per account
//!
//! Files are named `tokens_<sha256(username)>.json` and hold
//! `{accessToken, mqttAccessToken, timestamp, cached_at}`. A cached pair is
//! only handed out while the broker token's JWT `exp` is more than an hour
//! away.

use super::{token_prefix, AuthTokens, Credential};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Minimum remaining broker-token lifetime for a cache hit
pub const EXPIRY_MARGIN_SECS: i64 = 3600;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Token cache I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Token cache serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheFile {
    access_token: String,
    mqtt_access_token: String,
    /// Unix seconds at save time
    timestamp: i64,
    #[serde(rename = "cached_at")]
    cached_at: String,
}

/// Decode the `exp` claim of a JWT without verifying it
pub fn jwt_expiry(token: &str) -> Option<DateTime<Utc>> {
    let mut parts = token.split('.');
    let (_, payload, _) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }

    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    let exp = claims
        .get("exp")
        .and_then(|exp| exp.as_i64().or_else(|| exp.as_f64().map(|f| f as i64)))?;

    Utc.timestamp_opt(exp, 0).single()
}

/// Per-account token persistence
#[derive(Debug, Clone)]
pub struct TokenCache {
    path: PathBuf,
}

impl TokenCache {
    pub fn new(dir: impl AsRef<Path>, credential: &Credential) -> Self {
        let path = dir
            .as_ref()
            .join(format!("tokens_{}.json", credential.account_hash()));
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Cached tokens, if present and not about to expire
    pub fn get_valid_tokens(&self) -> Option<AuthTokens> {
        self.get_valid_tokens_at(Utc::now())
    }

    pub fn get_valid_tokens_at(&self, now: DateTime<Utc>) -> Option<AuthTokens> {
        let content = std::fs::read_to_string(&self.path).ok()?;
        let file: CacheFile = match serde_json::from_str(&content) {
            Ok(file) => file,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Ignoring unreadable token cache");
                return None;
            }
        };

        let expiry = jwt_expiry(&file.mqtt_access_token)?;
        if expiry.timestamp() - now.timestamp() <= EXPIRY_MARGIN_SECS {
            debug!(expires = %expiry, "Cached broker token expires within the margin");
            return None;
        }

        Some(AuthTokens {
            access_token: file.access_token,
            mqtt_access_token: file.mqtt_access_token,
            issued_at: Utc
                .timestamp_opt(file.timestamp, 0)
                .single()
                .unwrap_or(now),
        })
    }

    /// Persist a fresh token pair
    pub fn save_tokens(
        &self,
        access_token: &str,
        mqtt_access_token: &str,
    ) -> Result<AuthTokens, CacheError> {
        let now = Utc::now();
        let file = CacheFile {
            access_token: access_token.to_string(),
            mqtt_access_token: mqtt_access_token.to_string(),
            timestamp: now.timestamp(),
            cached_at: now.format("%Y-%m-%d %H:%M:%S").to_string(),
        };

        if let Some(dir) = self.path.parent() {
            create_private_dir(dir).map_err(|source| CacheError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }

        let json = serde_json::to_string_pretty(&file)?;
        std::fs::write(&self.path, json).map_err(|source| CacheError::Io {
            path: self.path.clone(),
            source,
        })?;

        info!(mqtt_token = %token_prefix(mqtt_access_token), "Tokens cached");
        Ok(AuthTokens {
            access_token: file.access_token,
            mqtt_access_token: file.mqtt_access_token,
            issued_at: now,
        })
    }

    /// Remove the cache file; a missing file is fine
    pub fn clear(&self) -> Result<(), CacheError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                info!("Token cache cleared");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(CacheError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    /// Human-readable expiry summary
    pub fn token_info(&self) -> String {
        let now = Utc::now();
        match self.get_valid_tokens_at(now) {
            None => "No valid tokens cached".to_string(),
            Some(tokens) => match jwt_expiry(&tokens.mqtt_access_token) {
                Some(expiry) => {
                    let hours = (expiry - now).num_minutes() as f64 / 60.0;
                    format!(
                        "MQTT token expires: {} (in {:.1} hours)",
                        expiry.format("%Y-%m-%d %H:%M:%S"),
                        hours
                    )
                }
                None => "Token info unavailable".to_string(),
            },
        }
    }
}

#[cfg(unix)]
fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::jwt_with_exp;
    use chrono::Duration;
    use tempfile::TempDir;

    fn cache(dir: &TempDir) -> TokenCache {
        TokenCache::new(dir.path(), &Credential::new("user@example.com", "pw"))
    }

    #[test]
    fn test_jwt_expiry() {
        let exp = Utc::now() + Duration::hours(5);
        let token = jwt_with_exp(exp.timestamp());
        assert_eq!(jwt_expiry(&token).unwrap().timestamp(), exp.timestamp());

        assert_eq!(jwt_expiry("not-a-jwt"), None);
        assert_eq!(jwt_expiry("a.b.c.d"), None);
        assert_eq!(jwt_expiry("a.!!!.c"), None);
    }

    #[test]
    fn test_jwt_without_exp() {
        let payload = URL_SAFE_NO_PAD.encode(br#"{"sub":"x"}"#);
        assert_eq!(jwt_expiry(&format!("h.{payload}.s")), None);
    }

    #[test]
    fn test_file_named_by_username_hash() {
        let dir = TempDir::new().unwrap();
        let credential = Credential::new("user@example.com", "pw");
        let cache = TokenCache::new(dir.path(), &credential);
        assert_eq!(
            cache.path().file_name().unwrap().to_string_lossy(),
            format!("tokens_{}.json", credential.account_hash())
        );
    }

    #[test]
    fn test_validity_boundary() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        let now = Utc::now();

        let valid = jwt_with_exp((now + Duration::minutes(61)).timestamp());
        cache.save_tokens("access", &valid).unwrap();
        assert!(cache.get_valid_tokens_at(now).is_some());

        let expiring = jwt_with_exp((now + Duration::minutes(59)).timestamp());
        cache.save_tokens("access", &expiring).unwrap();
        assert!(cache.get_valid_tokens_at(now).is_none());
    }

    #[test]
    fn test_save_writes_expected_shape() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        let mqtt = jwt_with_exp((Utc::now() + Duration::hours(3)).timestamp());

        cache.save_tokens("access-1", &mqtt).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(cache.path()).unwrap()).unwrap();
        assert_eq!(raw["accessToken"], "access-1");
        assert_eq!(raw["mqttAccessToken"], mqtt.as_str());
        assert!(raw["timestamp"].is_i64());
        assert_eq!(raw["cached_at"].as_str().unwrap().len(), 19);

        let tokens = cache.get_valid_tokens().unwrap();
        assert_eq!(tokens.access_token, "access-1");
    }

    #[test]
    fn test_missing_or_corrupt_file_is_absent() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        assert!(cache.get_valid_tokens().is_none());

        std::fs::write(cache.path(), "{not json").unwrap();
        assert!(cache.get_valid_tokens().is_none());
    }

    #[test]
    fn test_clear() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        cache.clear().unwrap();

        let mqtt = jwt_with_exp((Utc::now() + Duration::hours(3)).timestamp());
        cache.save_tokens("a", &mqtt).unwrap();
        cache.clear().unwrap();
        assert!(!cache.path().exists());
        assert_eq!(cache.token_info(), "No valid tokens cached");
    }

    #[test]
    fn test_token_info() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        let mqtt = jwt_with_exp((Utc::now() + Duration::hours(3)).timestamp());
        cache.save_tokens("a", &mqtt).unwrap();
        let info = cache.token_info();
        assert!(info.starts_with("MQTT token expires:"), "{info}");
        assert!(info.contains("hours"));
    }

    #[test]
    fn test_creates_nested_cache_dir() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a").join("b");
        let cache = TokenCache::new(&nested, &Credential::new("u", "p"));
        let mqtt = jwt_with_exp((Utc::now() + Duration::hours(3)).timestamp());
        cache.save_tokens("a", &mqtt).unwrap();
        assert!(nested.is_dir());
    }
}
