//! Configuration system for the Sydpower client
//!
//! Every section carries defaults that match the production cloud, so an
//! empty TOML file is a valid configuration. Credentials are never stored in
//! the file; they are read from environment variables at runtime.

use crate::auth::Credential;
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Main client configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SydpowerConfig {
    #[serde(default)]
    pub account: AccountSection,
    #[serde(default)]
    pub api: ApiSection,
    #[serde(default)]
    pub mqtt: MqttSection,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub pool: PoolSection,
    #[serde(default)]
    pub limits: DeviceLimits,
    #[serde(default)]
    pub validator: ValidatorSection,
}

/// Account section: where to find the credential
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccountSection {
    /// Environment variable containing the account username (e-mail)
    #[serde(default = "default_username_env")]
    pub username_env: String,
    /// Environment variable containing the account password
    #[serde(default = "default_password_env")]
    pub password_env: String,
}

fn default_username_env() -> String {
    "SYDPOWER_USERNAME".to_string()
}

fn default_password_env() -> String {
    "SYDPOWER_PASSWORD".to_string()
}

impl Default for AccountSection {
    fn default() -> Self {
        Self {
            username_env: default_username_env(),
            password_env: default_password_env(),
        }
    }
}

/// REST endpoint section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiSection {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_space_id")]
    pub space_id: String,
    /// Shared secret used to HMAC every request
    #[serde(default = "default_client_secret")]
    pub client_secret: String,
    #[serde(default = "default_api_timeout")]
    pub timeout_secs: u64,
}

fn default_endpoint() -> String {
    "https://api.next.bspapp.com/client".to_string()
}

fn default_space_id() -> String {
    "mp-6c382a98-49b8-40ba-b761-645d83e8ee74".to_string()
}

fn default_client_secret() -> String {
    "5rCEdl/nx7IgViBe4QYRiQ==".to_string()
}

fn default_api_timeout() -> u64 {
    15
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            space_id: default_space_id(),
            client_secret: default_client_secret(),
            timeout_secs: default_api_timeout(),
        }
    }
}

impl ApiSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// MQTT broker section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default = "default_mqtt_path")]
    pub path: String,
    /// Fixed protocol password; the broker token is the username
    #[serde(default = "default_mqtt_password")]
    pub password: String,
    #[serde(default)]
    pub use_tls: bool,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_mqtt_host() -> String {
    "mqtt.sydpower.com".to_string()
}

fn default_mqtt_port() -> u16 {
    8083
}

fn default_mqtt_path() -> String {
    "/mqtt".to_string()
}

fn default_mqtt_password() -> String {
    "helloyou".to_string()
}

fn default_keep_alive() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    10
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            path: default_mqtt_path(),
            password: default_mqtt_password(),
            use_tls: false,
            keep_alive_secs: default_keep_alive(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl MqttSection {
    /// WebSocket URL of the broker, e.g. `ws://mqtt.sydpower.com:8083/mqtt`
    pub fn websocket_url(&self) -> String {
        let scheme = if self.use_tls { "wss" } else { "ws" };
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        format!("{scheme}://{}:{}{path}", self.host, self.port)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Token cache section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheSection {
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,
}

fn default_cache_dir() -> PathBuf {
    std::env::var_os("XDG_CACHE_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".cache")))
        .unwrap_or_else(std::env::temp_dir)
        .join("sydpower")
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
        }
    }
}

/// Connection pool section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolSection {
    /// Entries older than this are never handed out
    #[serde(default = "default_pool_ttl")]
    pub ttl_secs: u64,
    /// How long a per-key lock counts as held
    #[serde(default = "default_lock_window")]
    pub lock_window_secs: u64,
    /// Maximum wait for a held key before falling back to a fresh connection
    #[serde(default = "default_lock_wait")]
    pub lock_wait_secs: u64,
    #[serde(default = "default_lock_poll")]
    pub lock_poll_ms: u64,
    /// `cleanup()` evicts entries older or idle longer than this
    #[serde(default = "default_max_idle")]
    pub max_idle_secs: u64,
    #[serde(default = "default_cache_ttl")]
    pub token_ttl_secs: u64,
    #[serde(default = "default_cache_ttl")]
    pub device_ttl_secs: u64,
}

fn default_pool_ttl() -> u64 {
    25
}

fn default_lock_window() -> u64 {
    5
}

fn default_lock_wait() -> u64 {
    5
}

fn default_lock_poll() -> u64 {
    100
}

fn default_max_idle() -> u64 {
    30
}

fn default_cache_ttl() -> u64 {
    3600
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            ttl_secs: default_pool_ttl(),
            lock_window_secs: default_lock_window(),
            lock_wait_secs: default_lock_wait(),
            lock_poll_ms: default_lock_poll(),
            max_idle_secs: default_max_idle(),
            token_ttl_secs: default_cache_ttl(),
            device_ttl_secs: default_cache_ttl(),
        }
    }
}

/// Value ranges accepted for writable settings.
///
/// The charging-current range depends on the hardware model (1-5 A on small
/// units, 1-20 A on the larger ones), so it is configuration rather than codec.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceLimits {
    #[serde(default = "default_current_min")]
    pub max_charge_current_min: u16,
    #[serde(default = "default_current_max")]
    pub max_charge_current_max: u16,
    #[serde(default = "default_upper_min")]
    pub charge_upper_limit_min: u16,
    #[serde(default = "default_upper_max")]
    pub charge_upper_limit_max: u16,
    #[serde(default = "default_lower_min")]
    pub discharge_lower_limit_min: u16,
    #[serde(default = "default_lower_max")]
    pub discharge_lower_limit_max: u16,
}

fn default_current_min() -> u16 {
    1
}

fn default_current_max() -> u16 {
    20
}

fn default_upper_min() -> u16 {
    60
}

fn default_upper_max() -> u16 {
    100
}

fn default_lower_min() -> u16 {
    0
}

fn default_lower_max() -> u16 {
    50
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            max_charge_current_min: default_current_min(),
            max_charge_current_max: default_current_max(),
            charge_upper_limit_min: default_upper_min(),
            charge_upper_limit_max: default_upper_max(),
            discharge_lower_limit_min: default_lower_min(),
            discharge_lower_limit_max: default_lower_max(),
        }
    }
}

impl DeviceLimits {
    pub fn max_charge_current(&self) -> RangeInclusive<u16> {
        self.max_charge_current_min..=self.max_charge_current_max
    }

    pub fn charge_upper_limit(&self) -> RangeInclusive<u16> {
        self.charge_upper_limit_min..=self.charge_upper_limit_max
    }

    pub fn discharge_lower_limit(&self) -> RangeInclusive<u16> {
        self.discharge_lower_limit_min..=self.discharge_lower_limit_max
    }
}

/// Response validator section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidatorSection {
    /// Wait used for commands without a confirmation predicate
    #[serde(default = "default_generic_wait")]
    pub generic_wait_ms: u64,
    /// Listen window used by status refreshes
    #[serde(default = "default_refresh_listen")]
    pub refresh_listen_ms: u64,
    /// How long a command may wait for the per-consumer semaphore
    #[serde(default = "default_command_lock")]
    pub command_lock_timeout_ms: u64,
}

fn default_generic_wait() -> u64 {
    2000
}

fn default_refresh_listen() -> u64 {
    5000
}

fn default_command_lock() -> u64 {
    5000
}

impl Default for ValidatorSection {
    fn default() -> Self {
        Self {
            generic_wait_ms: default_generic_wait(),
            refresh_listen_ms: default_refresh_listen(),
            command_lock_timeout_ms: default_command_lock(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl SydpowerConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: SydpowerConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        let endpoint = Url::parse(&self.api.endpoint).map_err(|_| {
            ConfigError::InvalidConfig(format!("Invalid API endpoint: {}", self.api.endpoint))
        })?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidConfig(format!(
                "API endpoint must be http(s): {}",
                self.api.endpoint
            )));
        }

        if self.mqtt.host.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "mqtt.host must not be empty".to_string(),
            ));
        }

        if self.pool.ttl_secs == 0 || self.pool.lock_poll_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "pool.ttl_secs and pool.lock_poll_ms must be greater than 0".to_string(),
            ));
        }

        let limits = &self.limits;
        if limits.max_charge_current().is_empty()
            || limits.charge_upper_limit().is_empty()
            || limits.discharge_lower_limit().is_empty()
        {
            return Err(ConfigError::InvalidConfig(
                "limits ranges must have min <= max".to_string(),
            ));
        }
        if limits.charge_upper_limit_max > 100 || limits.discharge_lower_limit_max > 100 {
            return Err(ConfigError::InvalidConfig(
                "percentage limits cannot exceed 100".to_string(),
            ));
        }

        Ok(())
    }

    /// Read the account credential from the configured environment variables
    pub fn credential(&self) -> Result<Credential, ConfigError> {
        let username = Self::get_env_var_required(&self.account.username_env)?;
        let password = Self::get_env_var_required(&self.account.password_env)?;
        Ok(Credential::new(username, password))
    }

    fn get_env_var_required(env_var_name: &str) -> Result<String, ConfigError> {
        std::env::var(env_var_name)
            .map_err(|_| ConfigError::EnvVarNotFound(env_var_name.to_string()))
    }
}
