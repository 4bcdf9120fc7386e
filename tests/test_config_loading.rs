//! Configuration loading and validation tests
//!
//! Tests focus on behaviour of configuration loading from disk and the
//! environment, not on TOML parsing details.

use std::io::Write;
use sydpower::config::{ConfigError, SydpowerConfig};
use sydpower::PoolConfig;
use tempfile::NamedTempFile;

#[test]
fn test_config_loads_from_file_with_overrides() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(
        temp_file,
        r#"
[mqtt]
host = "broker.internal"
port = 443
use_tls = true

[pool]
ttl_secs = 20
lock_wait_secs = 3

[limits]
max_charge_current_max = 5
"#
    )
    .unwrap();

    let config = SydpowerConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.mqtt.websocket_url(), "wss://broker.internal:443/mqtt");
    assert_eq!(config.limits.max_charge_current(), 1..=5);
    assert_eq!(config.api.endpoint, "https://api.next.bspapp.com/client");

    let pool = PoolConfig::from(&config.pool);
    assert_eq!(pool.ttl.as_secs(), 20);
    assert_eq!(pool.lock_wait.as_secs(), 3);
    assert_eq!(pool.lock_window.as_secs(), 5);
}

#[test]
fn test_missing_file_is_a_read_error() {
    let result = SydpowerConfig::load_from_file(std::path::Path::new("/nonexistent/sydpower.toml"));
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_malformed_toml_is_a_parse_error() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file, "[mqtt\nhost = ").unwrap();

    let result = SydpowerConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_invalid_values_fail_validation() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(
        temp_file,
        r#"
[limits]
charge_upper_limit_min = 90
charge_upper_limit_max = 80
"#
    )
    .unwrap();

    let result = SydpowerConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
}

#[test]
fn test_credential_read_from_configured_env_vars() {
    let config = SydpowerConfig::from_toml_str(
        r#"
[account]
username_env = "SYDPOWER_IT_USERNAME"
password_env = "SYDPOWER_IT_PASSWORD"
"#,
    )
    .unwrap();

    std::env::set_var("SYDPOWER_IT_USERNAME", "owner@example.com");
    std::env::remove_var("SYDPOWER_IT_PASSWORD");
    assert!(matches!(
        config.credential(),
        Err(ConfigError::EnvVarNotFound(name)) if name == "SYDPOWER_IT_PASSWORD"
    ));

    std::env::set_var("SYDPOWER_IT_PASSWORD", "secret");
    let credential = config.credential().unwrap();
    assert_eq!(credential.username(), "owner@example.com");
    assert!(!format!("{credential:?}").contains("secret"));
}
