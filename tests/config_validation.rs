//! Integration tests for configuration validation

#![allow(clippy::expect_used, clippy::unwrap_used)]

use relay_protocol::config::{ClientConfig, ConnectionConfig, LoggingConfig, TransportConfig};
use serial_test::serial;
use std::time::Duration;
use tracing::Level;

#[test]
fn test_default_config_validates() {
    let config = ClientConfig::default();
    let errors = config.validate();
    assert!(
        errors.is_empty(),
        "Default config should be valid, but got errors: {:?}",
        errors
    );
    assert!(config.validate_strict().is_ok());
}

#[test]
fn test_default_timings() {
    let config = ConnectionConfig::default();
    assert_eq!(config.request_timeout, Duration::from_secs(10));
    assert_eq!(config.reconnect_interval, Duration::from_secs(8));
    assert_eq!(config.handshake_timeout, Duration::from_secs(10));
    assert_eq!(config.chunk_size, 2 * 1024 * 1024);
    assert!(config.auto_reconnect);
}

#[test]
fn test_short_request_timeout() {
    let config = ClientConfig::default_with_overrides(|c| {
        c.connection.request_timeout = Duration::from_millis(50);
    });

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Request timeout too short")));
}

#[test]
fn test_long_reconnect_interval() {
    let config = ClientConfig::default_with_overrides(|c| {
        c.connection.reconnect_interval = Duration::from_secs(3600);
    });

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Reconnect interval too long")));
}

#[test]
fn test_chunk_size_bounds() {
    let mut config = ConnectionConfig {
        chunk_size: 100,
        ..ConnectionConfig::default()
    };
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Chunk size too small")));

    config.chunk_size = i32::MAX as usize + 1;
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Chunk size too large")));
}

#[test]
fn test_relay_url_scheme() {
    let mut config = TransportConfig {
        relay_url: "https://connect.example.com".to_string(),
        ..TransportConfig::default()
    };
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Invalid relay URL scheme")));

    config.relay_url = "not a url".to_string();
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Invalid relay URL")));

    config.relay_url = "ws://localhost:8080".to_string();
    assert!(config.validate().is_empty());
}

#[test]
fn test_zero_default_port() {
    let config = TransportConfig {
        default_port: 0,
        ..TransportConfig::default()
    };
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Default port cannot be 0")));
}

#[test]
fn test_logging_needs_an_output() {
    let config = LoggingConfig {
        log_to_console: false,
        log_to_file: false,
        ..LoggingConfig::default()
    };
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("At least one logging output")));
}

#[test]
fn test_log_file_requires_path() {
    let config = LoggingConfig {
        log_to_file: true,
        log_file_path: None,
        ..LoggingConfig::default()
    };
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("log_file_path must be specified")));
}

#[test]
fn test_multiple_errors_are_collected() {
    let config = ClientConfig::default_with_overrides(|c| {
        c.connection.request_timeout = Duration::from_millis(1);
        c.transport.default_port = 0;
        c.logging.app_name = String::new();
    });

    assert_eq!(config.validate().len(), 3);
    let error = config.validate_strict().unwrap_err().to_string();
    assert!(error.contains("Configuration validation failed"));
}

#[test]
fn test_toml_roundtrip() {
    let text = ClientConfig::example_config();
    let parsed = ClientConfig::from_toml(&text).expect("example config should parse");
    assert_eq!(
        parsed.connection.request_timeout,
        ConnectionConfig::default().request_timeout
    );
    assert_eq!(parsed.logging.log_level, Level::INFO);
}

#[test]
fn test_save_and_load_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("client.toml");

    let config = ClientConfig::default_with_overrides(|c| {
        c.connection.auto_reconnect = false;
        c.transport.relay_url = "wss://relay.test".to_string();
    });
    config.save_to_file(&path).unwrap();

    let loaded = ClientConfig::from_file(&path).unwrap();
    assert!(!loaded.connection.auto_reconnect);
    assert_eq!(loaded.transport.relay_url, "wss://relay.test");
}

#[test]
fn test_malformed_toml() {
    assert!(ClientConfig::from_toml("[connection\nrequest_timeout = ").is_err());
}

#[test]
#[serial]
fn test_env_overrides() {
    std::env::set_var("RELAY_PROTOCOL_REQUEST_TIMEOUT_MS", "2500");
    std::env::set_var("RELAY_PROTOCOL_AUTO_RECONNECT", "false");
    std::env::set_var("RELAY_PROTOCOL_LOG_LEVEL", "debug");

    let config = ClientConfig::from_env().unwrap();
    assert_eq!(config.connection.request_timeout, Duration::from_millis(2500));
    assert!(!config.connection.auto_reconnect);
    assert_eq!(config.logging.log_level, Level::DEBUG);

    std::env::remove_var("RELAY_PROTOCOL_REQUEST_TIMEOUT_MS");
    std::env::remove_var("RELAY_PROTOCOL_AUTO_RECONNECT");
    std::env::remove_var("RELAY_PROTOCOL_LOG_LEVEL");
}
