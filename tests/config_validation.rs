//! Integration tests for configuration validation

#![allow(clippy::expect_used, clippy::unwrap_used)]

use peer_protocol::config::{
    LoggingConfig, NetworkConfig, NodeConfig, PeerConfig, TransportConfig, TransportKind,
};
use serial_test::serial;
use std::time::Duration;
use tracing::Level;

#[test]
fn test_default_config_validates() {
    let config = NetworkConfig::default();
    let errors = config.validate();
    assert!(
        errors.is_empty(),
        "Default config should be valid, but got errors: {:?}",
        errors
    );
}

#[test]
fn test_invalid_tcp_address() {
    let mut config = NetworkConfig::default();
    config.node.address = "invalid_address".to_string();

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Invalid node address")));
}

#[test]
fn test_memory_address_is_free_form() {
    let mut config = NetworkConfig::default();
    config.transport.kind = TransportKind::Memory;
    config.node.address = "memory:alpha".to_string();

    assert!(config.validate().is_empty());
}

#[test]
fn test_empty_node_address() {
    for kind in [TransportKind::Tcp, TransportKind::Memory] {
        let mut config = NetworkConfig::default();
        config.transport.kind = kind;
        config.node.address = String::new();

        let errors = config.validate();
        assert!(errors.iter().any(|e| e.contains("cannot be empty")));
    }
}

#[test]
fn test_short_dial_timeout() {
    let mut config = NetworkConfig::default();
    config.node.dial_timeout = Duration::from_millis(1);

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Dial timeout too short")));
}

#[test]
fn test_high_max_peers_warning() {
    let mut config = NetworkConfig::default();
    config.node.max_peers = 200_000;

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Max peers very high")));
}

#[test]
fn test_zero_timeouts() {
    let mut config = NetworkConfig::default();
    config.peer.receive_message_timeout = Duration::ZERO;
    config.peer.send_message_timeout = Duration::ZERO;
    config.peer.send_worker_busy_timeout = Duration::ZERO;

    let errors = config.validate();
    assert_eq!(
        errors.iter().filter(|e| e.contains("must be greater than 0")).count(),
        3,
        "{errors:?}"
    );
}

#[test]
fn test_zero_queue_capacities() {
    let mut config = NetworkConfig::default();
    config.peer.send_queue_capacity = 0;
    config.peer.receive_buffer_capacity = 0;

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Send queue capacity")));
    assert!(errors.iter().any(|e| e.contains("Receive buffer capacity")));
}

#[test]
fn test_frame_size_bounds() {
    let mut config = NetworkConfig::default();
    config.peer.max_frame_size = 512;
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Max frame size too small")));

    config.peer.max_frame_size = 200 * 1024 * 1024;
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Max frame size too large")));
}

#[test]
fn test_zero_memory_buffer() {
    let mut config = NetworkConfig::default();
    config.transport.memory_buffer_size = 0;
    // Only checked when the memory transport is in use.
    assert!(config.validate().is_empty());

    config.transport.kind = TransportKind::Memory;
    config.node.address = "memory:0".to_string();
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Memory buffer size")));
}

#[test]
fn test_log_to_file_without_path() {
    let mut config = NetworkConfig::default();
    config.logging.log_to_file = true;
    config.logging.log_file_path = None;

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("log_file_path must be specified")));
}

#[test]
fn test_no_logging_outputs() {
    let mut config = NetworkConfig::default();
    config.logging.log_to_console = false;
    config.logging.log_to_file = false;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("At least one logging output")));
}

#[test]
fn test_validate_strict_with_invalid_config() {
    let mut config = NetworkConfig::default();
    config.node.address = String::new();

    let err = config.validate_strict().unwrap_err();
    assert!(err.to_string().contains("Configuration validation failed"));
}

#[test]
fn test_multiple_validation_errors() {
    let mut config = NetworkConfig::default();
    config.node.address = String::new();
    config.peer.send_queue_capacity = 0;
    config.peer.max_frame_size = 0;
    config.logging.app_name = String::new();

    let errors = config.validate();
    assert!(errors.len() >= 4, "Expected at least 4 errors, got {errors:?}");
}

#[test]
fn test_toml_roundtrip_keeps_durations_in_millis() {
    let mut config = NetworkConfig::default();
    config.peer.send_worker_busy_timeout = Duration::from_millis(250);
    config.peer.max_dropped_frames = 8;
    config.transport.kind = TransportKind::Memory;

    let text = toml::to_string_pretty(&config).unwrap();
    assert!(text.contains("send_worker_busy_timeout = 250"));
    assert!(text.contains("kind = \"memory\""));

    let parsed = NetworkConfig::from_toml(&text).unwrap();
    assert_eq!(parsed.peer.send_worker_busy_timeout, Duration::from_millis(250));
    assert_eq!(parsed.peer.max_dropped_frames, 8);
    assert_eq!(parsed.transport.kind, TransportKind::Memory);
}

#[test]
fn test_partial_toml_falls_back_to_defaults() {
    let parsed = NetworkConfig::from_toml(
        r#"
        [node]
        address = "0.0.0.0:4000"

        [peer]
        receive_message_timeout = 100
        "#,
    )
    .unwrap();

    assert_eq!(parsed.node.address, "0.0.0.0:4000");
    assert_eq!(parsed.peer.receive_message_timeout, Duration::from_millis(100));
    assert_eq!(parsed.peer.send_message_timeout, PeerConfig::default().send_message_timeout);
    assert!(parsed.validate().is_empty());
}

#[test]
fn test_invalid_toml_is_config_error() {
    let err = NetworkConfig::from_toml("[node\naddress = ").unwrap_err();
    assert!(err.to_string().contains("Failed to parse TOML"));
}

#[test]
#[serial]
fn test_env_overrides() {
    std::env::set_var("PEER_PROTOCOL_ADDRESS", "127.0.0.1:9100");
    std::env::set_var("PEER_PROTOCOL_SEND_BUSY_TIMEOUT_MS", "75");
    let config = NetworkConfig::from_env();
    std::env::remove_var("PEER_PROTOCOL_ADDRESS");
    std::env::remove_var("PEER_PROTOCOL_SEND_BUSY_TIMEOUT_MS");

    let config = config.unwrap();
    assert_eq!(config.node.address, "127.0.0.1:9100");
    assert_eq!(config.peer.send_worker_busy_timeout, Duration::from_millis(75));
}

#[test]
#[serial]
fn test_env_rejects_non_numeric_timeout() {
    std::env::set_var("PEER_PROTOCOL_RECEIVE_TIMEOUT_MS", "soon");
    let result = NetworkConfig::from_env();
    std::env::remove_var("PEER_PROTOCOL_RECEIVE_TIMEOUT_MS");

    assert!(result.is_err());
}

#[test]
fn test_valid_production_config() {
    let config = NetworkConfig {
        node: NodeConfig {
            address: "0.0.0.0:8443".to_string(),
            max_peers: 512,
            dial_timeout: Duration::from_secs(10),
        },
        peer: PeerConfig {
            receive_message_timeout: Duration::from_secs(5),
            send_message_timeout: Duration::from_secs(5),
            send_worker_busy_timeout: Duration::from_millis(500),
            send_queue_capacity: 4096,
            receive_buffer_capacity: 256,
            max_dropped_frames: 16,
            max_frame_size: 4 * 1024 * 1024,
        },
        transport: TransportConfig {
            kind: TransportKind::Tcp,
            tcp_nodelay: true,
            memory_buffer_size: 64 * 1024,
        },
        logging: LoggingConfig {
            app_name: "relay-node".to_string(),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: true,
        },
    };

    let errors = config.validate();
    assert!(errors.is_empty(), "Production config should be valid: {errors:?}");
}
