//! Configuration loading from files on disk

use edge_gateway::config::{ConfigError, GatewayConfig, QosLevel};
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "{content}").unwrap();
    file
}

#[test]
fn test_load_complete_file() {
    let file = write_config(
        r#"
[gateway]
topic_prefix = "plant-3/gw-1"
health_port = 9090
version = "2.4.0"

[mqtt]
broker_url = "tcp://broker.plant-3.local:1883"
client_id = "gw-1"
username = "gateway"
password = "s3cret"
qos = 2
keep_alive_secs = 30
reconnect_delay_secs = 2
max_reconnect_attempts = 5
subscriptions = ["plant-3/+/telemetry", "plant-3/alarms/#"]
"#,
    );

    let config = GatewayConfig::load_from_file(file.path()).unwrap();

    assert_eq!(config.gateway.topic_prefix, "plant-3/gw-1");
    assert_eq!(config.gateway.health_port, 9090);
    assert_eq!(config.gateway.reported_version(), "2.4.0");
    assert_eq!(config.mqtt.qos, QosLevel::ExactlyOnce);
    assert_eq!(
        config.mqtt.credentials(),
        Some(("gateway".to_string(), "s3cret".to_string()))
    );
    assert_eq!(config.mqtt.reconnect_window().as_secs(), 10);
    assert_eq!(config.mqtt.subscriptions.len(), 2);
}

#[test]
fn test_empty_file_uses_defaults() {
    let file = write_config("");

    let config = GatewayConfig::load_from_file(file.path()).unwrap();

    assert_eq!(config, GatewayConfig::default());
    assert_eq!(config.mqtt.broker_url, "tcp://localhost:1883");
    assert!(config.mqtt.credentials().is_none());
}

#[test]
fn test_missing_file_is_read_error() {
    let result = GatewayConfig::load_from_file(Path::new("/nonexistent/gateway.toml"));
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_malformed_toml_is_parse_error() {
    let file = write_config("[mqtt\nbroker_url = ");
    let result = GatewayConfig::load_from_file(file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_unsupported_scheme_is_rejected() {
    let file = write_config("[mqtt]\nbroker_url = \"http://broker:1883\"");
    let result = GatewayConfig::load_from_file(file.path());
    assert!(matches!(result, Err(ConfigError::InvalidBrokerUrl(_))));
}

#[test]
fn test_password_resolved_from_environment() {
    std::env::set_var("EDGE_GATEWAY_TEST_MQTT_PASSWORD", "from-env");
    let file = write_config(
        r#"
[mqtt]
username = "gateway"
password_env = "EDGE_GATEWAY_TEST_MQTT_PASSWORD"
"#,
    );

    let config = GatewayConfig::load_from_file(file.path()).unwrap();

    assert_eq!(config.mqtt.password.as_deref(), Some("from-env"));
    assert_eq!(config.redacted().mqtt.password.as_deref(), Some("***"));
    std::env::remove_var("EDGE_GATEWAY_TEST_MQTT_PASSWORD");
}

#[test]
fn test_cert_without_key_is_rejected_at_load() {
    let file = write_config(
        r#"
[mqtt]
broker_url = "ssl://broker:8883"
ca_cert_path = "/etc/gateway/ca.pem"
client_cert_path = "/etc/gateway/client.pem"
"#,
    );

    let result = GatewayConfig::load_from_file(file.path());
    assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
}

#[test]
fn test_redacted_config_round_trips_through_toml() {
    let file = write_config("[mqtt]\nusername = \"u\"\npassword = \"p\"");
    let config = GatewayConfig::load_from_file(file.path()).unwrap();

    let printed = toml::to_string_pretty(&config.redacted()).unwrap();

    assert!(printed.contains("***"));
    assert!(!printed.contains("\"p\""));
}
