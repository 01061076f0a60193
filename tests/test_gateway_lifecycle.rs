//! Gateway startup and shutdown against the mock transport

use edge_gateway::config::GatewayConfig;
use edge_gateway::gateway::{ConnectionState, Gateway, StatusDocument};
use edge_gateway::testing::mocks::MockTransport;
use edge_gateway::GatewayError;
use std::io::Write;
use tempfile::NamedTempFile;

fn config() -> GatewayConfig {
    GatewayConfig::from_toml_str(
        r#"
[gateway]
topic_prefix = "site-7/gateway"

[mqtt]
client_id = "gw-site-7"
subscriptions = ["site-7/+/data"]
"#,
    )
    .unwrap()
}

#[tokio::test]
async fn test_start_subscribes_commands_and_publishes_online_status() {
    let transport = MockTransport::new();
    let mut gateway = Gateway::with_transport(config(), transport.clone()).unwrap();

    gateway.start().await.unwrap();

    assert_eq!(gateway.manager().state(), ConnectionState::Connected);
    assert_eq!(
        transport.subscribed_topics(),
        vec![
            "site-7/+/data".to_string(),
            "site-7/gateway/commands".to_string()
        ]
    );
    assert!(gateway.manager().registry().lookup("site-7/gateway/commands").is_some());

    let published = transport.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].topic, "site-7/gateway/status");
    let status: StatusDocument = serde_json::from_slice(&published[0].payload).unwrap();
    assert_eq!(status.status, "online");
    assert_eq!(status.version, env!("CARGO_PKG_VERSION"));
    assert!(status.timestamp > 0);
}

#[tokio::test]
async fn test_shutdown_publishes_offline_and_disconnects() {
    let transport = MockTransport::new();
    let mut gateway = Gateway::with_transport(config(), transport.clone()).unwrap();
    gateway.start().await.unwrap();

    gateway.shutdown().await.unwrap();

    let published = transport.published();
    let last: StatusDocument = serde_json::from_slice(&published[published.len() - 1].payload).unwrap();
    assert_eq!(last.status, "offline");
    assert_eq!(gateway.manager().state(), ConnectionState::Disconnected);
    assert_eq!(transport.disconnect_count(), 1);

    // Second shutdown has nothing left to do
    gateway.shutdown().await.unwrap();
    assert_eq!(transport.disconnect_count(), 1);
}

#[tokio::test]
async fn test_command_messages_reach_command_handler() {
    let transport = MockTransport::new();
    let mut gateway = Gateway::with_transport(config(), transport.clone()).unwrap();
    gateway.start().await.unwrap();

    assert!(transport.deliver("site-7/gateway/commands", b"reboot").await);

    let metrics = gateway.metrics().clone();
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(2);
    while metrics.snapshot().messages.handled == 0 {
        assert!(tokio::time::Instant::now() < deadline, "command never handled");
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_missing_certificate_is_fatal_before_connecting() {
    let transport = MockTransport::new();
    let mut config = config();
    config.mqtt.ca_cert_path = Some("/nonexistent/ca.pem".into());

    let result = Gateway::with_transport(config, transport.clone());

    match result {
        Err(error @ GatewayError::CertificateLoad { .. }) => assert!(error.is_fatal_at_startup()),
        Err(other) => panic!("expected CertificateLoad, got {other:?}"),
        Ok(_) => panic!("expected CertificateLoad, got a gateway"),
    }
    assert_eq!(transport.open_count(), 0);
}

#[tokio::test]
async fn test_tls_context_is_passed_to_transport() {
    let certified = rcgen::generate_simple_self_signed(vec!["broker.local".to_string()]).unwrap();
    let mut ca = NamedTempFile::new().unwrap();
    write!(ca, "{}", certified.cert.pem()).unwrap();

    let transport = MockTransport::new();
    let mut config = config();
    config.mqtt.broker_url = "ssl://broker.local:8883".to_string();
    config.mqtt.ca_cert_path = Some(ca.path().to_path_buf());

    let mut gateway = Gateway::with_transport(config, transport.clone()).unwrap();
    gateway.start().await.unwrap();

    assert!(transport.used_tls());
    assert_eq!(
        transport.last_config().unwrap().broker_url,
        "ssl://broker.local:8883"
    );
}

#[tokio::test]
async fn test_connect_failure_surfaces_from_start() {
    let transport = MockTransport::new();
    transport.fail_connect("connection refused");
    let mut gateway = Gateway::with_transport(config(), transport).unwrap();

    let error = gateway.start().await.unwrap_err();
    assert!(matches!(error, GatewayError::Connection(_)));

    // Shutdown after a failed start is still clean
    gateway.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_during_slow_start_leaves_gateway_disconnected() {
    let transport = MockTransport::new();
    transport.delay_connect(std::time::Duration::from_secs(10));
    let mut gateway = Gateway::with_transport(config(), transport.clone()).unwrap();

    let started =
        tokio::time::timeout(std::time::Duration::from_millis(50), gateway.start()).await;
    assert!(started.is_err());

    gateway.shutdown().await.unwrap();

    assert_eq!(gateway.manager().state(), ConnectionState::Disconnected);
    assert!(transport.published().is_empty());
}
