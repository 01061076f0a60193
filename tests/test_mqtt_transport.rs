//! rumqttc transport against an in-process broker
//!
//! The broker speaks just enough MQTT 3.1.1 over a local TCP socket to drive the
//! real event loop: CONNACK, SUBACK, PUBACK, the QoS 2 handshake and PINGRESP,
//! plus forced connection drops.


use bytes::Bytes;
use edge_gateway::config::{QosLevel, SessionConfig};
use edge_gateway::gateway::{ConnectionManager, ConnectionState, HandlerRegistry};
use edge_gateway::observability::GatewayMetrics;
use edge_gateway::transport::mqtt::MqttTransport;
use edge_gateway::transport::{Session, Transport, TransportError, TransportEvent};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use test_helpers::{eventually_within, wait_for_state_within};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

const CONNECT: u8 = 1;
const PUBLISH: u8 = 3;
const PUBREL: u8 = 6;
const SUBSCRIBE: u8 = 8;
const PINGREQ: u8 = 12;
const DISCONNECT: u8 = 14;

#[derive(Clone, Default)]
struct Behavior {
    connack_delay: Duration,
    ignore_pings: bool,
    withhold_puback: bool,
    reject_topic: Option<String>,
    push_after_subscribe: Option<(String, Vec<u8>)>,
}

#[derive(Default)]
struct BrokerLog {
    connections: usize,
    /// (connection index, topic filter)
    subscriptions: Vec<(usize, String)>,
    /// (topic, qos)
    publishes: Vec<(String, u8)>,
}

struct FakeBroker {
    addr: SocketAddr,
    log: Arc<Mutex<BrokerLog>>,
    kick: Arc<watch::Sender<u64>>,
}

impl FakeBroker {
    async fn start(behavior: Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let log = Arc::new(Mutex::new(BrokerLog::default()));
        let kick = Arc::new(watch::channel(0u64).0);

        let accept_log = log.clone();
        let accept_kick = kick.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let index = {
                    let mut log = accept_log.lock().unwrap();
                    log.connections += 1;
                    log.connections - 1
                };
                tokio::spawn(serve(
                    stream,
                    index,
                    behavior.clone(),
                    accept_log.clone(),
                    accept_kick.subscribe(),
                ));
            }
        });

        Self { addr, log, kick }
    }

    fn url(&self) -> String {
        format!("tcp://{}", self.addr)
    }

    /// Close every open connection without a DISCONNECT
    fn drop_connections(&self) {
        self.kick.send_modify(|generation| *generation += 1);
    }

    fn connections(&self) -> usize {
        self.log.lock().unwrap().connections
    }

    fn subscriptions_on(&self, connection: usize) -> Vec<String> {
        self.log
            .lock()
            .unwrap()
            .subscriptions
            .iter()
            .filter(|(index, _)| *index == connection)
            .map(|(_, topic)| topic.clone())
            .collect()
    }

    fn publishes(&self) -> Vec<(String, u8)> {
        self.log.lock().unwrap().publishes.clone()
    }
}

async fn serve(
    mut stream: TcpStream,
    index: usize,
    behavior: Behavior,
    log: Arc<Mutex<BrokerLog>>,
    mut kick: watch::Receiver<u64>,
) {
    match read_packet(&mut stream).await {
        Ok((header, _)) if header >> 4 == CONNECT => {}
        _ => return,
    }
    tokio::time::sleep(behavior.connack_delay).await;
    if stream.write_all(&[0x20, 0x02, 0x00, 0x00]).await.is_err() {
        return;
    }

    loop {
        let packet = tokio::select! {
            _ = kick.changed() => return,
            packet = read_packet(&mut stream) => packet,
        };
        let Ok((header, body)) = packet else { return };

        let reply = match header >> 4 {
            PUBLISH => {
                let qos = (header >> 1) & 0x03;
                let topic_len = u16::from_be_bytes([body[0], body[1]]) as usize;
                let topic = String::from_utf8_lossy(&body[2..2 + topic_len]).to_string();
                log.lock().unwrap().publishes.push((topic, qos));

                let pkid = body.get(2 + topic_len..4 + topic_len).map(<[u8]>::to_vec);
                match (qos, pkid) {
                    (1, Some(_)) if behavior.withhold_puback => Vec::new(),
                    (1, Some(pkid)) => encode_packet(0x40, &pkid),
                    (2, Some(pkid)) => encode_packet(0x50, &pkid),
                    _ => Vec::new(),
                }
            }
            PUBREL => encode_packet(0x70, &body[..2]),
            SUBSCRIBE => {
                let mut codes = Vec::new();
                let mut cursor = 2;
                while cursor + 2 <= body.len() {
                    let len = u16::from_be_bytes([body[cursor], body[cursor + 1]]) as usize;
                    let topic =
                        String::from_utf8_lossy(&body[cursor + 2..cursor + 2 + len]).to_string();
                    let qos = body[cursor + 2 + len];
                    cursor += 3 + len;

                    codes.push(if behavior.reject_topic.as_deref() == Some(topic.as_str()) {
                        0x80
                    } else {
                        qos
                    });
                    log.lock().unwrap().subscriptions.push((index, topic));
                }

                let mut suback = body[..2].to_vec();
                suback.extend_from_slice(&codes);
                let mut reply = encode_packet(0x90, &suback);
                if let Some((topic, payload)) = &behavior.push_after_subscribe {
                    let mut publish = (topic.len() as u16).to_be_bytes().to_vec();
                    publish.extend_from_slice(topic.as_bytes());
                    publish.extend_from_slice(payload);
                    reply.extend(encode_packet(0x30, &publish));
                }
                reply
            }
            PINGREQ if behavior.ignore_pings => Vec::new(),
            PINGREQ => vec![0xD0, 0x00],
            DISCONNECT => return,
            _ => Vec::new(),
        };

        if !reply.is_empty() && stream.write_all(&reply).await.is_err() {
            return;
        }
    }
}

async fn read_packet(stream: &mut TcpStream) -> std::io::Result<(u8, Vec<u8>)> {
    let header = stream.read_u8().await?;
    let mut remaining = 0usize;
    let mut shift = 0;
    loop {
        let byte = stream.read_u8().await?;
        remaining |= ((byte & 0x7f) as usize) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    let mut body = vec![0; remaining];
    stream.read_exact(&mut body).await?;
    Ok((header, body))
}

fn encode_packet(header: u8, body: &[u8]) -> Vec<u8> {
    let mut packet = vec![header];
    let mut len = body.len();
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        packet.push(byte);
        if len == 0 {
            break;
        }
    }
    packet.extend_from_slice(body);
    packet
}

fn session_config(broker: &FakeBroker) -> SessionConfig {
    SessionConfig {
        broker_url: broker.url(),
        client_id: "edge-gateway-it".to_string(),
        connect_timeout_secs: 5,
        keep_alive_secs: 30,
        reconnect_delay_secs: 1,
        subscriptions: Vec::new(),
        ..SessionConfig::default()
    }
}

async fn next_event(events: &mut mpsc::Receiver<TransportEvent>, limit: Duration) -> TransportEvent {
    tokio::time::timeout(limit, events.recv())
        .await
        .expect("no transport event in time")
        .expect("event channel closed")
}

#[tokio::test]
async fn test_publish_resolves_on_broker_acknowledgment() {
    let broker = FakeBroker::start(Behavior::default()).await;
    let (events, _events_rx) = mpsc::channel(64);
    let session = MqttTransport::new()
        .open(&session_config(&broker), None, events)
        .await
        .unwrap();

    for qos in [QosLevel::AtMostOnce, QosLevel::AtLeastOnce, QosLevel::ExactlyOnce] {
        tokio::time::timeout(
            Duration::from_secs(5),
            session.publish("edge/out", Bytes::from_static(b"23.5"), qos, false),
        )
        .await
        .expect("publish never acknowledged")
        .unwrap();
    }

    assert_eq!(
        broker.publishes(),
        vec![
            ("edge/out".to_string(), 0),
            ("edge/out".to_string(), 1),
            ("edge/out".to_string(), 2)
        ]
    );
    session.disconnect(Duration::from_millis(250)).await.unwrap();
}

#[tokio::test]
async fn test_publish_waits_while_puback_is_withheld() {
    let broker = FakeBroker::start(Behavior {
        withhold_puback: true,
        ..Behavior::default()
    })
    .await;
    let (events, _events_rx) = mpsc::channel(64);
    let session = MqttTransport::new()
        .open(&session_config(&broker), None, events)
        .await
        .unwrap();

    let waited = tokio::time::timeout(
        Duration::from_millis(500),
        session.publish("edge/out", Bytes::from_static(b"x"), QosLevel::AtLeastOnce, false),
    )
    .await;

    assert!(waited.is_err(), "publish completed without a PUBACK");
    assert_eq!(broker.publishes().len(), 1);

    session.disconnect(Duration::from_millis(250)).await.unwrap();
    assert!(matches!(
        session
            .publish("edge/out", Bytes::new(), QosLevel::AtMostOnce, false)
            .await,
        Err(TransportError::Closed)
    ));
}

#[tokio::test]
async fn test_connect_timeout_beyond_rumqttc_default_is_honored() {
    let broker = FakeBroker::start(Behavior {
        connack_delay: Duration::from_secs(6),
        ..Behavior::default()
    })
    .await;
    let config = SessionConfig {
        connect_timeout_secs: 10,
        ..session_config(&broker)
    };
    let (events, _events_rx) = mpsc::channel(64);

    let started = Instant::now();
    let session = MqttTransport::new().open(&config, None, events).await;

    assert!(session.is_ok(), "open failed after {:?}", started.elapsed());
    assert!(started.elapsed() >= Duration::from_secs(6));
}

#[tokio::test]
async fn test_connect_gives_up_at_connect_timeout() {
    let broker = FakeBroker::start(Behavior {
        connack_delay: Duration::from_secs(5),
        ..Behavior::default()
    })
    .await;
    let config = SessionConfig {
        connect_timeout_secs: 1,
        ..session_config(&broker)
    };
    let (events, _events_rx) = mpsc::channel(64);

    let started = Instant::now();
    let result = MqttTransport::new().open(&config, None, events).await;

    assert!(matches!(
        result,
        Err(TransportError::Timeout) | Err(TransportError::Connect(_))
    ));
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn test_inbound_publish_becomes_message_event() {
    let broker = FakeBroker::start(Behavior {
        push_after_subscribe: Some(("edge/node-1/data".to_string(), b"23.5".to_vec())),
        ..Behavior::default()
    })
    .await;
    let (events, mut events_rx) = mpsc::channel(64);
    let session = MqttTransport::new()
        .open(&session_config(&broker), None, events)
        .await
        .unwrap();

    session
        .subscribe("edge/+/data", QosLevel::AtLeastOnce)
        .await
        .unwrap();

    match next_event(&mut events_rx, Duration::from_secs(5)).await {
        TransportEvent::Message { topic, payload } => {
            assert_eq!(topic, "edge/node-1/data");
            assert_eq!(payload, Bytes::from_static(b"23.5"));
        }
        other => panic!("expected a message, got {other:?}"),
    }
    session.disconnect(Duration::from_millis(250)).await.unwrap();
}

#[tokio::test]
async fn test_rejected_subscription_leaves_session_usable() {
    let broker = FakeBroker::start(Behavior {
        reject_topic: Some("restricted/#".to_string()),
        ..Behavior::default()
    })
    .await;
    let (events, _events_rx) = mpsc::channel(64);
    let session = MqttTransport::new()
        .open(&session_config(&broker), None, events)
        .await
        .unwrap();

    session
        .subscribe("restricted/#", QosLevel::AtLeastOnce)
        .await
        .unwrap();
    session
        .subscribe("edge/+/data", QosLevel::AtLeastOnce)
        .await
        .unwrap();

    tokio::time::timeout(
        Duration::from_secs(5),
        session.publish("edge/out", Bytes::from_static(b"x"), QosLevel::AtLeastOnce, false),
    )
    .await
    .expect("publish never acknowledged")
    .unwrap();
    assert_eq!(
        broker.subscriptions_on(0),
        vec!["restricted/#".to_string(), "edge/+/data".to_string()]
    );
}

#[tokio::test]
async fn test_unanswered_ping_triggers_reconnect() {
    let broker = FakeBroker::start(Behavior {
        ignore_pings: true,
        ..Behavior::default()
    })
    .await;
    let config = SessionConfig {
        keep_alive_secs: 1,
        ping_timeout_secs: 1,
        ..session_config(&broker)
    };
    let (events, mut events_rx) = mpsc::channel(64);
    let session = MqttTransport::new()
        .open(&config, None, events)
        .await
        .unwrap();

    assert!(matches!(
        next_event(&mut events_rx, Duration::from_secs(6)).await,
        TransportEvent::ConnectionLost(_)
    ));

    // The next session comes from a fresh TCP connection
    loop {
        match next_event(&mut events_rx, Duration::from_secs(6)).await {
            TransportEvent::Connected => break,
            TransportEvent::Reconnecting { .. } => {}
            other => panic!("unexpected event while reconnecting: {other:?}"),
        }
    }
    assert!(broker.connections() >= 2);

    session.disconnect(Duration::from_millis(250)).await.unwrap();
}

#[tokio::test]
async fn test_manager_resubscribes_every_filter_after_connection_drop() {
    let broker = FakeBroker::start(Behavior::default()).await;
    let config = SessionConfig {
        subscriptions: vec!["a/b".to_string(), "c/d".to_string()],
        ..session_config(&broker)
    };
    let metrics = Arc::new(GatewayMetrics::new());
    let mut manager = ConnectionManager::new(
        config,
        None,
        MqttTransport::new(),
        Arc::new(HandlerRegistry::new()),
        metrics.clone(),
    );

    manager.connect().await.unwrap();
    eventually_within(
        || broker.subscriptions_on(0).len() == 2,
        "initial subscriptions",
        Duration::from_secs(5),
    )
    .await;

    broker.drop_connections();
    wait_for_state_within(&manager, ConnectionState::ReconnectPending, Duration::from_secs(5))
        .await;
    wait_for_state_within(&manager, ConnectionState::Connected, Duration::from_secs(10)).await;

    eventually_within(
        || broker.subscriptions_on(1) == vec!["a/b".to_string(), "c/d".to_string()],
        "resubscription on the new connection",
        Duration::from_secs(5),
    )
    .await;
    assert_eq!(metrics.snapshot().connection.reconnects, 1);

    manager
        .publish_with("edge/out", "back", QosLevel::AtLeastOnce, false)
        .await
        .unwrap();
    manager.disconnect().await.unwrap();
}
