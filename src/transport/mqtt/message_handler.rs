//! Pure routing of rumqttc events
//!
//! The driver task turns every polled [`Event`] into an [`EventRoute`] and acts on
//! the route. Keeping the match here makes the driver loop readable and lets the
//! routing be tested without a broker.

use bytes::Bytes;
use rumqttc::{Event, Outgoing, Packet, SubscribeReasonCode};

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route MQTT event to appropriate handler (pure routing decision)
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                Packet::Publish(publish) => EventRoute::MessageReceived {
                    topic: publish.topic.clone(),
                    payload: publish.payload.clone(),
                    retain: publish.retain,
                },
                Packet::PubAck(ack) => EventRoute::PublishAcknowledged { pkid: ack.pkid },
                Packet::PubComp(comp) => EventRoute::PublishCompleted { pkid: comp.pkid },
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    pkid: suback.pkid,
                    return_codes: suback.return_codes.clone(),
                },
                Packet::PingResp => EventRoute::PingResponse,
                Packet::Disconnect => EventRoute::Disconnected,
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(outgoing) => match outgoing {
                Outgoing::Publish(pkid) => EventRoute::OutgoingPublish { pkid: *pkid },
                Outgoing::Subscribe(pkid) => EventRoute::OutgoingSubscribe { pkid: *pkid },
                Outgoing::PingReq => EventRoute::OutgoingPingRequest,
                Outgoing::Disconnect => EventRoute::OutgoingDisconnect,
                _ => EventRoute::OutgoingEvent,
            },
        }
    }

    /// Validate subscription success from SubAck (pure function)
    pub fn validate_subscription_success(return_codes: &[SubscribeReasonCode]) -> Result<(), String> {
        if return_codes
            .iter()
            .any(|code| matches!(code, SubscribeReasonCode::Failure))
        {
            Err(format!(
                "Subscription failed with return codes: {return_codes:?}"
            ))
        } else {
            Ok(())
        }
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// Connection acknowledged, ready to publish/subscribe
    ConnectionAcknowledged,
    /// Message received on subscribed topic
    MessageReceived {
        topic: String,
        payload: Bytes,
        retain: bool,
    },
    /// QoS 1 publish acknowledged
    PublishAcknowledged { pkid: u16 },
    /// QoS 2 publish flow completed
    PublishCompleted { pkid: u16 },
    /// Subscription confirmed with return codes
    SubscriptionConfirmed {
        pkid: u16,
        return_codes: Vec<SubscribeReasonCode>,
    },
    PingResponse,
    /// MQTT broker disconnected
    Disconnected,
    /// A publish left the client; QoS 0 publishes carry pkid 0
    OutgoingPublish { pkid: u16 },
    OutgoingSubscribe { pkid: u16 },
    OutgoingPingRequest,
    OutgoingDisconnect,
    /// Infrastructure event (PubRec, UnsubAck, etc.)
    InfrastructureEvent(String),
    /// Outgoing event (handled automatically)
    OutgoingEvent,
}
