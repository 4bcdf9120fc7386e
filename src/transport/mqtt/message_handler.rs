//! Pure routing of rumqttc events

use rumqttc::{ConnectReturnCode, Event, Packet, SubscribeReasonCode};

/// Pure routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route an event-loop event to what the client should do with it
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(ack) => EventRoute::ConnectionAcknowledged { code: ack.code },
                Packet::Publish(publish) => EventRoute::MessageReceived {
                    topic: publish.topic.clone(),
                    payload: publish.payload.clone(),
                },
                Packet::Disconnect => EventRoute::Disconnected,
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    packet_id: suback.pkid,
                    failures: suback
                        .return_codes
                        .iter()
                        .filter(|code| matches!(code, SubscribeReasonCode::Failure))
                        .count(),
                },
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Whether a ConnAck opened a usable session
    pub fn connack_accepted(code: ConnectReturnCode) -> bool {
        code == ConnectReturnCode::Success
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    ConnectionAcknowledged { code: ConnectReturnCode },
    MessageReceived { topic: String, payload: bytes::Bytes },
    Disconnected,
    SubscriptionConfirmed { packet_id: u16, failures: usize },
    /// PingResp, PubAck and friends
    InfrastructureEvent(String),
    OutgoingEvent,
}
