//! Transport layer for device telemetry and commands
//!
//! The [`Transport`] trait is the seam between the device client and the MQTT
//! broker. There is no background receiver: inbound frames are only read when
//! the caller drives [`Transport::pump`], so everything that happens while a
//! command lock is held is observed in order by the lock holder.

use crate::config::MqttSection;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

pub mod mqtt;

pub use rumqttc::QoS;

/// Broker connection parameters, independent of the session token
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerEndpoint {
    /// Full WebSocket URL, e.g. `ws://mqtt.sydpower.com:8083/mqtt`
    pub url: String,
    pub password: String,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
}

impl From<&MqttSection> for BrokerEndpoint {
    fn from(section: &MqttSection) -> Self {
        Self {
            url: section.websocket_url(),
            password: section.password.clone(),
            keep_alive: section.keep_alive(),
            connect_timeout: section.connect_timeout(),
        }
    }
}

impl Default for BrokerEndpoint {
    fn default() -> Self {
        Self::from(&MqttSection::default())
    }
}

/// One message read off the broker during a pump
#[derive(Debug, Clone, PartialEq)]
pub struct InboundFrame {
    pub topic: String,
    pub payload: Bytes,
    pub received_at: DateTime<Utc>,
}

impl InboundFrame {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at: Utc::now(),
        }
    }
}

/// Broker session failures
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),

    #[error("Broker refused connection: {reason}")]
    Refused { reason: String, auth: bool },

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("Not connected")]
    NotConnected,

    #[error("Publishing to '{topic}' failed: {message}")]
    PublishFailed { topic: String, message: String },

    #[error("Subscription failed: {0}")]
    SubscriptionFailed(String),
}

impl TransportError {
    /// Broker rejected the session token
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, TransportError::Refused { auth: true, .. })
    }
}

/// Caller-driven MQTT session.
///
/// Only `Send`: the rumqttc event loop is not `Sync`, and a client is always
/// reached through a mutex.
#[async_trait]
pub trait Transport: Send {
    /// Open the session, authenticating with the broker token as username
    async fn connect(
        &mut self,
        endpoint: &BrokerEndpoint,
        mqtt_token: &str,
    ) -> Result<(), TransportError>;

    /// Subscribe to every response and diagnostic topic of one device
    async fn subscribe(&mut self, device_id: &str) -> Result<(), TransportError>;

    async fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
    ) -> Result<(), TransportError>;

    /// Drive the session for up to `timeout` and return every frame received.
    ///
    /// This is the only place inbound data is read.
    async fn pump(&mut self, timeout: Duration) -> Result<Vec<InboundFrame>, TransportError>;

    /// True while the broker session is established
    fn is_healthy(&self) -> bool;

    async fn disconnect(&mut self) -> Result<(), TransportError>;
}

/// Type alias for the production transport
pub type MqttTransport = mqtt::MqttClient;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_from_default_section() {
        let endpoint = BrokerEndpoint::default();
        assert_eq!(endpoint.url, "ws://mqtt.sydpower.com:8083/mqtt");
        assert_eq!(endpoint.password, "helloyou");
    }

    #[test]
    fn test_auth_classification() {
        let refused = TransportError::Refused {
            reason: "BadUserNamePassword".to_string(),
            auth: true,
        };
        assert!(refused.is_auth_failure());

        let unavailable = TransportError::Refused {
            reason: "ServiceUnavailable".to_string(),
            auth: false,
        };
        assert!(!unavailable.is_auth_failure());
        assert!(!TransportError::NotConnected.is_auth_failure());
    }
}
