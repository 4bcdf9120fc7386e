//! Impure I/O operations for the MQTT client
//!
//! The rumqttc event loop is owned by the client and polled only from
//! [`MqttClient::pump`], on the caller's task.

use super::connection::{
    classify_connection_error, configure_mqtt_options, generate_client_id, refused,
    ConnectionState,
};
use super::message_handler::{EventRoute, MessageHandler};
use crate::protocol::topics::subscription_filters;
use crate::transport::{BrokerEndpoint, InboundFrame, Transport, TransportError};
use async_trait::async_trait;
use chrono::Utc;
use rumqttc::{AsyncClient, EventLoop, QoS, SubscribeFilter};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};

/// Request channel capacity between the client handle and its event loop
const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// Time given to flush the DISCONNECT packet
const DISCONNECT_FLUSH: Duration = Duration::from_millis(500);

/// MQTT-over-WebSocket session to the Sydpower broker
pub struct MqttClient {
    client: Option<AsyncClient>,
    event_loop: Option<EventLoop>,
    state: ConnectionState,
    client_id: Option<String>,
    subscribed_devices: Vec<String>,
    connected_at: Option<Instant>,
    frames_received: u64,
}

impl MqttClient {
    pub fn new() -> Self {
        Self {
            client: None,
            event_loop: None,
            state: ConnectionState::Disconnected,
            client_id: None,
            subscribed_devices: Vec::new(),
            connected_at: None,
            frames_received: 0,
        }
    }

    pub fn connection_state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    pub fn subscribed_devices(&self) -> &[String] {
        &self.subscribed_devices
    }

    pub fn frames_received(&self) -> u64 {
        self.frames_received
    }

    /// Poll until ConnAck, bounded by the endpoint's connect timeout
    async fn wait_for_connack(
        event_loop: &mut EventLoop,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let result = tokio::time::timeout(timeout, async {
            loop {
                let event = event_loop
                    .poll()
                    .await
                    .map_err(|e| classify_connection_error(&e))?;

                if let EventRoute::ConnectionAcknowledged { code } =
                    MessageHandler::route_mqtt_event(&event)
                {
                    return if MessageHandler::connack_accepted(code) {
                        Ok(())
                    } else {
                        Err(refused(code))
                    };
                }
            }
        })
        .await;

        result.unwrap_or(Err(TransportError::ConnectTimeout(timeout)))
    }

    fn check_connected(&self) -> Result<&AsyncClient, TransportError> {
        match (&self.client, self.state.is_connected()) {
            (Some(client), true) => Ok(client),
            _ => Err(TransportError::NotConnected),
        }
    }

    fn mark_closed(&mut self, reason: String) {
        warn!(reason = %reason, "MQTT session closed");
        self.state = ConnectionState::Closed(reason);
    }
}

impl Default for MqttClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MqttClient {
    async fn connect(
        &mut self,
        endpoint: &BrokerEndpoint,
        mqtt_token: &str,
    ) -> Result<(), TransportError> {
        let client_id = generate_client_id();
        let options = configure_mqtt_options(endpoint, mqtt_token, &client_id)?;
        let (client, mut event_loop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);

        self.state = ConnectionState::Connecting;
        debug!(client_id = %client_id, "Connecting to MQTT broker");

        let span = crate::mqtt_span!(url = %endpoint.url, client_id = %client_id);
        if let Err(e) = Self::wait_for_connack(&mut event_loop, endpoint.connect_timeout)
            .instrument(span)
            .await
        {
            self.state = ConnectionState::Closed(e.to_string());
            return Err(e);
        }

        info!(client_id = %client_id, "MQTT connected");
        self.client = Some(client);
        self.event_loop = Some(event_loop);
        self.client_id = Some(client_id);
        self.subscribed_devices.clear();
        self.connected_at = Some(Instant::now());
        self.state = ConnectionState::Connected;
        Ok(())
    }

    async fn subscribe(&mut self, device_id: &str) -> Result<(), TransportError> {
        let client = self.check_connected()?;
        let filters: Vec<SubscribeFilter> = subscription_filters(device_id)
            .into_iter()
            .map(|filter| SubscribeFilter::new(filter, QoS::AtMostOnce))
            .collect();

        client
            .subscribe_many(filters)
            .await
            .map_err(|e| TransportError::SubscriptionFailed(e.to_string()))?;

        debug!(device_id = %device_id, "Subscribed to device topics");
        if !self.subscribed_devices.iter().any(|d| d == device_id) {
            self.subscribed_devices.push(device_id.to_string());
        }
        Ok(())
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
    ) -> Result<(), TransportError> {
        let client = self.check_connected()?;
        client
            .publish(topic, qos, false, payload)
            .await
            .map_err(|e| TransportError::PublishFailed {
                topic: topic.to_string(),
                message: e.to_string(),
            })?;

        debug!(topic = %topic, "Queued publish");
        Ok(())
    }

    async fn pump(&mut self, timeout: Duration) -> Result<Vec<InboundFrame>, TransportError> {
        if !self.state.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let event_loop = self
            .event_loop
            .as_mut()
            .ok_or(TransportError::NotConnected)?;

        let deadline = Instant::now() + timeout;
        let mut frames = Vec::new();
        let mut closed: Option<(String, Option<TransportError>)> = None;

        while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
            if remaining.is_zero() {
                break;
            }

            let event = match tokio::time::timeout(remaining, event_loop.poll()).await {
                Err(_elapsed) => break,
                Ok(Err(e)) => {
                    closed = Some((e.to_string(), Some(classify_connection_error(&e))));
                    break;
                }
                Ok(Ok(event)) => event,
            };

            match MessageHandler::route_mqtt_event(&event) {
                EventRoute::MessageReceived { topic, payload } => {
                    frames.push(InboundFrame {
                        topic,
                        payload,
                        received_at: Utc::now(),
                    });
                }
                EventRoute::SubscriptionConfirmed {
                    packet_id,
                    failures,
                } if failures > 0 => {
                    warn!(packet_id, failures, "Broker rejected topic filters");
                }
                EventRoute::Disconnected => {
                    closed = Some(("broker sent DISCONNECT".to_string(), None));
                    break;
                }
                _ => {}
            }
        }

        self.frames_received += frames.len() as u64;

        if let Some((reason, error)) = closed {
            self.mark_closed(reason.clone());
            // Frames already read are still delivered; the next pump reports the failure
            if frames.is_empty() {
                return Err(error.unwrap_or(TransportError::ConnectionFailed(reason)));
            }
        }

        Ok(frames)
    }

    fn is_healthy(&self) -> bool {
        self.state.is_connected() && self.client.is_some()
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        if let (Some(client), true) = (&self.client, self.state.is_connected()) {
            if let Err(e) = client.disconnect().await {
                debug!(error = %e, "Disconnect request not queued");
            } else if let Some(event_loop) = self.event_loop.as_mut() {
                // Flush until the DISCONNECT leaves or the loop ends
                let _ = tokio::time::timeout(DISCONNECT_FLUSH, async {
                    while event_loop.poll().await.is_ok() {}
                })
                .await;
            }
            info!(
                uptime_ms = self
                    .connected_at
                    .map(|at| at.elapsed().as_millis() as u64)
                    .unwrap_or(0),
                "MQTT disconnected"
            );
        }

        self.client = None;
        self.event_loop = None;
        self.subscribed_devices.clear();
        self.state = ConnectionState::Disconnected;
        Ok(())
    }
}
