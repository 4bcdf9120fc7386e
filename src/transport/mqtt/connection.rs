//! Pure connection state management for the MQTT client
//!
//! Option building and error classification live here so they can be tested
//! without a broker.

use crate::transport::{BrokerEndpoint, TransportError};
use rumqttc::{ConnectReturnCode, ConnectionError, MqttOptions, Transport as RumqttcTransport};
use url::Url;

/// Connection state for the MQTT client
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Never connected, or cleanly disconnected
    Disconnected,
    /// Waiting for ConnAck
    Connecting,
    /// ConnAck received, session usable
    Connected,
    /// Broker or socket closed the session
    Closed(String),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Unique client id per connection so parallel sessions never kick each other
pub fn generate_client_id() -> String {
    format!("client_{}", uuid::Uuid::new_v4().simple())
}

/// Build rumqttc options for a WebSocket broker session.
///
/// The broker token is the MQTT username; the password is the fixed value from
/// the endpoint.
pub fn configure_mqtt_options(
    endpoint: &BrokerEndpoint,
    mqtt_token: &str,
    client_id: &str,
) -> Result<MqttOptions, TransportError> {
    let url =
        Url::parse(&endpoint.url).map_err(|_| TransportError::InvalidBrokerUrl(endpoint.url.clone()))?;

    let secure = match url.scheme() {
        "ws" => false,
        "wss" => true,
        _ => return Err(TransportError::InvalidBrokerUrl(endpoint.url.clone())),
    };
    if url.host_str().is_none() {
        return Err(TransportError::InvalidBrokerUrl(endpoint.url.clone()));
    }
    let port = url
        .port()
        .unwrap_or(if secure { 443 } else { 80 });

    // With the websocket transport rumqttc takes the full URL as the host
    let mut options = MqttOptions::new(client_id, endpoint.url.clone(), port);
    options.set_transport(if secure {
        RumqttcTransport::wss_with_default_config()
    } else {
        RumqttcTransport::Ws
    });
    options.set_credentials(mqtt_token, endpoint.password.clone());
    options.set_keep_alive(endpoint.keep_alive);
    options.set_clean_session(true);

    Ok(options)
}

/// Map a rumqttc failure into the transport taxonomy
pub fn classify_connection_error(error: &ConnectionError) -> TransportError {
    match error {
        ConnectionError::ConnectionRefused(code) => refused(*code),
        other => TransportError::ConnectionFailed(other.to_string()),
    }
}

/// Non-success ConnAck codes; bad credentials count as auth failures
pub fn refused(code: ConnectReturnCode) -> TransportError {
    TransportError::Refused {
        reason: format!("{code:?}"),
        auth: matches!(
            code,
            ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn endpoint(url: &str) -> BrokerEndpoint {
        BrokerEndpoint {
            url: url.to_string(),
            password: "helloyou".to_string(),
            keep_alive: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_configure_ws_options() {
        let options = configure_mqtt_options(
            &endpoint("ws://mqtt.sydpower.com:8083/mqtt"),
            "token-abc",
            "client_1",
        )
        .unwrap();

        assert_eq!(options.client_id(), "client_1");
        assert_eq!(
            options.broker_address(),
            ("ws://mqtt.sydpower.com:8083/mqtt".to_string(), 8083)
        );
        assert_eq!(
            options.credentials(),
            Some(("token-abc".to_string(), "helloyou".to_string()))
        );
        assert_eq!(options.keep_alive(), Duration::from_secs(30));
    }

    #[test]
    fn test_invalid_broker_url() {
        for url in ["not a url", "tcp://host:1883", "mqtt://host"] {
            let result = configure_mqtt_options(&endpoint(url), "t", "c");
            assert!(
                matches!(result, Err(TransportError::InvalidBrokerUrl(_))),
                "url: {url}"
            );
        }
    }

    #[test]
    fn test_refused_classification() {
        assert!(refused(ConnectReturnCode::BadUserNamePassword).is_auth_failure());
        assert!(refused(ConnectReturnCode::NotAuthorized).is_auth_failure());
        assert!(!refused(ConnectReturnCode::ServiceUnavailable).is_auth_failure());

        let error = classify_connection_error(&ConnectionError::ConnectionRefused(
            ConnectReturnCode::NotAuthorized,
        ));
        assert!(error.is_auth_failure());
    }

    #[test]
    fn test_client_ids_are_unique() {
        assert_ne!(generate_client_id(), generate_client_id());
    }

    #[test]
    fn test_connection_state() {
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Closed("eof".to_string()).is_connected());
        assert_ne!(ConnectionState::Disconnected, ConnectionState::Connecting);
    }
}
