//! MQTT-over-WebSocket transport for the Sydpower broker
//!
//! - [`connection`] - option building and error classification (pure)
//! - [`message_handler`] - event routing (pure)
//! - [`client`] - the session itself, driven by the caller through `pump`

pub mod client;
pub mod connection;
pub mod message_handler;

pub use client::MqttClient;
pub use connection::{configure_mqtt_options, ConnectionState};
pub use message_handler::{EventRoute, MessageHandler};
