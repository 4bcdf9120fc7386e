//! Sydpower cloud client
//!
//! Client for the cloud protocol spoken by Sydpower-built portable power
//! stations (sold as Fossibot and others). Devices are reached through a
//! signed REST backend for authorization and an MQTT-over-WebSocket broker
//! that carries Modbus-style register frames.
//!
//! # Overview
//!
//! - [`auth`]: signed three-step handshake with an on-disk token cache
//! - [`protocol`]: whitelisted command encoding and telemetry decoding
//! - [`transport`]: caller-driven MQTT session
//! - [`device::DeviceClient`]: one account's session and device states
//! - [`pool::ConnectionPool`], [`semaphore::Semaphore`] and
//!   [`executor::CommandExecutor`]: safe reuse across concurrent callers
//! - [`validation::ResponseValidator`]: confirms commands from telemetry
//!
//! # Quick Start
//!
//! ```rust
//! use sydpower::protocol::{encode, Command};
//!
//! // Charge upper limit of 85 % travels as 850 tenths
//! let frame = encode(Command::ChargeUpperLimit, Some(85)).unwrap();
//! assert_eq!(&frame[..6], &[0x11, 0x06, 0x00, 0x43, 0x03, 0x52]);
//!
//! // Anything outside the whitelist never becomes a frame
//! assert!(Command::from_name("REGFactoryReset").is_err());
//! ```

pub mod api;
pub mod auth;
pub mod config;
pub mod device;
pub mod error;
pub mod executor;
pub mod observability;
pub mod pool;
pub mod protocol;
pub mod semaphore;
pub mod testing;
pub mod transport;
pub mod validation;

pub use auth::Credential;
pub use config::*;
pub use device::DeviceClient;
pub use error::{SydpowerError, SydpowerResult};
pub use executor::{CommandExecutor, CommandOutcome};
pub use pool::{ConnectionPool, PoolConfig};
pub use protocol::{Command, DeviceState, StateField};
pub use semaphore::Semaphore;
pub use transport::mqtt::MqttClient;
