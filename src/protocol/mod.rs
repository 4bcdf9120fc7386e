//! Sydpower binary register protocol
//!
//! Commands are single Modbus register writes (or one settings read) framed
//! for the device's MQTT request topic; telemetry arrives as raw register dumps
//! that [`codec::decode`] turns into partial [`DeviceState`] updates.

pub mod codec;
pub mod command;
pub mod modbus;
pub mod state;
pub mod topics;

pub use codec::{decode, encode, merge_frame};
pub use command::{Command, CommandKind};
pub use state::{
    percent_to_raw, raw_to_percent, soc_from_raw, DeviceReadings, DeviceState, StateField,
    StateUpdate,
};
pub use topics::{TopicVariant, REQUEST_SUFFIX};

use serde::Serialize;
use thiserror::Error;

/// Frame-level decode failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Frame too short: {len} bytes, need at least {min}")]
    FrameTooShort { len: usize, min: usize },

    #[error("Topic does not name a device: '{topic}'")]
    UnroutableTopic { topic: String },
}

/// Reasons a command never leaves the codec
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommandRejected {
    #[error("'{name}' is not a whitelisted command")]
    NotWhitelisted { name: String },

    #[error("{command} requires a value")]
    MissingValue { command: String },

    #[error("{command} value {value} outside {min}..={max}")]
    OutOfRange {
        command: String,
        value: u16,
        min: u16,
        max: u16,
    },
}
