//! Per-device MQTT topic layout
//!
//! Everything a device publishes is rooted at its normalized id:
//! `{id}/device/response/state`, `{id}/device/response/client/{kind}` and a
//! handful of error topics. Commands go to `{id}/client/request/data`.

use super::ProtocolError;

pub const REQUEST_SUFFIX: &str = "client/request/data";

/// Build the command topic for a device
pub fn request_topic(device_id: &str) -> String {
    format!("{device_id}/{REQUEST_SUFFIX}")
}

/// Topic filters subscribed for a device, response topics first
pub fn subscription_filters(device_id: &str) -> Vec<String> {
    [
        "device/response/state",
        "device/response/client/+",
        "device/error/+",
        "error/+",
        "+/error",
        "+",
    ]
    .iter()
    .map(|suffix| format!("{device_id}/{suffix}"))
    .collect()
}

/// What kind of payload a topic carries
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicVariant {
    /// `device/response/state`
    State,
    /// `device/response/client/04`, the periodic full telemetry dump
    Client04,
    /// `device/response/client/data`, the settings block
    ClientData,
    /// any other `device/response/client/{kind}`
    Client(String),
    /// any topic mentioning `error`
    Error,
    /// catch-all, not decoded
    Other,
}

impl TopicVariant {
    pub fn classify(topic: &str) -> Self {
        if topic.contains("error") {
            return TopicVariant::Error;
        }

        let rest = match topic.split_once('/') {
            Some((_, rest)) => rest,
            None => return TopicVariant::Other,
        };

        if rest == "device/response/state" {
            return TopicVariant::State;
        }

        match rest.strip_prefix("device/response/client/") {
            Some("04") => TopicVariant::Client04,
            Some("data") => TopicVariant::ClientData,
            Some(kind) => TopicVariant::Client(kind.to_string()),
            None => TopicVariant::Other,
        }
    }

    /// Telemetry variants that can carry a full 81 register dump
    pub fn is_full_dump(&self) -> bool {
        matches!(self, TopicVariant::State | TopicVariant::Client04)
    }

    /// Whether frames on this variant are decoded at all
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            TopicVariant::State
                | TopicVariant::Client04
                | TopicVariant::ClientData
                | TopicVariant::Client(_)
        )
    }
}

/// First topic segment, which is always the normalized device id
pub fn device_id_from_topic(topic: &str) -> Result<&str, ProtocolError> {
    match topic.split('/').next() {
        Some(id) if !id.is_empty() && id != topic => Ok(id),
        _ => Err(ProtocolError::UnroutableTopic {
            topic: topic.to_string(),
        }),
    }
}
