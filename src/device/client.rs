//! Device client: one account session, one broker session, the state table

use crate::api::DeviceRecord;
use crate::auth::{AuthSession, AuthTokens};
use crate::config::DeviceLimits;
use crate::error::{SydpowerError, SydpowerResult};
use crate::protocol::topics::{device_id_from_topic, request_topic};
use crate::protocol::{encode, merge_frame, Command, CommandRejected, DeviceState, TopicVariant};
use crate::transport::{BrokerEndpoint, InboundFrame, QoS, Transport, TransportError};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Chunk size used by the waiting helpers
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// Reachability probe budget
pub const QUICK_PING_TIMEOUT: Duration = Duration::from_secs(1);

/// Most recent frame seen on any topic
#[derive(Debug, Clone, PartialEq)]
pub struct LastResponse {
    pub topic: String,
    pub payload: Bytes,
    pub received_at: DateTime<Utc>,
}

pub struct DeviceClient {
    session: AuthSession,
    transport: Box<dyn Transport>,
    endpoint: BrokerEndpoint,
    limits: DeviceLimits,
    devices: Vec<DeviceRecord>,
    states: HashMap<String, DeviceState>,
    last_response: Option<LastResponse>,
    response_received: bool,
}

impl DeviceClient {
    pub fn new(
        session: AuthSession,
        transport: Box<dyn Transport>,
        endpoint: BrokerEndpoint,
        limits: DeviceLimits,
    ) -> Self {
        Self {
            session,
            transport,
            endpoint,
            limits,
            devices: Vec::new(),
            states: HashMap::new(),
            last_response: None,
            response_received: false,
        }
    }

    pub fn session(&self) -> &AuthSession {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut AuthSession {
        &mut self.session
    }

    pub fn limits(&self) -> &DeviceLimits {
        &self.limits
    }

    pub async fn authenticate(&mut self) -> SydpowerResult<AuthTokens> {
        self.session.authenticate().await
    }

    /// Device list, fetched through the retrying API wrapper unless already known
    pub async fn get_devices(&mut self, force: bool) -> SydpowerResult<Vec<DeviceRecord>> {
        if !force && !self.devices.is_empty() {
            return Ok(self.devices.clone());
        }

        let devices = self
            .session
            .api_call_with_retry(|api, context| async move {
                api.device_list(context.authorize_token(), &context.tokens.access_token)
                    .await
                    .map_err(SydpowerError::from)
            })
            .await?;

        info!(count = devices.len(), "Fetched device list");
        self.set_devices(devices.clone());
        Ok(devices)
    }

    pub fn set_devices(&mut self, devices: Vec<DeviceRecord>) {
        self.devices = devices;
    }

    pub fn devices(&self) -> &[DeviceRecord] {
        &self.devices
    }

    pub fn device_ids(&self) -> Vec<String> {
        self.devices.iter().map(|d| d.device_id.clone()).collect()
    }

    fn ensure_known(&self, device_id: &str) -> SydpowerResult<()> {
        if self.devices.iter().any(|d| d.device_id == device_id) {
            Ok(())
        } else {
            Err(SydpowerError::unknown_device(device_id))
        }
    }

    /// Connect the broker session and subscribe every known device.
    ///
    /// A connect refused for bad credentials triggers one silent
    /// re-authentication and a second attempt.
    pub async fn connect_mqtt(&mut self) -> SydpowerResult<()> {
        let tokens = match self.session.tokens() {
            Some(tokens) => tokens.clone(),
            None => self.session.authenticate().await?,
        };

        if let Err(e) = self
            .transport
            .connect(&self.endpoint, &tokens.mqtt_access_token)
            .await
        {
            if !e.is_auth_failure() {
                return Err(e.into());
            }
            warn!(error = %e, "Broker rejected token");
            let tokens = self.session.reauthenticate().await?;
            self.transport
                .connect(&self.endpoint, &tokens.mqtt_access_token)
                .await?;
        }

        for device_id in self.device_ids() {
            self.transport.subscribe(&device_id).await?;
        }

        info!(devices = self.devices.len(), "MQTT session ready");
        Ok(())
    }

    pub fn is_healthy(&self) -> bool {
        self.transport.is_healthy()
    }

    fn check_range(
        command: Command,
        value: u16,
        range: RangeInclusive<u16>,
    ) -> Result<(), CommandRejected> {
        if range.contains(&value) {
            Ok(())
        } else {
            Err(CommandRejected::OutOfRange {
                command: command.name().to_string(),
                value,
                min: *range.start(),
                max: *range.end(),
            })
        }
    }

    fn validate_value(&self, command: Command, value: Option<u16>) -> Result<(), CommandRejected> {
        let Some(value) = value else {
            return Ok(());
        };
        match command {
            Command::MaxChargeCurrent => {
                Self::check_range(command, value, self.limits.max_charge_current())
            }
            Command::ChargeUpperLimit => {
                Self::check_range(command, value, self.limits.charge_upper_limit())
            }
            Command::DischargeLowerLimit => {
                Self::check_range(command, value, self.limits.discharge_lower_limit())
            }
            _ => Ok(()),
        }
    }

    /// Encode and publish a command to `{device}/client/request/data`.
    ///
    /// Nothing reaches the transport unless the command encodes and its value
    /// is within the configured limits.
    pub async fn send_command(
        &mut self,
        device_id: &str,
        command: Command,
        value: Option<u16>,
    ) -> SydpowerResult<()> {
        self.ensure_known(device_id)?;
        self.validate_value(command, value)?;
        let payload = encode(command, value)?;

        if !self.transport.is_healthy() {
            return Err(TransportError::NotConnected.into());
        }

        let topic = request_topic(device_id);
        self.transport
            .publish(&topic, payload, QoS::AtLeastOnce)
            .await?;

        debug!(device_id = %device_id, command = %command, value = ?value, "Command published");
        Ok(())
    }

    /// Resolve a wire name through the whitelist, then send
    pub async fn send_named_command(
        &mut self,
        device_id: &str,
        name: &str,
        value: Option<u16>,
    ) -> SydpowerResult<()> {
        let command = Command::from_name(name)?;
        self.send_command(device_id, command, value).await
    }

    pub async fn request_device_settings(&mut self, device_id: &str) -> SydpowerResult<()> {
        self.send_command(device_id, Command::RequestSettings, None)
            .await
    }

    pub fn get_device_status(&self, device_id: &str) -> Option<&DeviceState> {
        self.states.get(device_id)
    }

    pub fn all_device_data(&self) -> &HashMap<String, DeviceState> {
        &self.states
    }

    pub fn last_response(&self) -> Option<&LastResponse> {
        self.last_response.as_ref()
    }

    pub fn has_received_response(&self) -> bool {
        self.response_received
    }

    fn handle_frame(&mut self, frame: InboundFrame) {
        self.response_received = true;
        self.last_response = Some(LastResponse {
            topic: frame.topic.clone(),
            payload: frame.payload.clone(),
            received_at: frame.received_at,
        });

        let variant = TopicVariant::classify(&frame.topic);
        if variant == TopicVariant::Error {
            warn!(topic = %frame.topic, bytes = frame.payload.len(), "Device reported an error");
            return;
        }
        if !variant.is_response() {
            return;
        }

        let Ok(device_id) = device_id_from_topic(&frame.topic) else {
            return;
        };
        let device_id = device_id.to_string();
        let prior = self.states.get(&device_id).cloned().unwrap_or_default();

        match merge_frame(&prior, &frame.topic, &frame.payload, frame.received_at) {
            Ok(next) => {
                self.states.insert(device_id, next);
            }
            Err(e) => {
                warn!(topic = %frame.topic, error = %e, "Dropping undecodable frame");
            }
        }
    }

    /// Drive the broker session for `timeout`, folding every frame into the
    /// state table. Returns the number of frames seen.
    pub async fn listen_for_updates(&mut self, timeout: Duration) -> SydpowerResult<usize> {
        let frames = self.transport.pump(timeout).await?;
        let count = frames.len();
        for frame in frames {
            self.handle_frame(frame);
        }
        Ok(count)
    }

    /// Pump until any frame arrives. `false` on timeout or when not connected.
    pub async fn wait_for_response(&mut self, timeout: Duration) -> SydpowerResult<bool> {
        if !self.transport.is_healthy() {
            return Ok(false);
        }

        self.response_received = false;
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            let slice = WAIT_SLICE.min(deadline - Instant::now());
            self.listen_for_updates(slice).await?;
            if self.response_received {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Pump until the device's state timestamp moves past its current value
    pub async fn wait_for_data_update(
        &mut self,
        device_id: &str,
        timeout: Duration,
    ) -> SydpowerResult<bool> {
        if !self.transport.is_healthy() {
            return Ok(false);
        }

        let initial = self.states.get(device_id).and_then(|s| s.last_update);
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            let slice = WAIT_SLICE.min(deadline - Instant::now());
            self.listen_for_updates(slice).await?;

            let current = self.states.get(device_id).and_then(|s| s.last_update);
            if current > initial {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Settings request plus a one second wait for any answer
    pub async fn quick_ping(&mut self, device_id: &str) -> SydpowerResult<bool> {
        self.response_received = false;
        self.request_device_settings(device_id).await?;
        self.wait_for_response(QUICK_PING_TIMEOUT).await
    }

    pub async fn disconnect(&mut self) -> SydpowerResult<()> {
        self.transport.disconnect().await?;
        Ok(())
    }

    pub fn clear_token_cache(&mut self) -> SydpowerResult<()> {
        self.session.clear_cache()
    }

    pub fn token_info(&self) -> String {
        self.session.cache().token_info()
    }
}
