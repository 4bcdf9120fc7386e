//! Mock implementations for testing
//!
//! Provides mock Transport, CloudApi and ClientFactory implementations plus a
//! register-level device simulator, so the client stack can be exercised
//! without a broker or the cloud backend.

use super::frames::RegisterDump;
use super::jwt_with_claims;
use crate::api::{ApiError, CloudApi, DeviceRecord};
use crate::auth::{AuthSession, Credential, TokenCache};
use crate::config::DeviceLimits;
use crate::device::DeviceClient;
use crate::error::SydpowerResult;
use crate::pool::ClientFactory;
use crate::protocol::modbus::{self, bits, registers as reg, FN_READ_HOLDING, FN_WRITE_SINGLE};
use crate::transport::{BrokerEndpoint, InboundFrame, QoS, Transport, TransportError};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Device id used throughout the test suite
pub const TEST_DEVICE: &str = "7C2C67AB5F0E";

pub type PublishedMessage = (String, Vec<u8>);

/// Synchronous hook run on every publish; returned frames are queued inbound
pub type Responder = Arc<dyn Fn(&str, &[u8]) -> Vec<InboundFrame> + Send + Sync>;

#[derive(Default)]
struct TransportState {
    published: Mutex<Vec<PublishedMessage>>,
    subscriptions: Mutex<Vec<String>>,
    inbound: Mutex<VecDeque<InboundFrame>>,
    responder: Mutex<Option<Responder>>,
    connect_failures: Mutex<VecDeque<TransportError>>,
    connect_tokens: Mutex<Vec<String>>,
    connected: AtomicBool,
    connect_calls: AtomicUsize,
    fail_publish: AtomicBool,
}

/// Mock transport for testing.
///
/// Clones share state, so a test keeps one handle while the client owns
/// another.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<TransportState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn published(&self) -> Vec<PublishedMessage> {
        self.state.published.lock().await.clone()
    }

    pub async fn clear_published(&self) {
        self.state.published.lock().await.clear();
    }

    pub async fn subscriptions(&self) -> Vec<String> {
        self.state.subscriptions.lock().await.clone()
    }

    /// Queue a frame for the next pump
    pub async fn push_frame(&self, topic: impl Into<String>, payload: Vec<u8>) {
        self.state
            .inbound
            .lock()
            .await
            .push_back(InboundFrame::new(topic, payload));
    }

    pub async fn set_responder(&self, responder: Responder) {
        *self.state.responder.lock().await = Some(responder);
    }

    pub async fn clear_responder(&self) {
        *self.state.responder.lock().await = None;
    }

    pub async fn fail_next_connect(&self, error: TransportError) {
        self.state.connect_failures.lock().await.push_back(error);
    }

    pub fn set_fail_publish(&self, fail: bool) {
        self.state.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Simulate the broker dropping the session
    pub fn drop_connection(&self) {
        self.state.connected.store(false, Ordering::SeqCst);
    }

    pub fn connect_calls(&self) -> usize {
        self.state.connect_calls.load(Ordering::SeqCst)
    }

    /// Broker tokens presented on each connect, in order
    pub async fn connect_tokens(&self) -> Vec<String> {
        self.state.connect_tokens.lock().await.clone()
    }

    async fn drain_inbound(&self) -> Vec<InboundFrame> {
        self.state.inbound.lock().await.drain(..).collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(
        &mut self,
        _endpoint: &BrokerEndpoint,
        mqtt_token: &str,
    ) -> Result<(), TransportError> {
        self.state.connect_calls.fetch_add(1, Ordering::SeqCst);
        self.state
            .connect_tokens
            .lock()
            .await
            .push(mqtt_token.to_string());

        if let Some(error) = self.state.connect_failures.lock().await.pop_front() {
            return Err(error);
        }

        self.state.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&mut self, device_id: &str) -> Result<(), TransportError> {
        if !self.is_healthy() {
            return Err(TransportError::NotConnected);
        }
        let mut subscriptions = self.state.subscriptions.lock().await;
        if !subscriptions.iter().any(|d| d == device_id) {
            subscriptions.push(device_id.to_string());
        }
        Ok(())
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        _qos: QoS,
    ) -> Result<(), TransportError> {
        if !self.is_healthy() {
            return Err(TransportError::NotConnected);
        }
        if self.state.fail_publish.load(Ordering::SeqCst) {
            return Err(TransportError::PublishFailed {
                topic: topic.to_string(),
                message: "Mock publish failure".to_string(),
            });
        }

        let responder = self.state.responder.lock().await.clone();
        if let Some(responder) = responder {
            let frames = responder(topic, &payload);
            self.state.inbound.lock().await.extend(frames);
        }

        self.state
            .published
            .lock()
            .await
            .push((topic.to_string(), payload));
        Ok(())
    }

    async fn pump(&mut self, timeout: Duration) -> Result<Vec<InboundFrame>, TransportError> {
        if !self.is_healthy() {
            return Err(TransportError::NotConnected);
        }

        let frames = self.drain_inbound().await;
        if !frames.is_empty() {
            return Ok(frames);
        }

        tokio::time::sleep(timeout).await;
        Ok(self.drain_inbound().await)
    }

    fn is_healthy(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.state.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Register-level stand-in for a power station.
///
/// Writes land in the register bank; every request is answered with a full
/// dump on `client/04`.
#[derive(Clone)]
pub struct DeviceSimulator {
    device_id: String,
    registers: Arc<std::sync::Mutex<RegisterDump>>,
    silent: Arc<AtomicBool>,
}

impl DeviceSimulator {
    pub fn new(device_id: impl Into<String>) -> Self {
        let mut dump = RegisterDump::full();
        dump.set(reg::TOTAL_INPUT, 120)
            .set(reg::TOTAL_OUTPUT, 80)
            .set(reg::STATE_OF_CHARGE, 750)
            .set(reg::MAX_CHARGE_CURRENT as usize, 10)
            .set(reg::DISCHARGE_LOWER_LIMIT as usize, 100)
            .set(reg::CHARGE_UPPER_LIMIT as usize, 1000);

        Self {
            device_id: device_id.into(),
            registers: Arc::new(std::sync::Mutex::new(dump)),
            silent: Arc::new(AtomicBool::new(false)),
        }
    }

    fn with_registers<T>(&self, f: impl FnOnce(&mut RegisterDump) -> T) -> T {
        let mut guard = self
            .registers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }

    pub fn set(&self, index: usize, value: u16) {
        self.with_registers(|dump| {
            dump.set(index, value);
        });
    }

    pub fn register(&self, index: usize) -> u16 {
        self.with_registers(|dump| dump.registers()[index])
    }

    /// Stop answering requests
    pub fn set_silent(&self, silent: bool) {
        self.silent.store(silent, Ordering::SeqCst);
    }

    fn apply_write(dump: &mut RegisterDump, register: u16, value: u16) {
        let output_bit = match register {
            reg::AC_OUTPUT => Some(bits::AC),
            reg::DC_OUTPUT => Some(bits::DC),
            reg::USB_OUTPUT => Some(bits::USB),
            _ => None,
        };

        match output_bit {
            Some(bit) => {
                let mask = dump.registers()[reg::OUTPUT_BITMASK];
                let mask = if value == 1 {
                    mask | (1 << bit)
                } else {
                    mask & !(1 << bit)
                };
                dump.set(reg::OUTPUT_BITMASK, mask);
            }
            None => {
                dump.set(usize::from(register), value);
            }
        }
    }

    /// Answer one request frame
    pub fn handle(&self, topic: &str, payload: &[u8]) -> Vec<InboundFrame> {
        if self.silent.load(Ordering::SeqCst) || !topic.starts_with(&self.device_id) {
            return Vec::new();
        }
        if payload.len() < 6 || payload[0] != modbus::DEVICE_ADDRESS {
            return Vec::new();
        }

        let frame = self.with_registers(|dump| {
            match payload[1] {
                FN_WRITE_SINGLE => {
                    let register = modbus::high_low_to_int(payload[2], payload[3]);
                    let value = modbus::high_low_to_int(payload[4], payload[5]);
                    Self::apply_write(dump, register, value);
                }
                FN_READ_HOLDING => {}
                _ => return None,
            }
            Some(dump.to_frame())
        });

        frame
            .map(|frame| {
                vec![InboundFrame::new(
                    format!("{}/device/response/client/04", self.device_id),
                    frame,
                )]
            })
            .unwrap_or_default()
    }

    pub fn responder(&self) -> Responder {
        let simulator = self.clone();
        Arc::new(move |topic: &str, payload: &[u8]| simulator.handle(topic, payload))
    }
}

#[derive(Default)]
struct ApiCounters {
    authorize: AtomicUsize,
    login: AtomicUsize,
    mqtt: AtomicUsize,
    device_list: AtomicUsize,
}

/// Mock cloud backend.
///
/// Logins hand out `access-token-N`; broker tokens are JWTs expiring a day
/// ahead, each with a distinct `jti`.
pub struct MockCloudApi {
    counters: ApiCounters,
    devices: Mutex<Vec<DeviceRecord>>,
    login_failures: Mutex<VecDeque<ApiError>>,
    device_list_failures: Mutex<VecDeque<ApiError>>,
}

impl Default for MockCloudApi {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCloudApi {
    pub fn new() -> Self {
        Self::with_devices(vec![DeviceRecord::new("7C:2C:67:AB:5F:0E", "F2400")])
    }

    pub fn with_devices(devices: Vec<DeviceRecord>) -> Self {
        Self {
            counters: ApiCounters::default(),
            devices: Mutex::new(devices),
            login_failures: Mutex::new(VecDeque::new()),
            device_list_failures: Mutex::new(VecDeque::new()),
        }
    }

    pub async fn fail_next_login(&self, error: ApiError) {
        self.login_failures.lock().await.push_back(error);
    }

    pub async fn fail_next_device_list(&self, error: ApiError) {
        self.device_list_failures.lock().await.push_back(error);
    }

    pub fn authorize_calls(&self) -> usize {
        self.counters.authorize.load(Ordering::SeqCst)
    }

    pub fn login_calls(&self) -> usize {
        self.counters.login.load(Ordering::SeqCst)
    }

    pub fn mqtt_calls(&self) -> usize {
        self.counters.mqtt.load(Ordering::SeqCst)
    }

    pub fn device_list_calls(&self) -> usize {
        self.counters.device_list.load(Ordering::SeqCst)
    }

    pub fn total_calls(&self) -> usize {
        self.authorize_calls() + self.login_calls() + self.mqtt_calls() + self.device_list_calls()
    }
}

#[async_trait]
impl CloudApi for MockCloudApi {
    async fn anonymous_authorize(&self) -> Result<String, ApiError> {
        let n = self.counters.authorize.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("authorize-token-{n}"))
    }

    async fn login(
        &self,
        _authorize_token: &str,
        _credential: &Credential,
    ) -> Result<String, ApiError> {
        let n = self.counters.login.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(error) = self.login_failures.lock().await.pop_front() {
            return Err(error);
        }
        Ok(format!("access-token-{n}"))
    }

    async fn mqtt_token(
        &self,
        _authorize_token: Option<&str>,
        _access_token: &str,
    ) -> Result<String, ApiError> {
        let n = self.counters.mqtt.fetch_add(1, Ordering::SeqCst) + 1;
        let exp = (Utc::now() + ChronoDuration::hours(24)).timestamp();
        Ok(jwt_with_claims(&json!({ "exp": exp, "jti": n })))
    }

    async fn device_list(
        &self,
        _authorize_token: Option<&str>,
        _access_token: &str,
    ) -> Result<Vec<DeviceRecord>, ApiError> {
        self.counters.device_list.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.device_list_failures.lock().await.pop_front() {
            return Err(error);
        }
        Ok(self.devices.lock().await.clone())
    }
}

/// Build an unconnected client backed by the given mocks
pub fn mock_client(
    cache_dir: &Path,
    credential: Credential,
    transport: MockTransport,
    api: Arc<MockCloudApi>,
) -> DeviceClient {
    let cache = TokenCache::new(cache_dir, &credential);
    let session = AuthSession::new(credential, api, cache);
    DeviceClient::new(
        session,
        Box::new(transport),
        BrokerEndpoint::default(),
        DeviceLimits::default(),
    )
}

/// Authenticated, device-listed, broker-connected client
pub async fn connected_client(
    cache_dir: &Path,
    transport: MockTransport,
    api: Arc<MockCloudApi>,
) -> SydpowerResult<DeviceClient> {
    let credential = Credential::new("user@example.com", "pw");
    let mut client = mock_client(cache_dir, credential, transport, api);
    client.authenticate().await?;
    client.get_devices(false).await?;
    client.connect_mqtt().await?;
    Ok(client)
}

/// Client factory handing out mock-backed clients.
///
/// Every client gets a fresh [`MockTransport`] answered by the shared
/// [`DeviceSimulator`].
pub struct MockClientFactory {
    cache_dir: PathBuf,
    api: Arc<MockCloudApi>,
    simulator: DeviceSimulator,
    transports: std::sync::Mutex<Vec<MockTransport>>,
    connect_failures: std::sync::Mutex<VecDeque<TransportError>>,
    created: AtomicUsize,
}

impl MockClientFactory {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            api: Arc::new(MockCloudApi::new()),
            simulator: DeviceSimulator::new(TEST_DEVICE),
            transports: std::sync::Mutex::new(Vec::new()),
            connect_failures: std::sync::Mutex::new(VecDeque::new()),
            created: AtomicUsize::new(0),
        }
    }

    pub fn api(&self) -> Arc<MockCloudApi> {
        Arc::clone(&self.api)
    }

    pub fn simulator(&self) -> &DeviceSimulator {
        &self.simulator
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Queue a broker connect failure for the next client created
    pub fn fail_next_connect(&self, error: TransportError) {
        self.connect_failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(error);
    }

    /// Transports of every client created so far
    pub fn transports(&self) -> Vec<MockTransport> {
        self.transports
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl ClientFactory for MockClientFactory {
    async fn create(&self, credential: &Credential) -> SydpowerResult<DeviceClient> {
        self.created.fetch_add(1, Ordering::SeqCst);

        let transport = MockTransport::new();
        transport.set_responder(self.simulator.responder()).await;
        let failure = self
            .connect_failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front();
        if let Some(error) = failure {
            transport.fail_next_connect(error).await;
        }
        self.transports
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(transport.clone());

        Ok(mock_client(
            &self.cache_dir,
            credential.clone(),
            transport,
            self.api(),
        ))
    }
}
