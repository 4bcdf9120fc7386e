//! Construction of unconnected device clients

use crate::api::CloudApi;
use crate::auth::{AuthSession, Credential, TokenCache};
use crate::config::SydpowerConfig;
use crate::device::DeviceClient;
use crate::error::SydpowerResult;
use crate::transport::{BrokerEndpoint, MqttTransport};
use async_trait::async_trait;
use std::sync::Arc;

/// Builds a fresh, not yet authenticated client for one account.
///
/// The pool drives authentication, device discovery and the broker connect
/// itself so it can substitute its own caches.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn create(&self, credential: &Credential) -> SydpowerResult<DeviceClient>;
}

/// Production factory: shared REST client, MQTT-over-WebSocket transport
pub struct DefaultClientFactory {
    config: SydpowerConfig,
    api: Arc<dyn CloudApi>,
}

impl DefaultClientFactory {
    pub fn new(config: SydpowerConfig, api: Arc<dyn CloudApi>) -> Self {
        Self { config, api }
    }
}

#[async_trait]
impl ClientFactory for DefaultClientFactory {
    async fn create(&self, credential: &Credential) -> SydpowerResult<DeviceClient> {
        credential.validate()?;

        let cache = TokenCache::new(&self.config.cache.dir, credential);
        let session = AuthSession::new(credential.clone(), Arc::clone(&self.api), cache);

        Ok(DeviceClient::new(
            session,
            Box::new(MqttTransport::new()),
            BrokerEndpoint::from(&self.config.mqtt),
            self.config.limits.clone(),
        ))
    }
}
