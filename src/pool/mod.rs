//! Connection pool
//!
//! Authentication and device discovery are the expensive steps of bringing up
//! a client, so the pool keeps connected clients per `(account, consumer)` for
//! a short TTL and caches tokens and device lists for much longer. Broker
//! sessions themselves are never kept past the TTL.
//!
//! A per-key lock keeps two callers from racing to use or build the same
//! entry. It is deliberately narrower than the command-scoped semaphore the
//! executor holds.

pub mod factory;

pub use factory::{ClientFactory, DefaultClientFactory};

use crate::api::DeviceRecord;
use crate::auth::{AuthTokens, Credential};
use crate::config::PoolSection;
use crate::device::DeviceClient;
use crate::error::SydpowerResult;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};

/// A pooled client; lock it for the duration of one operation
pub type SharedClient = Arc<Mutex<DeviceClient>>;

#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    pub ttl: Duration,
    pub lock_window: Duration,
    pub lock_wait: Duration,
    pub lock_poll: Duration,
    pub max_idle: Duration,
    pub token_ttl: Duration,
    pub device_ttl: Duration,
}

impl From<&PoolSection> for PoolConfig {
    fn from(section: &PoolSection) -> Self {
        Self {
            ttl: Duration::from_secs(section.ttl_secs),
            lock_window: Duration::from_secs(section.lock_window_secs),
            lock_wait: Duration::from_secs(section.lock_wait_secs),
            lock_poll: Duration::from_millis(section.lock_poll_ms),
            max_idle: Duration::from_secs(section.max_idle_secs),
            token_ttl: Duration::from_secs(section.token_ttl_secs),
            device_ttl: Duration::from_secs(section.device_ttl_secs),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::from(&PoolSection::default())
    }
}

/// Pool key: sha256 of `username_consumer`
pub fn pool_key(credential: &Credential, consumer: &str) -> String {
    let digest = Sha256::digest(format!("{}_{}", credential.username(), consumer).as_bytes());
    hex::encode(digest)
}

/// Handle returned by [`ConnectionPool::get_connection`]
#[derive(Clone)]
pub struct PooledConnection {
    key: String,
    consumer: String,
    client: SharedClient,
    reuses: u32,
}

impl PooledConnection {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    pub fn client(&self) -> SharedClient {
        Arc::clone(&self.client)
    }

    /// How many times the entry had been handed out before; 0 when fresh
    pub fn reuses(&self) -> u32 {
        self.reuses
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("key", &&self.key[..self.key.len().min(12)])
            .field("consumer", &self.consumer)
            .field("reuses", &self.reuses)
            .finish()
    }
}

struct PoolEntry {
    client: SharedClient,
    consumer: String,
    created_at: Instant,
    last_used: Instant,
    reuses: u32,
}

impl PoolEntry {
    fn is_healthy(&self, now: Instant, ttl: Duration) -> bool {
        if now.duration_since(self.created_at) >= ttl {
            return false;
        }
        // A client locked by someone else cannot be handed out anyway
        self.client
            .try_lock()
            .map(|client| client.is_healthy())
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone)]
struct KeyLock {
    consumer: String,
    taken_at: Instant,
}

#[derive(Default)]
struct PoolState {
    entries: HashMap<String, PoolEntry>,
    locks: HashMap<String, KeyLock>,
    tokens: HashMap<String, (AuthTokens, Instant)>,
    devices: HashMap<String, (Vec<DeviceRecord>, Instant)>,
}

impl PoolState {
    fn lock_active(&self, key: &str, now: Instant, window: Duration) -> bool {
        self.locks
            .get(key)
            .is_some_and(|lock| now.duration_since(lock.taken_at) < window)
    }

    fn take_lock(&mut self, key: &str, consumer: &str, now: Instant) {
        self.locks.insert(
            key.to_string(),
            KeyLock {
                consumer: consumer.to_string(),
                taken_at: now,
            },
        );
    }

    fn cached_tokens(&self, account: &str, now: Instant) -> Option<AuthTokens> {
        self.tokens
            .get(account)
            .filter(|(_, expires)| now < *expires)
            .map(|(tokens, _)| tokens.clone())
    }

    fn cached_devices(&self, key: &str, now: Instant) -> Option<Vec<DeviceRecord>> {
        self.devices
            .get(key)
            .filter(|(_, expires)| now < *expires)
            .map(|(devices, _)| devices.clone())
    }
}

enum Claim {
    Reuse(PooledConnection),
    Create { stale: Option<PoolEntry> },
    Wait,
}

/// Per-entry view for [`PoolStats`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntryStats {
    pub consumer: String,
    pub age_secs: u64,
    pub idle_secs: u64,
    pub reuses: u32,
    pub locked: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStats {
    pub total_connections: usize,
    pub active_locks: usize,
    pub cached_tokens: usize,
    pub cached_device_lists: usize,
    pub connections: Vec<EntryStats>,
}

pub struct ConnectionPool {
    config: PoolConfig,
    factory: Arc<dyn ClientFactory>,
    state: Mutex<PoolState>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig, factory: Arc<dyn ClientFactory>) -> Self {
        Self {
            config,
            factory,
            state: Mutex::new(PoolState::default()),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// A healthy pooled client for `(credential, consumer)`, or a new one.
    ///
    /// If another caller holds the key, waits up to the lock wait for it and
    /// then falls back to a detached fresh connection instead of deadlocking.
    pub async fn get_connection(
        &self,
        credential: &Credential,
        consumer: &str,
    ) -> SydpowerResult<PooledConnection> {
        let key = pool_key(credential, consumer);
        let span = crate::pool_span!(consumer = %consumer);

        async {
            match self.claim(&key, consumer).await {
                Claim::Reuse(connection) => Ok(connection),
                Claim::Create { stale } => {
                    self.create_connection(credential, consumer, &key, stale)
                        .await
                }
                Claim::Wait => self.wait_for_connection(credential, consumer, &key).await,
            }
        }
        .instrument(span)
        .await
    }

    /// Check the lock and entry for `key` and take the lock if it is free
    async fn claim(&self, key: &str, consumer: &str) -> Claim {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        if state.lock_active(key, now, self.config.lock_window) {
            return Claim::Wait;
        }
        state.take_lock(key, consumer, now);

        let healthy = state
            .entries
            .get(key)
            .map(|entry| entry.is_healthy(now, self.config.ttl));

        match healthy {
            Some(true) => {
                let Some(entry) = state.entries.get_mut(key) else {
                    return Claim::Create { stale: None };
                };
                entry.reuses += 1;
                entry.last_used = now;
                entry.consumer = consumer.to_string();
                info!(reuses = entry.reuses, "Reusing pooled connection");
                Claim::Reuse(PooledConnection {
                    key: key.to_string(),
                    consumer: consumer.to_string(),
                    client: Arc::clone(&entry.client),
                    reuses: entry.reuses,
                })
            }
            Some(false) => {
                info!("Pooled connection unhealthy, replacing it");
                Claim::Create {
                    stale: state.entries.remove(key),
                }
            }
            None => Claim::Create { stale: None },
        }
    }

    async fn wait_for_connection(
        &self,
        credential: &Credential,
        consumer: &str,
        key: &str,
    ) -> SydpowerResult<PooledConnection> {
        let deadline = Instant::now() + self.config.lock_wait;

        while Instant::now() < deadline {
            tokio::time::sleep(self.config.lock_poll).await;
            match self.claim(key, consumer).await {
                Claim::Wait => continue,
                Claim::Reuse(connection) => return Ok(connection),
                Claim::Create { stale } => {
                    return self
                        .create_connection(credential, consumer, key, stale)
                        .await
                }
            }
        }

        warn!(
            waited_ms = self.config.lock_wait.as_millis() as u64,
            "Pool lock wait timed out, creating a detached connection"
        );
        let detached = format!("{key}_timeout");
        let stale = {
            let mut state = self.state.lock().await;
            state.take_lock(&detached, consumer, Instant::now());
            state.entries.remove(&detached)
        };
        self.create_connection(credential, consumer, &detached, stale)
            .await
    }

    /// Build, authenticate and connect a new client under `key`.
    ///
    /// The caller already holds the key's lock; it is dropped again on failure.
    async fn create_connection(
        &self,
        credential: &Credential,
        consumer: &str,
        key: &str,
        stale: Option<PoolEntry>,
    ) -> SydpowerResult<PooledConnection> {
        if let Some(stale) = stale {
            Self::teardown(stale).await;
        }

        match self.build_client(credential, key).await {
            Ok(client) => {
                let client = Arc::new(Mutex::new(client));
                let now = Instant::now();
                let mut state = self.state.lock().await;
                state.entries.insert(
                    key.to_string(),
                    PoolEntry {
                        client: Arc::clone(&client),
                        consumer: consumer.to_string(),
                        created_at: now,
                        last_used: now,
                        reuses: 0,
                    },
                );
                state.take_lock(key, consumer, now);

                Ok(PooledConnection {
                    key: key.to_string(),
                    consumer: consumer.to_string(),
                    client,
                    reuses: 0,
                })
            }
            Err(e) => {
                self.state.lock().await.locks.remove(key);
                Err(e)
            }
        }
    }

    async fn build_client(&self, credential: &Credential, key: &str) -> SydpowerResult<DeviceClient> {
        let mut client = self.factory.create(credential).await?;
        let account = credential.account_hash();

        let (tokens, devices) = {
            let state = self.state.lock().await;
            let now = Instant::now();
            (
                state.cached_tokens(&account, now),
                state.cached_devices(key, now),
            )
        };
        let seeded = tokens.clone();

        if let Err(e) = self.bring_up(&mut client, key, tokens, devices).await {
            if e.is_auth_failure() {
                warn!("Authorization failed, dropping pooled tokens");
                self.state.lock().await.tokens.remove(&account);
            }
            return Err(e);
        }

        // The client may have re-authenticated after a refusal
        if let Some(current) = client.session().tokens() {
            if seeded.as_ref() != Some(current) {
                debug!("Storing refreshed tokens in the pool");
                let expires = Instant::now() + self.config.token_ttl;
                self.state
                    .lock()
                    .await
                    .tokens
                    .insert(account, (current.clone(), expires));
            }
        }
        Ok(client)
    }

    /// Authenticate, list devices and connect, preferring the pool caches
    async fn bring_up(
        &self,
        client: &mut DeviceClient,
        key: &str,
        tokens: Option<AuthTokens>,
        devices: Option<Vec<DeviceRecord>>,
    ) -> SydpowerResult<()> {
        let started = Instant::now();

        match tokens {
            Some(tokens) => {
                debug!("Reusing pooled tokens");
                client.session_mut().set_tokens(tokens);
            }
            None => {
                client.authenticate().await?;
            }
        }

        match devices {
            Some(devices) => {
                debug!(count = devices.len(), "Reusing pooled device list");
                client.set_devices(devices);
            }
            None => {
                let devices = client.get_devices(true).await?;
                let expires = Instant::now() + self.config.device_ttl;
                self.state
                    .lock()
                    .await
                    .devices
                    .insert(key.to_string(), (devices, expires));
            }
        }

        let mqtt_started = Instant::now();
        client.connect_mqtt().await?;
        info!(
            total_ms = started.elapsed().as_millis() as u64,
            mqtt_ms = mqtt_started.elapsed().as_millis() as u64,
            "New pooled connection"
        );
        Ok(())
    }

    async fn teardown(entry: PoolEntry) {
        // A client still in use elsewhere is simply dropped from the pool
        if let Ok(mut client) = entry.client.try_lock() {
            if let Err(e) = client.disconnect().await {
                debug!(error = %e, "Ignoring disconnect error during teardown");
            }
        }
    }

    /// Clear the locks held by `consumer`; the sessions stay pooled
    pub async fn release_connection(&self, consumer: &str) {
        let mut state = self.state.lock().await;
        let before = state.locks.len();
        state.locks.retain(|_, lock| lock.consumer != consumer);
        if state.locks.len() < before {
            debug!(consumer = %consumer, "Released pool lock");
        }
    }

    /// Tear down the entry behind `connection`, e.g. after a transport error
    pub async fn invalidate(&self, connection: &PooledConnection) {
        let entry = {
            let mut state = self.state.lock().await;
            state.locks.remove(&connection.key);
            match state.entries.get(&connection.key) {
                Some(entry) if Arc::ptr_eq(&entry.client, &connection.client) => {
                    state.entries.remove(&connection.key)
                }
                _ => None,
            }
        };

        if let Some(entry) = entry {
            warn!(consumer = %connection.consumer, "Invalidating pooled connection");
            Self::teardown(entry).await;
        }
    }

    /// Disconnect and drop every entry, lock and cached token/device list
    pub async fn reset(&self) {
        let entries: Vec<PoolEntry> = {
            let mut state = self.state.lock().await;
            state.locks.clear();
            state.tokens.clear();
            state.devices.clear();
            state.entries.drain().map(|(_, entry)| entry).collect()
        };

        for entry in entries {
            Self::teardown(entry).await;
        }
        info!("Connection pool reset");
    }

    /// Evict entries older or idle longer than the configured maximum
    pub async fn cleanup(&self) -> usize {
        let now = Instant::now();
        let max_idle = self.config.max_idle;

        let evicted: Vec<PoolEntry> = {
            let mut state = self.state.lock().await;
            let old: Vec<String> = state
                .entries
                .iter()
                .filter(|(_, entry)| {
                    now.duration_since(entry.created_at) > max_idle
                        || now.duration_since(entry.last_used) > max_idle
                })
                .map(|(key, _)| key.clone())
                .collect();

            state.tokens.retain(|_, (_, expires)| now < *expires);
            state.devices.retain(|_, (_, expires)| now < *expires);

            old.iter()
                .filter_map(|key| {
                    state.locks.remove(key);
                    state.entries.remove(key)
                })
                .collect()
        };

        let count = evicted.len();
        for entry in evicted {
            Self::teardown(entry).await;
        }
        if count > 0 {
            info!(count, "Cleaned up old pooled connections");
        }
        count
    }

    pub async fn stats(&self) -> PoolStats {
        let state = self.state.lock().await;
        let now = Instant::now();

        let mut connections: Vec<EntryStats> = state
            .entries
            .iter()
            .map(|(key, entry)| EntryStats {
                consumer: entry.consumer.clone(),
                age_secs: now.duration_since(entry.created_at).as_secs(),
                idle_secs: now.duration_since(entry.last_used).as_secs(),
                reuses: entry.reuses,
                locked: state.locks.contains_key(key),
            })
            .collect();
        connections.sort_by(|a, b| a.consumer.cmp(&b.consumer));

        PoolStats {
            total_connections: state.entries.len(),
            active_locks: state.locks.len(),
            cached_tokens: state.tokens.len(),
            cached_device_lists: state.devices.len(),
            connections,
        }
    }
}
