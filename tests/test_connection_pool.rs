//! Connection pool behaviour across consumers, TTLs and concurrent callers

use std::sync::Arc;
use std::time::Duration;
use sydpower::pool::pool_key;
use sydpower::testing::MockClientFactory;
use sydpower::transport::TransportError;
use sydpower::{ConnectionPool, Credential, PoolConfig};
use tempfile::TempDir;

fn credential() -> Credential {
    Credential::new("user@example.com", "pw")
}

fn pool(dir: &TempDir) -> (ConnectionPool, Arc<MockClientFactory>) {
    let factory = Arc::new(MockClientFactory::new(dir.path()));
    (
        ConnectionPool::new(PoolConfig::default(), factory.clone()),
        factory,
    )
}

#[tokio::test(start_paused = true)]
async fn test_entry_reused_inside_ttl_and_replaced_after() {
    let dir = TempDir::new().unwrap();
    let (pool, factory) = pool(&dir);

    let first = pool.get_connection(&credential(), "dashboard").await.unwrap();
    pool.release_connection("dashboard").await;

    tokio::time::advance(Duration::from_secs(10)).await;
    let second = pool.get_connection(&credential(), "dashboard").await.unwrap();
    pool.release_connection("dashboard").await;
    assert!(Arc::ptr_eq(&first.client(), &second.client()));
    assert_eq!(second.reuses(), 1);

    tokio::time::advance(Duration::from_secs(16)).await;
    let third = pool.get_connection(&credential(), "dashboard").await.unwrap();
    assert!(!Arc::ptr_eq(&first.client(), &third.client()));
    assert_eq!(third.reuses(), 0);
    assert_eq!(factory.created(), 2);

    // The replaced session is disconnected; the new one is live
    assert!(!first.client().lock().await.is_healthy());
    assert!(third.client().lock().await.is_healthy());
}

#[tokio::test(start_paused = true)]
async fn test_consumers_get_separate_sessions_sharing_one_login() {
    let dir = TempDir::new().unwrap();
    let (pool, factory) = pool(&dir);

    let dashboard = pool.get_connection(&credential(), "dashboard").await.unwrap();
    let scheduler = pool.get_connection(&credential(), "scheduler").await.unwrap();

    assert_ne!(dashboard.key(), scheduler.key());
    assert_eq!(dashboard.key(), pool_key(&credential(), "dashboard"));
    assert!(!Arc::ptr_eq(&dashboard.client(), &scheduler.client()));
    assert_eq!(factory.created(), 2);
    assert_eq!(factory.api().login_calls(), 1);

    let stats = pool.stats().await;
    assert_eq!(stats.total_connections, 2);
    assert_eq!(stats.active_locks, 2);
    assert_eq!(stats.cached_tokens, 1);
    assert_eq!(stats.cached_device_lists, 2);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_caller_waits_for_release_then_reuses() {
    let dir = TempDir::new().unwrap();
    let (pool, factory) = pool(&dir);

    let holder = async {
        let connection = pool.get_connection(&credential(), "dashboard").await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        pool.release_connection("dashboard").await;
        connection
    };
    let waiter = async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        pool.get_connection(&credential(), "dashboard").await.unwrap()
    };

    let (first, second) = tokio::join!(holder, waiter);
    assert!(Arc::ptr_eq(&first.client(), &second.client()));
    assert_eq!(second.reuses(), 1);
    assert_eq!(factory.created(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stuck_holder_does_not_deadlock_waiters() {
    let dir = TempDir::new().unwrap();
    let factory = Arc::new(MockClientFactory::new(dir.path()));
    let config = PoolConfig {
        lock_window: Duration::from_secs(60),
        lock_wait: Duration::from_secs(2),
        ..PoolConfig::default()
    };
    let pool = ConnectionPool::new(config, factory.clone());

    let stuck = pool.get_connection(&credential(), "dashboard").await.unwrap();
    let detached = pool.get_connection(&credential(), "dashboard").await.unwrap();

    assert!(detached.key().ends_with("_timeout"));
    assert!(!Arc::ptr_eq(&stuck.client(), &detached.client()));
    assert_eq!(factory.created(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_cleanup_and_reset_disconnect_sessions() {
    let dir = TempDir::new().unwrap();
    let (pool, _factory) = pool(&dir);

    let old = pool.get_connection(&credential(), "dashboard").await.unwrap();
    pool.release_connection("dashboard").await;
    tokio::time::advance(Duration::from_secs(31)).await;
    let fresh = pool.get_connection(&credential(), "scheduler").await.unwrap();

    assert_eq!(pool.cleanup().await, 1);
    assert!(!old.client().lock().await.is_healthy());
    assert_eq!(pool.stats().await.total_connections, 1);

    pool.reset().await;
    assert!(!fresh.client().lock().await.is_healthy());
    let stats = pool.stats().await;
    assert_eq!(stats.total_connections, 0);
    assert_eq!(stats.cached_tokens, 0);
}

#[tokio::test(start_paused = true)]
async fn test_tokens_refreshed_after_broker_refusal_are_shared() {
    let dir = TempDir::new().unwrap();
    let (pool, factory) = pool(&dir);

    pool.get_connection(&credential(), "dashboard").await.unwrap();
    factory.fail_next_connect(TransportError::Refused {
        reason: "NotAuthorized".to_string(),
        auth: true,
    });
    pool.get_connection(&credential(), "scheduler").await.unwrap();
    pool.get_connection(&credential(), "listener").await.unwrap();

    let transports = factory.transports();
    let original = transports[0].connect_tokens().await;
    let scheduler = transports[1].connect_tokens().await;
    let listener = transports[2].connect_tokens().await;

    // Scheduler tried the pooled token, was refused and logged in again
    assert_eq!(scheduler.len(), 2);
    assert_eq!(scheduler[0], original[0]);
    assert_ne!(scheduler[1], original[0]);

    // Listener starts from the refreshed token, not the refused one
    assert_eq!(listener, vec![scheduler[1].clone()]);
    assert_eq!(factory.api().login_calls(), 2);
    assert_eq!(pool.stats().await.cached_tokens, 1);
}
