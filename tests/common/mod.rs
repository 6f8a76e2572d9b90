#![allow(dead_code)]

use catalog_sync::broker::{
    ConnectionManager, ConnectionState, ConsumerOptions, EventConsumer, EventPublisher, MemoryBroker,
};
use catalog_sync::replica::InMemoryReplica;
use catalog_sync::resilience::RetryPolicy;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, Instant};

pub const EXCHANGE: &str = "book_events";

/// Reconnect delay used by test consumers in place of the production 5s.
pub const RECONNECT_DELAY: Duration = Duration::from_millis(50);

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter("catalog_sync=debug")
        .with_test_writer()
        .try_init()
        .ok();
}

pub fn publisher(broker: &MemoryBroker) -> EventPublisher<MemoryBroker> {
    let connections = ConnectionManager::new(broker.clone(), EXCHANGE)
        .with_acquire_policy(RetryPolicy::testing());
    EventPublisher::new(Arc::new(connections))
}

pub fn consumer_connections(broker: &MemoryBroker) -> Arc<ConnectionManager<MemoryBroker>> {
    Arc::new(
        ConnectionManager::new(broker.clone(), EXCHANGE)
            .with_reconnect_policy(RetryPolicy::fixed(RECONNECT_DELAY)),
    )
}

pub fn consumer(
    broker: &MemoryBroker,
    options: ConsumerOptions,
) -> EventConsumer<MemoryBroker, InMemoryReplica> {
    EventConsumer::new(
        consumer_connections(broker),
        Arc::new(InMemoryReplica::new()),
        options,
    )
}

/// Polls `condition` until it holds or `limit` elapses.
pub async fn eventually<F>(limit: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Waits until some consumer queue is bound to the exchange.
pub async fn wait_for_queues(broker: &MemoryBroker, count: usize) {
    assert!(
        eventually(Duration::from_secs(2), || broker.queue_count(EXCHANGE) >= count).await,
        "expected {} bound queue(s), found {}",
        count,
        broker.queue_count(EXCHANGE)
    );
}

pub async fn wait_for_state(connections: &ConnectionManager<MemoryBroker>, state: ConnectionState) {
    let mut watcher = connections.watch_state();
    timeout(Duration::from_secs(2), watcher.wait_for(|s| *s == state))
        .await
        .expect("timed out waiting for connection state")
        .expect("state channel closed");
}

pub async fn within<T>(limit: Duration, future: impl Future<Output = T>) -> T {
    timeout(limit, future).await.expect("operation timed out")
}
