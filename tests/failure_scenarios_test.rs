mod common;

use catalog_sync::broker::{
    AckMode, BrokerChannel, ConnectionState, ConsumerOptions, EventConsumer, MemoryBroker,
    SubscribeOptions, Transport,
};
use catalog_sync::inventory::NewBook;
use catalog_sync::replica::{ApplyOutcome, CatalogEntry, InMemoryReplica, ReplicaStore};
use catalog_sync::{BookEvent, BookSnapshot, Error, EventKind, Inventory, Result};
use common::{
    consumer, consumer_connections, eventually, publisher, wait_for_queues, wait_for_state, within,
    EXCHANGE, RECONNECT_DELAY,
};
use futures::StreamExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn created(id: i64) -> Vec<u8> {
    BookEvent::Created(BookSnapshot::new(id, format!("Book {}", id), 1.0, 1))
        .encode()
        .unwrap()
}

/// Fails the first `failures` applies of every event, then delegates.
struct FlakyReplica {
    inner: InMemoryReplica,
    failures: usize,
    calls: AtomicUsize,
    poisoned_id: Option<i64>,
}

impl FlakyReplica {
    fn failing_first(failures: usize) -> Self {
        Self {
            inner: InMemoryReplica::new(),
            failures,
            calls: AtomicUsize::new(0),
            poisoned_id: None,
        }
    }

    fn always_failing_for(id: i64) -> Self {
        Self {
            inner: InMemoryReplica::new(),
            failures: 0,
            calls: AtomicUsize::new(0),
            poisoned_id: Some(id),
        }
    }
}

impl ReplicaStore for FlakyReplica {
    fn apply(&self, event: &BookEvent) -> Result<ApplyOutcome> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if Some(event.book_id()) == self.poisoned_id || call < self.failures {
            return Err(Error::ApplyFailure {
                message: "disk full".to_string(),
            });
        }
        self.inner.apply(event)
    }

    fn get(&self, id: i64) -> Result<Option<CatalogEntry>> {
        self.inner.get(id)
    }

    fn get_all(&self) -> Result<Vec<CatalogEntry>> {
        self.inner.get_all()
    }

    fn len(&self) -> Result<usize> {
        self.inner.len()
    }
}

#[tokio::test]
async fn test_malformed_message_does_not_stop_consumer() {
    common::init_tracing();

    let broker = MemoryBroker::new();
    let consumer = consumer(&broker, ConsumerOptions::default());
    let replica = consumer.replica().clone();
    let stats = consumer.stats();
    let shutdown = CancellationToken::new();
    let handle = consumer.spawn(shutdown.clone());
    wait_for_queues(&broker, 1).await;

    broker.inject(EXCHANGE, created(1));
    broker.inject(EXCHANGE, "{\"type\":\"book_created\"");
    broker.inject(EXCHANGE, vec![0xffu8, 0x00, 0x13]);
    broker.inject(EXCHANGE, r#"{"type":"book_burned","book":{"id":2}}"#);
    broker.inject(EXCHANGE, created(2));

    assert!(eventually(Duration::from_secs(2), || replica.len().unwrap() == 2).await);
    assert!(eventually(Duration::from_secs(2), || broker.rejected() == 3).await);

    let stats = stats.snapshot();
    assert_eq!(stats.malformed, 3);
    assert_eq!(stats.applied, 2);
    assert_eq!(broker.open_attempts(), 1);

    shutdown.cancel();
    within(Duration::from_secs(2), handle).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_consumer_resumes_after_connection_drop() {
    let broker = MemoryBroker::new();
    let consumer = consumer(&broker, ConsumerOptions::default());
    let replica = consumer.replica().clone();
    let shutdown = CancellationToken::new();
    let handle = consumer.spawn(shutdown.clone());
    wait_for_queues(&broker, 1).await;

    broker.inject(EXCHANGE, created(1));
    assert!(eventually(Duration::from_secs(2), || replica.len().unwrap() == 1).await);

    broker.sever_connections();
    assert_eq!(broker.queue_count(EXCHANGE), 0);

    // Published while disconnected: the exclusive queue is gone, so lost.
    assert_eq!(broker.inject(EXCHANGE, created(2)), 0);

    wait_for_queues(&broker, 1).await;
    broker.inject(EXCHANGE, created(3));

    assert!(eventually(RECONNECT_DELAY * 20, || replica.get(3).unwrap().is_some()).await);
    assert!(replica.get(2).unwrap().is_none());
    assert_eq!(broker.open_attempts(), 2);

    shutdown.cancel();
    within(Duration::from_secs(2), handle).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_consumer_waits_out_broker_outage() {
    let broker = MemoryBroker::new();
    broker.set_available(false);

    let connections = consumer_connections(&broker);
    let consumer = EventConsumer::new(
        connections.clone(),
        Arc::new(InMemoryReplica::new()),
        ConsumerOptions::default(),
    );
    let replica = consumer.replica().clone();
    let shutdown = CancellationToken::new();
    let handle = consumer.spawn(shutdown.clone());

    assert!(eventually(Duration::from_secs(2), || broker.open_attempts() >= 4).await);
    assert!(!handle.is_finished());

    broker.set_available(true);
    wait_for_state(&connections, ConnectionState::Ready).await;
    wait_for_queues(&broker, 1).await;

    broker.inject(EXCHANGE, created(1));
    assert!(eventually(Duration::from_secs(2), || replica.len().unwrap() == 1).await);

    shutdown.cancel();
    within(Duration::from_secs(2), handle).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_shutdown_during_backoff() {
    let broker = MemoryBroker::new();
    broker.set_available(false);
    let consumer = consumer(&broker, ConsumerOptions::default());
    let shutdown = CancellationToken::new();
    let handle = consumer.spawn(shutdown.clone());

    assert!(eventually(Duration::from_secs(2), || broker.open_attempts() >= 1).await);
    shutdown.cancel();

    within(Duration::from_secs(1), handle).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_exchange_mismatch_stops_consumer() {
    let broker = MemoryBroker::new();
    broker.declare_conflicting_exchange(EXCHANGE);
    let consumer = consumer(&broker, ConsumerOptions::default());

    let result = within(Duration::from_secs(2), consumer.spawn(CancellationToken::new()))
        .await
        .unwrap();

    assert!(matches!(result, Err(Error::ExchangeMismatch { .. })));
    assert_eq!(broker.open_attempts(), 1);
}

#[tokio::test]
async fn test_apply_failure_is_retried_locally() {
    let broker = MemoryBroker::new();
    let replica = Arc::new(FlakyReplica::failing_first(2));
    let consumer = EventConsumer::new(
        consumer_connections(&broker),
        replica.clone(),
        ConsumerOptions {
            apply_attempts: 3,
            ..Default::default()
        },
    );
    let shutdown = CancellationToken::new();
    let handle = consumer.spawn(shutdown.clone());
    wait_for_queues(&broker, 1).await;

    broker.inject(EXCHANGE, created(1));

    assert!(eventually(Duration::from_secs(2), || replica.len().unwrap() == 1).await);
    assert!(eventually(Duration::from_secs(2), || broker.acked() == 1).await);
    assert_eq!(broker.rejected(), 0);

    shutdown.cancel();
    within(Duration::from_secs(2), handle).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_apply_failure_is_dead_lettered_and_loop_continues() {
    let broker = MemoryBroker::new();
    let dlx = "book_events.dlx";

    // Park dead letters somewhere observable.
    let parking = broker.open().await.unwrap();
    parking.declare_fanout_exchange(dlx).await.unwrap();
    let mut parked = parking.subscribe(&SubscribeOptions::new(dlx)).await.unwrap();

    let replica = Arc::new(FlakyReplica::always_failing_for(13));
    let consumer = EventConsumer::new(
        consumer_connections(&broker),
        replica.clone(),
        ConsumerOptions {
            apply_attempts: 2,
            dead_letter_exchange: Some(dlx.to_string()),
            ..Default::default()
        },
    );
    let stats = consumer.stats();
    let shutdown = CancellationToken::new();
    let handle = consumer.spawn(shutdown.clone());
    wait_for_queues(&broker, 1).await;

    broker.inject(EXCHANGE, created(13));
    broker.inject(EXCHANGE, created(14));

    assert!(eventually(Duration::from_secs(2), || replica.get(14).unwrap().is_some()).await);
    assert!(replica.get(13).unwrap().is_none());
    assert_eq!(stats.snapshot().failed, 1);

    let dead = within(Duration::from_secs(2), parked.next()).await.unwrap().unwrap();
    assert_eq!(BookEvent::decode(&dead.body).unwrap().book_id(), 13);
    assert_eq!(broker.dead_letters().len(), 1);

    shutdown.cancel();
    within(Duration::from_secs(2), handle).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_auto_ack_loses_failed_apply() {
    let broker = MemoryBroker::new();
    let replica = Arc::new(FlakyReplica::always_failing_for(5));
    let consumer = EventConsumer::new(
        consumer_connections(&broker),
        replica.clone(),
        ConsumerOptions {
            ack_mode: AckMode::Auto,
            apply_attempts: 1,
            ..Default::default()
        },
    );
    let stats = consumer.stats();
    let shutdown = CancellationToken::new();
    let handle = consumer.spawn(shutdown.clone());
    wait_for_queues(&broker, 1).await;

    broker.inject(EXCHANGE, created(5));
    assert!(eventually(Duration::from_secs(2), || stats.snapshot().failed == 1).await);

    assert!(replica.get(5).unwrap().is_none());
    assert_eq!(broker.rejected(), 0);
    assert!(broker.dead_letters().is_empty());

    shutdown.cancel();
    within(Duration::from_secs(2), handle).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_publish_failure_does_not_fail_mutation() {
    let broker = MemoryBroker::new();
    broker.set_available(false);
    let publisher = publisher(&broker);

    let result = publisher
        .publish(EventKind::Created, &BookSnapshot::new(1, "A", 1.0, 1))
        .await;
    assert!(matches!(result, Err(Error::BrokerUnavailable { attempts: 3, .. })));

    let inventory = Inventory::new(publisher);
    let book = inventory
        .create(NewBook {
            title: "Still saved".to_string(),
            author: None,
            description: None,
            price: 0.0,
            stock: 0,
            user_id: 1,
        })
        .await
        .unwrap();
    assert_eq!(inventory.get(book.id).await.unwrap().title, "Still saved");

    // Once the broker is back the next change goes through.
    broker.set_available(true);
    inventory.delete(book.id).await.unwrap();
    let published = broker.published();
    assert_eq!(published.len(), 1);
    assert_eq!(
        BookEvent::decode(&published[0].body).unwrap().kind(),
        EventKind::Deleted
    );
}
