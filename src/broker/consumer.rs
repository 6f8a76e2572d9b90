//! Replica-side subscription loop.
//!
//! Each consumer binds its own anonymous exclusive queue to the exchange, so
//! every running instance receives a full copy of every event. The queue
//! disappears with the connection; events published while the consumer is
//! disconnected are not replayed.

use super::connection::ConnectionManager;
use super::transport::{AckMode, BrokerChannel, Delivery, SubscribeOptions, Transport};
use crate::config::ConsumerConfig;
use crate::event::BookEvent;
use crate::replica::{ApplyOutcome, ReplicaStore};
use crate::{Error, Result};
use futures::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const APPLY_RETRY_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerOptions {
    pub ack_mode: AckMode,
    pub prefetch: u16,
    pub apply_attempts: usize,
    pub dead_letter_exchange: Option<String>,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            ack_mode: AckMode::AfterApply,
            prefetch: 32,
            apply_attempts: 3,
            dead_letter_exchange: None,
        }
    }
}

impl From<&ConsumerConfig> for ConsumerOptions {
    fn from(config: &ConsumerConfig) -> Self {
        Self {
            ack_mode: config.ack_mode,
            prefetch: config.prefetch,
            apply_attempts: config.apply_attempts.max(1),
            dead_letter_exchange: config.dead_letter_exchange.clone(),
        }
    }
}

#[derive(Debug, Default)]
pub struct ConsumerStats {
    received: AtomicU64,
    applied: AtomicU64,
    malformed: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConsumerStatsSnapshot {
    pub received: u64,
    pub applied: u64,
    pub malformed: u64,
    pub failed: u64,
}

impl ConsumerStats {
    pub fn snapshot(&self) -> ConsumerStatsSnapshot {
        ConsumerStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

pub struct EventConsumer<T: Transport, R: ReplicaStore> {
    connections: Arc<ConnectionManager<T>>,
    replica: Arc<R>,
    options: ConsumerOptions,
    stats: Arc<ConsumerStats>,
}

impl<T: Transport, R: ReplicaStore> EventConsumer<T, R> {
    pub fn new(connections: Arc<ConnectionManager<T>>, replica: Arc<R>, options: ConsumerOptions) -> Self {
        Self {
            connections,
            replica,
            options,
            stats: Arc::new(ConsumerStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<ConsumerStats> {
        self.stats.clone()
    }

    pub fn replica(&self) -> &Arc<R> {
        &self.replica
    }

    /// Runs on its own task until `shutdown` is cancelled.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<Result<()>> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    /// Consumes until `shutdown` is cancelled, reconnecting as needed.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let subscription = SubscribeOptions {
            exchange: self.connections.exchange().to_string(),
            ack_mode: self.options.ack_mode,
            prefetch: self.options.prefetch,
            dead_letter_exchange: self.options.dead_letter_exchange.clone(),
        };

        info!(
            exchange = %subscription.exchange,
            ack_mode = %subscription.ack_mode,
            "Starting event consumer"
        );

        self.connections
            .run_with_reconnect(|channel| self.consume(channel, subscription.clone()), shutdown)
            .await
    }

    async fn consume(&self, channel: T::Channel, subscription: SubscribeOptions) -> Result<()> {
        let mut deliveries = channel.subscribe(&subscription).await?;
        info!("Started consuming book events");

        while let Some(delivery) = deliveries.next().await {
            self.handle_delivery(delivery?).await?;
        }

        Err(Error::Connection("delivery stream closed".to_string()))
    }

    /// Only acknowledgement failures are returned; everything else about a
    /// message is settled here.
    async fn handle_delivery(&self, delivery: Delivery) -> Result<()> {
        self.stats.received.fetch_add(1, Ordering::Relaxed);

        let event = match BookEvent::decode(&delivery.body) {
            Ok(event) => event,
            Err(e) => {
                self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, bytes = delivery.body.len(), "Discarding malformed event");
                return self.settle(&delivery, false).await;
            }
        };

        match self.apply_with_retry(&event).await {
            Ok(outcome) => {
                self.stats.applied.fetch_add(1, Ordering::Relaxed);
                info!(
                    event_type = %event.kind(),
                    book_id = event.book_id(),
                    outcome = ?outcome,
                    redelivered = delivery.redelivered,
                    "Processed event"
                );
                self.settle(&delivery, true).await
            }
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                error!(
                    event_type = %event.kind(),
                    book_id = event.book_id(),
                    error = %e,
                    "Error processing event"
                );
                self.settle(&delivery, false).await
            }
        }
    }

    async fn apply_with_retry(&self, event: &BookEvent) -> Result<ApplyOutcome> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.replica.apply(event) {
                Ok(outcome) => return Ok(outcome),
                Err(e) if attempt < self.options.apply_attempts => {
                    warn!(attempt, error = %e, book_id = event.book_id(), "Apply failed, retrying");
                    tokio::time::sleep(APPLY_RETRY_DELAY).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Auto mode was acked on receipt. Otherwise ack on success and reject
    /// without requeue on failure, which dead-letters when configured.
    async fn settle(&self, delivery: &Delivery, success: bool) -> Result<()> {
        if self.options.ack_mode == AckMode::Auto {
            return Ok(());
        }
        if success {
            delivery.ack().await
        } else {
            debug!(
                dead_letter_exchange = ?self.options.dead_letter_exchange,
                "Rejecting message without requeue"
            );
            delivery.reject(false).await
        }
    }
}
