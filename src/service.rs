//! The catalog replica as a running service.
//!
//! [`ReplicaService`] supervises the consumer task and snapshots the replica
//! on an interval. It stops when the shutdown signal fires or when the
//! consumer stops by itself, which only happens on a fatal error such as an
//! exchange declared with other properties. Either way a final snapshot is
//! written before returning.

use crate::broker::{ConsumerStats, ConsumerStatsSnapshot, EventConsumer, Transport};
use crate::replica::{ReplicaSnapshot, ReplicaStore, SnapshotStore};
use crate::Result;
use std::future::Future;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub struct ReplicaService<T: Transport, R: ReplicaStore> {
    consumer: EventConsumer<T, R>,
    snapshots: Option<SnapshotStore>,
    snapshot_interval: Duration,
}

impl<T: Transport, R: ReplicaStore> ReplicaService<T, R> {
    pub fn new(consumer: EventConsumer<T, R>) -> Self {
        Self {
            consumer,
            snapshots: None,
            snapshot_interval: Duration::from_secs(30),
        }
    }

    pub fn with_snapshots(mut self, store: SnapshotStore, interval: Duration) -> Self {
        self.snapshots = Some(store);
        self.snapshot_interval = interval;
        self
    }

    /// Runs until `signal` resolves or the consumer gives up.
    ///
    /// A fatal consumer error is returned after the final snapshot.
    pub async fn run<S>(self, signal: S) -> Result<ConsumerStatsSnapshot>
    where
        S: Future<Output = ()>,
    {
        let Self {
            consumer,
            snapshots,
            snapshot_interval,
        } = self;

        let replica = consumer.replica().clone();
        let stats = consumer.stats();
        let shutdown = CancellationToken::new();
        let mut consumer_task = consumer.spawn(shutdown.clone());

        let mut ticker = tokio::time::interval(snapshot_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(signal);

        let joined = loop {
            tokio::select! {
                _ = &mut signal => {
                    info!("Shutdown requested");
                    shutdown.cancel();
                    break (&mut consumer_task).await;
                }
                joined = &mut consumer_task => {
                    error!("Consumer stopped on its own, shutting down");
                    break joined;
                }
                _ = ticker.tick(), if snapshots.is_some() => {
                    if let Some(store) = &snapshots {
                        if let Err(e) = save_snapshot(store, replica.as_ref(), &stats).await {
                            warn!(error = %e, "Failed to save replica snapshot");
                        }
                    }
                }
            }
        };

        let saved = match &snapshots {
            Some(store) => save_snapshot(store, replica.as_ref(), &stats).await,
            None => Ok(()),
        };

        let totals = stats.snapshot();
        info!(
            received = totals.received,
            applied = totals.applied,
            malformed = totals.malformed,
            failed = totals.failed,
            "Catalog replica stopped"
        );

        if let Err(e) = joined? {
            if let Err(save_err) = saved {
                warn!(error = %save_err, "Failed to save final replica snapshot");
            }
            return Err(e);
        }
        saved?;
        Ok(totals)
    }
}

async fn save_snapshot<R: ReplicaStore>(
    store: &SnapshotStore,
    replica: &R,
    stats: &ConsumerStats,
) -> Result<()> {
    let snapshot = ReplicaSnapshot::capture(replica, stats.snapshot().applied)?;
    store.save(&snapshot).await
}
