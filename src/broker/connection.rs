//! Broker connection lifecycle.
//!
//! # Connection Lifecycle
//!
//! ```text
//! Disconnected → Connecting → Ready
//!      ↑             ↓          ↓
//!      └─────────────┴──────────┘
//! ```
//!
//! The channel is lazy: nothing is opened until [`ConnectionManager::acquire`]
//! or [`ConnectionManager::run_with_reconnect`] needs one. The check of the
//! cached channel and the creation of a new one happen under a single lock,
//! so only one task is ever connecting or tearing down at a time.
//!
//! Every (re)connect declares the durable fan-out exchange.

use super::transport::{BrokerChannel, Transport};
use crate::config::Config;
use crate::resilience::RetryPolicy;
use crate::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Ready,
}

pub struct ConnectionManager<T: Transport> {
    transport: T,
    exchange: String,
    connect_timeout: Duration,
    acquire_policy: RetryPolicy,
    reconnect_policy: RetryPolicy,
    stable_session: Duration,
    channel: Mutex<Option<T::Channel>>,
    state: watch::Sender<ConnectionState>,
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new(transport: T, exchange: impl Into<String>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            transport,
            exchange: exchange.into(),
            connect_timeout: Duration::from_secs(10),
            acquire_policy: RetryPolicy {
                max_attempts: 5,
                initial_delay: Duration::from_secs(2),
                max_delay: Duration::from_secs(2),
                backoff_factor: 1.0,
                jitter: 0.0,
            },
            reconnect_policy: RetryPolicy::fixed(Duration::from_secs(5)),
            stable_session: Duration::from_secs(30),
            channel: Mutex::new(None),
            state,
        }
    }

    pub fn from_config(transport: T, config: &Config) -> Self {
        Self::new(transport, config.broker.exchange.clone())
            .with_connect_timeout(config.broker.connect_timeout())
            .with_acquire_policy(config.publisher.retry_policy())
            .with_reconnect_policy(config.consumer.reconnect_policy())
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Budget for [`acquire`](Self::acquire).
    pub fn with_acquire_policy(mut self, policy: RetryPolicy) -> Self {
        self.acquire_policy = policy;
        self
    }

    /// Backoff for [`run_with_reconnect`](Self::run_with_reconnect).
    /// The attempt limit is ignored there.
    pub fn with_reconnect_policy(mut self, policy: RetryPolicy) -> Self {
        self.reconnect_policy = policy;
        self
    }

    /// How long a session must stay up before the reconnect backoff
    /// starts over from the first attempt.
    pub fn with_stable_session(mut self, stable_session: Duration) -> Self {
        self.stable_session = stable_session;
        self
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Follow state transitions, e.g. to wait for `Ready`.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Returns the live channel, connecting if there is none or it closed.
    ///
    /// Gives up with [`Error::BrokerUnavailable`] once the acquire budget is
    /// spent.
    pub async fn acquire(&self) -> Result<T::Channel> {
        let mut slot = self.channel.lock().await;

        if let Some(channel) = slot.as_ref() {
            if channel.is_open() {
                return Ok(channel.clone());
            }
            debug!(endpoint = %self.transport.endpoint(), "Cached channel is closed, reconnecting");
        }
        self.discard_closed(&mut slot).await;

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.open_and_declare().await {
                Ok(channel) => {
                    if attempt > 1 {
                        info!(attempt, endpoint = %self.transport.endpoint(), "Connected to broker after retry");
                    }
                    *slot = Some(channel.clone());
                    return Ok(channel);
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    if self.acquire_policy.is_exhausted(attempt) {
                        error!(attempt, error = %e, "Failed to connect to broker after max retries");
                        return Err(Error::BrokerUnavailable {
                            attempts: attempt,
                            message: e.to_string(),
                        });
                    }

                    let delay = self.acquire_policy.delay_for_attempt(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Broker connection attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Drop the cached channel so the next caller reconnects.
    pub async fn invalidate(&self) {
        let stale = self.channel.lock().await.take();
        self.set_state(ConnectionState::Disconnected);

        if let Some(channel) = stale {
            debug!("Discarding broker channel");
            if let Err(e) = channel.close().await {
                debug!(error = %e, "Error closing discarded channel");
            }
        }
    }

    /// Close the channel for shutdown.
    pub async fn close(&self) {
        if self.channel.lock().await.is_some() {
            info!(endpoint = %self.transport.endpoint(), "Closing broker connection");
        }
        self.invalidate().await;
    }

    /// Consumer-side supervision loop.
    ///
    /// Connects, declares the exchange and hands the channel to `on_ready`,
    /// whose future runs the subscription. Whenever connecting or the
    /// subscription fails, the channel is discarded and the loop sleeps per
    /// the reconnect policy before trying again, forever. The backoff only
    /// starts over after a session that stayed up for the stable-session time.
    ///
    /// Returns `Ok(())` once `shutdown` is cancelled, or the error if it is
    /// fatal (see [`Error::is_fatal`]).
    pub async fn run_with_reconnect<F, Fut>(
        &self,
        mut on_ready: F,
        shutdown: CancellationToken,
    ) -> Result<()>
    where
        F: FnMut(T::Channel) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut failures = 0usize;

        loop {
            let mut connected_at = None;

            let outcome = tokio::select! {
                _ = shutdown.cancelled() => None,
                outcome = self.run_session(&mut on_ready, &mut connected_at) => Some(outcome),
            };

            let Some(outcome) = outcome else {
                self.close().await;
                info!("Consumer shut down");
                return Ok(());
            };

            if connected_at.is_some_and(|at: Instant| at.elapsed() >= self.stable_session) {
                failures = 0;
            }
            failures += 1;

            match outcome {
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "Fatal broker configuration error, giving up");
                    self.invalidate().await;
                    return Err(e);
                }
                Err(e) => error!(error = %e, "Lost connection to broker, reconnecting"),
                Ok(()) => warn!("Subscription ended, reconnecting"),
            }
            self.invalidate().await;

            let delay = self.reconnect_policy.delay_for_attempt(failures);
            debug!(attempt = failures, delay_ms = delay.as_millis() as u64, "Waiting before reconnect");

            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Consumer shut down during backoff");
                    return Ok(());
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn run_session<F, Fut>(&self, on_ready: &mut F, connected_at: &mut Option<Instant>) -> Result<()>
    where
        F: FnMut(T::Channel) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let channel = {
            let mut slot = self.channel.lock().await;
            match slot.as_ref() {
                Some(channel) if channel.is_open() => channel.clone(),
                _ => {
                    self.discard_closed(&mut slot).await;
                    let channel = self.open_and_declare().await?;
                    *slot = Some(channel.clone());
                    channel
                }
            }
        };

        *connected_at = Some(Instant::now());
        on_ready(channel).await
    }

    /// A channel the broker closed can still hold its connection open.
    async fn discard_closed(&self, slot: &mut Option<T::Channel>) {
        if let Some(stale) = slot.take() {
            self.set_state(ConnectionState::Disconnected);
            if let Err(e) = stale.close().await {
                debug!(error = %e, "Error closing stale channel");
            }
        }
    }

    async fn open_and_declare(&self) -> Result<T::Channel> {
        self.set_state(ConnectionState::Connecting);
        debug!(endpoint = %self.transport.endpoint(), "Connecting to broker");

        let result = async {
            let channel = timeout(self.connect_timeout, self.transport.open())
                .await
                .map_err(|_| Error::Timeout {
                    message: format!(
                        "connecting to {} took longer than {:?}",
                        self.transport.endpoint(),
                        self.connect_timeout
                    ),
                })??;

            if let Err(e) = channel.declare_fanout_exchange(&self.exchange).await {
                let _ = channel.close().await;
                return Err(e);
            }
            Ok(channel)
        }
        .await;

        match &result {
            Ok(_) => {
                self.set_state(ConnectionState::Ready);
                info!(
                    endpoint = %self.transport.endpoint(),
                    exchange = %self.exchange,
                    "Connected to broker"
                );
            }
            Err(_) => self.set_state(ConnectionState::Disconnected),
        }
        result
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }
}
