//! In-process fan-out broker.
//!
//! Mirrors the parts of AMQP this crate relies on: durable fan-out exchanges,
//! exclusive queues that vanish with their connection, persistent publishes,
//! manual ack/reject and an optional dead-letter exchange. Outages are
//! simulated with [`MemoryBroker::set_available`] and
//! [`MemoryBroker::sever_connections`].

use super::transport::{
    AckMode, Acker, BrokerChannel, Delivery, DeliveryStream, SubscribeOptions, Transport,
};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExchangeSpec {
    DurableFanout,
    Conflicting,
}

type QueueSender = mpsc::UnboundedSender<Result<Delivery>>;

#[derive(Debug)]
struct Queue {
    name: String,
    connection_id: u64,
    ack_mode: AckMode,
    dead_letter_exchange: Option<String>,
    sender: QueueSender,
}

/// A message as it was handed to an exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub body: Bytes,
    pub persistent: bool,
}

#[derive(Debug, Default)]
struct BrokerState {
    unavailable: bool,
    open_attempts: usize,
    next_id: u64,
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, Vec<Queue>>,
    connections: HashMap<u64, Arc<AtomicBool>>,
    published: Vec<PublishedMessage>,
    acked: usize,
    rejected: usize,
    dead_letters: Vec<Bytes>,
}

#[derive(Clone, Debug, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// While unavailable, every connection attempt is refused.
    pub fn set_available(&self, available: bool) {
        self.lock().unavailable = !available;
    }

    /// Drops every live connection, as a broker restart or network cut
    /// would. Exclusive queues are deleted and their consumers see an error
    /// followed by the end of the stream.
    pub fn sever_connections(&self) {
        let mut state = self.lock();
        for open in state.connections.values() {
            open.store(false, Ordering::Release);
        }
        state.connections.clear();
        for queues in state.queues.values_mut() {
            for queue in queues.drain(..) {
                let _ = queue
                    .sender
                    .send(Err(Error::Connection("connection reset by broker".to_string())));
            }
        }
        debug!("Severed all broker connections");
    }

    /// Pre-declares `exchange` with properties no fan-out declare matches.
    pub fn declare_conflicting_exchange(&self, exchange: &str) {
        self.lock()
            .exchanges
            .insert(exchange.to_string(), ExchangeSpec::Conflicting);
    }

    /// Routes raw bytes through an exchange, bypassing any channel.
    /// Returns the number of queues reached.
    pub fn inject(&self, exchange: &str, body: impl Into<Bytes>) -> usize {
        let mut state = self.lock();
        self.route(&mut state, exchange, body.into(), true)
    }

    pub fn has_exchange(&self, exchange: &str) -> bool {
        self.lock().exchanges.contains_key(exchange)
    }

    pub fn open_attempts(&self) -> usize {
        self.lock().open_attempts
    }

    /// Connections opened and not yet closed or severed.
    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn queue_count(&self, exchange: &str) -> usize {
        self.lock().queues.get(exchange).map_or(0, Vec::len)
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.clone()
    }

    pub fn acked(&self) -> usize {
        self.lock().acked
    }

    pub fn rejected(&self) -> usize {
        self.lock().rejected
    }

    pub fn dead_letters(&self) -> Vec<Bytes> {
        self.lock().dead_letters.clone()
    }

    fn route(&self, state: &mut BrokerState, exchange: &str, body: Bytes, persistent: bool) -> usize {
        state.published.push(PublishedMessage {
            exchange: exchange.to_string(),
            body: body.clone(),
            persistent,
        });

        let Some(queues) = state.queues.get(exchange) else {
            return 0;
        };

        let mut reached = 0;
        for queue in queues {
            if self.enqueue(queue, body.clone(), false) {
                reached += 1;
            } else {
                debug!(queue = %queue.name, "Queue consumer is gone, dropping message");
            }
        }
        reached
    }

    fn enqueue(&self, queue: &Queue, body: Bytes, redelivered: bool) -> bool {
        let delivery = Delivery::new(body.clone()).redelivered(redelivered);
        let delivery = match queue.ack_mode {
            AckMode::Auto => delivery,
            AckMode::AfterApply => delivery.with_acker(Arc::new(MemoryAcker {
                broker: self.clone(),
                body,
                sender: queue.sender.clone(),
                dead_letter_exchange: queue.dead_letter_exchange.clone(),
                settled: AtomicBool::new(false),
            })),
        };
        queue.sender.send(Ok(delivery)).is_ok()
    }
}

struct MemoryAcker {
    broker: MemoryBroker,
    body: Bytes,
    sender: QueueSender,
    dead_letter_exchange: Option<String>,
    settled: AtomicBool,
}

impl MemoryAcker {
    fn settle(&self) -> Result<()> {
        if self.settled.swap(true, Ordering::AcqRel) {
            return Err(Error::Connection(
                "PRECONDITION_FAILED - delivery already acknowledged".to_string(),
            ));
        }
        if self.sender.is_closed() {
            return Err(Error::Connection("channel closed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.settle()?;
        self.broker.lock().acked += 1;
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.settle()?;
        let mut state = self.broker.lock();
        state.rejected += 1;

        if requeue {
            let acker = MemoryAcker {
                broker: self.broker.clone(),
                body: self.body.clone(),
                sender: self.sender.clone(),
                dead_letter_exchange: self.dead_letter_exchange.clone(),
                settled: AtomicBool::new(false),
            };
            let delivery = Delivery::new(self.body.clone())
                .redelivered(true)
                .with_acker(Arc::new(acker));
            let _ = self.sender.send(Ok(delivery));
        } else if let Some(dlx) = &self.dead_letter_exchange {
            state.dead_letters.push(self.body.clone());
            self.broker.route(&mut state, dlx, self.body.clone(), true);
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    type Channel = MemoryChannel;

    fn endpoint(&self) -> String {
        "memory://local".to_string()
    }

    async fn open(&self) -> Result<MemoryChannel> {
        let mut state = self.lock();
        state.open_attempts += 1;
        if state.unavailable {
            return Err(Error::Connection("connection refused".to_string()));
        }

        state.next_id += 1;
        let connection_id = state.next_id;
        let open = Arc::new(AtomicBool::new(true));
        state.connections.insert(connection_id, open.clone());

        Ok(MemoryChannel {
            broker: self.clone(),
            connection_id,
            open,
        })
    }
}

#[derive(Clone, Debug)]
pub struct MemoryChannel {
    broker: MemoryBroker,
    connection_id: u64,
    open: Arc<AtomicBool>,
}

impl MemoryChannel {
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(Error::Connection("channel is closed".to_string()))
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn declare_fanout_exchange(&self, exchange: &str) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        match state.exchanges.get(exchange) {
            Some(ExchangeSpec::DurableFanout) => Ok(()),
            Some(ExchangeSpec::Conflicting) => {
                // The broker closes the channel on a failed declare.
                self.open.store(false, Ordering::Release);
                Err(Error::ExchangeMismatch {
                    exchange: exchange.to_string(),
                    message: "PRECONDITION_FAILED - inequivalent arg 'type'".to_string(),
                })
            }
            None => {
                state
                    .exchanges
                    .insert(exchange.to_string(), ExchangeSpec::DurableFanout);
                Ok(())
            }
        }
    }

    async fn publish(&self, exchange: &str, body: &[u8], persistent: bool) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        if !state.exchanges.contains_key(exchange) {
            self.open.store(false, Ordering::Release);
            return Err(Error::Connection(format!(
                "NOT_FOUND - no exchange '{}'",
                exchange
            )));
        }
        self.broker
            .route(&mut state, exchange, Bytes::copy_from_slice(body), persistent);
        Ok(())
    }

    async fn subscribe(&self, options: &SubscribeOptions) -> Result<DeliveryStream> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        if !state.exchanges.contains_key(&options.exchange) {
            return Err(Error::Connection(format!(
                "NOT_FOUND - no exchange '{}'",
                options.exchange
            )));
        }

        state.next_id += 1;
        let name = format!("amq.gen-{}", state.next_id);
        let (sender, receiver) = mpsc::unbounded_channel();
        state
            .queues
            .entry(options.exchange.clone())
            .or_default()
            .push(Queue {
                name: name.clone(),
                connection_id: self.connection_id,
                ack_mode: options.ack_mode,
                dead_letter_exchange: options.dead_letter_exchange.clone(),
                sender,
            });

        debug!(queue = %name, exchange = %options.exchange, "Bound exclusive queue");
        Ok(UnboundedReceiverStream::new(receiver).boxed())
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::Release);
        let mut state = self.broker.lock();
        state.connections.remove(&self.connection_id);
        for queues in state.queues.values_mut() {
            queues.retain(|queue| queue.connection_id != self.connection_id);
        }
        Ok(())
    }
}
