pub mod amqp;
pub mod connection;
pub mod consumer;
pub mod memory;
pub mod publisher;
pub mod transport;

pub use amqp::{AmqpChannel, AmqpTransport};
pub use connection::{ConnectionManager, ConnectionState};
pub use consumer::{ConsumerOptions, ConsumerStats, ConsumerStatsSnapshot, EventConsumer};
pub use memory::{MemoryBroker, MemoryChannel, PublishedMessage};
pub use publisher::EventPublisher;
pub use transport::{AckMode, Acker, BrokerChannel, Delivery, DeliveryStream, SubscribeOptions, Transport};
