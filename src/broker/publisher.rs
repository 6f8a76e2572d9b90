use super::connection::ConnectionManager;
use super::transport::{BrokerChannel, Transport};
use crate::event::{BookEvent, BookSnapshot, EventKind};
use crate::{Error, Result};
use std::sync::Arc;
use tracing::{debug, error, instrument};

/// Emits book changes to the fan-out exchange.
///
/// One attempt per call. A failure is logged and returned, never retried:
/// the change is already committed at the source and stays committed.
pub struct EventPublisher<T: Transport> {
    connections: Arc<ConnectionManager<T>>,
    persistent: bool,
}

impl<T: Transport> Clone for EventPublisher<T> {
    fn clone(&self) -> Self {
        Self {
            connections: self.connections.clone(),
            persistent: self.persistent,
        }
    }
}

impl<T: Transport> EventPublisher<T> {
    pub fn new(connections: Arc<ConnectionManager<T>>) -> Self {
        Self {
            connections,
            persistent: true,
        }
    }

    /// Whether to ask the broker to keep messages across restarts.
    pub fn with_persistence(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn connections(&self) -> &Arc<ConnectionManager<T>> {
        &self.connections
    }

    pub async fn publish(&self, kind: EventKind, book: &BookSnapshot) -> Result<()> {
        self.publish_event(&BookEvent::new(kind, book.clone())).await
    }

    #[instrument(skip_all, fields(event_type = %event.kind(), book_id = event.book_id()))]
    pub async fn publish_event(&self, event: &BookEvent) -> Result<()> {
        match self.try_publish(event).await {
            Ok(()) => {
                debug!("Published event");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Failed to publish event");
                if matches!(e, Error::Amqp(_) | Error::Connection(_)) {
                    self.connections.invalidate().await;
                }
                Err(e)
            }
        }
    }

    async fn try_publish(&self, event: &BookEvent) -> Result<()> {
        let body = event.encode()?;
        let channel = self.connections.acquire().await?;
        channel
            .publish(self.connections.exchange(), &body, self.persistent)
            .await
    }
}
