//! Source-of-truth book store.
//!
//! Each mutation commits first and publishes second. The publish result is
//! logged by the publisher and otherwise ignored: the inventory stays
//! authoritative whether or not the catalog hears about the change.
//!
//! Mutations are sequenced from commit through publish, so events leave in
//! commit order and the replica settles on the latest committed snapshot.

use crate::broker::{EventPublisher, Transport};
use crate::event::{BookSnapshot, EventKind};
use crate::{Error, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use tokio::sync::{Mutex, RwLock};
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
pub struct NewBook {
    pub title: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub stock: i64,
    pub user_id: i64,
}

/// Fields left `None` keep their current value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BookPatch {
    pub title: Option<String>,
    pub author: Option<String>,
    pub description: Option<String>,
    pub price: Option<f64>,
    pub stock: Option<i64>,
}

struct Books {
    next_id: i64,
    by_id: BTreeMap<i64, BookSnapshot>,
}

pub struct Inventory<T: Transport> {
    books: RwLock<Books>,
    /// Held from commit until the publish returns.
    sequencer: Mutex<()>,
    publisher: EventPublisher<T>,
}

impl<T: Transport> Inventory<T> {
    pub fn new(publisher: EventPublisher<T>) -> Self {
        Self {
            books: RwLock::new(Books {
                next_id: 1,
                by_id: BTreeMap::new(),
            }),
            sequencer: Mutex::new(()),
            publisher,
        }
    }

    pub async fn create(&self, new: NewBook) -> Result<BookSnapshot> {
        if new.title.trim().is_empty() {
            return Err(Error::Validation("title is required".to_string()));
        }
        let _sequence = self.sequencer.lock().await;

        let book = {
            let mut books = self.books.write().await;
            let id = books.next_id;
            books.next_id += 1;

            let book = BookSnapshot {
                id,
                title: new.title,
                author: new.author,
                price: new.price,
                stock: new.stock,
                description: new.description,
                user_id: Some(new.user_id),
            };
            books.by_id.insert(id, book.clone());
            book
        };

        info!(book_id = book.id, "Created book");
        let _ = self.publisher.publish(EventKind::Created, &book).await;
        Ok(book)
    }

    pub async fn update(&self, id: i64, patch: BookPatch) -> Result<BookSnapshot> {
        if matches!(&patch.title, Some(title) if title.trim().is_empty()) {
            return Err(Error::Validation("title must not be empty".to_string()));
        }
        let _sequence = self.sequencer.lock().await;

        let book = {
            let mut books = self.books.write().await;
            let book = books.by_id.get_mut(&id).ok_or(Error::NotFound(id))?;

            if let Some(title) = patch.title {
                book.title = title;
            }
            if patch.author.is_some() {
                book.author = patch.author;
            }
            if patch.description.is_some() {
                book.description = patch.description;
            }
            if let Some(price) = patch.price {
                book.price = price;
            }
            if let Some(stock) = patch.stock {
                book.stock = stock;
            }
            book.clone()
        };

        info!(book_id = id, "Updated book");
        let _ = self.publisher.publish(EventKind::Updated, &book).await;
        Ok(book)
    }

    /// Publishes the snapshot as it was just before removal.
    pub async fn delete(&self, id: i64) -> Result<BookSnapshot> {
        let _sequence = self.sequencer.lock().await;
        let book = self
            .books
            .write()
            .await
            .by_id
            .remove(&id)
            .ok_or(Error::NotFound(id))?;

        info!(book_id = id, "Deleted book");
        let _ = self.publisher.publish(EventKind::Deleted, &book).await;
        Ok(book)
    }

    pub async fn get(&self, id: i64) -> Result<BookSnapshot> {
        self.books
            .read()
            .await
            .by_id
            .get(&id)
            .cloned()
            .ok_or(Error::NotFound(id))
    }

    pub async fn list(&self, user_id: Option<i64>) -> Vec<BookSnapshot> {
        self.books
            .read()
            .await
            .by_id
            .values()
            .filter(|book| user_id.is_none() || book.user_id == user_id)
            .cloned()
            .collect()
    }
}
