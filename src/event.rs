//! Wire schema for catalog change notifications.
//!
//! An event is a full snapshot of one book plus what happened to it:
//!
//! ```json
//! {"type": "book_updated", "book": {"id": 1, "title": "A", "author": "X", "price": 7.99, "stock": 3}}
//! ```
//!
//! Events carry no sequence number or timestamp, so a consumer can only apply
//! them in delivery order.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Snapshot of a book at emission time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookSnapshot {
    pub id: i64,
    pub title: String,
    #[serde(default)]
    pub author: Option<String>,
    pub price: f64,
    pub stock: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
}

impl BookSnapshot {
    pub fn new(id: i64, title: impl Into<String>, price: f64, stock: i64) -> Self {
        Self {
            id,
            title: title.into(),
            author: None,
            price,
            stock,
            description: None,
            user_id: None,
        }
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "book_created")]
    Created,
    #[serde(rename = "book_updated")]
    Updated,
    #[serde(rename = "book_deleted")]
    Deleted,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Created => "book_created",
            EventKind::Updated => "book_updated",
            EventKind::Deleted => "book_deleted",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventKind {
    type Err = Error;

    /// Accepts both the wire name and the short form (`created`).
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "book_created" | "created" => Ok(EventKind::Created),
            "book_updated" | "updated" => Ok(EventKind::Updated),
            "book_deleted" | "deleted" => Ok(EventKind::Deleted),
            other => Err(Error::malformed(format!("unknown event type '{}'", other))),
        }
    }
}

/// A change notification for one book.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "book")]
pub enum BookEvent {
    #[serde(rename = "book_created")]
    Created(BookSnapshot),
    #[serde(rename = "book_updated")]
    Updated(BookSnapshot),
    #[serde(rename = "book_deleted")]
    Deleted(BookSnapshot),
}

/// Incoming layout. A delete only needs the id; whatever else the
/// producer sends is kept, missing fields take their defaults.
#[derive(Deserialize)]
#[serde(tag = "type", content = "book")]
enum WireEvent {
    #[serde(rename = "book_created")]
    Created(BookSnapshot),
    #[serde(rename = "book_updated")]
    Updated(BookSnapshot),
    #[serde(rename = "book_deleted")]
    Deleted(DeletedBook),
}

#[derive(Deserialize)]
struct DeletedBook {
    id: i64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    price: f64,
    #[serde(default)]
    stock: i64,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    user_id: Option<i64>,
}

impl From<DeletedBook> for BookSnapshot {
    fn from(book: DeletedBook) -> Self {
        Self {
            id: book.id,
            title: book.title,
            author: book.author,
            price: book.price,
            stock: book.stock,
            description: book.description,
            user_id: book.user_id,
        }
    }
}

impl<'de> Deserialize<'de> for BookEvent {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Ok(match WireEvent::deserialize(deserializer)? {
            WireEvent::Created(book) => BookEvent::Created(book),
            WireEvent::Updated(book) => BookEvent::Updated(book),
            WireEvent::Deleted(book) => BookEvent::Deleted(book.into()),
        })
    }
}

impl BookEvent {
    pub fn new(kind: EventKind, book: BookSnapshot) -> Self {
        match kind {
            EventKind::Created => BookEvent::Created(book),
            EventKind::Updated => BookEvent::Updated(book),
            EventKind::Deleted => BookEvent::Deleted(book),
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            BookEvent::Created(_) => EventKind::Created,
            BookEvent::Updated(_) => EventKind::Updated,
            BookEvent::Deleted(_) => EventKind::Deleted,
        }
    }

    pub fn book(&self) -> &BookSnapshot {
        match self {
            BookEvent::Created(book) | BookEvent::Updated(book) | BookEvent::Deleted(book) => book,
        }
    }

    pub fn book_id(&self) -> i64 {
        self.book().id
    }

    /// Compact UTF-8 JSON body.
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(Into::into)
    }

    /// Any failure here is a [`Error::MalformedEvent`].
    pub fn decode(body: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(body)
            .map_err(|e| Error::malformed(format!("body is not UTF-8: {}", e)))?;
        serde_json::from_str(text).map_err(|e| Error::malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn test_encode_matches_wire_layout() {
        let event = BookEvent::Created(BookSnapshot::new(1, "A", 9.99, 5).with_author("X"));
        let value: Value = serde_json::from_slice(&event.encode().unwrap()).unwrap();

        assert_eq!(
            value,
            json!({
                "type": "book_created",
                "book": {"id": 1, "title": "A", "author": "X", "price": 9.99, "stock": 5}
            })
        );
    }

    #[test]
    fn test_decode_source_snapshot_with_extra_fields() {
        let body = br#"{"type":"book_updated","book":{"id":4,"title":"Dune","author":null,
            "description":"spice","price":12.5,"stock":2,"user_id":9,"isbn":"x"}}"#;

        let event = BookEvent::decode(body).unwrap();
        assert_eq!(event.kind(), EventKind::Updated);
        assert_eq!(event.book_id(), 4);
        assert_eq!(event.book().author, None);
        assert_eq!(event.book().description.as_deref(), Some("spice"));
        assert_eq!(event.book().user_id, Some(9));
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let body = br#"{"type":"book_archived","book":{"id":1,"title":"A","price":1.0,"stock":1}}"#;
        assert!(matches!(
            BookEvent::decode(body),
            Err(Error::MalformedEvent { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_missing_fields() {
        let missing_stock = br#"{"type":"book_created","book":{"id":1,"title":"A","price":1.0}}"#;
        let missing_book = br#"{"type":"book_created"}"#;
        let wrong_type = br#"{"type":"book_created","book":{"id":"one","title":"A","price":1.0,"stock":1}}"#;

        for body in [&missing_stock[..], &missing_book[..], &wrong_type[..]] {
            assert!(matches!(
                BookEvent::decode(body),
                Err(Error::MalformedEvent { .. })
            ));
        }
    }

    #[test]
    fn test_decode_delete_needs_only_the_id() {
        let event = BookEvent::decode(br#"{"type":"book_deleted","book":{"id":1}}"#).unwrap();
        assert_eq!(event.kind(), EventKind::Deleted);
        assert_eq!(event.book_id(), 1);

        let full = BookEvent::Deleted(BookSnapshot::new(2, "B", 3.0, 4).with_author("Y"));
        assert_eq!(BookEvent::decode(&full.encode().unwrap()).unwrap(), full);

        let no_id = br#"{"type":"book_deleted","book":{"title":"A"}}"#;
        assert!(matches!(BookEvent::decode(no_id), Err(Error::MalformedEvent { .. })));
    }

    #[test]
    fn test_decode_rejects_invalid_utf8_and_json() {
        assert!(matches!(
            BookEvent::decode(&[0xff, 0xfe, 0x00]),
            Err(Error::MalformedEvent { .. })
        ));
        assert!(matches!(
            BookEvent::decode(b"not json"),
            Err(Error::MalformedEvent { .. })
        ));
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("created".parse::<EventKind>().unwrap(), EventKind::Created);
        assert_eq!("book_deleted".parse::<EventKind>().unwrap(), EventKind::Deleted);
        assert!("purged".parse::<EventKind>().is_err());
        assert_eq!(EventKind::Updated.to_string(), "book_updated");
    }

    #[test]
    fn test_new_round_trips_kind() {
        let book = BookSnapshot::new(2, "B", 1.0, 1);
        for kind in [EventKind::Created, EventKind::Updated, EventKind::Deleted] {
            assert_eq!(BookEvent::new(kind, book.clone()).kind(), kind);
        }
    }
}
