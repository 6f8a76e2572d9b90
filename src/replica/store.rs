use crate::event::{BookEvent, BookSnapshot};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// A book as the catalog sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: i64,
    pub title: String,
    pub author: Option<String>,
    pub price: f64,
    pub stock: i64,
}

impl From<&BookSnapshot> for CatalogEntry {
    fn from(book: &BookSnapshot) -> Self {
        Self {
            id: book.id,
            title: book.title.clone(),
            author: book.author.clone(),
            price: book.price,
            stock: book.stock,
        }
    }
}

/// What applying one event did to the replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// `created` for an id not yet present.
    Inserted,
    /// `created` for an id already present (duplicate or re-create).
    Replaced,
    Updated,
    Removed,
    /// `updated` or `deleted` for an unknown id.
    Ignored,
}

/// The apply side plus the read-only queries served to the catalog.
///
/// Every `apply` must be idempotent: applying an event twice leaves the same
/// state as applying it once.
pub trait ReplicaStore: Send + Sync + 'static {
    fn apply(&self, event: &BookEvent) -> Result<ApplyOutcome>;

    fn get(&self, id: i64) -> Result<Option<CatalogEntry>>;

    /// All entries ordered by id.
    fn get_all(&self) -> Result<Vec<CatalogEntry>>;

    fn len(&self) -> Result<usize>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// Many readers, one writer. A poisoned lock surfaces as
/// [`Error::ApplyFailure`].
#[derive(Debug, Default)]
pub struct InMemoryReplica {
    entries: RwLock<BTreeMap<i64, CatalogEntry>>,
}

impl InMemoryReplica {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = CatalogEntry>) -> Self {
        Self {
            entries: RwLock::new(entries.into_iter().map(|e| (e.id, e)).collect()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, BTreeMap<i64, CatalogEntry>>> {
        self.entries
            .read()
            .map_err(|_| Error::apply_failure("replica lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<i64, CatalogEntry>>> {
        self.entries
            .write()
            .map_err(|_| Error::apply_failure("replica lock poisoned"))
    }
}

impl ReplicaStore for InMemoryReplica {
    fn apply(&self, event: &BookEvent) -> Result<ApplyOutcome> {
        let mut entries = self.write()?;

        let outcome = match event {
            BookEvent::Created(book) => match entries.insert(book.id, CatalogEntry::from(book)) {
                Some(_) => ApplyOutcome::Replaced,
                None => ApplyOutcome::Inserted,
            },
            BookEvent::Updated(book) => match entries.get_mut(&book.id) {
                Some(entry) => {
                    *entry = CatalogEntry::from(book);
                    ApplyOutcome::Updated
                }
                None => ApplyOutcome::Ignored,
            },
            BookEvent::Deleted(book) => match entries.remove(&book.id) {
                Some(_) => ApplyOutcome::Removed,
                None => ApplyOutcome::Ignored,
            },
        };
        Ok(outcome)
    }

    fn get(&self, id: i64) -> Result<Option<CatalogEntry>> {
        Ok(self.read()?.get(&id).cloned())
    }

    fn get_all(&self) -> Result<Vec<CatalogEntry>> {
        Ok(self.read()?.values().cloned().collect())
    }

    fn len(&self) -> Result<usize> {
        Ok(self.read()?.len())
    }
}
