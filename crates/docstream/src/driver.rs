//! Document-store driver seam.
//!
//! The pool and cursors never perform I/O themselves. Everything goes
//! through these traits, which a real driver (see the `mongo` module behind
//! the `mongodb` feature) or the in-process [`MemoryDriver`](crate::memory::MemoryDriver)
//! implements.
//!
//! ```text
//! Driver::connect(address)      → Client            (one per address, shared)
//! Client::collection(name)      → Collection        (cheap, per operation)
//! Collection::save / remove / find
//! Client::close()                                    (after the idle delay)
//! ```

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use bson::Document;
use futures_util::stream::BoxStream;
use regex::Regex;

use crate::config::ConnectOptions;

/// Native identifier field of stored documents.
pub const NATIVE_ID_FIELD: &str = "_id";

static TRANSIENT_TIMEOUT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\btimed?[\s_-]?out\b").expect("static regex is valid")
});

/// Whether a driver message carries the transient connect-timeout signature.
pub fn is_transient_timeout(message: &str) -> bool {
    TRANSIENT_TIMEOUT.is_match(message)
}

/// Error reported by a driver. Only the message is kept.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct DriverError {
    pub message: String,
}

impl DriverError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        is_transient_timeout(&self.message)
    }
}

/// Result of [`Collection::save`].
#[derive(Debug, Clone, PartialEq)]
pub enum SaveOutcome {
    /// An existing document was replaced; carries the number of documents touched.
    Updated(u64),
    /// A new document was stored; carries it as persisted, `_id` included.
    Inserted(Document),
}

/// Sort direction for a single key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

impl SortDirection {
    /// The `1` / `-1` form document stores use.
    pub fn as_i32(self) -> i32 {
        match self {
            SortDirection::Ascending => 1,
            SortDirection::Descending => -1,
        }
    }
}

impl From<i32> for SortDirection {
    fn from(value: i32) -> Self {
        if value < 0 {
            SortDirection::Descending
        } else {
            SortDirection::Ascending
        }
    }
}

/// Options for [`Collection::find`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FindOptions {
    pub limit: Option<u64>,
    pub skip: Option<u64>,
    /// Ordered `[field, direction]` pairs; earlier keys take precedence.
    pub sort: Vec<(String, SortDirection)>,
}

impl FindOptions {
    /// The sort list as a native sort document (`{field: 1 | -1, ...}`).
    pub fn sort_document(&self) -> Option<Document> {
        if self.sort.is_empty() {
            return None;
        }
        let mut doc = Document::new();
        for (field, direction) in &self.sort {
            doc.insert(field.clone(), direction.as_i32());
        }
        Some(doc)
    }
}

/// Push-based sequence of documents produced by [`Collection::find`].
pub type DocumentStream = BoxStream<'static, Result<Document, DriverError>>;

/// Establishes physical clients.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Connect to `address`. Called at most once at a time per address.
    async fn connect(
        &self,
        address: &str,
        options: &ConnectOptions,
    ) -> Result<Arc<dyn Client>, DriverError>;
}

/// A physical connection shared by every logical connection to one address.
#[async_trait]
pub trait Client: Send + Sync {
    fn collection(&self, name: &str) -> Arc<dyn Collection>;

    /// Close the underlying transport. Called once, after the idle delay.
    async fn close(&self);
}

/// One named collection on a [`Client`].
#[async_trait]
pub trait Collection: Send + Sync {
    /// Insert `doc`, or replace the stored document with the same `_id`.
    async fn save(&self, doc: Document) -> Result<SaveOutcome, DriverError>;

    /// Delete every document matching `filter`; returns how many were removed.
    async fn remove(&self, filter: Document) -> Result<u64, DriverError>;

    async fn find(&self, filter: Document, options: FindOptions)
    -> Result<DocumentStream, DriverError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_signature_matches() {
        assert!(is_transient_timeout("connection timed out"));
        assert!(is_transient_timeout("Server selection Timeout after 30000 ms"));
        assert!(is_transient_timeout("connect time-out"));
        assert!(!is_transient_timeout("connection refused"));
        assert!(!is_transient_timeout("authentication failed"));
        assert!(!is_transient_timeout("checkout"));
    }

    #[test]
    fn sort_document_keeps_key_order() {
        let options = FindOptions {
            sort: vec![
                ("age".to_string(), SortDirection::Descending),
                ("name".to_string(), SortDirection::Ascending),
            ],
            ..FindOptions::default()
        };
        let doc = options.sort_document().unwrap();
        let keys: Vec<&String> = doc.keys().collect();
        assert_eq!(keys, ["age", "name"]);
        assert_eq!(doc.get_i32("age").unwrap(), -1);
        assert_eq!(doc.get_i32("name").unwrap(), 1);
    }

    #[test]
    fn empty_sort_has_no_document() {
        assert!(FindOptions::default().sort_document().is_none());
    }

    #[test]
    fn direction_from_sign() {
        assert_eq!(SortDirection::from(-1), SortDirection::Descending);
        assert_eq!(SortDirection::from(1), SortDirection::Ascending);
    }
}
