//! Document store client abstraction.
//!
//! The mapper never talks to a database directly. Everything it needs from the
//! underlying hierarchical document store is expressed by the traits in this module:
//!
//! - [`DocumentStoreClient`]: single-document reads and writes, collection queries,
//!   real-time listeners, atomic batches, and transactions
//! - [`StoreTransaction`]: a running optimistic transaction
//! - [`StoreClientBuilder`]: factory trait for creating client instances
//!
//! Paths are slash-separated and alternate collection and document segments. Collection
//! paths have an odd number of segments (`users/u1/messages`), document paths an even
//! number (`users/u1/messages/m1`).

use std::{
    fmt::{self, Debug},
    sync::Arc,
};

use async_trait::async_trait;
use bson::Document;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    error::{DocumentStoreError, DocumentStoreResult},
    plan::Source,
    query::Query,
};

/// A document read from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentSnapshot {
    /// The document identifier (the last path segment).
    pub id: String,
    /// The stored fields. Never contains the identifier.
    pub data: Document,
    /// When the document was last written.
    pub update_time: DateTime<Utc>,
}

/// Options for whole-document writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetOptions {
    /// Merge the written fields into an existing document instead of replacing it.
    pub merge: bool,
}

impl SetOptions {
    pub fn merge() -> Self {
        SetOptions { merge: true }
    }
}

/// A single write inside an atomic batch.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOperation {
    /// Writes the whole document, creating it if needed.
    Set {
        path: String,
        data: Document,
        options: SetOptions,
    },
    /// Merges fields into an existing document. Fails if the document is missing.
    Update { path: String, data: Document },
    /// Removes the document. Missing documents are ignored.
    Delete { path: String },
}

impl WriteOperation {
    /// The document path this write targets.
    pub fn path(&self) -> &str {
        match self {
            WriteOperation::Set { path, .. }
            | WriteOperation::Update { path, .. }
            | WriteOperation::Delete { path } => path,
        }
    }
}

/// Splits a document path into its collection path and document identifier.
///
/// # Errors
///
/// Returns [`DocumentStoreError::InvalidPath`] if the path does not name a document.
pub fn split_document_path(path: &str) -> DocumentStoreResult<(&str, &str)> {
    let segments = path.split('/').count();

    match path.rsplit_once('/') {
        Some((collection, id))
            if segments % 2 == 0 && !id.is_empty() && !collection.split('/').any(str::is_empty) =>
        {
            Ok((collection, id))
        }
        _ => Err(DocumentStoreError::InvalidPath(format!(
            "'{path}' is not a document path"
        ))),
    }
}

/// Receives every result set of a collection listener.
pub type SnapshotSink = Box<dyn FnMut(DocumentStoreResult<Vec<DocumentSnapshot>>) + Send>;

/// Receives every state of a document listener. `None` means the document does not exist.
pub type DocumentSink = Box<dyn FnMut(DocumentStoreResult<Option<DocumentSnapshot>>) + Send>;

/// Handle returned by clients when a listener is attached.
///
/// Calling [`ListenerRegistration::remove`] detaches the listener. Removing twice is a no-op.
pub struct ListenerRegistration {
    detach: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl ListenerRegistration {
    pub fn new(detach: impl FnOnce() + Send + 'static) -> Self {
        ListenerRegistration {
            detach: Mutex::new(Some(Box::new(detach))),
        }
    }

    /// A registration with nothing to detach.
    pub fn noop() -> Self {
        ListenerRegistration {
            detach: Mutex::new(None),
        }
    }

    pub fn remove(&self) {
        if let Some(detach) = self.detach.lock().take() {
            detach();
        }
    }
}

impl Debug for ListenerRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistration")
            .field("attached", &self.detach.lock().is_some())
            .finish()
    }
}

/// Abstract interface for hierarchical document store clients.
///
/// # Thread Safety
///
/// All implementations must be thread-safe and support concurrent access from multiple
/// async tasks.
///
/// # Error Handling
///
/// Transport and server failures are reported as [`DocumentStoreError::Backend`].
/// Optimistic transaction conflicts are reported as
/// [`DocumentStoreError::TransactionAborted`].
#[async_trait]
pub trait DocumentStoreClient: Send + Sync + Debug {
    /// Generates a fresh document identifier.
    fn new_document_id(&self) -> String;

    /// Reads a single document.
    ///
    /// # Arguments
    ///
    /// * `path` - The document path
    ///
    /// # Returns
    ///
    /// Returns `Ok(None)` when the document does not exist.
    async fn get_document(&self, path: &str) -> DocumentStoreResult<Option<DocumentSnapshot>>;

    /// Writes a whole document, creating it when missing.
    ///
    /// # Arguments
    ///
    /// * `path` - The document path
    /// * `data` - The document fields
    /// * `options` - Whether to merge into the existing document
    async fn set_document(
        &self,
        path: &str,
        data: Document,
        options: SetOptions,
    ) -> DocumentStoreResult<()>;

    /// Merges fields into an existing document.
    ///
    /// # Returns
    ///
    /// Returns [`DocumentStoreError::DocumentNotFound`] when the document does not exist.
    async fn update_document(&self, path: &str, data: Document) -> DocumentStoreResult<()>;

    /// Deletes a document. Deleting a missing document succeeds.
    async fn delete_document(&self, path: &str) -> DocumentStoreResult<()>;

    /// Runs a query against one collection.
    ///
    /// # Arguments
    ///
    /// * `path` - The collection path
    /// * `query` - The filter, sort keys, limit and offset to apply
    /// * `source` - Where to read from, when the store distinguishes server and cache
    async fn query_collection(
        &self,
        path: &str,
        query: Query,
        source: Source,
    ) -> DocumentStoreResult<Vec<DocumentSnapshot>>;

    /// Attaches a listener to a collection query.
    ///
    /// The sink receives the current result set once, then again every time it changes,
    /// until the returned registration is removed.
    async fn listen_collection(
        &self,
        path: &str,
        query: Query,
        sink: SnapshotSink,
    ) -> DocumentStoreResult<ListenerRegistration>;

    /// Attaches a listener to a single document.
    async fn listen_document(
        &self,
        path: &str,
        sink: DocumentSink,
    ) -> DocumentStoreResult<ListenerRegistration>;

    /// Applies all writes atomically: either every write is applied or none is.
    async fn commit_batch(&self, writes: Vec<WriteOperation>) -> DocumentStoreResult<()>;

    /// Starts an optimistic transaction.
    async fn begin_transaction(&self) -> DocumentStoreResult<Arc<dyn StoreTransaction>>;

    /// Releases any resources held by the client.
    ///
    /// The default implementation is a no-op.
    async fn shutdown(&self) -> DocumentStoreResult<()> {
        Ok(())
    }
}

/// A running transaction.
///
/// Reads go to the store immediately. Writes are staged and applied atomically by
/// [`StoreTransaction::commit`], which fails with [`DocumentStoreError::TransactionAborted`]
/// if anything read inside the transaction changed in the meantime.
#[async_trait]
pub trait StoreTransaction: Send + Sync + Debug {
    async fn get_document(&self, path: &str) -> DocumentStoreResult<Option<DocumentSnapshot>>;

    fn set_document(
        &self,
        path: &str,
        data: Document,
        options: SetOptions,
    ) -> DocumentStoreResult<()>;

    fn update_document(&self, path: &str, data: Document) -> DocumentStoreResult<()>;

    fn delete_document(&self, path: &str) -> DocumentStoreResult<()>;

    async fn commit(&self) -> DocumentStoreResult<()>;

    async fn rollback(&self) -> DocumentStoreResult<()>;

    /// Drops staged writes without a round trip.
    ///
    /// Called instead of [`StoreTransaction::rollback`] when the transaction is abandoned
    /// before it resolved, because the future driving it was dropped or panicked. The
    /// default implementation does nothing.
    fn abandon(&self) {}
}

/// Factory trait for creating document store clients.
///
/// # Example
///
/// ```ignore
/// let store = InMemoryStoreBuilder::new().build().await?;
/// let mapper = DocumentMapper::new(store);
/// ```
#[async_trait]
pub trait StoreClientBuilder {
    type Client: DocumentStoreClient;

    async fn build(self) -> DocumentStoreResult<Self::Client>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn document_paths_split_into_collection_and_id() {
        assert_eq!(split_document_path("users/u1").unwrap(), ("users", "u1"));
        assert_eq!(
            split_document_path("users/u1/messages/m1").unwrap(),
            ("users/u1/messages", "m1")
        );
        assert!(split_document_path("users").is_err());
        assert!(split_document_path("users/u1/messages").is_err());
        assert!(split_document_path("users/").is_err());
    }

    #[test]
    fn registrations_detach_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let registration = ListenerRegistration::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        registration.remove();
        registration.remove();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
