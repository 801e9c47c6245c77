//! In-memory hierarchical document store.
//!
//! Documents live in a map from collection path (`users`, `users/u1/messages`) to an
//! identifier-ordered map of stored documents. Every write bumps a store-wide clock and
//! stamps the written documents with it, which is what transactions compare at commit
//! and what listeners use to tell whether their results changed.

use std::{
    collections::{BTreeMap, HashMap},
    fmt::{self, Debug},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use bson::{Bson, Document};
use chrono::{DateTime, Utc};
use mea::rwlock::RwLock;
use parking_lot::Mutex;
use tracing::{debug, trace};
use uuid::Uuid;

use docmap_core::{
    client::{
        DocumentSink, DocumentSnapshot, DocumentStoreClient, ListenerRegistration, SetOptions,
        SnapshotSink, StoreClientBuilder, StoreTransaction, WriteOperation, split_document_path,
    },
    error::{DocumentStoreError, DocumentStoreResult},
    plan::Source,
    query::Query,
};

use crate::evaluator::run_query;

#[derive(Debug, Clone)]
struct StoredDocument {
    data: Document,
    version: u64,
    update_time: DateTime<Utc>,
}

type Collection = BTreeMap<String, StoredDocument>;

#[derive(Debug, Default)]
struct StoreState {
    collections: HashMap<String, Collection>,
    clock: u64,
}

fn check_collection_path(path: &str) -> DocumentStoreResult<()> {
    let segments: Vec<&str> = path.split('/').collect();
    if segments.iter().any(|segment| segment.is_empty()) || segments.len() % 2 == 0 {
        return Err(DocumentStoreError::InvalidPath(format!(
            "'{path}' is not a collection path"
        )));
    }
    Ok(())
}

/// Merges `patch` into `target`, descending into nested documents present on both sides.
fn merge_into(target: &mut Document, patch: Document) {
    for (key, value) in patch {
        match (target.get_mut(&key), value) {
            (Some(Bson::Document(existing)), Bson::Document(nested)) => merge_into(existing, nested),
            (_, value) => {
                target.insert(key, value);
            }
        }
    }
}

impl StoreState {
    fn document(&self, path: &str) -> DocumentStoreResult<Option<(&str, &StoredDocument)>> {
        let (collection, id) = split_document_path(path)?;
        Ok(self
            .collections
            .get(collection)
            .and_then(|documents| documents.get_key_value(id))
            .map(|(id, stored)| (id.as_str(), stored)))
    }

    fn snapshot(&self, path: &str) -> DocumentStoreResult<Option<DocumentSnapshot>> {
        Ok(self.document(path)?.map(|(id, stored)| DocumentSnapshot {
            id: id.to_owned(),
            data: stored.data.clone(),
            update_time: stored.update_time,
        }))
    }

    fn version(&self, path: &str) -> DocumentStoreResult<Option<u64>> {
        Ok(self.document(path)?.map(|(_, stored)| stored.version))
    }

    fn query(
        &self,
        path: &str,
        query: &Query,
    ) -> DocumentStoreResult<Vec<(DocumentSnapshot, u64)>> {
        check_collection_path(path)?;
        let Some(documents) = self.collections.get(path) else {
            return Ok(Vec::new());
        };

        let matched = run_query(
            documents.iter().map(|(id, stored)| (id.as_str(), &stored.data)),
            query,
        )?;

        Ok(matched
            .into_iter()
            .filter_map(|(id, _)| documents.get_key_value(id))
            .map(|(id, stored)| {
                let snapshot = DocumentSnapshot {
                    id: id.clone(),
                    data: stored.data.clone(),
                    update_time: stored.update_time,
                };
                (snapshot, stored.version)
            })
            .collect())
    }

    /// Applies every write or none of them.
    fn apply(&mut self, writes: Vec<WriteOperation>) -> DocumentStoreResult<()> {
        let mut exists: HashMap<&str, bool> = HashMap::new();
        for write in &writes {
            let path = write.path();
            let (collection, id) = split_document_path(path)?;
            let present = match exists.get(path) {
                Some(present) => *present,
                None => self.document(path)?.is_some(),
            };
            match write {
                WriteOperation::Set { .. } => {
                    exists.insert(path, true);
                }
                WriteOperation::Update { .. } if !present => {
                    return Err(DocumentStoreError::DocumentNotFound(id.to_owned(), collection.to_owned()));
                }
                WriteOperation::Update { .. } => {}
                WriteOperation::Delete { .. } => {
                    exists.insert(path, false);
                }
            }
        }

        let update_time = Utc::now();
        for write in writes {
            self.clock += 1;
            let version = self.clock;
            let (collection, id) = split_document_path(write.path())?;
            let (collection, id) = (collection.to_owned(), id.to_owned());
            let documents = self.collections.entry(collection).or_default();

            match write {
                WriteOperation::Set { data, options, .. } => {
                    let data = match documents.remove(&id) {
                        Some(mut existing) if options.merge => {
                            merge_into(&mut existing.data, data);
                            existing.data
                        }
                        _ => data,
                    };
                    documents.insert(id, StoredDocument { data, version, update_time });
                }
                WriteOperation::Update { data, .. } => {
                    if let Some(existing) = documents.get_mut(&id) {
                        for (key, value) in data {
                            existing.data.insert(key, value);
                        }
                        existing.version = version;
                        existing.update_time = update_time;
                    }
                }
                WriteOperation::Delete { .. } => {
                    documents.remove(&id);
                }
            }
        }

        Ok(())
    }
}

enum Listener {
    Collection { path: String, query: Query, sink: SnapshotSink },
    Document { path: String, sink: DocumentSink },
}

struct ListenerEntry {
    id: u64,
    inner: Mutex<(Listener, Option<Vec<(String, u64)>>)>,
}

impl ListenerEntry {
    /// Sends the listener its current results, unless they match what it last received.
    fn deliver(&self, state: &StoreState, initial: bool) {
        let mut inner = self.inner.lock();
        let (listener, last) = &mut *inner;

        match listener {
            Listener::Collection { path, query, sink } => match state.query(path, query) {
                Ok(results) => {
                    let fingerprint: Vec<_> = results.iter().map(|(s, v)| (s.id.clone(), *v)).collect();
                    if !initial && last.as_ref() == Some(&fingerprint) {
                        return;
                    }
                    *last = Some(fingerprint);
                    sink(Ok(results.into_iter().map(|(snapshot, _)| snapshot).collect()));
                }
                Err(err) if initial => sink(Err(err)),
                Err(_) => {}
            },
            Listener::Document { path, sink } => match (state.snapshot(path), state.version(path)) {
                (Ok(snapshot), Ok(version)) => {
                    let fingerprint: Vec<_> = snapshot
                        .as_ref()
                        .zip(version)
                        .map(|(s, v)| (s.id.clone(), v))
                        .into_iter()
                        .collect();
                    if !initial && last.as_ref() == Some(&fingerprint) {
                        return;
                    }
                    *last = Some(fingerprint);
                    sink(Ok(snapshot));
                }
                (Err(err), _) | (_, Err(err)) if initial => sink(Err(err)),
                _ => {}
            },
        }
    }
}

type ListenerList = Arc<Mutex<Vec<Arc<ListenerEntry>>>>;

/// Thread-safe in-memory document store.
///
/// `InMemoryStore` is cloneable and uses an `Arc`-wrapped internal state, so clones
/// share the same documents and listeners.
///
/// Queries scan every document of the collection. Listeners are notified while the
/// store's write lock is held, so they observe writes in commit order.
///
/// # Example
///
/// ```ignore
/// use docmap_memory::InMemoryStore;
/// use docmap::client::{DocumentStoreClient, SetOptions};
/// use bson::doc;
///
/// let store = InMemoryStore::new();
/// store.set_document("users/u1", doc! { "name": "Ada" }, SetOptions::default()).await?;
/// assert!(store.get_document("users/u1").await?.is_some());
/// ```
#[derive(Clone)]
pub struct InMemoryStore {
    state: Arc<RwLock<StoreState>>,
    listeners: ListenerList,
    next_listener: Arc<AtomicU64>,
}

impl InMemoryStore {
    /// Creates a new empty in-memory document store.
    pub fn new() -> Self {
        InMemoryStore {
            state: Arc::new(RwLock::new(StoreState::default())),
            listeners: Arc::new(Mutex::new(Vec::new())),
            next_listener: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn builder() -> InMemoryStoreBuilder {
        InMemoryStoreBuilder::default()
    }

    /// Returns the number of attached listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    async fn write(&self, writes: Vec<WriteOperation>) -> DocumentStoreResult<()> {
        let mut state = self.state.write().await;
        state.apply(writes)?;
        self.notify(&state);
        Ok(())
    }

    fn notify(&self, state: &StoreState) {
        let listeners: Vec<_> = self.listeners.lock().clone();
        for listener in listeners {
            listener.deliver(state, false);
        }
    }

    async fn attach(&self, listener: Listener) -> ListenerRegistration {
        let id = self.next_listener.fetch_add(1, Ordering::SeqCst);
        let entry = Arc::new(ListenerEntry {
            id,
            inner: Mutex::new((listener, None)),
        });

        // Registering under the read lock keeps writes from slipping in between the
        // initial snapshot and the first change notification.
        let state = self.state.read().await;
        entry.deliver(&state, true);
        self.listeners.lock().push(entry);
        drop(state);

        trace!(target: "docmap::memory", listener = id, "listener attached");

        let listeners = Arc::clone(&self.listeners);
        ListenerRegistration::new(move || {
            listeners.lock().retain(|entry| entry.id != id);
            trace!(target: "docmap::memory", listener = id, "listener detached");
        })
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        InMemoryStore::new()
    }
}

impl Debug for InMemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryStore")
            .field("listeners", &self.listener_count())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl DocumentStoreClient for InMemoryStore {
    fn new_document_id(&self) -> String {
        Uuid::new_v4().simple().to_string()
    }

    async fn get_document(&self, path: &str) -> DocumentStoreResult<Option<DocumentSnapshot>> {
        self.state.read().await.snapshot(path)
    }

    async fn set_document(
        &self,
        path: &str,
        data: Document,
        options: SetOptions,
    ) -> DocumentStoreResult<()> {
        self.write(vec![WriteOperation::Set {
            path: path.to_owned(),
            data,
            options,
        }])
        .await
    }

    async fn update_document(&self, path: &str, data: Document) -> DocumentStoreResult<()> {
        self.write(vec![WriteOperation::Update {
            path: path.to_owned(),
            data,
        }])
        .await
    }

    async fn delete_document(&self, path: &str) -> DocumentStoreResult<()> {
        self.write(vec![WriteOperation::Delete { path: path.to_owned() }]).await
    }

    async fn query_collection(
        &self,
        path: &str,
        query: Query,
        _source: Source,
    ) -> DocumentStoreResult<Vec<DocumentSnapshot>> {
        let state = self.state.read().await;
        Ok(state
            .query(path, &query)?
            .into_iter()
            .map(|(snapshot, _)| snapshot)
            .collect())
    }

    async fn listen_collection(
        &self,
        path: &str,
        query: Query,
        sink: SnapshotSink,
    ) -> DocumentStoreResult<ListenerRegistration> {
        check_collection_path(path)?;
        Ok(self
            .attach(Listener::Collection {
                path: path.to_owned(),
                query,
                sink,
            })
            .await)
    }

    async fn listen_document(
        &self,
        path: &str,
        sink: DocumentSink,
    ) -> DocumentStoreResult<ListenerRegistration> {
        split_document_path(path)?;
        Ok(self
            .attach(Listener::Document {
                path: path.to_owned(),
                sink,
            })
            .await)
    }

    async fn commit_batch(&self, writes: Vec<WriteOperation>) -> DocumentStoreResult<()> {
        debug!(target: "docmap::memory", writes = writes.len(), "committing batch");
        self.write(writes).await
    }

    async fn begin_transaction(&self) -> DocumentStoreResult<Arc<dyn StoreTransaction>> {
        Ok(Arc::new(InMemoryTransaction {
            store: self.clone(),
            reads: Mutex::new(HashMap::new()),
            writes: Mutex::new(Vec::new()),
        }))
    }
}

/// An optimistic transaction over an [`InMemoryStore`].
///
/// Reads go straight to the store and remember the version they saw. Writes are staged
/// and applied at commit, which fails with [`DocumentStoreError::TransactionAborted`] if
/// any document read in the meantime changed.
pub struct InMemoryTransaction {
    store: InMemoryStore,
    reads: Mutex<HashMap<String, Option<u64>>>,
    writes: Mutex<Vec<WriteOperation>>,
}

impl InMemoryTransaction {
    fn stage(&self, write: WriteOperation) -> DocumentStoreResult<()> {
        split_document_path(write.path())?;
        self.writes.lock().push(write);
        Ok(())
    }
}

impl Debug for InMemoryTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryTransaction")
            .field("reads", &self.reads.lock().len())
            .field("writes", &self.writes.lock().len())
            .finish()
    }
}

#[async_trait]
impl StoreTransaction for InMemoryTransaction {
    async fn get_document(&self, path: &str) -> DocumentStoreResult<Option<DocumentSnapshot>> {
        let state = self.store.state.read().await;
        let version = state.version(path)?;
        self.reads.lock().entry(path.to_owned()).or_insert(version);
        state.snapshot(path)
    }

    fn set_document(
        &self,
        path: &str,
        data: Document,
        options: SetOptions,
    ) -> DocumentStoreResult<()> {
        self.stage(WriteOperation::Set {
            path: path.to_owned(),
            data,
            options,
        })
    }

    fn update_document(&self, path: &str, data: Document) -> DocumentStoreResult<()> {
        self.stage(WriteOperation::Update {
            path: path.to_owned(),
            data,
        })
    }

    fn delete_document(&self, path: &str) -> DocumentStoreResult<()> {
        self.stage(WriteOperation::Delete { path: path.to_owned() })
    }

    async fn commit(&self) -> DocumentStoreResult<()> {
        let reads = std::mem::take(&mut *self.reads.lock());
        let writes = std::mem::take(&mut *self.writes.lock());

        let mut state = self.store.state.write().await;
        for (path, seen) in reads {
            if state.version(&path)? != seen {
                debug!(target: "docmap::memory", path = %path, "transaction conflict");
                return Err(DocumentStoreError::TransactionAborted(format!(
                    "{path} changed after it was read"
                )));
            }
        }

        state.apply(writes)?;
        self.store.notify(&state);
        Ok(())
    }

    async fn rollback(&self) -> DocumentStoreResult<()> {
        self.abandon();
        Ok(())
    }

    fn abandon(&self) {
        self.reads.lock().clear();
        self.writes.lock().clear();
    }
}

/// Builder for constructing [`InMemoryStore`] instances.
#[derive(Debug, Default)]
pub struct InMemoryStoreBuilder;

#[async_trait]
impl StoreClientBuilder for InMemoryStoreBuilder {
    type Client = InMemoryStore;

    /// Always succeeds with a freshly initialized store.
    async fn build(self) -> DocumentStoreResult<Self::Client> {
        Ok(InMemoryStore::new())
    }
}
