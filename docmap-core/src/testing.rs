//! Fixtures shared by the unit tests of this crate.

use std::{
    collections::HashMap,
    marker::PhantomData,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use bson::Document;
use chrono::Utc;
use futures::channel::oneshot;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    client::{
        DocumentSink, DocumentSnapshot, DocumentStoreClient, ListenerRegistration, SetOptions,
        SnapshotSink, StoreTransaction, WriteOperation,
    },
    config::MapperConfig,
    entity::{AccessorSlot, Entity, SubCollection},
    error::DocumentStoreResult,
    executor::{QueryExecutor, QueryOutcome, Subscription},
    mapper::{DocumentMapper, DocumentMapperBuilder},
    metadata::{CollectionDescriptor, MetadataRegistry},
    plan::{OrderBy, QueryClause, QueryExecutionPlan, Source},
    query::Query,
    validate::{ValidationError, Validator, ValidatorOptions},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub messages: SubCollection<Message>,
}

impl User {
    pub fn named(id: &str, name: &str) -> Self {
        User {
            id: id.to_owned(),
            name: name.to_owned(),
            messages: SubCollection::new(),
        }
    }
}

impl Entity for User {
    fn id(&self) -> &str {
        &self.id
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }

    fn sub_collection(&self, accessor_key: &str) -> Option<&AccessorSlot> {
        match accessor_key {
            "messages" => Some(self.messages.slot()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub attachments: SubCollection<Attachment>,
}

impl Message {
    pub fn text(id: &str, text: &str) -> Self {
        Message {
            id: id.to_owned(),
            text: text.to_owned(),
            attachments: SubCollection::new(),
        }
    }
}

impl Entity for Message {
    fn id(&self) -> &str {
        &self.id
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }

    fn sub_collection(&self, accessor_key: &str) -> Option<&AccessorSlot> {
        match accessor_key {
            "attachments" => Some(self.attachments.slot()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub file_name: String,
}

impl Entity for Attachment {
    fn id(&self) -> &str {
        &self.id
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }
}

#[derive(Debug, Default)]
struct RecordingState {
    calls: Vec<String>,
    documents: HashMap<String, Document>,
    last_set: Option<Document>,
    batches: Vec<Vec<WriteOperation>>,
    batch_gate: Option<oneshot::Receiver<()>>,
}

/// A client that records every store call and keeps written documents in a map.
///
/// Identifier generation and writes staged inside a transaction are not recorded.
#[derive(Debug, Default)]
pub struct RecordingClient {
    state: Arc<Mutex<RecordingState>>,
    ids: AtomicUsize,
}

impl RecordingClient {
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn last_set(&self) -> Option<Document> {
        self.state.lock().last_set.clone()
    }

    pub fn batches(&self) -> Vec<Vec<WriteOperation>> {
        self.state.lock().batches.clone()
    }

    /// Makes the next batch commit wait until the returned sender fires.
    pub fn hold_next_batch(&self) -> oneshot::Sender<()> {
        let (release, gate) = oneshot::channel();
        self.state.lock().batch_gate = Some(gate);
        release
    }

    fn record(&self, call: String) {
        self.state.lock().calls.push(call);
    }
}

#[async_trait]
impl DocumentStoreClient for RecordingClient {
    fn new_document_id(&self) -> String {
        format!("generated-{}", self.ids.fetch_add(1, Ordering::SeqCst))
    }

    async fn get_document(&self, path: &str) -> DocumentStoreResult<Option<DocumentSnapshot>> {
        self.record(format!("get {path}"));
        let state = self.state.lock();
        Ok(state.documents.get(path).map(|data| DocumentSnapshot {
            id: path.rsplit('/').next().unwrap_or_default().to_owned(),
            data: data.clone(),
            update_time: Utc::now(),
        }))
    }

    async fn set_document(
        &self,
        path: &str,
        data: Document,
        _options: SetOptions,
    ) -> DocumentStoreResult<()> {
        let mut state = self.state.lock();
        state.calls.push(format!("set {path}"));
        state.documents.insert(path.to_owned(), data.clone());
        state.last_set = Some(data);
        Ok(())
    }

    async fn update_document(&self, path: &str, data: Document) -> DocumentStoreResult<()> {
        let mut state = self.state.lock();
        state.calls.push(format!("update {path}"));
        state.documents.insert(path.to_owned(), data);
        Ok(())
    }

    async fn delete_document(&self, path: &str) -> DocumentStoreResult<()> {
        let mut state = self.state.lock();
        state.calls.push(format!("delete {path}"));
        state.documents.remove(path);
        Ok(())
    }

    async fn query_collection(
        &self,
        path: &str,
        _query: Query,
        _source: Source,
    ) -> DocumentStoreResult<Vec<DocumentSnapshot>> {
        self.record(format!("query {path}"));
        Ok(Vec::new())
    }

    async fn listen_collection(
        &self,
        path: &str,
        _query: Query,
        mut sink: SnapshotSink,
    ) -> DocumentStoreResult<ListenerRegistration> {
        self.record(format!("listen {path}"));
        sink(Ok(Vec::new()));
        Ok(ListenerRegistration::noop())
    }

    async fn listen_document(
        &self,
        path: &str,
        mut sink: DocumentSink,
    ) -> DocumentStoreResult<ListenerRegistration> {
        self.record(format!("listen {path}"));
        sink(Ok(None));
        Ok(ListenerRegistration::noop())
    }

    async fn commit_batch(&self, writes: Vec<WriteOperation>) -> DocumentStoreResult<()> {
        let gate = {
            let mut state = self.state.lock();
            state.calls.push("batch".to_owned());
            state.batch_gate.take()
        };
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        self.state.lock().batches.push(writes);
        Ok(())
    }

    async fn begin_transaction(&self) -> DocumentStoreResult<Arc<dyn StoreTransaction>> {
        self.record("begin".to_owned());
        Ok(Arc::new(RecordingTransaction {
            state: Arc::clone(&self.state),
            staged: Mutex::new(Vec::new()),
        }))
    }
}

#[derive(Debug)]
pub struct RecordingTransaction {
    state: Arc<Mutex<RecordingState>>,
    staged: Mutex<Vec<WriteOperation>>,
}

#[async_trait]
impl StoreTransaction for RecordingTransaction {
    async fn get_document(&self, path: &str) -> DocumentStoreResult<Option<DocumentSnapshot>> {
        let state = self.state.lock();
        Ok(state.documents.get(path).map(|data| DocumentSnapshot {
            id: path.rsplit('/').next().unwrap_or_default().to_owned(),
            data: data.clone(),
            update_time: Utc::now(),
        }))
    }

    fn set_document(
        &self,
        path: &str,
        data: Document,
        options: SetOptions,
    ) -> DocumentStoreResult<()> {
        self.staged.lock().push(WriteOperation::Set {
            path: path.to_owned(),
            data,
            options,
        });
        Ok(())
    }

    fn update_document(&self, path: &str, data: Document) -> DocumentStoreResult<()> {
        self.staged.lock().push(WriteOperation::Update {
            path: path.to_owned(),
            data,
        });
        Ok(())
    }

    fn delete_document(&self, path: &str) -> DocumentStoreResult<()> {
        self.staged.lock().push(WriteOperation::Delete { path: path.to_owned() });
        Ok(())
    }

    async fn commit(&self) -> DocumentStoreResult<()> {
        let staged = std::mem::take(&mut *self.staged.lock());
        let mut state = self.state.lock();
        state.calls.push("commit".to_owned());
        for write in staged {
            match write {
                WriteOperation::Set { path, data, .. } | WriteOperation::Update { path, data } => {
                    state.documents.insert(path, data);
                }
                WriteOperation::Delete { path } => {
                    state.documents.remove(&path);
                }
            }
        }
        Ok(())
    }

    async fn rollback(&self) -> DocumentStoreResult<()> {
        self.staged.lock().clear();
        self.state.lock().calls.push("rollback".to_owned());
        Ok(())
    }

    fn abandon(&self) {
        self.staged.lock().clear();
        self.state.lock().calls.push("abandon".to_owned());
    }
}

/// A mapper over a fresh [`RecordingClient`] and a private registry holding
/// `users`, `users/{id}/messages` and `users/{id}/messages/{id}/attachments`.
pub fn recording_mapper() -> (DocumentMapper, Arc<RecordingClient>) {
    recording_mapper_with(crate::validate::NoopValidator, MapperConfig::default())
}

pub fn recording_mapper_with(
    validator: impl Validator + 'static,
    config: MapperConfig,
) -> (DocumentMapper, Arc<RecordingClient>) {
    let registry = Arc::new(MetadataRegistry::new());
    registry.register_collection::<User>(None).unwrap();
    registry
        .register_sub_collection::<User, Message>("messages", Some("messages"))
        .unwrap();
    registry
        .register_sub_collection::<Message, Attachment>("attachments", Some("attachments"))
        .unwrap();

    let client = Arc::new(RecordingClient::default());
    let mapper = DocumentMapperBuilder::new(client.clone() as Arc<dyn DocumentStoreClient>)
        .registry(registry)
        .validator(validator)
        .config(config)
        .build();

    (mapper, client)
}

/// Rejects every entity with a single error.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailingValidator;

impl Validator for FailingValidator {
    fn validate(
        &self,
        _entity: &bson::Bson,
        collection: &CollectionDescriptor,
        _options: &ValidatorOptions,
    ) -> Vec<ValidationError> {
        vec![ValidationError::new(
            collection.entity_type().name(),
            "name",
            "isNotEmpty",
            "name should not be empty",
        )]
    }
}

/// What a [`CapturingExecutor`] saw of the last plan it ran.
#[derive(Debug, Clone)]
pub struct PlanSummary {
    pub single: bool,
    pub clauses: Vec<QueryClause>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub post_processors: usize,
}

/// An executor that returns nothing and remembers the plans it was given.
pub struct CapturingExecutor<T> {
    last: Mutex<Option<PlanSummary>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Default for CapturingExecutor<T> {
    fn default() -> Self {
        CapturingExecutor {
            last: Mutex::new(None),
            _marker: PhantomData,
        }
    }
}

impl<T> CapturingExecutor<T> {
    pub fn last_plan(&self) -> Option<PlanSummary> {
        self.last.lock().clone()
    }
}

#[async_trait]
impl<T: Entity> QueryExecutor<T> for CapturingExecutor<T> {
    async fn execute(&self, plan: QueryExecutionPlan<T>) -> DocumentStoreResult<QueryOutcome<T>> {
        *self.last.lock() = Some(PlanSummary {
            single: plan.single,
            clauses: plan.clauses.clone(),
            order_by: plan.order_by.clone(),
            limit: plan.limit,
            offset: plan.offset,
            post_processors: plan.post_processors.len(),
        });

        if plan.is_listening() {
            return Ok(QueryOutcome::Subscription(Subscription::new(
                Arc::new(AtomicBool::new(true)),
                ListenerRegistration::noop(),
            )));
        }
        Ok(QueryOutcome::Items(plan.post_process(Vec::new())))
    }
}
