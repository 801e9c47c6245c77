//! Atomic write batches.
//!
//! A [`WriteBatch`] queues creates, updates and deletes across any number of collections
//! and commits them in one atomic store call. Batch repositories only enqueue: nothing
//! reaches the store before [`WriteBatch::commit`].
//!
//! ```ignore
//! let batch = mapper.create_batch();
//! let users = batch.repository::<User>()?;
//! let ada = users.create(User::named("Ada"))?;
//! batch.repository_at::<Message>(format!("users/{}/messages", ada.id))?
//!     .create(Message::text("hello"))?;
//! batch.commit().await?;
//! ```
//!
//! Commits validate every queued entity first (when validation is enabled) and write
//! nothing if any of them fails. A failed or cancelled commit leaves the queue intact
//! so it can be retried; a successful one empties it.

use std::{
    fmt::{self, Debug},
    marker::PhantomData,
    ops::Deref,
    sync::Arc,
};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
    client::{SetOptions, WriteOperation},
    entity::{AnyEntity, Entity},
    error::{DocumentStoreError, DocumentStoreResult},
    mapper::MapperContext,
    metadata::{CollectionTarget, FullCollectionDescriptor},
    resolver::locate,
    validate::{ValidatorOptions, ensure_valid},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOperationKind {
    Create,
    Update,
    Delete,
}

/// One queued write.
#[derive(Debug, Clone)]
pub struct BatchOperation {
    pub kind: BatchOperationKind,
    pub entity: Box<dyn AnyEntity>,
    pub document_path: String,
    pub collection: Arc<FullCollectionDescriptor>,
    /// Whether the entity is validated before the commit writes anything.
    pub validate: bool,
    pub validator_options: ValidatorOptions,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BatchStatus {
    #[default]
    Pending,
    Committing,
}

#[derive(Debug, Default)]
struct BatchState {
    status: BatchStatus,
    operations: Vec<BatchOperation>,
}

/// Resets the batch to pending when a commit ends, whether it succeeded, failed, or was
/// dropped mid-flight.
struct CommitGuard<'a> {
    state: &'a Mutex<BatchState>,
}

impl Drop for CommitGuard<'_> {
    fn drop(&mut self) {
        self.state.lock().status = BatchStatus::Pending;
    }
}

/// The operation queue and commit state machine behind a [`WriteBatch`].
#[derive(Debug)]
pub struct BatchCoordinator {
    context: Arc<MapperContext>,
    state: Mutex<BatchState>,
}

impl BatchCoordinator {
    pub fn new(context: Arc<MapperContext>) -> Self {
        BatchCoordinator {
            context,
            state: Mutex::new(BatchState::default()),
        }
    }

    pub fn context(&self) -> &Arc<MapperContext> {
        &self.context
    }

    pub fn status(&self) -> BatchStatus {
        self.state.lock().status
    }

    pub fn len(&self) -> usize {
        self.state.lock().operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().operations.is_empty()
    }

    /// Queues an operation.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentStoreError::AlreadyCommitting`] while a commit is in flight.
    pub fn add(&self, operation: BatchOperation) -> DocumentStoreResult<()> {
        let mut state = self.state.lock();
        if state.status == BatchStatus::Committing {
            return Err(DocumentStoreError::AlreadyCommitting);
        }
        state.operations.push(operation);
        Ok(())
    }

    /// Validates, serializes and atomically writes every queued operation.
    ///
    /// # Errors
    ///
    /// * [`DocumentStoreError::AlreadyCommitting`] if another commit is in flight
    /// * [`DocumentStoreError::EmptyBatch`] if nothing is queued
    /// * [`DocumentStoreError::Validation`] with the errors of every invalid entity
    /// * Any error of the store's atomic commit
    pub async fn commit(&self) -> DocumentStoreResult<()> {
        let operations = {
            let mut state = self.state.lock();
            if state.status == BatchStatus::Committing {
                return Err(DocumentStoreError::AlreadyCommitting);
            }
            if state.operations.is_empty() {
                return Err(DocumentStoreError::EmptyBatch);
            }
            state.status = BatchStatus::Committing;
            state.operations.clone()
        };
        let _guard = CommitGuard { state: &self.state };

        debug!(target: "docmap::batch", operations = operations.len(), "committing batch");

        let writes = self.prepare(&operations)?;
        self.context.client().commit_batch(writes).await?;

        self.state.lock().operations.clear();
        debug!(target: "docmap::batch", "batch committed");

        Ok(())
    }

    /// Discards every queued operation.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentStoreError::AlreadyCommitting`] while a commit is in flight.
    pub fn clear(&self) -> DocumentStoreResult<()> {
        let mut state = self.state.lock();
        if state.status == BatchStatus::Committing {
            return Err(DocumentStoreError::AlreadyCommitting);
        }
        state.operations.clear();
        Ok(())
    }

    fn prepare(&self, operations: &[BatchOperation]) -> DocumentStoreResult<Vec<WriteOperation>> {
        let validator = self.context.validator();
        let mut errors = Vec::new();

        for operation in operations {
            if operation.kind == BatchOperationKind::Delete || !operation.validate {
                continue;
            }
            let bson = operation.entity.to_any_bson()?;
            errors.extend(validator.validate(&bson, &operation.collection, &operation.validator_options));
        }

        if !errors.is_empty() {
            warn!(target: "docmap::batch", errors = errors.len(), "batch failed validation, nothing written");
        }
        ensure_valid(errors)?;

        operations
            .iter()
            .map(|operation| {
                let path = operation.document_path.clone();
                if operation.kind == BatchOperationKind::Delete {
                    return Ok(WriteOperation::Delete { path });
                }

                let data = self
                    .context
                    .serializer()
                    .serialize(operation.entity.to_any_bson()?, &operation.collection.sub_collections)?;

                Ok(match operation.kind {
                    BatchOperationKind::Create => WriteOperation::Set {
                        path,
                        data,
                        options: SetOptions::default(),
                    },
                    _ => WriteOperation::Update { path, data },
                })
            })
            .collect()
    }
}

/// A handle for queuing writes across collections and committing them atomically.
///
/// Clones share the same queue.
#[derive(Debug, Clone)]
pub struct WriteBatch {
    coordinator: Arc<BatchCoordinator>,
}

impl WriteBatch {
    pub fn new(context: Arc<MapperContext>) -> Self {
        WriteBatch {
            coordinator: Arc::new(BatchCoordinator::new(context)),
        }
    }

    fn open<T: Entity>(&self, target: CollectionTarget) -> DocumentStoreResult<BatchRepository<T>> {
        let (collection, path) = locate::<T>(self.coordinator.context().registry(), target)?;
        Ok(BatchRepository::new(
            Arc::clone(&self.coordinator),
            Arc::new(collection),
            path,
        ))
    }

    /// Returns a batch repository for the root collection holding `T`.
    pub fn repository<T: Entity>(&self) -> DocumentStoreResult<BatchRepository<T>> {
        self.open(CollectionTarget::of::<T>())
    }

    /// Returns a batch repository for the collection at `path`.
    pub fn repository_at<T: Entity>(
        &self,
        path: impl Into<String>,
    ) -> DocumentStoreResult<BatchRepository<T>> {
        self.open(CollectionTarget::Path(path.into()))
    }

    pub fn coordinator(&self) -> &Arc<BatchCoordinator> {
        &self.coordinator
    }

    pub fn len(&self) -> usize {
        self.coordinator.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coordinator.is_empty()
    }

    pub fn status(&self) -> BatchStatus {
        self.coordinator.status()
    }

    /// Commits every queued operation. See [`BatchCoordinator::commit`].
    pub async fn commit(&self) -> DocumentStoreResult<()> {
        self.coordinator.commit().await
    }
}

/// Queues writes for one collection of a batch.
pub struct BatchRepository<T: Entity> {
    coordinator: Arc<BatchCoordinator>,
    collection: Arc<FullCollectionDescriptor>,
    path: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Entity> BatchRepository<T> {
    pub(crate) fn new(
        coordinator: Arc<BatchCoordinator>,
        collection: Arc<FullCollectionDescriptor>,
        path: String,
    ) -> Self {
        BatchRepository {
            coordinator,
            collection,
            path,
            _marker: PhantomData,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn enqueue(&self, kind: BatchOperationKind, item: &T) -> DocumentStoreResult<()> {
        let config = self.coordinator.context().config();
        self.coordinator.add(BatchOperation {
            kind,
            entity: Box::new(item.clone()),
            document_path: format!("{}/{}", self.path, item.id()),
            collection: Arc::clone(&self.collection),
            validate: config.validate_models,
            validator_options: config.validator_options.clone(),
        })
    }

    fn require_id(&self, item: &T) -> DocumentStoreResult<()> {
        if item.id().is_empty() {
            return Err(DocumentStoreError::InvalidDocument(format!(
                "{} entities need an id to be batched",
                T::entity_name()
            )));
        }
        Ok(())
    }

    /// Queues the creation of `item`, assigning an identifier when it has none.
    ///
    /// Returns the entity as it will be written.
    pub fn create(&self, mut item: T) -> DocumentStoreResult<T> {
        if item.id().is_empty() {
            item.set_id(self.coordinator.context().client().new_document_id());
        }
        self.enqueue(BatchOperationKind::Create, &item)?;
        Ok(item)
    }

    /// Queues an update of `item`.
    pub fn update(&self, item: &T) -> DocumentStoreResult<()> {
        self.require_id(item)?;
        self.enqueue(BatchOperationKind::Update, item)
    }

    /// Queues the deletion of `item`.
    pub fn delete(&self, item: &T) -> DocumentStoreResult<()> {
        self.require_id(item)?;
        self.enqueue(BatchOperationKind::Delete, item)
    }
}

impl<T: Entity> Debug for BatchRepository<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchRepository")
            .field("entity", &self.collection.entity_type())
            .field("path", &self.path)
            .finish()
    }
}

/// A batch repository that owns its batch and can commit it.
pub struct BatchSingleRepository<T: Entity> {
    inner: BatchRepository<T>,
}

impl<T: Entity> BatchSingleRepository<T> {
    pub(crate) fn new(
        coordinator: Arc<BatchCoordinator>,
        collection: Arc<FullCollectionDescriptor>,
        path: String,
    ) -> Self {
        BatchSingleRepository {
            inner: BatchRepository::new(coordinator, collection, path),
        }
    }

    pub async fn commit(&self) -> DocumentStoreResult<()> {
        self.inner.coordinator.commit().await
    }
}

impl<T: Entity> Deref for BatchSingleRepository<T> {
    type Target = BatchRepository<T>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<T: Entity> Debug for BatchSingleRepository<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BatchSingleRepository").field(&self.inner).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::MapperConfig,
        testing::{FailingValidator, Message, User, recording_mapper, recording_mapper_with},
    };

    #[tokio::test]
    async fn empty_batches_cannot_commit() {
        let (mapper, client) = recording_mapper();

        assert!(matches!(
            mapper.create_batch().commit().await,
            Err(DocumentStoreError::EmptyBatch)
        ));
        assert!(client.calls().is_empty());
    }

    #[tokio::test]
    async fn writes_across_collections_commit_together() {
        let (mapper, client) = recording_mapper();
        let batch = mapper.create_batch();

        let ada = batch.repository::<User>().unwrap().create(User::named("", "Ada")).unwrap();
        batch
            .repository_at::<Message>(format!("users/{}/messages", ada.id))
            .unwrap()
            .create(Message::text("m1", "hello"))
            .unwrap();
        batch.repository::<User>().unwrap().delete(&User::named("u9", "Old")).unwrap();
        assert_eq!(batch.len(), 3);

        batch.commit().await.unwrap();

        assert!(batch.is_empty());
        assert_eq!(client.calls(), vec!["batch".to_owned()]);
        let paths: Vec<_> = client.batches()[0].iter().map(|w| w.path().to_owned()).collect();
        assert_eq!(
            paths,
            vec![
                format!("users/{}", ada.id),
                format!("users/{}/messages/m1", ada.id),
                "users/u9".to_owned(),
            ]
        );
    }

    #[tokio::test]
    async fn concurrent_commits_are_rejected() {
        let (mapper, client) = recording_mapper();
        let batch = mapper.create_batch();
        let users = batch.repository::<User>().unwrap();
        users.create(User::named("", "Ada")).unwrap();
        let release = client.hold_next_batch();

        let (first, (second, queued)) = futures::join!(batch.commit(), async {
            let second = batch.commit().await;
            let queued = users.create(User::named("", "Grace"));
            let _ = release.send(());
            (second, queued)
        });

        assert!(first.is_ok());
        assert!(matches!(second, Err(DocumentStoreError::AlreadyCommitting)));
        assert!(matches!(queued, Err(DocumentStoreError::AlreadyCommitting)));
        assert_eq!(batch.status(), BatchStatus::Pending);
        assert_eq!(client.batches().len(), 1);
    }

    #[tokio::test]
    async fn invalid_entities_abort_the_whole_batch() {
        let (mapper, client) = recording_mapper_with(
            FailingValidator,
            MapperConfig::builder().validate_models(true).build(),
        );
        let batch = mapper.create_batch();
        let users = batch.repository::<User>().unwrap();
        users.create(User::named("u1", "Ada")).unwrap();
        users.create(User::named("u2", "Grace")).unwrap();

        let err = batch.commit().await.unwrap_err();

        assert_eq!(err.validation_errors().map(<[_]>::len), Some(2));
        assert!(client.calls().is_empty());
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.status(), BatchStatus::Pending);
    }

    #[tokio::test]
    async fn single_repositories_commit_their_own_batch() {
        let (mapper, client) = recording_mapper();
        let users = mapper.repository::<User>().unwrap().create_batch();

        users.update(&User::named("u1", "Ada")).unwrap();
        assert!(matches!(
            users.update(&User::named("", "Nobody")),
            Err(DocumentStoreError::InvalidDocument(_))
        ));
        users.commit().await.unwrap();

        assert!(matches!(client.batches()[0][0], WriteOperation::Update { .. }));
    }
}
