//! Repositories: typed access to one collection.
//!
//! A [`Repository`] reads and writes the entities of one concrete collection path
//! (`users`, or `users/u1/messages`). It executes the query plans built through its
//! [`Queryable`] entry points, and binds the [`SubCollection`](crate::entity::SubCollection)
//! accessors of every entity it returns.
//!
//! # Example
//!
//! ```ignore
//! let users = mapper.repository::<User>()?;
//!
//! let ada = users.create(User::named("Ada")).await?;
//! let found = users.find_by_id(&ada.id).await?;
//! let adults = users.where_greater_or_equal_than("age", 18).find().await?;
//! ```

use std::{
    fmt::{self, Debug},
    marker::PhantomData,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use bson::{Bson, Document, de::deserialize_from_bson};
use tracing::{debug, trace};

use crate::{
    batch::{BatchCoordinator, BatchSingleRepository},
    builder::{QueryBuilder, Queryable},
    client::{DocumentSink, DocumentSnapshot, SetOptions, SnapshotSink},
    entity::{AccessorSlot, Binding, Entity, EntityExt},
    error::{DocumentStoreError, DocumentStoreResult},
    executor::{QueryExecutor, QueryOutcome, Subscription},
    mapper::MapperContext,
    metadata::{CollectionTarget, FullCollectionDescriptor},
    plan::{QueryExecutionPlan, apply_post_processors},
    resolver::locate,
    transaction::{TransactionCoordinator, TransactionRepository},
    validate::{ValidationError, ensure_valid, validate_entity},
};

/// Typed access to the entities of one collection.
///
/// Cloning a repository is cheap.
pub struct Repository<T: Entity> {
    context: Arc<MapperContext>,
    collection: Arc<FullCollectionDescriptor>,
    path: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Entity> Repository<T> {
    /// Opens the repository for `target`.
    ///
    /// # Errors
    ///
    /// See [`RepositoryResolver::resolve`](crate::resolver::RepositoryResolver::resolve).
    pub fn open(
        context: Arc<MapperContext>,
        target: CollectionTarget,
    ) -> DocumentStoreResult<Self> {
        let (collection, path) = locate::<T>(context.registry(), target)?;
        Ok(Repository {
            context,
            collection: Arc::new(collection),
            path,
            _marker: PhantomData,
        })
    }

    /// The collection path this repository reads and writes.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn collection(&self) -> &FullCollectionDescriptor {
        &self.collection
    }

    pub fn context(&self) -> &Arc<MapperContext> {
        &self.context
    }

    fn document_path(&self, id: &str) -> String {
        format!("{}/{}", self.path, id)
    }

    fn bind(&self, entity: &T) {
        bind_sub_collections(entity, &self.collection, &self.path, |slot, _, path| {
            slot.bind(Binding::Default {
                context: Arc::clone(&self.context),
                path,
            });
        });
    }

    fn materialize(&self, snapshot: DocumentSnapshot) -> DocumentStoreResult<T> {
        let entity = materialize::<T>(&self.context, &self.collection, snapshot)?;
        self.bind(&entity);
        Ok(entity)
    }

    fn materialize_all(&self, snapshots: Vec<DocumentSnapshot>) -> DocumentStoreResult<Vec<T>> {
        snapshots
            .into_iter()
            .map(|snapshot| self.materialize(snapshot))
            .collect()
    }

    /// Checks `item` with the configured validator.
    pub fn validate(&self, item: &T) -> DocumentStoreResult<Vec<ValidationError>> {
        validate_entity(
            self.context.validator().as_ref(),
            item,
            &self.collection,
            &self.context.config().validator_options,
        )
    }

    fn prepare_write(&self, item: &T) -> DocumentStoreResult<Document> {
        prepare_write(&self.context, &self.collection, item)
    }

    /// Reads one entity by identifier.
    pub async fn find_by_id(&self, id: &str) -> DocumentStoreResult<Option<T>> {
        self.context
            .client()
            .get_document(&self.document_path(id))
            .await?
            .map(|snapshot| self.materialize(snapshot))
            .transpose()
    }

    /// Subscribes to one entity. `on_next` receives `None` while the document does not exist.
    pub async fn find_by_id_and_listen<N, E>(
        &self,
        id: &str,
        on_next: N,
        on_error: E,
    ) -> DocumentStoreResult<Subscription>
    where
        N: Fn(Option<T>) + Send + Sync + 'static,
        E: Fn(DocumentStoreError) + Send + Sync + 'static,
    {
        let gate = Arc::new(AtomicBool::new(true));
        let sink_gate = Arc::clone(&gate);
        let repository = self.clone();

        let sink: DocumentSink = Box::new(move |result| {
            if !sink_gate.load(Ordering::Acquire) {
                return;
            }
            match result.and_then(|snapshot| snapshot.map(|s| repository.materialize(s)).transpose()) {
                Ok(entity) => on_next(entity),
                Err(err) => on_error(err),
            }
        });

        let registration = self
            .context
            .client()
            .listen_document(&self.document_path(id), sink)
            .await?;
        Ok(Subscription::new(gate, registration))
    }

    /// Creates a new entity.
    ///
    /// Entities without an identifier get a fresh one from the client. The returned entity
    /// carries the identifier and has its sub-collection accessors bound.
    ///
    /// # Errors
    ///
    /// * [`DocumentStoreError::Validation`] if validation is enabled and fails
    /// * [`DocumentStoreError::DocumentAlreadyExists`] if an entity with the same identifier exists
    pub async fn create(&self, mut item: T) -> DocumentStoreResult<T> {
        let mut data = self.prepare_write(&item)?;

        if item.id().is_empty() {
            let id = self.context.client().new_document_id();
            data.insert(T::ID_FIELD, Bson::String(id.clone()));
            item.set_id(id);
        } else if self.find_by_id(item.id()).await?.is_some() {
            return Err(DocumentStoreError::DocumentAlreadyExists(
                item.id().to_owned(),
                self.path.clone(),
            ));
        }

        debug!(target: "docmap::repository", path = %self.path, id = item.id(), "creating entity");
        self.context
            .client()
            .set_document(&self.document_path(item.id()), data, SetOptions::default())
            .await?;
        self.bind(&item);

        Ok(item)
    }

    /// Replaces an existing entity.
    pub async fn update(&self, item: T) -> DocumentStoreResult<T> {
        self.update_with(item, SetOptions::default()).await
    }

    /// Writes an existing entity with explicit write options.
    ///
    /// # Errors
    ///
    /// * [`DocumentStoreError::Validation`] if validation is enabled and fails
    /// * [`DocumentStoreError::DocumentNotFound`] if the entity does not exist
    pub async fn update_with(&self, item: T, options: SetOptions) -> DocumentStoreResult<T> {
        let data = self.prepare_write(&item)?;

        if item.id().is_empty() || self.find_by_id(item.id()).await?.is_none() {
            return Err(DocumentStoreError::DocumentNotFound(
                item.id().to_owned(),
                self.path.clone(),
            ));
        }

        debug!(target: "docmap::repository", path = %self.path, id = item.id(), merge = options.merge, "updating entity");
        self.context
            .client()
            .set_document(&self.document_path(item.id()), data, options)
            .await?;
        self.bind(&item);

        Ok(item)
    }

    /// Deletes an entity by identifier. Deleting a missing entity succeeds.
    pub async fn delete(&self, id: &str) -> DocumentStoreResult<()> {
        debug!(target: "docmap::repository", path = %self.path, id, "deleting entity");
        self.context
            .client()
            .delete_document(&self.document_path(id))
            .await
    }

    /// Runs `f` inside a transaction with this collection's transactional repository.
    pub async fn run_transaction<F, Fut, R, E>(&self, f: F) -> Result<R, E>
    where
        F: FnOnce(TransactionRepository<T>) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: From<DocumentStoreError>,
    {
        let path = self.path.clone();
        TransactionCoordinator::new(Arc::clone(&self.context))
            .run(|scope| async move {
                let repository = scope.repository_at::<T>(path)?;
                f(repository).await
            })
            .await
    }

    /// Starts a write batch scoped to this collection.
    pub fn create_batch(&self) -> BatchSingleRepository<T> {
        let coordinator = Arc::new(BatchCoordinator::new(Arc::clone(&self.context)));
        BatchSingleRepository::new(coordinator, Arc::clone(&self.collection), self.path.clone())
    }
}

impl<T: Entity> Clone for Repository<T> {
    fn clone(&self) -> Self {
        Repository {
            context: Arc::clone(&self.context),
            collection: Arc::clone(&self.collection),
            path: self.path.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Entity> Debug for Repository<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Repository")
            .field("entity", &self.collection.entity_type())
            .field("path", &self.path)
            .finish()
    }
}

impl<T: Entity> Queryable<T> for Repository<T> {
    fn query(&self) -> QueryBuilder<T> {
        QueryBuilder::new(Arc::new(self.clone()))
    }
}

#[async_trait]
impl<T: Entity> QueryExecutor<T> for Repository<T> {
    async fn execute(&self, plan: QueryExecutionPlan<T>) -> DocumentStoreResult<QueryOutcome<T>> {
        let query = plan.to_query();
        debug!(target: "docmap::query", path = %self.path, ?query, single = plan.single, listening = plan.is_listening(), "executing query");

        let QueryExecutionPlan {
            listener,
            post_processors,
            source,
            ..
        } = plan;

        let Some(listener) = listener else {
            let snapshots = self
                .context
                .client()
                .query_collection(&self.path, query, source)
                .await?;
            let items = self.materialize_all(snapshots)?;
            return Ok(QueryOutcome::Items(apply_post_processors(&post_processors, items)));
        };

        let gate = Arc::new(AtomicBool::new(true));
        let sink_gate = Arc::clone(&gate);
        let repository = self.clone();

        let sink: SnapshotSink = Box::new(move |result| {
            if !sink_gate.load(Ordering::Acquire) {
                return;
            }
            match result.and_then(|snapshots| repository.materialize_all(snapshots)) {
                Ok(items) => listener.next(apply_post_processors(&post_processors, items)),
                Err(err) => listener.error(err),
            }
        });

        let registration = self
            .context
            .client()
            .listen_collection(&self.path, query, sink)
            .await?;
        Ok(QueryOutcome::Subscription(Subscription::new(gate, registration)))
    }
}

/// Rebuilds an entity from a stored document. Accessors are left unbound.
pub(crate) fn materialize<T: Entity>(
    context: &MapperContext,
    collection: &FullCollectionDescriptor,
    snapshot: DocumentSnapshot,
) -> DocumentStoreResult<T> {
    let bson = context.serializer().deserialize(snapshot, collection)?;
    Ok(deserialize_from_bson(bson)?)
}

/// Validates `item` when the mapper is configured to, then serializes it for storage.
pub(crate) fn prepare_write<T: Entity>(
    context: &MapperContext,
    collection: &FullCollectionDescriptor,
    item: &T,
) -> DocumentStoreResult<Document> {
    let config = context.config();
    if config.validate_models {
        ensure_valid(validate_entity(
            context.validator().as_ref(),
            item,
            collection,
            &config.validator_options,
        )?)?;
    }

    context
        .serializer()
        .serialize(item.to_bson()?, &collection.sub_collections)
}

/// Calls `bind` with every accessor slot of `entity` that has a registered sub-collection,
/// its accessor key, and the sub-collection path below the entity.
pub(crate) fn bind_sub_collections<T: Entity>(
    entity: &T,
    collection: &FullCollectionDescriptor,
    path: &str,
    mut bind: impl FnMut(&AccessorSlot, &str, String),
) {
    if entity.id().is_empty() {
        return;
    }

    for sub_collection in &collection.sub_collections {
        let Some(key) = sub_collection.accessor_key() else {
            continue;
        };
        match entity.sub_collection(key) {
            Some(slot) => bind(slot, key, format!("{}/{}/{}", path, entity.id(), sub_collection.name())),
            None => trace!(
                target: "docmap::repository",
                entity = T::entity_name(),
                key,
                "entity does not expose a registered sub-collection accessor"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::MapperConfig,
        testing::{FailingValidator, User, recording_mapper, recording_mapper_with},
    };

    #[tokio::test]
    async fn where_in_with_too_many_values_never_reaches_the_client() {
        let (mapper, client) = recording_mapper();
        let users = mapper.repository::<User>().unwrap();

        let result = users.where_in("name", (0..11).map(|n| n.to_string()));

        assert!(matches!(result, Err(DocumentStoreError::TooManyValues { .. })));
        assert!(client.calls().is_empty());
    }

    #[tokio::test]
    async fn create_assigns_an_identifier_and_binds_accessors() {
        let (mapper, client) = recording_mapper();
        let users = mapper.repository::<User>().unwrap();

        let user = users.create(User::named("", "Ada")).await.unwrap();

        assert!(!user.id.is_empty());
        assert_eq!(user.messages.path(), Some(format!("users/{}/messages", user.id)));
        assert_eq!(client.calls(), vec![format!("set users/{}", user.id)]);

        let written = client.last_set().unwrap();
        assert_eq!(written.get_str("id").unwrap(), user.id);
        assert!(!written.contains_key("messages"));
    }

    #[tokio::test]
    async fn invalid_entities_are_not_written() {
        let (mapper, client) = recording_mapper_with(
            FailingValidator,
            MapperConfig::builder().validate_models(true).build(),
        );
        let users = mapper.repository::<User>().unwrap();

        let err = users.create(User::named("u1", "Ada")).await.unwrap_err();

        assert_eq!(err.validation_errors().map(<[_]>::len), Some(1));
        assert!(client.calls().is_empty());
    }

    #[tokio::test]
    async fn update_requires_an_existing_entity() {
        let (mapper, _) = recording_mapper();
        let users = mapper.repository::<User>().unwrap();

        assert!(matches!(
            users.update(User::named("u1", "Ada")).await,
            Err(DocumentStoreError::DocumentNotFound(..))
        ));
    }
}
