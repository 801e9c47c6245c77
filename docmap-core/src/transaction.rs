//! Transactions.
//!
//! [`TransactionCoordinator::run`] starts a store transaction, hands the callback a
//! [`TransactionScope`], and commits or rolls back depending on the callback's result.
//! Repositories obtained from the scope stage their writes in the transaction and bind
//! sub-collection accessors to transactional repositories. Every such accessor is
//! recorded, and once the transaction settles the coordinator rebinds it to an ordinary
//! repository, so entities that escape the callback keep working.
//!
//! ```ignore
//! let user = mapper
//!     .run_transaction(|tx| async move {
//!         let users = tx.repository::<User>()?;
//!         let mut user = users.find_by_id("u1").await?.ok_or(MyError::Missing)?;
//!         user.visits += 1;
//!         users.update(user).await
//!     })
//!     .await?;
//! ```

use std::{
    collections::HashSet,
    fmt::{self, Debug},
    future::Future,
    hash::{Hash, Hasher},
    marker::PhantomData,
    sync::Arc,
};

use async_trait::async_trait;
use bson::Bson;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
    builder::{QueryBuilder, Queryable},
    client::{SetOptions, StoreTransaction},
    entity::{AccessorSlot, Binding, Entity},
    error::{DocumentStoreError, DocumentStoreResult},
    executor::{QueryExecutor, QueryOutcome, Subscription},
    mapper::MapperContext,
    metadata::{CollectionTarget, FullCollectionDescriptor},
    plan::QueryExecutionPlan,
    repository::{bind_sub_collections, materialize, prepare_write},
    resolver::locate,
    validate::{ValidationError, validate_entity},
};

/// A sub-collection accessor bound during a transaction.
#[derive(Clone)]
pub struct TransactionReference {
    slot: AccessorSlot,
    accessor_key: String,
    path: String,
}

impl TransactionReference {
    pub fn accessor_key(&self) -> &str {
        &self.accessor_key
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl PartialEq for TransactionReference {
    fn eq(&self, other: &Self) -> bool {
        self.slot.identity() == other.slot.identity()
            && self.accessor_key == other.accessor_key
            && self.path == other.path
    }
}

impl Eq for TransactionReference {}

impl Hash for TransactionReference {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.slot.identity().hash(state);
        self.accessor_key.hash(state);
        self.path.hash(state);
    }
}

impl Debug for TransactionReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionReference")
            .field("accessor_key", &self.accessor_key)
            .field("path", &self.path)
            .finish()
    }
}

/// The set of accessors bound during one transaction.
#[derive(Clone, Debug, Default)]
pub struct TransactionReferenceStorage {
    references: Arc<Mutex<HashSet<TransactionReference>>>,
}

impl TransactionReferenceStorage {
    /// Records a reference. Returns `false` if it was already recorded.
    pub fn record(&self, reference: TransactionReference) -> bool {
        self.references.lock().insert(reference)
    }

    pub fn len(&self) -> usize {
        self.references.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.references.lock().is_empty()
    }

    fn drain(&self) -> Vec<TransactionReference> {
        self.references.lock().drain().collect()
    }
}

/// Access to a running transaction.
#[derive(Clone)]
pub struct TransactionScope {
    context: Arc<MapperContext>,
    transaction: Arc<dyn StoreTransaction>,
    references: TransactionReferenceStorage,
}

impl TransactionScope {
    /// Returns the transactional repository of the root collection holding `T`.
    pub fn repository<T: Entity>(&self) -> DocumentStoreResult<TransactionRepository<T>> {
        TransactionRepository::open(self.clone(), CollectionTarget::of::<T>())
    }

    /// Returns the transactional repository of the collection at `path`.
    pub fn repository_at<T: Entity>(
        &self,
        path: impl Into<String>,
    ) -> DocumentStoreResult<TransactionRepository<T>> {
        TransactionRepository::open(self.clone(), CollectionTarget::Path(path.into()))
    }

    pub fn references(&self) -> &TransactionReferenceStorage {
        &self.references
    }

    pub fn transaction(&self) -> &Arc<dyn StoreTransaction> {
        &self.transaction
    }

    /// Records `slot` so it is rebound once the transaction settles.
    pub(crate) fn track(&self, slot: &AccessorSlot, accessor_key: &str, path: &str) {
        self.references.record(TransactionReference {
            slot: slot.share(),
            accessor_key: accessor_key.to_owned(),
            path: path.to_owned(),
        });
    }
}

impl Debug for TransactionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionScope")
            .field("transaction", &self.transaction)
            .field("references", &self.references.len())
            .finish()
    }
}

/// Runs callbacks inside store transactions.
#[derive(Debug, Clone)]
pub struct TransactionCoordinator {
    context: Arc<MapperContext>,
}

impl TransactionCoordinator {
    pub fn new(context: Arc<MapperContext>) -> Self {
        TransactionCoordinator { context }
    }

    /// Runs `f` inside a new transaction.
    ///
    /// Commits when `f` returns `Ok`, rolls back otherwise. A failed rollback is logged and
    /// the callback's error is returned. Whatever the outcome, accessors bound during the
    /// transaction are rebound to ordinary repositories before this returns. If the
    /// returned future is dropped early, or `f` panics, the transaction is abandoned and
    /// the accessors are rebound all the same.
    ///
    /// # Errors
    ///
    /// Returns the callback's error, or the store's error converted into `E` when beginning
    /// or committing fails.
    pub async fn run<F, Fut, R, E>(&self, f: F) -> Result<R, E>
    where
        F: FnOnce(TransactionScope) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: From<DocumentStoreError>,
    {
        let transaction = self.context.client().begin_transaction().await?;
        let scope = TransactionScope {
            context: Arc::clone(&self.context),
            transaction: Arc::clone(&transaction),
            references: TransactionReferenceStorage::default(),
        };
        let mut settlement = Settlement {
            scope: scope.clone(),
            resolved: false,
        };

        debug!(target: "docmap::transaction", "transaction started");

        let outcome = match f(scope).await {
            Ok(value) => {
                let committed = transaction.commit().await;
                settlement.resolved = true;
                match committed {
                    Ok(()) => {
                        debug!(target: "docmap::transaction", "transaction committed");
                        Ok(value)
                    }
                    Err(err) => {
                        warn!(target: "docmap::transaction", error = %err, "transaction commit failed");
                        Err(E::from(err))
                    }
                }
            }
            Err(err) => {
                let rolled_back = transaction.rollback().await;
                settlement.resolved = true;
                if let Err(rollback) = rolled_back {
                    warn!(
                        target: "docmap::transaction",
                        error = %rollback,
                        "transaction rollback failed"
                    );
                } else {
                    debug!(target: "docmap::transaction", "transaction rolled back");
                }
                Err(err)
            }
        };

        drop(settlement);
        outcome
    }
}

/// Settles a transaction on every exit path of [`TransactionCoordinator::run`].
///
/// Unless the transaction was committed or rolled back, dropping the guard abandons it.
/// Either way every recorded accessor is rebound to an ordinary repository.
struct Settlement {
    scope: TransactionScope,
    resolved: bool,
}

impl Drop for Settlement {
    fn drop(&mut self) {
        if !self.resolved {
            warn!(target: "docmap::transaction", "transaction abandoned before it resolved");
            self.scope.transaction.abandon();
        }

        let references = self.scope.references.drain();
        debug!(
            target: "docmap::transaction",
            count = references.len(),
            "rebinding sub-collection accessors"
        );

        for reference in references {
            reference.slot.bind(Binding::Default {
                context: Arc::clone(&self.scope.context),
                path: reference.path,
            });
        }
    }
}

/// Typed access to one collection inside a transaction.
///
/// Reads go through the transaction. Writes are staged and applied on commit. Queries,
/// listeners, limits and ordering are not available: builders handed out by this
/// repository reject `limit`, `offset`, `order_by_*` and every terminal call with
/// [`DocumentStoreError::UnsupportedInTransaction`] at the call itself.
pub struct TransactionRepository<T: Entity> {
    scope: TransactionScope,
    collection: Arc<FullCollectionDescriptor>,
    path: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Entity> TransactionRepository<T> {
    pub(crate) fn open(
        scope: TransactionScope,
        target: CollectionTarget,
    ) -> DocumentStoreResult<Self> {
        let (collection, path) = locate::<T>(scope.context.registry(), target)?;
        Ok(TransactionRepository {
            scope,
            collection: Arc::new(collection),
            path,
            _marker: PhantomData,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn collection(&self) -> &FullCollectionDescriptor {
        &self.collection
    }

    fn document_path(&self, id: &str) -> String {
        format!("{}/{}", self.path, id)
    }

    fn bind(&self, entity: &T) {
        bind_sub_collections(entity, &self.collection, &self.path, |slot, key, path| {
            self.scope.track(slot, key, &path);
            slot.bind(Binding::Transactional {
                scope: self.scope.clone(),
                accessor_key: key.to_owned(),
                path,
            });
        });
    }

    pub fn validate(&self, item: &T) -> DocumentStoreResult<Vec<ValidationError>> {
        let context = &self.scope.context;
        validate_entity(
            context.validator().as_ref(),
            item,
            &self.collection,
            &context.config().validator_options,
        )
    }

    /// Reads one entity through the transaction.
    pub async fn find_by_id(&self, id: &str) -> DocumentStoreResult<Option<T>> {
        let Some(snapshot) = self.scope.transaction.get_document(&self.document_path(id)).await? else {
            return Ok(None);
        };
        let entity = materialize::<T>(&self.scope.context, &self.collection, snapshot)?;
        self.bind(&entity);
        Ok(Some(entity))
    }

    pub async fn find_by_id_and_listen<N, E>(
        &self,
        _id: &str,
        _on_next: N,
        _on_error: E,
    ) -> DocumentStoreResult<Subscription>
    where
        N: Fn(Option<T>) + Send + Sync + 'static,
        E: Fn(DocumentStoreError) + Send + Sync + 'static,
    {
        Err(DocumentStoreError::UnsupportedInTransaction("findByIdAndListen"))
    }

    /// Stages the creation of an entity, assigning an identifier when it has none.
    pub async fn create(&self, mut item: T) -> DocumentStoreResult<T> {
        let mut data = prepare_write(&self.scope.context, &self.collection, &item)?;

        if item.id().is_empty() {
            let id = self.scope.context.client().new_document_id();
            data.insert(T::ID_FIELD, Bson::String(id.clone()));
            item.set_id(id);
        }

        debug!(target: "docmap::transaction", path = %self.path, id = item.id(), "staging create");
        self.scope
            .transaction
            .set_document(&self.document_path(item.id()), data, SetOptions::default())?;
        self.bind(&item);

        Ok(item)
    }

    /// Stages a full write of an existing entity.
    pub async fn update(&self, item: T) -> DocumentStoreResult<T> {
        self.update_with(item, SetOptions::default()).await
    }

    pub async fn update_with(&self, item: T, options: SetOptions) -> DocumentStoreResult<T> {
        if item.id().is_empty() {
            return Err(DocumentStoreError::DocumentNotFound(String::new(), self.path.clone()));
        }
        let data = prepare_write(&self.scope.context, &self.collection, &item)?;

        debug!(target: "docmap::transaction", path = %self.path, id = item.id(), "staging update");
        self.scope
            .transaction
            .set_document(&self.document_path(item.id()), data, options)?;
        self.bind(&item);

        Ok(item)
    }

    /// Stages the deletion of an entity.
    pub async fn delete(&self, id: &str) -> DocumentStoreResult<()> {
        debug!(target: "docmap::transaction", path = %self.path, id, "staging delete");
        self.scope.transaction.delete_document(&self.document_path(id))
    }
}

impl<T: Entity> Clone for TransactionRepository<T> {
    fn clone(&self) -> Self {
        TransactionRepository {
            scope: self.scope.clone(),
            collection: Arc::clone(&self.collection),
            path: self.path.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Entity> Debug for TransactionRepository<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionRepository")
            .field("entity", &self.collection.entity_type())
            .field("path", &self.path)
            .finish()
    }
}

#[async_trait]
impl<T: Entity> Queryable<T> for TransactionRepository<T> {
    fn query(&self) -> QueryBuilder<T> {
        QueryBuilder::in_transaction(Arc::new(self.clone()))
    }
}

#[async_trait]
impl<T: Entity> QueryExecutor<T> for TransactionRepository<T> {
    async fn execute(&self, _: QueryExecutionPlan<T>) -> DocumentStoreResult<QueryOutcome<T>> {
        Err(DocumentStoreError::UnsupportedInTransaction("execute"))
    }
}
