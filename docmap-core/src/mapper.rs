//! Main mapper interface.
//!
//! A [`DocumentMapper`] ties together a document store client, a metadata registry, the
//! validation and serialization collaborators, and configuration. Repositories, batches
//! and transactions are all obtained from it.
//!
//! # Example
//!
//! ```ignore
//! use docmap::prelude::*;
//!
//! let mapper = DocumentMapper::builder(InMemoryStore::new())
//!     .registry(Arc::new(MetadataRegistry::new()))
//!     .config(MapperConfig::builder().validate_models(true).build())
//!     .build();
//!
//! mapper.register_collection::<User>(None)?;
//! mapper.register_sub_collection::<User, Message>("messages", Some("messages"))?;
//!
//! let users = mapper.repository::<User>()?;
//! let ada = users.create(User::named("Ada")).await?;
//! let inbox = ada.messages.repository()?;
//! ```

use std::{future::Future, sync::Arc};

use tracing::debug;

use crate::{
    batch::WriteBatch,
    client::DocumentStoreClient,
    config::MapperConfig,
    entity::Entity,
    error::{DocumentStoreError, DocumentStoreResult},
    metadata::{CollectionTarget, MetadataRegistry},
    repository::Repository,
    resolver::{CustomRepository, RepositoryKind, RepositoryResolver, ResolvedRepository},
    serialize::{BsonEntitySerializer, EntitySerializer},
    transaction::{TransactionCoordinator, TransactionScope},
    validate::{NoopValidator, Validator},
};

/// Everything repositories need to reach the store, shared behind an [`Arc`].
#[derive(Debug)]
pub struct MapperContext {
    registry: Arc<MetadataRegistry>,
    client: Arc<dyn DocumentStoreClient>,
    validator: Arc<dyn Validator>,
    serializer: Arc<dyn EntitySerializer>,
    config: MapperConfig,
}

impl MapperContext {
    pub fn registry(&self) -> &Arc<MetadataRegistry> {
        &self.registry
    }

    pub fn client(&self) -> &Arc<dyn DocumentStoreClient> {
        &self.client
    }

    pub fn validator(&self) -> &Arc<dyn Validator> {
        &self.validator
    }

    pub fn serializer(&self) -> &Arc<dyn EntitySerializer> {
        &self.serializer
    }

    pub fn config(&self) -> &MapperConfig {
        &self.config
    }
}

/// The entry point of the mapping layer.
///
/// Cloning a mapper is cheap; clones share the same context.
#[derive(Debug, Clone)]
pub struct DocumentMapper {
    context: Arc<MapperContext>,
}

impl DocumentMapper {
    /// Creates a mapper over `client` using the global registry and default collaborators.
    pub fn new(client: impl DocumentStoreClient + 'static) -> Self {
        DocumentMapper::builder(client).build()
    }

    pub fn builder(client: impl DocumentStoreClient + 'static) -> DocumentMapperBuilder {
        DocumentMapperBuilder::new(Arc::new(client))
    }

    pub fn context(&self) -> &Arc<MapperContext> {
        &self.context
    }

    pub fn registry(&self) -> &Arc<MetadataRegistry> {
        self.context.registry()
    }

    pub fn config(&self) -> &MapperConfig {
        self.context.config()
    }

    /// Registers `E` as a root collection. See [`MetadataRegistry::register_collection`].
    pub fn register_collection<E: Entity>(&self, name: Option<&str>) -> DocumentStoreResult<()> {
        self.registry().register_collection::<E>(name)
    }

    /// Registers `C` as a sub-collection of `P`. See [`MetadataRegistry::register_sub_collection`].
    pub fn register_sub_collection<P: Entity, C: Entity>(
        &self,
        accessor_key: &str,
        name: Option<&str>,
    ) -> DocumentStoreResult<()> {
        self.registry().register_sub_collection::<P, C>(accessor_key, name)
    }

    /// Registers `R` as the custom repository for `E`.
    pub fn register_repository<E: Entity, R: CustomRepository<E>>(
        &self,
    ) -> DocumentStoreResult<()> {
        self.registry().register_repository::<E, R>()
    }

    pub fn resolver(&self) -> RepositoryResolver {
        RepositoryResolver::new(Arc::clone(&self.context))
    }

    /// Resolves a repository of the given kind. See [`RepositoryResolver::resolve`].
    pub fn resolve_repository<E: Entity>(
        &self,
        target: impl Into<CollectionTarget>,
        kind: RepositoryKind,
    ) -> DocumentStoreResult<ResolvedRepository<E>> {
        self.resolver().resolve(target, kind)
    }

    /// Returns the base repository of the root collection holding `E`.
    ///
    /// # Errors
    ///
    /// Fails with [`DocumentStoreError::InvalidPath`] when `E` is stored in a sub-collection;
    /// use [`DocumentMapper::repository_at`] for those.
    pub fn repository<E: Entity>(&self) -> DocumentStoreResult<Repository<E>> {
        Repository::open(Arc::clone(&self.context), CollectionTarget::of::<E>())
    }

    /// Returns the base repository of the collection at `path`.
    pub fn repository_at<E: Entity>(
        &self,
        path: impl Into<String>,
    ) -> DocumentStoreResult<Repository<E>> {
        Repository::open(Arc::clone(&self.context), CollectionTarget::Path(path.into()))
    }

    /// Returns the registered custom repository `R` for the collection at `target`.
    pub fn custom_repository<E: Entity, R: CustomRepository<E>>(
        &self,
        target: impl Into<CollectionTarget>,
    ) -> DocumentStoreResult<R> {
        self.resolver().custom::<E, R>(target)
    }

    /// Starts a new write batch.
    pub fn create_batch(&self) -> WriteBatch {
        WriteBatch::new(Arc::clone(&self.context))
    }

    /// Runs `f` inside a transaction.
    ///
    /// The transaction commits when `f` returns `Ok` and rolls back otherwise. Either way,
    /// sub-collection accessors bound during the transaction are rebound to ordinary
    /// repositories before this returns.
    pub async fn run_transaction<F, Fut, R, E>(&self, f: F) -> Result<R, E>
    where
        F: FnOnce(TransactionScope) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: From<DocumentStoreError>,
    {
        TransactionCoordinator::new(Arc::clone(&self.context)).run(f).await
    }

    /// Shuts the underlying client down.
    pub async fn shutdown(&self) -> DocumentStoreResult<()> {
        debug!(target: "docmap::mapper", "shutting down document store client");
        self.context.client().shutdown().await
    }
}

/// Builder for [`DocumentMapper`].
#[derive(Debug)]
pub struct DocumentMapperBuilder {
    client: Arc<dyn DocumentStoreClient>,
    registry: Option<Arc<MetadataRegistry>>,
    validator: Arc<dyn Validator>,
    serializer: Arc<dyn EntitySerializer>,
    config: MapperConfig,
}

impl DocumentMapperBuilder {
    pub fn new(client: Arc<dyn DocumentStoreClient>) -> Self {
        DocumentMapperBuilder {
            client,
            registry: None,
            validator: Arc::new(NoopValidator),
            serializer: Arc::new(BsonEntitySerializer),
            config: MapperConfig::default(),
        }
    }

    /// Uses a private registry instead of the global one.
    pub fn registry(mut self, registry: Arc<MetadataRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn validator(mut self, validator: impl Validator + 'static) -> Self {
        self.validator = Arc::new(validator);
        self
    }

    pub fn serializer(mut self, serializer: impl EntitySerializer + 'static) -> Self {
        self.serializer = Arc::new(serializer);
        self
    }

    pub fn config(mut self, config: MapperConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> DocumentMapper {
        DocumentMapper {
            context: Arc::new(MapperContext {
                registry: self.registry.unwrap_or_else(MetadataRegistry::global),
                client: self.client,
                validator: self.validator,
                serializer: self.serializer,
                config: self.config,
            }),
        }
    }
}
