//! Repository resolution.
//!
//! Given an entity type or a collection path, the resolver decides which repository
//! serves it: the base [`Repository`], a registered custom repository, or a
//! [`TransactionRepository`] bound to a running transaction.

use std::{
    any::{Any, TypeId, type_name},
    fmt::{self, Debug},
    sync::Arc,
};

use tracing::trace;

use crate::{
    entity::{Entity, EntityType},
    error::{DocumentStoreError, DocumentStoreResult},
    mapper::MapperContext,
    metadata::{CollectionTarget, FullCollectionDescriptor, MetadataRegistry},
    repository::Repository,
    transaction::{TransactionRepository, TransactionScope},
};

/// A user-defined repository layered over the base [`Repository`] of an entity.
///
/// # Example
///
/// ```ignore
/// struct UserRepository {
///     base: Repository<User>,
/// }
///
/// impl CustomRepository<User> for UserRepository {
///     fn from_repository(base: Repository<User>) -> Self {
///         UserRepository { base }
///     }
/// }
///
/// impl UserRepository {
///     async fn adults(&self) -> DocumentStoreResult<Vec<User>> {
///         self.base.where_greater_or_equal_than("age", 18).find().await
///     }
/// }
/// ```
pub trait CustomRepository<T: Entity>: Send + Sync + 'static {
    /// Builds the custom repository on top of the base repository for the requested collection.
    fn from_repository(repository: Repository<T>) -> Self
    where
        Self: Sized;
}

type RepositoryFactory =
    Arc<dyn Fn(Box<dyn Any + Send>) -> Option<Box<dyn Any + Send + Sync>> + Send + Sync>;

/// A registered custom repository, erased so the registry can hold overrides for any entity.
#[derive(Clone)]
pub struct RepositoryOverride {
    entity_type: EntityType,
    target_type_id: TypeId,
    target_name: &'static str,
    factory: RepositoryFactory,
}

impl RepositoryOverride {
    pub fn of<T: Entity, R: CustomRepository<T>>() -> Self {
        RepositoryOverride {
            entity_type: EntityType::of::<T>(),
            target_type_id: TypeId::of::<R>(),
            target_name: type_name::<R>(),
            factory: Arc::new(|base: Box<dyn Any + Send>| {
                base.downcast::<Repository<T>>()
                    .ok()
                    .map(|base| Box::new(R::from_repository(*base)) as Box<dyn Any + Send + Sync>)
            }),
        }
    }

    pub fn entity_type(&self) -> EntityType {
        self.entity_type
    }

    pub fn target_type_id(&self) -> TypeId {
        self.target_type_id
    }

    pub fn target_name(&self) -> &'static str {
        self.target_name
    }

    fn instantiate<T: Entity>(
        &self,
        base: Repository<T>,
    ) -> DocumentStoreResult<CustomRepositoryHandle> {
        let value = (self.factory)(Box::new(base)).ok_or_else(|| DocumentStoreError::InvalidOverride {
            entity: EntityType::of::<T>().name().to_owned(),
            reason: format!("{} is a repository for {}", self.target_name, self.entity_type),
        })?;

        Ok(CustomRepositoryHandle {
            target_name: self.target_name,
            value,
        })
    }
}

impl Debug for RepositoryOverride {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepositoryOverride")
            .field("entity_type", &self.entity_type)
            .field("target", &self.target_name)
            .finish()
    }
}

/// An instantiated custom repository of a type known only at runtime.
pub struct CustomRepositoryHandle {
    target_name: &'static str,
    value: Box<dyn Any + Send + Sync>,
}

impl CustomRepositoryHandle {
    pub fn target_name(&self) -> &'static str {
        self.target_name
    }

    /// Recovers the concrete custom repository.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentStoreError::InvalidOverride`] if the handle holds another type.
    pub fn downcast<R: 'static>(self) -> DocumentStoreResult<R> {
        let target_name = self.target_name;
        self.value
            .downcast::<R>()
            .map(|repository| *repository)
            .map_err(|_| DocumentStoreError::InvalidOverride {
                entity: target_name.to_owned(),
                reason: format!("the registered repository is not a {}", type_name::<R>()),
            })
    }
}

impl Debug for CustomRepositoryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CustomRepositoryHandle").field(&self.target_name).finish()
    }
}

/// Which repository flavour to resolve.
#[derive(Clone, Debug)]
pub enum RepositoryKind {
    /// The custom repository when one is registered, the base repository otherwise.
    Default,
    /// Always the base repository.
    Base,
    /// The registered custom repository. Fails when none is registered.
    Custom,
    /// A repository bound to the given transaction.
    Transactional(TransactionScope),
}

/// The outcome of [`RepositoryResolver::resolve`].
#[derive(Debug)]
pub enum ResolvedRepository<T: Entity> {
    Base(Repository<T>),
    Custom(CustomRepositoryHandle),
    Transactional(TransactionRepository<T>),
}

impl<T: Entity> ResolvedRepository<T> {
    pub fn into_base(self) -> Option<Repository<T>> {
        match self {
            ResolvedRepository::Base(repository) => Some(repository),
            _ => None,
        }
    }

    pub fn into_transactional(self) -> Option<TransactionRepository<T>> {
        match self {
            ResolvedRepository::Transactional(repository) => Some(repository),
            _ => None,
        }
    }

    /// Recovers a custom repository of type `R`.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentStoreError::InvalidOverride`] if no custom repository of type `R`
    /// was resolved.
    pub fn into_custom<R: 'static>(self) -> DocumentStoreResult<R> {
        match self {
            ResolvedRepository::Custom(handle) => handle.downcast(),
            _ => Err(DocumentStoreError::InvalidOverride {
                entity: EntityType::of::<T>().name().to_owned(),
                reason: "no custom repository was resolved".to_owned(),
            }),
        }
    }
}

/// Finds the linked collection for `target` and checks it holds `T` entities.
///
/// Returns the descriptor and the concrete collection path.
pub(crate) fn locate<T: Entity>(
    registry: &MetadataRegistry,
    target: CollectionTarget,
) -> DocumentStoreResult<(FullCollectionDescriptor, String)> {
    let expected = EntityType::of::<T>();
    let collection = registry.resolve(target.clone())?;

    if collection.entity_type() != expected {
        return Err(DocumentStoreError::EntityMismatch {
            path: target.to_string(),
            expected: expected.name().to_owned(),
            found: collection.entity_type().name().to_owned(),
        });
    }

    let path = match target {
        CollectionTarget::Path(path) => path,
        CollectionTarget::Type(_) if collection.is_sub_collection() => {
            return Err(DocumentStoreError::InvalidPath(format!(
                "{} is a sub-collection and must be addressed by its full path",
                expected.name()
            )));
        }
        CollectionTarget::Type(_) => collection.name().to_owned(),
    };

    Ok((collection, path))
}

/// Resolves repositories against a mapper context.
#[derive(Debug, Clone)]
pub struct RepositoryResolver {
    context: Arc<MapperContext>,
}

impl RepositoryResolver {
    pub fn new(context: Arc<MapperContext>) -> Self {
        RepositoryResolver { context }
    }

    /// Resolves the repository serving `target`.
    ///
    /// # Arguments
    ///
    /// * `target` - An entity type (root collections only) or a collection path
    /// * `kind` - Which repository flavour to return
    ///
    /// # Errors
    ///
    /// * [`DocumentStoreError::NoMetadata`] if no linked collection matches, or a custom
    ///   repository is requested for an entity without one
    /// * [`DocumentStoreError::InvalidPath`] for malformed paths or a sub-collection addressed by type
    /// * [`DocumentStoreError::EntityMismatch`] if the collection holds another entity type
    pub fn resolve<T: Entity>(
        &self,
        target: impl Into<CollectionTarget>,
        kind: RepositoryKind,
    ) -> DocumentStoreResult<ResolvedRepository<T>> {
        let target = target.into();
        trace!(target: "docmap::resolver", %target, ?kind, "resolving repository");

        let open_base = || Repository::<T>::open(Arc::clone(&self.context), target.clone());
        let registered = || {
            self.context
                .registry()
                .repository_override(EntityType::of::<T>())
        };

        match kind {
            RepositoryKind::Transactional(scope) => {
                TransactionRepository::open(scope, target.clone()).map(ResolvedRepository::Transactional)
            }
            RepositoryKind::Base => open_base().map(ResolvedRepository::Base),
            RepositoryKind::Default => {
                let base = open_base()?;
                match registered() {
                    Some(registered) => registered.instantiate(base).map(ResolvedRepository::Custom),
                    None => Ok(ResolvedRepository::Base(base)),
                }
            }
            RepositoryKind::Custom => {
                let base = open_base()?;
                let registered = registered().ok_or_else(|| {
                    DocumentStoreError::NoMetadata(format!("'{target}' does not have a custom repository"))
                })?;
                registered.instantiate(base).map(ResolvedRepository::Custom)
            }
        }
    }

    /// Resolves the custom repository `R` for `target`.
    pub fn custom<T: Entity, R: CustomRepository<T>>(
        &self,
        target: impl Into<CollectionTarget>,
    ) -> DocumentStoreResult<R> {
        self.resolve::<T>(target, RepositoryKind::Custom)?.into_custom()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Message, User, recording_mapper};

    #[derive(Debug)]
    struct UserRepository {
        base: Repository<User>,
    }

    impl CustomRepository<User> for UserRepository {
        fn from_repository(base: Repository<User>) -> Self {
            UserRepository { base }
        }
    }

    #[test]
    fn default_kind_prefers_custom_repository() {
        let (mapper, _) = recording_mapper();
        let resolver = RepositoryResolver::new(Arc::clone(mapper.context()));

        assert!(matches!(
            resolver.resolve::<User>(EntityType::of::<User>(), RepositoryKind::Default),
            Ok(ResolvedRepository::Base(_))
        ));

        mapper.registry().register_repository::<User, UserRepository>().unwrap();

        let custom: UserRepository = resolver
            .resolve::<User>(EntityType::of::<User>(), RepositoryKind::Default)
            .unwrap()
            .into_custom()
            .unwrap();
        assert_eq!(custom.base.path(), "users");

        assert!(matches!(
            resolver.resolve::<User>(EntityType::of::<User>(), RepositoryKind::Base),
            Ok(ResolvedRepository::Base(_))
        ));
    }

    #[test]
    fn custom_kind_requires_registration() {
        let (mapper, _) = recording_mapper();
        let resolver = RepositoryResolver::new(Arc::clone(mapper.context()));

        assert!(matches!(
            resolver.custom::<User, UserRepository>(EntityType::of::<User>()),
            Err(DocumentStoreError::NoMetadata(_))
        ));
    }

    #[test]
    fn sub_collections_need_a_path() {
        let (mapper, _) = recording_mapper();
        let resolver = RepositoryResolver::new(Arc::clone(mapper.context()));

        assert!(matches!(
            resolver.resolve::<Message>(EntityType::of::<Message>(), RepositoryKind::Base),
            Err(DocumentStoreError::InvalidPath(_))
        ));

        let messages = resolver
            .resolve::<Message>("users/u1/messages", RepositoryKind::Base)
            .unwrap()
            .into_base()
            .unwrap();
        assert_eq!(messages.path(), "users/u1/messages");

        assert!(matches!(
            resolver.resolve::<User>("users/u1/messages", RepositoryKind::Base),
            Err(DocumentStoreError::EntityMismatch { .. })
        ));
    }
}
