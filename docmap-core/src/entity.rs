//! Core traits and types for entity representation and serialization.
//!
//! This module provides the [`Entity`] trait that all mapped types implement, the
//! [`SubCollection`] accessor used to reach nested collections from a parent entity,
//! and type-erased helpers used when entities of different types travel together
//! (for example inside a write batch).

use std::{
    any::{Any, TypeId},
    fmt::{self, Debug, Display},
    hash::{Hash, Hasher},
    marker::PhantomData,
    sync::Arc,
};

use bson::{Bson, de::deserialize_from_bson, ser::serialize_to_bson};
use parking_lot::RwLock;
use serde::{
    Deserialize, Deserializer, Serialize, Serializer,
    de::{self, DeserializeOwned, IgnoredAny, Visitor},
};

use crate::{
    error::{DocumentStoreError, DocumentStoreResult},
    mapper::MapperContext,
    repository::Repository,
    transaction::{TransactionRepository, TransactionScope},
};

/// Core trait that all entities stored through the mapper must implement.
///
/// An entity has a string identifier (an empty string means "not assigned yet") and
/// may expose [`SubCollection`] accessors for the collections nested under it.
///
/// The `#[derive(Entity)]` macro from the facade crate implements this trait: it picks
/// the `id` field (or the field marked `#[entity(id)]`) and wires every
/// `SubCollection<_>` field into [`Entity::sub_collection`].
///
/// # Example
///
/// ```ignore
/// use docmap::prelude::*;
///
/// #[derive(Debug, Clone, Default, Serialize, Deserialize, Entity)]
/// pub struct User {
///     pub id: String,
///     pub name: String,
///     #[serde(default)]
///     pub messages: SubCollection<Message>,
/// }
/// ```
pub trait Entity: Serialize + DeserializeOwned + Send + Sync + Clone + 'static {
    /// Name of the serialized field holding the identifier.
    const ID_FIELD: &'static str = "id";

    /// Returns this entity's identifier, or an empty string when none is assigned.
    fn id(&self) -> &str;

    /// Assigns the identifier.
    fn set_id(&mut self, id: String);

    /// Returns the short type name used to derive default collection names.
    fn entity_name() -> &'static str {
        short_type_name(std::any::type_name::<Self>())
    }

    /// Returns the accessor slot stored under `accessor_key`, if this entity has one.
    fn sub_collection(&self, accessor_key: &str) -> Option<&AccessorSlot> {
        let _ = accessor_key;
        None
    }
}

fn short_type_name(full: &'static str) -> &'static str {
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// Extension trait providing BSON conversion for entities.
///
/// This trait is automatically implemented for all types that implement [`Entity`].
pub trait EntityExt: Entity {
    /// Converts this entity to a BSON value.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    fn to_bson(&self) -> DocumentStoreResult<Bson>;

    /// Creates an entity from a BSON value.
    ///
    /// # Errors
    ///
    /// Returns an error if deserialization fails or the structure is invalid.
    fn from_bson(bson: Bson) -> DocumentStoreResult<Self>;
}

impl<E: Entity> EntityExt for E {
    fn to_bson(&self) -> DocumentStoreResult<Bson> {
        Ok(serialize_to_bson(self)?)
    }

    fn from_bson(bson: Bson) -> DocumentStoreResult<Self> {
        Ok(deserialize_from_bson(bson)?)
    }
}

/// Runtime identity of an entity type.
///
/// Two values are equal exactly when they describe the same Rust type.
#[derive(Clone, Copy)]
pub struct EntityType {
    type_id: TypeId,
    name: &'static str,
    id_field: &'static str,
}

impl EntityType {
    pub fn of<E: Entity>() -> Self {
        EntityType {
            type_id: TypeId::of::<E>(),
            name: E::entity_name(),
            id_field: E::ID_FIELD,
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn id_field(&self) -> &'static str {
        self.id_field
    }
}

impl PartialEq for EntityType {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id
    }
}

impl Eq for EntityType {}

impl Hash for EntityType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_id.hash(state);
    }
}

impl Debug for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EntityType").field(&self.name).finish()
    }
}

impl Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Type-erased entity trait that allows working with entities of different types uniformly.
///
/// Write batches queue entities of many types in one list; this trait lets them share it
/// while still producing BSON and identifiers on demand.
pub trait AnyEntity: Send + Sync {
    /// Returns this entity's identifier.
    fn entity_id(&self) -> &str;

    /// Returns the type of the boxed entity.
    fn entity_type(&self) -> EntityType;

    /// Returns a reference to the entity as a generic `Any` type.
    fn as_any(&self) -> &dyn Any;

    /// Clones the entity into a new boxed `AnyEntity`.
    fn clone_box(&self) -> Box<dyn AnyEntity>;

    /// Converts this entity to BSON format.
    fn to_any_bson(&self) -> DocumentStoreResult<Bson>;
}

impl dyn AnyEntity {
    /// Attempts to downcast a reference to a specific entity type.
    pub fn downcast_ref<E: Entity>(&self) -> Option<&E> {
        self.as_any().downcast_ref::<E>()
    }
}

impl<E: Entity> AnyEntity for E {
    fn entity_id(&self) -> &str {
        self.id()
    }

    fn entity_type(&self) -> EntityType {
        EntityType::of::<E>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn clone_box(&self) -> Box<dyn AnyEntity> {
        Box::new(self.clone())
    }

    fn to_any_bson(&self) -> DocumentStoreResult<Bson> {
        EntityExt::to_bson(self)
    }
}

impl Clone for Box<dyn AnyEntity> {
    fn clone(&self) -> Box<dyn AnyEntity> {
        self.clone_box()
    }
}

impl Debug for dyn AnyEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnyEntity")
            .field("type", &self.entity_type())
            .field("id", &self.entity_id())
            .finish()
    }
}

/// What a sub-collection accessor currently points at.
#[derive(Clone, Default)]
pub(crate) enum Binding {
    #[default]
    Unbound,
    Default {
        context: Arc<MapperContext>,
        path: String,
    },
    Transactional {
        scope: TransactionScope,
        accessor_key: String,
        path: String,
    },
}

impl Binding {
    fn path(&self) -> Option<&str> {
        match self {
            Binding::Unbound => None,
            Binding::Default { path, .. } | Binding::Transactional { path, .. } => Some(path),
        }
    }
}

/// Rebindable storage behind a [`SubCollection`] accessor.
///
/// Cloning copies the current binding into a new slot, so binding one entity never
/// retargets its clones. A clone taken inside a transaction is tracked by that
/// transaction and rebound together with the original.
#[derive(Default)]
pub struct AccessorSlot(Arc<RwLock<Binding>>);

impl AccessorSlot {
    /// Returns a handle to this very slot, for rebinding it later.
    pub(crate) fn share(&self) -> AccessorSlot {
        AccessorSlot(Arc::clone(&self.0))
    }

    pub(crate) fn bind(&self, binding: Binding) {
        *self.0.write() = binding;
    }

    pub(crate) fn binding(&self) -> Binding {
        self.0.read().clone()
    }

    /// Returns the collection path the accessor is bound to.
    pub fn path(&self) -> Option<String> {
        self.0.read().path().map(str::to_owned)
    }

    pub fn is_bound(&self) -> bool {
        !matches!(*self.0.read(), Binding::Unbound)
    }

    /// Returns `true` while the accessor is bound to a transactional repository.
    pub fn is_transactional(&self) -> bool {
        matches!(*self.0.read(), Binding::Transactional { .. })
    }

    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }
}

impl Clone for AccessorSlot {
    fn clone(&self) -> Self {
        let binding = self.binding();
        let slot = AccessorSlot(Arc::new(RwLock::new(binding.clone())));
        if let Binding::Transactional { scope, accessor_key, path } = &binding {
            scope.track(&slot, accessor_key, path);
        }
        slot
    }
}

impl Debug for AccessorSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let binding = self.0.read();
        let kind = match &*binding {
            Binding::Unbound => "unbound",
            Binding::Default { .. } => "default",
            Binding::Transactional { .. } => "transactional",
        };
        f.debug_struct("AccessorSlot")
            .field("kind", &kind)
            .field("path", &binding.path())
            .finish()
    }
}

/// An accessor for the collection of `C` entities nested under a parent entity.
///
/// A freshly constructed or deserialized accessor is unbound. Repositories bind it when
/// they create or read the parent entity: to an ordinary [`Repository`] outside of
/// transactions, or to a [`TransactionRepository`] inside one. After a transaction
/// settles, every accessor it bound is rebound to an ordinary repository.
///
/// The accessor never reaches the store: it serializes as nothing and ignores whatever
/// value is stored under its field.
pub struct SubCollection<C> {
    slot: AccessorSlot,
    _marker: PhantomData<fn() -> C>,
}

/// The repository a [`SubCollection`] accessor is currently bound to.
pub enum SubRepository<C: Entity> {
    Default(Repository<C>),
    Transactional(TransactionRepository<C>),
}

impl<C: Entity> SubCollection<C> {
    pub fn new() -> Self {
        SubCollection {
            slot: AccessorSlot::default(),
            _marker: PhantomData,
        }
    }

    pub fn slot(&self) -> &AccessorSlot {
        &self.slot
    }

    pub fn path(&self) -> Option<String> {
        self.slot.path()
    }

    pub fn is_bound(&self) -> bool {
        self.slot.is_bound()
    }

    pub fn is_transactional(&self) -> bool {
        self.slot.is_transactional()
    }

    /// Returns the repository the accessor is bound to.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentStoreError::DetachedSubCollection`] if the accessor is unbound.
    pub fn get(&self) -> DocumentStoreResult<SubRepository<C>> {
        match self.slot.binding() {
            Binding::Unbound => Err(DocumentStoreError::DetachedSubCollection(
                C::entity_name().to_owned(),
            )),
            Binding::Default { context, path } => {
                Repository::open(context, path.into()).map(SubRepository::Default)
            }
            Binding::Transactional { scope, path, .. } => {
                TransactionRepository::open(scope, path.into()).map(SubRepository::Transactional)
            }
        }
    }

    /// Returns the ordinary repository the accessor is bound to.
    ///
    /// # Errors
    ///
    /// Fails with [`DocumentStoreError::UnsupportedInTransaction`] while the accessor is
    /// bound to a transaction, and with [`DocumentStoreError::DetachedSubCollection`]
    /// when it is unbound.
    pub fn repository(&self) -> DocumentStoreResult<Repository<C>> {
        match self.get()? {
            SubRepository::Default(repository) => Ok(repository),
            SubRepository::Transactional(_) => {
                Err(DocumentStoreError::UnsupportedInTransaction("SubCollection::repository"))
            }
        }
    }

    /// Returns the transactional repository the accessor is bound to.
    ///
    /// # Errors
    ///
    /// Fails with [`DocumentStoreError::DetachedSubCollection`] unless the accessor is
    /// bound to a running transaction.
    pub fn transaction_repository(&self) -> DocumentStoreResult<TransactionRepository<C>> {
        match self.get()? {
            SubRepository::Transactional(repository) => Ok(repository),
            SubRepository::Default(repository) => Err(DocumentStoreError::DetachedSubCollection(
                format!("{} is not bound to a transaction", repository.path()),
            )),
        }
    }
}

impl<C: Entity> Default for SubCollection<C> {
    fn default() -> Self {
        SubCollection::new()
    }
}

impl<C> Clone for SubCollection<C> {
    fn clone(&self) -> Self {
        SubCollection {
            slot: self.slot.clone(),
            _marker: PhantomData,
        }
    }
}

impl<C> Debug for SubCollection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SubCollection").field(&self.slot).finish()
    }
}

// Accessors carry no data, so they never make two entities unequal.
impl<C> PartialEq for SubCollection<C> {
    fn eq(&self, _: &Self) -> bool {
        true
    }
}

impl<C> Serialize for SubCollection<C> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_none()
    }
}

impl<'de, C: Entity> Deserialize<'de> for SubCollection<C> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct AccessorVisitor<C>(PhantomData<fn() -> C>);

        impl<'de, C: Entity> Visitor<'de> for AccessorVisitor<C> {
            type Value = SubCollection<C>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an optional sub-collection placeholder")
            }

            fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
                Ok(SubCollection::new())
            }

            fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
                Ok(SubCollection::new())
            }

            fn visit_some<D: Deserializer<'de>>(
                self,
                deserializer: D,
            ) -> Result<Self::Value, D::Error> {
                IgnoredAny::deserialize(deserializer)?;
                Ok(SubCollection::new())
            }
        }

        deserializer.deserialize_option(AccessorVisitor(PhantomData))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Message, User, recording_mapper};

    #[test]
    fn entity_type_identity_follows_rust_type() {
        assert_eq!(EntityType::of::<User>(), EntityType::of::<User>());
        assert_ne!(EntityType::of::<User>(), EntityType::of::<Message>());
        assert_eq!(EntityType::of::<User>().name(), "User");
    }

    #[test]
    fn accessors_never_serialize_data() {
        let user = User::named("u1", "Ada");
        let bson = user.to_bson().unwrap();
        let doc = bson.as_document().unwrap();

        assert_eq!(doc.get("messages"), Some(&Bson::Null));
        assert_eq!(doc.get_str("name").unwrap(), "Ada");
    }

    #[test]
    fn missing_accessor_field_deserializes_unbound() {
        let user = User::from_bson(Bson::Document(bson::doc! { "id": "u1", "name": "Ada" })).unwrap();

        assert!(!user.messages.is_bound());
        assert!(matches!(
            user.messages.get(),
            Err(DocumentStoreError::DetachedSubCollection(_))
        ));
    }

    #[tokio::test]
    async fn clones_keep_their_own_accessor_binding() {
        let (mapper, _) = recording_mapper();
        let users = mapper.repository::<User>().unwrap();
        let template = User::named("", "Ada");

        let first = users.create(template.clone()).await.unwrap();
        let second = users.create(template.clone()).await.unwrap();
        assert!(!template.messages.is_bound());
        assert_eq!(first.messages.path(), Some(format!("users/{}/messages", first.id)));
        assert_eq!(second.messages.path(), Some(format!("users/{}/messages", second.id)));

        let copy = first.clone();
        assert_ne!(copy.messages.slot().identity(), first.messages.slot().identity());
        assert_eq!(copy.messages.path(), first.messages.path());
    }

    #[test]
    fn boxed_entities_downcast() {
        let boxed: Box<dyn AnyEntity> = Box::new(User::named("u1", "Ada"));

        assert_eq!(boxed.entity_id(), "u1");
        assert_eq!(boxed.downcast_ref::<User>().map(|u| u.name.as_str()), Some("Ada"));
        assert!(boxed.downcast_ref::<Message>().is_none());
    }
}
