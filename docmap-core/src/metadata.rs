//! Collection metadata and the registry that links entity types into a hierarchy.
//!
//! Every entity type is registered exactly once, either as a root collection or as a
//! sub-collection of a parent entity type. Registrations may arrive in any order: a
//! sub-collection registered before its parent stays unlinked (empty path segments) until
//! the parent appears, at which point segments are recomputed for the whole subtree.
//!
//! ```ignore
//! use docmap::prelude::*;
//!
//! let registry = MetadataRegistry::new();
//! registry.register_sub_collection::<User, Message>("messages", None)?;
//! registry.register_collection::<User>(None)?;
//!
//! let messages = registry.resolve("users/u1/messages")?;
//! assert_eq!(messages.segments(), ["users", "Messages"]);
//! ```

use std::{
    any::TypeId,
    collections::{HashMap, HashSet},
    fmt::{self, Display},
    ops::Deref,
    sync::Arc,
};

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use tracing::debug;

use crate::{
    entity::{Entity, EntityType},
    error::{DocumentStoreError, DocumentStoreResult},
    resolver::{CustomRepository, RepositoryOverride},
};

/// Describes where the documents of one entity type live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionDescriptor {
    name: String,
    entity_type: EntityType,
    parent: Option<ParentLink>,
    segments: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ParentLink {
    entity_type: EntityType,
    accessor_key: String,
}

/// A [`CollectionDescriptor`] nested under a parent entity type.
///
/// Descriptors of this kind always carry a parent entity type and an accessor key.
pub type SubCollectionDescriptor = CollectionDescriptor;

impl CollectionDescriptor {
    /// Describes a root collection.
    pub fn root(name: impl Into<String>, entity_type: EntityType) -> Self {
        CollectionDescriptor {
            name: name.into(),
            entity_type,
            parent: None,
            segments: Vec::new(),
        }
    }

    /// Describes a collection nested under documents of `parent`, reachable through the
    /// parent's `accessor_key` accessor.
    pub fn sub_collection(
        name: impl Into<String>,
        entity_type: EntityType,
        parent: EntityType,
        accessor_key: impl Into<String>,
    ) -> Self {
        CollectionDescriptor {
            name: name.into(),
            entity_type,
            parent: Some(ParentLink {
                entity_type: parent,
                accessor_key: accessor_key.into(),
            }),
            segments: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entity_type(&self) -> EntityType {
        self.entity_type
    }

    pub fn parent_entity_type(&self) -> Option<EntityType> {
        self.parent.as_ref().map(|parent| parent.entity_type)
    }

    pub fn accessor_key(&self) -> Option<&str> {
        self.parent.as_ref().map(|parent| parent.accessor_key.as_str())
    }

    /// Collection names from the root collection down to this one.
    ///
    /// Empty while any ancestor is still unregistered.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn is_sub_collection(&self) -> bool {
        self.parent.is_some()
    }

    /// Returns `true` once the whole ancestor chain is registered.
    pub fn is_linked(&self) -> bool {
        !self.segments.is_empty()
    }
}

/// A collection descriptor together with its direct sub-collections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullCollectionDescriptor {
    pub collection: CollectionDescriptor,
    pub sub_collections: Vec<SubCollectionDescriptor>,
}

impl Deref for FullCollectionDescriptor {
    type Target = CollectionDescriptor;

    fn deref(&self) -> &Self::Target {
        &self.collection
    }
}

/// Identifies a collection either by entity type or by a slash-separated path.
///
/// Paths alternate collection and document segments and must have an odd number of
/// segments: `users`, `users/u1/messages`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectionTarget {
    Type(EntityType),
    Path(String),
}

impl CollectionTarget {
    pub fn of<E: Entity>() -> Self {
        CollectionTarget::Type(EntityType::of::<E>())
    }
}

impl Display for CollectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectionTarget::Type(entity_type) => Display::fmt(entity_type, f),
            CollectionTarget::Path(path) => f.write_str(path),
        }
    }
}

impl From<EntityType> for CollectionTarget {
    fn from(entity_type: EntityType) -> Self {
        CollectionTarget::Type(entity_type)
    }
}

impl From<&str> for CollectionTarget {
    fn from(path: &str) -> Self {
        CollectionTarget::Path(path.to_owned())
    }
}

impl From<String> for CollectionTarget {
    fn from(path: String) -> Self {
        CollectionTarget::Path(path)
    }
}

impl From<&String> for CollectionTarget {
    fn from(path: &String) -> Self {
        CollectionTarget::Path(path.clone())
    }
}

/// Splits a collection path into its collection-name segments.
///
/// `users/u1/messages` yields `["users", "messages"]`.
///
/// # Errors
///
/// Returns [`DocumentStoreError::InvalidPath`] when the path is empty, has an empty
/// segment, or points at a document (an even number of segments).
pub fn collection_segments(path: &str) -> DocumentStoreResult<Vec<String>> {
    let parts: Vec<&str> = path.split('/').collect();

    if parts.iter().any(|part| part.is_empty()) {
        return Err(DocumentStoreError::InvalidPath(format!(
            "'{path}' contains an empty segment"
        )));
    }
    if parts.len() % 2 == 0 {
        return Err(DocumentStoreError::InvalidPath(format!(
            "'{path}' has an even number of segments and points at a document"
        )));
    }

    Ok(parts.iter().step_by(2).map(|part| (*part).to_owned()).collect())
}

/// Appends a plural suffix using simple English rules.
pub fn pluralize(word: &str) -> String {
    let lower = word.to_ascii_lowercase();

    if lower.ends_with('s')
        || lower.ends_with('x')
        || lower.ends_with('z')
        || lower.ends_with("ch")
        || lower.ends_with("sh")
    {
        return format!("{word}es");
    }

    let mut chars = lower.chars().rev();
    if let (Some('y'), Some(before)) = (chars.next(), chars.next()) {
        if !matches!(before, 'a' | 'e' | 'i' | 'o' | 'u') {
            return format!("{}ies", &word[..word.len() - 1]);
        }
    }

    format!("{word}s")
}

/// Default name of a root collection: the lowercased, pluralized entity name.
pub fn default_collection_name<E: Entity>() -> String {
    pluralize(&E::entity_name().to_lowercase())
}

/// Default name of a sub-collection: the pluralized entity name, case preserved.
pub fn default_sub_collection_name<E: Entity>() -> String {
    pluralize(E::entity_name())
}

#[derive(Debug, Default)]
struct RegistryState {
    collections: Vec<CollectionDescriptor>,
    index: HashMap<TypeId, usize>,
    overrides: HashMap<TypeId, RepositoryOverride>,
}

impl RegistryState {
    fn get(&self, entity_type: EntityType) -> Option<&CollectionDescriptor> {
        self.index
            .get(&entity_type.type_id())
            .map(|position| &self.collections[*position])
    }

    fn children_of(&self, entity_type: EntityType) -> Vec<EntityType> {
        self.collections
            .iter()
            .filter(|descriptor| descriptor.parent_entity_type() == Some(entity_type))
            .map(CollectionDescriptor::entity_type)
            .collect()
    }

    fn segments_for(&self, descriptor: &CollectionDescriptor) -> Vec<String> {
        match descriptor.parent_entity_type() {
            None => vec![descriptor.name.clone()],
            Some(parent) => match self.get(parent) {
                Some(parent) if parent.is_linked() => {
                    let mut segments = parent.segments.clone();
                    segments.push(descriptor.name.clone());
                    segments
                }
                _ => Vec::new(),
            },
        }
    }

    fn ensure_acyclic(&self, descriptor: &CollectionDescriptor) -> DocumentStoreResult<()> {
        let mut visited = HashSet::new();
        let mut cursor = descriptor.parent_entity_type();

        while let Some(current) = cursor {
            if current == descriptor.entity_type || !visited.insert(current) {
                return Err(DocumentStoreError::CyclicHierarchy(
                    descriptor.entity_type.name().to_owned(),
                ));
            }
            cursor = self.get(current).and_then(CollectionDescriptor::parent_entity_type);
        }

        Ok(())
    }

    fn propagate_from(&mut self, root: EntityType) {
        let mut visited = HashSet::from([root]);
        let mut worklist = self.children_of(root);

        while let Some(child) = worklist.pop() {
            if !visited.insert(child) {
                continue;
            }
            let Some(position) = self.index.get(&child.type_id()).copied() else {
                continue;
            };
            let segments = self.segments_for(&self.collections[position]);
            self.collections[position].segments = segments;
            worklist.extend(self.children_of(child));
        }
    }

    fn full(&self, descriptor: &CollectionDescriptor) -> FullCollectionDescriptor {
        FullCollectionDescriptor {
            collection: descriptor.clone(),
            sub_collections: self
                .collections
                .iter()
                .filter(|candidate| candidate.parent_entity_type() == Some(descriptor.entity_type))
                .cloned()
                .collect(),
        }
    }
}

/// Stores collection descriptors and repository overrides for a mapper.
///
/// The registry is internally synchronized; share it behind an [`Arc`]. Most applications
/// use the process-wide instance returned by [`MetadataRegistry::global`], while tests
/// usually build a private one.
#[derive(Debug, Default)]
pub struct MetadataRegistry {
    state: RwLock<RegistryState>,
}

static GLOBAL_REGISTRY: Lazy<Arc<MetadataRegistry>> =
    Lazy::new(|| Arc::new(MetadataRegistry::new()));

impl MetadataRegistry {
    pub fn new() -> Self {
        MetadataRegistry::default()
    }

    /// Returns the process-wide registry.
    pub fn global() -> Arc<MetadataRegistry> {
        Arc::clone(&GLOBAL_REGISTRY)
    }

    /// Removes every registration.
    pub fn reset(&self) {
        *self.state.write() = RegistryState::default();
    }

    /// Registers a collection descriptor.
    ///
    /// The descriptor's segments are computed here; any segments on the argument are
    /// ignored. Registering a parent recomputes the segments of its whole subtree.
    ///
    /// # Errors
    ///
    /// * [`DocumentStoreError::DuplicateCollection`] if the entity type is already registered
    /// * [`DocumentStoreError::CyclicHierarchy`] if the entity type would become its own ancestor
    pub fn register(&self, mut descriptor: CollectionDescriptor) -> DocumentStoreResult<()> {
        let mut state = self.state.write();

        if let Some(existing) = state.get(descriptor.entity_type) {
            return Err(DocumentStoreError::DuplicateCollection(format!(
                "{} ({})",
                existing.name,
                descriptor.entity_type.name()
            )));
        }
        state.ensure_acyclic(&descriptor)?;

        descriptor.segments = state.segments_for(&descriptor);
        let entity_type = descriptor.entity_type;

        debug!(
            target: "docmap::metadata",
            entity = entity_type.name(),
            name = %descriptor.name,
            linked = descriptor.is_linked(),
            "registering collection"
        );

        let position = state.collections.len();
        state.collections.push(descriptor);
        state.index.insert(entity_type.type_id(), position);
        state.propagate_from(entity_type);

        Ok(())
    }

    /// Registers `E` as a root collection, named `name` or the default collection name.
    pub fn register_collection<E: Entity>(&self, name: Option<&str>) -> DocumentStoreResult<()> {
        let name = name.map_or_else(default_collection_name::<E>, str::to_owned);
        self.register(CollectionDescriptor::root(name, EntityType::of::<E>()))
    }

    /// Registers `C` as a sub-collection of `P`, reachable through the `accessor_key`
    /// field of `P`.
    pub fn register_sub_collection<P: Entity, C: Entity>(
        &self,
        accessor_key: &str,
        name: Option<&str>,
    ) -> DocumentStoreResult<()> {
        let name = name.map_or_else(default_sub_collection_name::<C>, str::to_owned);
        self.register(CollectionDescriptor::sub_collection(
            name,
            EntityType::of::<C>(),
            EntityType::of::<P>(),
            accessor_key,
        ))
    }

    /// Looks up the linked collection for a target.
    ///
    /// Returns `Ok(None)` when nothing is registered, or when the collection's ancestors
    /// are not all registered yet.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentStoreError::InvalidPath`] for malformed paths.
    pub fn lookup(
        &self,
        target: &CollectionTarget,
    ) -> DocumentStoreResult<Option<FullCollectionDescriptor>> {
        let state = self.state.read();

        let found = match target {
            CollectionTarget::Type(entity_type) => state.get(*entity_type),
            CollectionTarget::Path(path) => {
                let segments = collection_segments(path)?;
                state
                    .collections
                    .iter()
                    .find(|descriptor| descriptor.segments == segments)
            }
        };

        Ok(found
            .filter(|descriptor| descriptor.is_linked())
            .map(|descriptor| state.full(descriptor)))
    }

    /// Like [`MetadataRegistry::lookup`], but fails when nothing is found.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentStoreError::NoMetadata`] if no linked collection matches.
    pub fn resolve(
        &self,
        target: impl Into<CollectionTarget>,
    ) -> DocumentStoreResult<FullCollectionDescriptor> {
        let target = target.into();
        self.lookup(&target)?
            .ok_or_else(|| DocumentStoreError::NoMetadata(target.to_string()))
    }

    /// Returns every registered descriptor, linked or not, in registration order.
    pub fn collections(&self) -> Vec<CollectionDescriptor> {
        self.state.read().collections.clone()
    }

    /// Registers a custom repository for an entity type.
    ///
    /// Registering the same target twice is a no-op.
    ///
    /// # Errors
    ///
    /// * [`DocumentStoreError::InvalidOverride`] if the override was built for another entity
    /// * [`DocumentStoreError::ConflictingOverride`] if a different target is already registered
    pub fn register_repository_override(
        &self,
        entity_type: EntityType,
        repository: RepositoryOverride,
    ) -> DocumentStoreResult<()> {
        if repository.entity_type() != entity_type {
            return Err(DocumentStoreError::InvalidOverride {
                entity: entity_type.name().to_owned(),
                reason: format!(
                    "{} is a repository for {}",
                    repository.target_name(),
                    repository.entity_type()
                ),
            });
        }

        let mut state = self.state.write();
        if let Some(existing) = state.overrides.get(&entity_type.type_id()) {
            if existing.target_type_id() == repository.target_type_id() {
                return Ok(());
            }
            return Err(DocumentStoreError::ConflictingOverride(entity_type.name().to_owned()));
        }

        debug!(
            target: "docmap::metadata",
            entity = entity_type.name(),
            repository = repository.target_name(),
            "registering custom repository"
        );
        state.overrides.insert(entity_type.type_id(), repository);

        Ok(())
    }

    /// Registers `R` as the custom repository for `E`.
    pub fn register_repository<E: Entity, R: CustomRepository<E>>(
        &self,
    ) -> DocumentStoreResult<()> {
        self.register_repository_override(EntityType::of::<E>(), RepositoryOverride::of::<E, R>())
    }

    pub fn repository_override(&self, entity_type: EntityType) -> Option<RepositoryOverride> {
        self.state.read().overrides.get(&entity_type.type_id()).cloned()
    }
}
