//! Conversion between entities and stored documents.
//!
//! The mapper serializes entities to BSON with serde, then hands the result to an
//! [`EntitySerializer`] which strips sub-collection accessors before the write. On reads
//! the serializer injects the document identifier into the stored fields so serde can
//! rebuild the entity.

use std::fmt::Debug;

use bson::{Bson, Document};

use crate::{
    client::DocumentSnapshot,
    error::{DocumentStoreError, DocumentStoreResult},
    metadata::{CollectionDescriptor, SubCollectionDescriptor},
};

/// Converts between serialized entities and stored documents.
pub trait EntitySerializer: Send + Sync + Debug {
    /// Turns a serialized entity into the fields to store.
    ///
    /// # Arguments
    ///
    /// * `entity` - The entity serialized to BSON
    /// * `sub_collections` - The sub-collections of the entity's collection; their
    ///   accessor fields must not be stored
    fn serialize(
        &self,
        entity: Bson,
        sub_collections: &[SubCollectionDescriptor],
    ) -> DocumentStoreResult<Document>;

    /// Turns a stored document back into a serialized entity.
    fn deserialize(
        &self,
        snapshot: DocumentSnapshot,
        collection: &CollectionDescriptor,
    ) -> DocumentStoreResult<Bson>;
}

/// The default serializer.
///
/// Strips accessor fields on write, and on read inserts the document identifier under
/// the entity's id field.
#[derive(Debug, Clone, Copy, Default)]
pub struct BsonEntitySerializer;

impl EntitySerializer for BsonEntitySerializer {
    fn serialize(
        &self,
        entity: Bson,
        sub_collections: &[SubCollectionDescriptor],
    ) -> DocumentStoreResult<Document> {
        let Bson::Document(mut document) = entity else {
            return Err(DocumentStoreError::InvalidDocument(format!(
                "entities must serialize to a document, got {:?}",
                entity.element_type()
            )));
        };

        for key in sub_collections.iter().filter_map(CollectionDescriptor::accessor_key) {
            document.remove(key);
        }

        Ok(document)
    }

    fn deserialize(
        &self,
        snapshot: DocumentSnapshot,
        collection: &CollectionDescriptor,
    ) -> DocumentStoreResult<Bson> {
        let mut document = snapshot.data;
        document.insert(collection.entity_type().id_field(), Bson::String(snapshot.id));
        Ok(Bson::Document(document))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        entity::EntityType,
        testing::{Message, User},
    };
    use bson::doc;
    use chrono::Utc;

    #[test]
    fn accessor_fields_are_stripped() {
        let messages = CollectionDescriptor::sub_collection(
            "messages",
            EntityType::of::<Message>(),
            EntityType::of::<User>(),
            "messages",
        );

        let stored = BsonEntitySerializer
            .serialize(
                Bson::Document(doc! { "id": "u1", "name": "Ada", "messages": Bson::Null }),
                &[messages],
            )
            .unwrap();

        assert_eq!(stored, doc! { "id": "u1", "name": "Ada" });
    }

    #[test]
    fn scalars_are_rejected() {
        assert!(matches!(
            BsonEntitySerializer.serialize(Bson::Int32(3), &[]),
            Err(DocumentStoreError::InvalidDocument(_))
        ));
    }

    #[test]
    fn reads_inject_the_identifier() {
        let users = CollectionDescriptor::root("users", EntityType::of::<User>());
        let snapshot = DocumentSnapshot {
            id: "u1".into(),
            data: doc! { "name": "Ada" },
            update_time: Utc::now(),
        };

        let bson = BsonEntitySerializer.deserialize(snapshot, &users).unwrap();
        assert_eq!(bson, Bson::Document(doc! { "name": "Ada", "id": "u1" }));
    }
}
