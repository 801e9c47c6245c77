//! Error types and result types for mapping operations.
//!
//! Every fallible operation in this crate returns [`DocumentStoreResult<T>`]. The error
//! kinds fall into two broad families: misuse of the mapping layer (bad paths, duplicate
//! registrations, repeated query clauses, operations a transaction cannot perform) and
//! failures surfaced by the document store itself.

use bson::error::Error as BsonError;
use serde_json::Error as SerdeJsonError;
use thiserror::Error;

use crate::validate::ValidationError;

/// Represents all possible errors that can occur while mapping entities onto a document store.
#[derive(Error, Debug)]
pub enum DocumentStoreError {
    /// No collection is registered for the given entity type or path.
    #[error("There is no metadata stored for \"{0}\"")]
    NoMetadata(String),
    /// A collection path is malformed, or a sub-collection was addressed by type alone.
    #[error("Invalid collection path: {0}")]
    InvalidPath(String),
    /// The entity type already has a collection registered.
    #[error("Collection with name {0} has already been registered")]
    DuplicateCollection(String),
    /// Registering the descriptor would make an entity type its own ancestor.
    #[error("Registering {0} would create a cyclic collection hierarchy")]
    CyclicHierarchy(String),
    /// A custom repository is already registered for the entity with a different target.
    #[error("Cannot register a custom repository on {0} twice with two different targets")]
    ConflictingOverride(String),
    /// A repository override does not fit the entity it was registered for.
    #[error("Invalid repository override for {entity}: {reason}")]
    InvalidOverride {
        /// The entity the override was registered for.
        entity: String,
        /// Why the override was rejected.
        reason: String,
    },
    /// A path resolved to a collection holding a different entity type than requested.
    #[error("Path {path} holds {found} entities, not {expected}")]
    EntityMismatch {
        /// The collection path that was resolved.
        path: String,
        /// The entity type the caller asked for.
        expected: String,
        /// The entity type registered at the path.
        found: String,
    },
    /// A single-use query clause was supplied more than once.
    #[error("{0} cannot be called more than once in the same query expression")]
    DuplicateClause(String),
    /// A multi-value query clause was given more values than the store accepts.
    #[error("This query supports up to {max} values. You provided {provided}")]
    TooManyValues {
        /// Maximum number of values accepted.
        max: usize,
        /// Number of values supplied.
        provided: usize,
    },
    /// One or more entities failed validation.
    #[error("Validation failed with {} error(s)", .0.len())]
    Validation(Vec<ValidationError>),
    /// The batch is being committed and cannot accept operations or a second commit.
    #[error("This batch is already being committed")]
    AlreadyCommitting,
    /// A batch commit was requested with no queued operations.
    #[error("Cannot commit a batch with zero operations")]
    EmptyBatch,
    /// The operation is not available on transactional repositories.
    #[error("{0} is not available for transactions")]
    UnsupportedInTransaction(&'static str),
    /// A sub-collection accessor was used before a repository was bound to it.
    #[error("Sub-collection accessor is not bound: {0}")]
    DetachedSubCollection(String),
    /// A document with the given ID already exists in the collection.
    /// The first argument is the document ID, the second is the collection path.
    #[error("Document {0} already exists in collection {1}")]
    DocumentAlreadyExists(String, String),
    /// The requested document was not found in the collection.
    /// The first argument is the document ID, the second is the collection path.
    #[error("Document not found {0} in collection {1}")]
    DocumentNotFound(String, String),
    /// The store refused to commit a transaction.
    #[error("Transaction aborted: {0}")]
    TransactionAborted(String),
    /// The document has an invalid structure.
    #[error("Invalid document: {0}")]
    InvalidDocument(String),
    /// Serialization/deserialization error when converting between document formats (BSON, JSON).
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// An error occurred in the underlying document store.
    #[error("Backend error: {0}")]
    Backend(String),
    /// An unknown error occurred.
    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl DocumentStoreError {
    /// Returns `true` when the error was caused by misusing the mapping layer rather than
    /// by the document store.
    pub fn is_misuse(&self) -> bool {
        matches!(
            self,
            DocumentStoreError::NoMetadata(_)
                | DocumentStoreError::InvalidPath(_)
                | DocumentStoreError::DuplicateCollection(_)
                | DocumentStoreError::CyclicHierarchy(_)
                | DocumentStoreError::ConflictingOverride(_)
                | DocumentStoreError::InvalidOverride { .. }
                | DocumentStoreError::EntityMismatch { .. }
                | DocumentStoreError::DuplicateClause(_)
                | DocumentStoreError::TooManyValues { .. }
                | DocumentStoreError::AlreadyCommitting
                | DocumentStoreError::EmptyBatch
                | DocumentStoreError::UnsupportedInTransaction(_)
                | DocumentStoreError::DetachedSubCollection(_)
        )
    }

    /// Returns the validation errors carried by a [`DocumentStoreError::Validation`].
    pub fn validation_errors(&self) -> Option<&[ValidationError]> {
        match self {
            DocumentStoreError::Validation(errors) => Some(errors),
            _ => None,
        }
    }
}

/// A specialized `Result` type for mapping operations.
pub type DocumentStoreResult<T> = Result<T, DocumentStoreError>;

impl From<BsonError> for DocumentStoreError {
    fn from(err: BsonError) -> Self {
        DocumentStoreError::Serialization(err.to_string())
    }
}

impl From<SerdeJsonError> for DocumentStoreError {
    fn from(err: SerdeJsonError) -> Self {
        DocumentStoreError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn misuse_errors_are_classified() {
        assert!(DocumentStoreError::EmptyBatch.is_misuse());
        assert!(DocumentStoreError::UnsupportedInTransaction("find").is_misuse());
        assert!(!DocumentStoreError::Backend("unavailable".into()).is_misuse());
        assert!(!DocumentStoreError::Validation(Vec::new()).is_misuse());
    }

    #[test]
    fn validation_message_counts_errors() {
        let err = DocumentStoreError::Validation(vec![ValidationError::new(
            "User",
            "name",
            "isNotEmpty",
            "name should not be empty",
        )]);

        assert_eq!(err.to_string(), "Validation failed with 1 error(s)");
        assert_eq!(err.validation_errors().map(<[_]>::len), Some(1));
    }
}
