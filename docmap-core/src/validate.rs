//! Entity validation hooks.
//!
//! The mapping layer never inspects entity constraints itself. Instead it hands the
//! serialized entity to a [`Validator`] before every write, and refuses the write when
//! the validator reports any [`ValidationError`].

use std::fmt::{self, Debug, Display};

use bson::Bson;
use serde::{Deserialize, Serialize};

use crate::{
    entity::{Entity, EntityExt},
    error::{DocumentStoreError, DocumentStoreResult},
    metadata::CollectionDescriptor,
};

/// A single constraint violation reported by a [`Validator`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    /// Name of the entity type that failed validation.
    pub target: String,
    /// The offending property, as a dotted path.
    pub property: String,
    /// Identifier of the violated constraint.
    pub constraint: String,
    /// Human readable description of the violation.
    pub message: String,
}

impl ValidationError {
    pub fn new(
        target: impl Into<String>,
        property: impl Into<String>,
        constraint: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        ValidationError {
            target: target.into(),
            property: property.into(),
            constraint: constraint.into(),
            message: message.into(),
        }
    }
}

impl Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}: {} ({})", self.target, self.property, self.message, self.constraint)
    }
}

/// Options forwarded verbatim to the [`Validator`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorOptions {
    /// Ignore constraints on properties that are absent.
    pub skip_missing_properties: bool,
    /// Only check constraints belonging to these groups. Empty means all groups.
    pub groups: Vec<String>,
    /// Stop at the first violated constraint.
    pub stop_at_first_error: bool,
}

/// Validates serialized entities before they are written.
///
/// Implementations receive the entity as BSON together with the descriptor of the
/// collection it is about to be written to. Returning an empty list means the entity
/// is valid.
pub trait Validator: Send + Sync + Debug {
    /// Checks an entity and returns every violated constraint.
    ///
    /// # Arguments
    ///
    /// * `entity` - The entity serialized to BSON, sub-collection accessors included
    /// * `collection` - The collection the entity belongs to
    /// * `options` - Options configured on the mapper
    fn validate(
        &self,
        entity: &Bson,
        collection: &CollectionDescriptor,
        options: &ValidatorOptions,
    ) -> Vec<ValidationError>;
}

/// A validator that accepts everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopValidator;

impl Validator for NoopValidator {
    fn validate(
        &self,
        _: &Bson,
        _: &CollectionDescriptor,
        _: &ValidatorOptions,
    ) -> Vec<ValidationError> {
        Vec::new()
    }
}

/// Runs the validator over `entity`.
pub(crate) fn validate_entity<T: Entity>(
    validator: &dyn Validator,
    entity: &T,
    collection: &CollectionDescriptor,
    options: &ValidatorOptions,
) -> DocumentStoreResult<Vec<ValidationError>> {
    let bson = entity.to_bson()?;
    Ok(validator.validate(&bson, collection, options))
}

/// Fails with [`DocumentStoreError::Validation`] when `errors` is not empty.
pub(crate) fn ensure_valid(errors: Vec<ValidationError>) -> DocumentStoreResult<()> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(DocumentStoreError::Validation(errors))
    }
}
