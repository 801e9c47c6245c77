//! Ready-made in-memory transforms for [`QueryBuilder::pipe`](crate::builder::QueryBuilder::pipe).
//!
//! ```ignore
//! let users = repository
//!     .query()
//!     .pipe_shared(post_process::search("ada", ["name", "profile.email"]))
//!     .find()
//!     .await?;
//! ```

use std::sync::Arc;

use bson::Bson;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    entity::{Entity, EntityExt},
    plan::{FieldPath, PipeOperator},
    query::lookup_path,
};

/// One requested value of a filterable field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterParam {
    pub field: String,
    pub value: String,
}

impl FilterParam {
    pub fn new(field: impl Into<String>, value: impl Into<String>) -> Self {
        FilterParam {
            field: field.into(),
            value: value.into(),
        }
    }
}

/// Keeps the entities where any of `fields` contains `term`, ignoring case.
///
/// Arrays and nested documents under a field are searched recursively. An empty term
/// keeps everything.
pub fn search<T, I, F>(term: &str, fields: I) -> PipeOperator<T>
where
    T: Entity,
    I: IntoIterator<Item = F>,
    F: Into<FieldPath>,
{
    let needle = term.to_lowercase();
    let fields: Vec<String> = fields.into_iter().map(|f| f.into().into_string()).collect();

    Arc::new(move |items: Vec<T>| {
        if needle.is_empty() {
            return items;
        }
        items
            .into_iter()
            .filter(|item| {
                with_document(item, |document| {
                    fields
                        .iter()
                        .filter_map(|field| lookup_path(document, field))
                        .any(|value| contains(value, &needle))
                })
            })
            .collect()
    })
}

/// Keeps the entities matching every parameter that names one of `fields`.
///
/// A field matches when its value, or any element of it when it is an array, equals
/// one of the requested values as a string. Parameters naming other fields are ignored.
pub fn filter_by_params<T, I, F>(params: Vec<FilterParam>, fields: I) -> PipeOperator<T>
where
    T: Entity,
    I: IntoIterator<Item = F>,
    F: Into<FieldPath>,
{
    let criteria: Vec<(String, Vec<String>)> = fields
        .into_iter()
        .map(|f| f.into().into_string())
        .filter_map(|field| {
            let values: Vec<String> = params
                .iter()
                .filter(|param| param.field == field)
                .map(|param| param.value.clone())
                .collect();
            (!values.is_empty()).then_some((field, values))
        })
        .collect();

    Arc::new(move |items: Vec<T>| {
        if criteria.is_empty() {
            return items;
        }
        items
            .into_iter()
            .filter(|item| {
                with_document(item, |document| {
                    criteria.iter().all(|(field, values)| {
                        lookup_path(document, field).is_some_and(|value| equals_any(value, values))
                    })
                })
            })
            .collect()
    })
}

fn with_document<T: Entity>(item: &T, predicate: impl FnOnce(&bson::Document) -> bool) -> bool {
    match item.to_bson() {
        Ok(Bson::Document(document)) => predicate(&document),
        Ok(_) => false,
        Err(err) => {
            warn!(target: "docmap::query", error = %err, "dropping entity that failed to serialize");
            false
        }
    }
}

fn contains(value: &Bson, needle: &str) -> bool {
    match value {
        Bson::Array(items) => items.iter().any(|item| contains(item, needle)),
        Bson::Document(document) => document.values().any(|item| contains(item, needle)),
        other => scalar_text(other).is_some_and(|text| text.to_lowercase().contains(needle)),
    }
}

fn equals_any(value: &Bson, values: &[String]) -> bool {
    match value {
        Bson::Array(items) => items.iter().any(|item| equals_any(item, values)),
        other => scalar_text(other).is_some_and(|text| values.iter().any(|v| *v == text)),
    }
}

fn scalar_text(value: &Bson) -> Option<String> {
    match value {
        Bson::String(s) => Some(s.clone()),
        Bson::Boolean(b) => Some(b.to_string()),
        Bson::Int32(n) => Some(n.to_string()),
        Bson::Int64(n) => Some(n.to_string()),
        Bson::Double(n) => Some(n.to_string()),
        Bson::DateTime(dt) => Some(dt.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::User;

    fn users() -> Vec<User> {
        vec![User::named("u1", "Ada Lovelace"), User::named("u2", "Grace Hopper")]
    }

    #[test]
    fn search_is_case_insensitive() {
        let found = search::<User, _, _>("LOVE", ["name"])(users());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "u1");

        assert_eq!(search::<User, _, _>("", ["name"])(users()).len(), 2);
        assert!(search::<User, _, _>("ada", ["id"])(users()).is_empty());
    }

    #[test]
    fn params_filter_only_their_own_fields() {
        let params = vec![FilterParam::new("id", "u2"), FilterParam::new("color", "red")];

        let found = filter_by_params::<User, _, _>(params.clone(), ["id"])(users());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "Grace Hopper");

        assert_eq!(filter_by_params::<User, _, _>(params, ["name"])(users()).len(), 2);
    }
}
