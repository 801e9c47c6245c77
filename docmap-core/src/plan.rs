//! Query execution plans.
//!
//! A [`QueryExecutionPlan`] is the immutable description a query builder hands to an
//! executor: where clauses, paging, ordering, an optional listener, the read source, and
//! the in-memory post-processors to run over the materialized results.

use std::{
    fmt::{self, Debug, Display},
    sync::Arc,
};

use bson::Bson;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    error::DocumentStoreError,
    query::{Expr, FieldOp, Query, Sort, SortDirection},
};

/// Maximum number of values accepted by `in`, `not-in` and `array-contains-any` clauses.
pub const MAX_DISJUNCTION_VALUES: usize = 10;

/// A dotted path into an entity's fields.
///
/// Build one from a string (`"address.city"`), from a list of segments, or with the
/// [`field_path!`](crate::field_path) macro.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldPath(String);

impl FieldPath {
    pub fn new(path: impl Into<String>) -> Self {
        FieldPath(path.into())
    }

    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let segments: Vec<String> = segments
            .into_iter()
            .map(|segment| segment.as_ref().to_owned())
            .collect();
        FieldPath(segments.join("."))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FieldPath {
    fn from(path: &str) -> Self {
        FieldPath::new(path)
    }
}

impl From<String> for FieldPath {
    fn from(path: String) -> Self {
        FieldPath(path)
    }
}

impl From<&String> for FieldPath {
    fn from(path: &String) -> Self {
        FieldPath(path.clone())
    }
}

impl<const N: usize> From<[&str; N]> for FieldPath {
    fn from(segments: [&str; N]) -> Self {
        FieldPath::from_segments(segments)
    }
}

impl From<Vec<String>> for FieldPath {
    fn from(segments: Vec<String>) -> Self {
        FieldPath::from_segments(segments)
    }
}

/// Builds a [`FieldPath`] from identifiers: `field_path!(address.city)`.
#[macro_export]
macro_rules! field_path {
    ($($segment:ident).+) => {
        $crate::plan::FieldPath::from_segments([$(stringify!($segment)),+])
    };
}

/// One where clause of a plan.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryClause {
    pub property_path: String,
    pub operator: FieldOp,
    pub value: Bson,
}

/// One ordering key of a plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub property_path: String,
    pub direction: SortDirection,
}

/// Where a one-shot read is served from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// Let the store decide.
    #[default]
    Default,
    /// Always ask the server.
    Server,
    /// Only read cached data.
    Cache,
}

/// An in-memory transformation applied to query results, in registration order.
pub type PipeOperator<T> = Arc<dyn Fn(Vec<T>) -> Vec<T> + Send + Sync>;

/// Adds a raw native constraint to a query.
///
/// The function receives the query assembled from the plan's clauses, ordering and paging,
/// and returns an extra filter that is ANDed onto it.
pub type CustomQuery = Arc<dyn Fn(&Query) -> Expr + Send + Sync>;

/// Callbacks receiving the result sets of a real-time query.
pub struct QueryListener<T> {
    on_next: Arc<dyn Fn(Vec<T>) + Send + Sync>,
    on_error: Option<Arc<dyn Fn(DocumentStoreError) + Send + Sync>>,
}

impl<T> QueryListener<T> {
    pub fn new(on_next: impl Fn(Vec<T>) + Send + Sync + 'static) -> Self {
        QueryListener {
            on_next: Arc::new(on_next),
            on_error: None,
        }
    }

    pub fn with_error_handler(
        mut self,
        on_error: impl Fn(DocumentStoreError) + Send + Sync + 'static,
    ) -> Self {
        self.on_error = Some(Arc::new(on_error));
        self
    }

    pub fn next(&self, items: Vec<T>) {
        (self.on_next)(items);
    }

    pub fn error(&self, err: DocumentStoreError) {
        match &self.on_error {
            Some(on_error) => on_error(err),
            None => warn!(target: "docmap::query", error = %err, "listener error without handler"),
        }
    }
}

impl<T> Clone for QueryListener<T> {
    fn clone(&self) -> Self {
        QueryListener {
            on_next: Arc::clone(&self.on_next),
            on_error: self.on_error.clone(),
        }
    }
}

/// Runs every post-processor over `items`, each receiving the previous one's output.
pub fn apply_post_processors<T>(post_processors: &[PipeOperator<T>], items: Vec<T>) -> Vec<T> {
    post_processors
        .iter()
        .fold(items, |items, post_processor| post_processor(items))
}

/// The immutable description of a query, produced by a query builder.
pub struct QueryExecutionPlan<T> {
    pub clauses: Vec<QueryClause>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub order_by: Vec<OrderBy>,
    /// Fetch at most one entity.
    pub single: bool,
    pub custom_query: Option<CustomQuery>,
    /// Present for real-time queries.
    pub listener: Option<QueryListener<T>>,
    pub source: Source,
    pub post_processors: Vec<PipeOperator<T>>,
}

impl<T> QueryExecutionPlan<T> {
    pub fn is_listening(&self) -> bool {
        self.listener.is_some()
    }

    /// Translates the plan into a native [`Query`].
    ///
    /// Clauses become one conjunction in order. `single` caps the limit at one. The
    /// custom query, if any, sees everything else and its constraint is ANDed last.
    pub fn to_query(&self) -> Query {
        let mut filters: Vec<Expr> = self
            .clauses
            .iter()
            .map(|clause| Expr::field(clause.property_path.clone(), clause.operator, clause.value.clone()))
            .collect();

        let mut query = Query {
            filter: Expr::all(filters.clone()),
            sort: self
                .order_by
                .iter()
                .map(|order| Sort {
                    field: order.property_path.clone(),
                    direction: order.direction,
                })
                .collect(),
            limit: if self.single { Some(1) } else { self.limit },
            offset: self.offset,
        };

        if let Some(custom_query) = &self.custom_query {
            filters.push(custom_query(&query));
            query.filter = Expr::all(filters);
        }

        query
    }

    /// Runs the plan's post-processors over `items`.
    pub fn post_process(&self, items: Vec<T>) -> Vec<T> {
        apply_post_processors(&self.post_processors, items)
    }
}

impl<T> Debug for QueryExecutionPlan<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryExecutionPlan")
            .field("clauses", &self.clauses)
            .field("limit", &self.limit)
            .field("offset", &self.offset)
            .field("order_by", &self.order_by)
            .field("single", &self.single)
            .field("custom_query", &self.custom_query.is_some())
            .field("listening", &self.is_listening())
            .field("source", &self.source)
            .field("post_processors", &self.post_processors.len())
            .finish()
    }
}
