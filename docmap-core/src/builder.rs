//! Fluent query construction.
//!
//! Queries are built by chaining where clauses, ordering and paging onto a
//! [`QueryBuilder`], then finished with a terminal call (`find`, `find_one`,
//! `find_and_listen`, `find_one_and_listen`, or `watch`).
//!
//! ```ignore
//! let adults = users
//!     .where_greater_or_equal_than("age", 18)
//!     .order_by_ascending("name")?
//!     .limit(20)?
//!     .find()
//!     .await?;
//! ```
//!
//! Clauses that may only appear once (`limit`, `offset`, `custom_query`, and each
//! `order_by` field) fail with [`DocumentStoreError::DuplicateClause`] when repeated.
//! Multi-value clauses fail with [`DocumentStoreError::TooManyValues`] past
//! [`MAX_DISJUNCTION_VALUES`] values. Both errors surface before anything reaches the store.
//!
//! Builders handed out inside a transaction only accept where clauses: paging, ordering
//! and every terminal call fail with [`DocumentStoreError::UnsupportedInTransaction`].

use std::{collections::HashSet, sync::Arc};

use async_trait::async_trait;
use bson::Bson;
use futures::channel::mpsc;

use crate::{
    entity::Entity,
    error::{DocumentStoreError, DocumentStoreResult},
    executor::{ListenStream, QueryExecutor, QueryOutcome, Subscription},
    plan::{
        CustomQuery, FieldPath, MAX_DISJUNCTION_VALUES, OrderBy, PipeOperator, QueryClause,
        QueryExecutionPlan, QueryListener, Source,
    },
    query::{Expr, FieldOp, Query, SortDirection},
};

/// Accumulates a query and runs it through a [`QueryExecutor`].
pub struct QueryBuilder<T: Entity> {
    executor: Arc<dyn QueryExecutor<T>>,
    clauses: Vec<QueryClause>,
    limit: Option<usize>,
    offset: Option<usize>,
    order_by: Vec<OrderBy>,
    ordered_fields: HashSet<String>,
    custom_query: Option<CustomQuery>,
    source: Source,
    post_processors: Vec<PipeOperator<T>>,
    transactional: bool,
}

impl<T: Entity> QueryBuilder<T> {
    pub fn new(executor: Arc<dyn QueryExecutor<T>>) -> Self {
        QueryBuilder {
            executor,
            clauses: Vec::new(),
            limit: None,
            offset: None,
            order_by: Vec::new(),
            ordered_fields: HashSet::new(),
            custom_query: None,
            source: Source::Default,
            post_processors: Vec::new(),
            transactional: false,
        }
    }

    /// A builder for a repository bound to a running transaction.
    pub(crate) fn in_transaction(executor: Arc<dyn QueryExecutor<T>>) -> Self {
        QueryBuilder {
            transactional: true,
            ..QueryBuilder::new(executor)
        }
    }

    pub fn is_transactional(&self) -> bool {
        self.transactional
    }

    fn outside_transaction(&self, operation: &'static str) -> DocumentStoreResult<()> {
        if self.transactional {
            return Err(DocumentStoreError::UnsupportedInTransaction(operation));
        }
        Ok(())
    }

    fn clause(mut self, field: impl Into<FieldPath>, operator: FieldOp, value: Bson) -> Self {
        self.clauses.push(QueryClause {
            property_path: field.into().into_string(),
            operator,
            value,
        });
        self
    }

    fn list_clause<I>(
        self,
        field: impl Into<FieldPath>,
        operator: FieldOp,
        values: I,
    ) -> DocumentStoreResult<Self>
    where
        I: IntoIterator,
        I::Item: Into<Bson>,
    {
        let values: Vec<Bson> = values.into_iter().map(Into::into).collect();
        if values.len() > MAX_DISJUNCTION_VALUES {
            return Err(DocumentStoreError::TooManyValues {
                max: MAX_DISJUNCTION_VALUES,
                provided: values.len(),
            });
        }
        Ok(self.clause(field, operator, Bson::Array(values)))
    }

    pub fn where_equal_to(self, field: impl Into<FieldPath>, value: impl Into<Bson>) -> Self {
        self.clause(field, FieldOp::Eq, value.into())
    }

    pub fn where_not_equal_to(self, field: impl Into<FieldPath>, value: impl Into<Bson>) -> Self {
        self.clause(field, FieldOp::Ne, value.into())
    }

    pub fn where_greater_than(self, field: impl Into<FieldPath>, value: impl Into<Bson>) -> Self {
        self.clause(field, FieldOp::Gt, value.into())
    }

    pub fn where_greater_or_equal_than(
        self,
        field: impl Into<FieldPath>,
        value: impl Into<Bson>,
    ) -> Self {
        self.clause(field, FieldOp::Gte, value.into())
    }

    pub fn where_less_than(self, field: impl Into<FieldPath>, value: impl Into<Bson>) -> Self {
        self.clause(field, FieldOp::Lt, value.into())
    }

    pub fn where_less_or_equal_than(
        self,
        field: impl Into<FieldPath>,
        value: impl Into<Bson>,
    ) -> Self {
        self.clause(field, FieldOp::Lte, value.into())
    }

    pub fn where_array_contains(
        self,
        field: impl Into<FieldPath>,
        value: impl Into<Bson>,
    ) -> Self {
        self.clause(field, FieldOp::ArrayContains, value.into())
    }

    /// Matches entities whose array field contains any of up to ten values.
    pub fn where_array_contains_any<I>(
        self,
        field: impl Into<FieldPath>,
        values: I,
    ) -> DocumentStoreResult<Self>
    where
        I: IntoIterator,
        I::Item: Into<Bson>,
    {
        self.list_clause(field, FieldOp::ArrayContainsAny, values)
    }

    /// Matches entities whose field equals any of up to ten values.
    pub fn where_in<I>(self, field: impl Into<FieldPath>, values: I) -> DocumentStoreResult<Self>
    where
        I: IntoIterator,
        I::Item: Into<Bson>,
    {
        self.list_clause(field, FieldOp::In, values)
    }

    /// Matches entities whose field equals none of up to ten values.
    pub fn where_not_in<I>(
        self,
        field: impl Into<FieldPath>,
        values: I,
    ) -> DocumentStoreResult<Self>
    where
        I: IntoIterator,
        I::Item: Into<Bson>,
    {
        self.list_clause(field, FieldOp::NotIn, values)
    }

    pub fn limit(mut self, limit: usize) -> DocumentStoreResult<Self> {
        self.outside_transaction("limit")?;
        if self.limit.is_some() {
            return Err(DocumentStoreError::DuplicateClause("limit".into()));
        }
        self.limit = Some(limit);
        Ok(self)
    }

    /// Skips the first `offset` matching entities.
    pub fn offset(mut self, offset: usize) -> DocumentStoreResult<Self> {
        self.outside_transaction("offset")?;
        if self.offset.is_some() {
            return Err(DocumentStoreError::DuplicateClause("offset".into()));
        }
        self.offset = Some(offset);
        Ok(self)
    }

    fn order_by(
        mut self,
        field: impl Into<FieldPath>,
        direction: SortDirection,
    ) -> DocumentStoreResult<Self> {
        self.outside_transaction(match direction {
            SortDirection::Asc => "orderByAscending",
            SortDirection::Desc => "orderByDescending",
        })?;
        let field = field.into().into_string();
        if !self.ordered_fields.insert(field.clone()) {
            return Err(DocumentStoreError::DuplicateClause(format!("orderBy({field})")));
        }
        self.order_by.push(OrderBy {
            property_path: field,
            direction,
        });
        Ok(self)
    }

    pub fn order_by_ascending(self, field: impl Into<FieldPath>) -> DocumentStoreResult<Self> {
        self.order_by(field, SortDirection::Asc)
    }

    pub fn order_by_descending(self, field: impl Into<FieldPath>) -> DocumentStoreResult<Self> {
        self.order_by(field, SortDirection::Desc)
    }

    /// Adds a raw native constraint built from the assembled query.
    pub fn custom_query(
        mut self,
        custom_query: impl Fn(&Query) -> Expr + Send + Sync + 'static,
    ) -> DocumentStoreResult<Self> {
        if self.custom_query.is_some() {
            return Err(DocumentStoreError::DuplicateClause("customQuery".into()));
        }
        self.custom_query = Some(Arc::new(custom_query));
        Ok(self)
    }

    /// Chooses where one-shot reads are served from.
    pub fn from_source(mut self, source: Source) -> Self {
        self.source = source;
        self
    }

    /// Appends an in-memory transformation of the results.
    ///
    /// Post-processors run in the order they were added, on every delivery.
    pub fn pipe(
        mut self,
        post_processor: impl Fn(Vec<T>) -> Vec<T> + Send + Sync + 'static,
    ) -> Self {
        self.post_processors.push(Arc::new(post_processor));
        self
    }

    /// Appends an already shared post-processor.
    pub fn pipe_shared(mut self, post_processor: PipeOperator<T>) -> Self {
        self.post_processors.push(post_processor);
        self
    }

    fn plan(
        self,
        single: bool,
        listener: Option<QueryListener<T>>,
    ) -> (Arc<dyn QueryExecutor<T>>, QueryExecutionPlan<T>) {
        let plan = QueryExecutionPlan {
            clauses: self.clauses,
            limit: self.limit,
            offset: self.offset,
            order_by: self.order_by,
            single,
            custom_query: self.custom_query,
            listener,
            source: self.source,
            post_processors: self.post_processors,
        };
        (self.executor, plan)
    }

    /// Returns the plan a `find` would execute, without running it.
    pub fn into_plan(self) -> QueryExecutionPlan<T> {
        self.plan(false, None).1
    }

    async fn items(self, single: bool) -> DocumentStoreResult<Vec<T>> {
        self.outside_transaction(if single { "findOne" } else { "find" })?;
        let (executor, plan) = self.plan(single, None);
        match executor.execute(plan).await? {
            QueryOutcome::Items(items) => Ok(items),
            QueryOutcome::Subscription(subscription) => {
                subscription.unsubscribe();
                Err(DocumentStoreError::Unknown(
                    "executor returned a subscription for a one-shot read".into(),
                ))
            }
        }
    }

    async fn subscribe(
        self,
        single: bool,
        listener: QueryListener<T>,
    ) -> DocumentStoreResult<Subscription> {
        self.outside_transaction(if single { "findOneAndListen" } else { "findAndListen" })?;
        let (executor, plan) = self.plan(single, Some(listener));
        match executor.execute(plan).await? {
            QueryOutcome::Subscription(subscription) => Ok(subscription),
            QueryOutcome::Items(_) => Err(DocumentStoreError::Unknown(
                "executor returned items for a real-time query".into(),
            )),
        }
    }

    /// Runs the query and returns every matching entity.
    pub async fn find(self) -> DocumentStoreResult<Vec<T>> {
        self.items(false).await
    }

    /// Runs the query and returns the first matching entity.
    pub async fn find_one(self) -> DocumentStoreResult<Option<T>> {
        Ok(self.items(true).await?.into_iter().next())
    }

    /// Subscribes to the query. `on_next` receives the full result set on every change.
    pub async fn find_and_listen<N, E>(
        self,
        on_next: N,
        on_error: E,
    ) -> DocumentStoreResult<Subscription>
    where
        N: Fn(Vec<T>) + Send + Sync + 'static,
        E: Fn(DocumentStoreError) + Send + Sync + 'static,
    {
        self.subscribe(false, QueryListener::new(on_next).with_error_handler(on_error))
            .await
    }

    /// Subscribes to the first matching entity. `on_next` receives at most one entity.
    pub async fn find_one_and_listen<N, E>(
        self,
        on_next: N,
        on_error: E,
    ) -> DocumentStoreResult<Subscription>
    where
        N: Fn(Vec<T>) + Send + Sync + 'static,
        E: Fn(DocumentStoreError) + Send + Sync + 'static,
    {
        self.subscribe(true, QueryListener::new(on_next).with_error_handler(on_error))
            .await
    }

    /// Subscribes to the query and delivers result sets through a stream.
    pub async fn watch(self) -> DocumentStoreResult<(Subscription, ListenStream<T>)> {
        self.outside_transaction("watch")?;
        let (sender, receiver) = mpsc::unbounded();
        let error_sender = sender.clone();
        let listener = QueryListener::new(move |items| {
            let _ = sender.unbounded_send(Ok(items));
        })
        .with_error_handler(move |err| {
            let _ = error_sender.unbounded_send(Err(err));
        });

        let subscription = self.subscribe(false, listener).await?;
        Ok((subscription, receiver))
    }
}

/// Query entry points shared by repositories.
///
/// Every method starts a fresh [`QueryBuilder`] through [`Queryable::query`], so whatever
/// the builder rejects is rejected by the repository shortcut too.
#[async_trait]
pub trait Queryable<T: Entity>: Send + Sync {
    /// Starts an empty query against this repository.
    fn query(&self) -> QueryBuilder<T>;

    fn where_equal_to(
        &self,
        field: impl Into<FieldPath>,
        value: impl Into<Bson>,
    ) -> QueryBuilder<T> {
        self.query().where_equal_to(field, value)
    }

    fn where_not_equal_to(
        &self,
        field: impl Into<FieldPath>,
        value: impl Into<Bson>,
    ) -> QueryBuilder<T> {
        self.query().where_not_equal_to(field, value)
    }

    fn where_greater_than(
        &self,
        field: impl Into<FieldPath>,
        value: impl Into<Bson>,
    ) -> QueryBuilder<T> {
        self.query().where_greater_than(field, value)
    }

    fn where_greater_or_equal_than(
        &self,
        field: impl Into<FieldPath>,
        value: impl Into<Bson>,
    ) -> QueryBuilder<T> {
        self.query().where_greater_or_equal_than(field, value)
    }

    fn where_less_than(
        &self,
        field: impl Into<FieldPath>,
        value: impl Into<Bson>,
    ) -> QueryBuilder<T> {
        self.query().where_less_than(field, value)
    }

    fn where_less_or_equal_than(
        &self,
        field: impl Into<FieldPath>,
        value: impl Into<Bson>,
    ) -> QueryBuilder<T> {
        self.query().where_less_or_equal_than(field, value)
    }

    fn where_array_contains(
        &self,
        field: impl Into<FieldPath>,
        value: impl Into<Bson>,
    ) -> QueryBuilder<T> {
        self.query().where_array_contains(field, value)
    }

    fn where_array_contains_any<I>(
        &self,
        field: impl Into<FieldPath>,
        values: I,
    ) -> DocumentStoreResult<QueryBuilder<T>>
    where
        I: IntoIterator,
        I::Item: Into<Bson>,
    {
        self.query().where_array_contains_any(field, values)
    }

    fn where_in<I>(
        &self,
        field: impl Into<FieldPath>,
        values: I,
    ) -> DocumentStoreResult<QueryBuilder<T>>
    where
        I: IntoIterator,
        I::Item: Into<Bson>,
    {
        self.query().where_in(field, values)
    }

    fn where_not_in<I>(
        &self,
        field: impl Into<FieldPath>,
        values: I,
    ) -> DocumentStoreResult<QueryBuilder<T>>
    where
        I: IntoIterator,
        I::Item: Into<Bson>,
    {
        self.query().where_not_in(field, values)
    }

    fn limit(&self, limit: usize) -> DocumentStoreResult<QueryBuilder<T>> {
        self.query().limit(limit)
    }

    fn order_by_ascending(
        &self,
        field: impl Into<FieldPath>,
    ) -> DocumentStoreResult<QueryBuilder<T>> {
        self.query().order_by_ascending(field)
    }

    fn order_by_descending(
        &self,
        field: impl Into<FieldPath>,
    ) -> DocumentStoreResult<QueryBuilder<T>> {
        self.query().order_by_descending(field)
    }

    /// Returns every entity of the collection.
    async fn find(&self) -> DocumentStoreResult<Vec<T>> {
        self.query().find().await
    }

    /// Returns the first entity of the collection in store order.
    async fn find_one(&self) -> DocumentStoreResult<Option<T>> {
        self.query().find_one().await
    }

    async fn find_and_listen<N, E>(
        &self,
        on_next: N,
        on_error: E,
    ) -> DocumentStoreResult<Subscription>
    where
        N: Fn(Vec<T>) + Send + Sync + 'static,
        E: Fn(DocumentStoreError) + Send + Sync + 'static,
    {
        self.query().find_and_listen(on_next, on_error).await
    }

    async fn find_one_and_listen<N, E>(
        &self,
        on_next: N,
        on_error: E,
    ) -> DocumentStoreResult<Subscription>
    where
        N: Fn(Vec<T>) + Send + Sync + 'static,
        E: Fn(DocumentStoreError) + Send + Sync + 'static,
    {
        self.query().find_one_and_listen(on_next, on_error).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CapturingExecutor, User};

    fn builder() -> (Arc<CapturingExecutor<User>>, QueryBuilder<User>) {
        let executor = Arc::new(CapturingExecutor::default());
        let builder = QueryBuilder::new(executor.clone() as Arc<dyn QueryExecutor<User>>);
        (executor, builder)
    }

    #[test]
    fn limit_offset_and_custom_query_are_single_use() {
        let (_, query) = builder();
        assert!(matches!(
            query.limit(5).unwrap().limit(10),
            Err(DocumentStoreError::DuplicateClause(_))
        ));

        let (_, query) = builder();
        assert!(matches!(
            query.offset(5).unwrap().offset(10),
            Err(DocumentStoreError::DuplicateClause(_))
        ));

        let (_, query) = builder();
        let query = query.custom_query(|_| Expr::And(Vec::new())).unwrap();
        assert!(matches!(
            query.custom_query(|_| Expr::And(Vec::new())),
            Err(DocumentStoreError::DuplicateClause(_))
        ));
    }

    #[test]
    fn order_by_rejects_repeated_fields_only() {
        let (_, query) = builder();
        let query = query
            .order_by_ascending("name")
            .unwrap()
            .order_by_descending("age")
            .unwrap();

        assert!(matches!(
            query.order_by_descending("name"),
            Err(DocumentStoreError::DuplicateClause(_))
        ));
    }

    #[test]
    fn multi_value_clauses_accept_up_to_ten_values() {
        let (_, query) = builder();
        let query = query.where_in("name", (0..10).map(|n| n.to_string())).unwrap();
        assert_eq!(query.into_plan().clauses[0].value.as_array().map(Vec::len), Some(10));

        let (_, query) = builder();
        assert!(matches!(
            query.where_not_in("name", 0..11),
            Err(DocumentStoreError::TooManyValues { max: 10, provided: 11 })
        ));

        let (_, query) = builder();
        assert!(matches!(
            query.where_array_contains_any("tags", vec!["a"; 11]),
            Err(DocumentStoreError::TooManyValues { .. })
        ));
    }

    #[tokio::test]
    async fn find_one_marks_the_plan_single() {
        let (executor, query) = builder();
        let found = query
            .where_equal_to("name", "Ada")
            .order_by_ascending(["profile", "age"])
            .unwrap()
            .find_one()
            .await
            .unwrap();

        assert!(found.is_none());
        let plan = executor.last_plan().unwrap();
        assert!(plan.single);
        assert_eq!(plan.clauses.len(), 1);
        assert_eq!(plan.order_by[0].property_path, "profile.age");
    }

    #[tokio::test]
    async fn transactional_builders_reject_paging_ordering_and_reads() {
        let executor = Arc::new(CapturingExecutor::<User>::default());
        let query =
            || QueryBuilder::in_transaction(executor.clone() as Arc<dyn QueryExecutor<User>>);

        assert!(query().is_transactional());
        assert!(matches!(
            query().where_equal_to("name", "Ada").limit(5),
            Err(DocumentStoreError::UnsupportedInTransaction("limit"))
        ));
        assert!(matches!(
            query().offset(1),
            Err(DocumentStoreError::UnsupportedInTransaction("offset"))
        ));
        assert!(matches!(
            query().order_by_descending("age"),
            Err(DocumentStoreError::UnsupportedInTransaction("orderByDescending"))
        ));
        assert!(matches!(
            query().where_in("name", ["Ada"]).unwrap().find().await,
            Err(DocumentStoreError::UnsupportedInTransaction("find"))
        ));
        assert!(matches!(
            query().watch().await,
            Err(DocumentStoreError::UnsupportedInTransaction("watch"))
        ));
        assert!(executor.last_plan().is_none());
    }

    #[tokio::test]
    async fn pipe_appends_post_processors() {
        let (executor, query) = builder();
        query
            .pipe(|users| users)
            .pipe(|users: Vec<User>| users.into_iter().rev().collect())
            .find()
            .await
            .unwrap();

        assert_eq!(executor.last_plan().unwrap().post_processors, 2);
    }
}
