//! Convenient re-exports of commonly used types from docmap.
//!
//! ```ignore
//! use docmap::prelude::*;
//! ```
//!
//! This provides access to:
//! - The entity trait, its derive macro and sub-collection accessors
//! - The mapper, repositories and the query builder
//! - Batches and transactions
//! - Store client traits
//! - Error types

pub use docmap_core::{
    batch::{BatchRepository, BatchSingleRepository, BatchStatus, WriteBatch},
    builder::{QueryBuilder, Queryable},
    client::{
        DocumentSnapshot, DocumentStoreClient, SetOptions, StoreClientBuilder, StoreTransaction,
    },
    config::MapperConfig,
    entity::{Entity, EntityExt, SubCollection, SubRepository},
    error::{DocumentStoreError, DocumentStoreResult},
    executor::Subscription,
    mapper::DocumentMapper,
    metadata::{CollectionTarget, MetadataRegistry},
    plan::{FieldPath, Source},
    post_process::FilterParam,
    query::{Expr, FieldOp, Filter, Query, SortDirection},
    repository::Repository,
    resolver::{CustomRepository, RepositoryKind, ResolvedRepository},
    transaction::{TransactionRepository, TransactionScope},
    validate::{ValidationError, Validator, ValidatorOptions},
};
pub use docmap_macros::Entity;
