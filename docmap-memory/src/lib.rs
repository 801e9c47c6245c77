//! In-memory document store client for docmap.
//!
//! This crate provides a thread-safe, in-memory implementation of the
//! [`DocumentStoreClient`](docmap_core::client::DocumentStoreClient) trait. It is meant for
//! development, tests and small deployments.
//!
//! # Features
//!
//! - **Hierarchical paths** - Collections nest under documents (`users/u1/messages`)
//! - **Full query support** - All filter operators, multi-key ordering, offset and limit
//! - **Atomic batches** - A batch either applies every write or none
//! - **Optimistic transactions** - Commits abort when a document read inside changed
//! - **Listeners** - Collection and document listeners with change detection
//!
//! # Quick Start
//!
//! ```ignore
//! use docmap::{prelude::*, memory::InMemoryStore};
//!
//! let mapper = DocumentMapper::new(InMemoryStore::new());
//! mapper.register_collection::<User>(None)?;
//!
//! let users = mapper.repository::<User>()?;
//! users.create(User { id: String::new(), name: "Alice".into(), ..Default::default() }).await?;
//! ```

#[allow(unused_extern_crates)]
extern crate self as docmap_memory;

pub mod evaluator;
pub mod store;

pub use store::{InMemoryStore, InMemoryStoreBuilder, InMemoryTransaction};
