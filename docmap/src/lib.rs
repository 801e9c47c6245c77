//! Main docmap crate providing a typed data-mapping layer for hierarchical document stores.
//!
//! This crate is the primary entry point for users of the docmap framework. It
//! re-exports the core types from the sub-crates, the `#[derive(Entity)]` macro, and the
//! bundled in-memory store client.
//!
//! # Features
//!
//! - **Typed repositories** - CRUD, fluent queries and real-time listeners per collection
//! - **Nested collections** - Sub-collections reached through accessors on their parent entity
//! - **Atomic batches and transactions** - Multi-collection writes that apply together
//! - **Pluggable stores** - Anything implementing [`DocumentStoreClient`](client::DocumentStoreClient)
//!
//! # Quick Start
//!
//! ```ignore
//! use docmap::{prelude::*, memory::InMemoryStore};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Clone, Default, Serialize, Deserialize, Entity)]
//! pub struct User {
//!     pub id: String,
//!     pub name: String,
//!     #[serde(default)]
//!     pub messages: SubCollection<Message>,
//! }
//!
//! #[derive(Debug, Clone, Default, Serialize, Deserialize, Entity)]
//! pub struct Message {
//!     pub id: String,
//!     pub text: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> DocumentStoreResult<()> {
//!     let mapper = DocumentMapper::new(InMemoryStore::builder().build().await?);
//!     mapper.register_collection::<User>(None)?;
//!     mapper.register_sub_collection::<User, Message>("messages", None)?;
//!
//!     let users = mapper.repository::<User>()?;
//!     let ada = users.create(User { name: "Ada".into(), ..Default::default() }).await?;
//!
//!     // Accessors are bound once the parent is created or read.
//!     ada.messages
//!         .repository()?
//!         .create(Message { text: "Hello".into(), ..Default::default() })
//!         .await?;
//!
//!     let found = users
//!         .where_equal_to("name", "Ada")
//!         .order_by_ascending("name")?
//!         .find()
//!         .await?;
//!     println!("Queried users: {found:?}");
//!
//!     mapper.shutdown().await
//! }
//! ```
//!
//! # Batches and Transactions
//!
//! ```ignore
//! let batch = mapper.create_batch();
//! let users = batch.repository::<User>()?;
//! users.create(User { name: "Grace".into(), ..Default::default() })?;
//! users.delete(&ada)?;
//! batch.commit().await?;
//!
//! mapper
//!     .run_transaction(|tx| async move {
//!         let users = tx.repository::<User>()?;
//!         if let Some(mut user) = users.find_by_id(&ada.id).await? {
//!             user.name.push_str(" Lovelace");
//!             users.update(user).await?;
//!         }
//!         Ok::<_, DocumentStoreError>(())
//!     })
//!     .await?;
//! ```
//!
//! # Backends
//!
//! - [`memory`] - In-memory store client for development and testing

#[allow(unused_extern_crates)]
extern crate self as docmap;

pub mod prelude;

pub use docmap_core::{
    batch, builder, client, config, entity, error, executor, field_path, mapper, metadata, plan,
    post_process, query, repository, resolver, serialize, transaction, validate,
};
pub use docmap_macros::Entity;

pub use async_trait::async_trait;
pub use bson;
pub use serde;

/// In-memory store client implementations.
pub mod memory {
    pub use docmap_memory::{InMemoryStore, InMemoryStoreBuilder, InMemoryTransaction};
}
