//! A typed data-mapping layer for hierarchical document stores.
//!
//! This crate is the core of the docmap project and provides:
//!
//! - **Entities** ([`entity`]) - The [`Entity`](entity::Entity) trait and sub-collection accessors
//! - **Collection metadata** ([`metadata`]) - Registration of collections and their nesting
//! - **Store client contract** ([`client`]) - Traits a document store backend implements
//! - **Queries** ([`query`], [`plan`], [`builder`]) - Native filters, execution plans and the fluent builder
//! - **Repositories** ([`repository`], [`resolver`]) - Typed CRUD, queries and listeners per collection
//! - **Batches** ([`batch`]) - Atomic multi-collection writes
//! - **Transactions** ([`transaction`]) - Transaction-scoped repositories with accessor rebinding
//! - **Validation and serialization** ([`validate`], [`serialize`]) - Pluggable collaborators
//! - **Error handling** ([`error`]) - The error and result types shared by every module
//!
//! # Example
//!
//! ```ignore
//! use docmap_core::{entity::{Entity, SubCollection}, mapper::DocumentMapper};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! pub struct User {
//!     pub id: String,
//!     pub name: String,
//!     #[serde(default)]
//!     pub messages: SubCollection<Message>,
//! }
//!
//! impl Entity for User {
//!     fn id(&self) -> &str {
//!         &self.id
//!     }
//!
//!     fn set_id(&mut self, id: String) {
//!         self.id = id;
//!     }
//! }
//! ```

#[allow(unused_extern_crates)]
extern crate self as docmap_core;

pub mod batch;
pub mod builder;
pub mod client;
pub mod config;
pub mod entity;
pub mod error;
pub mod executor;
pub mod mapper;
pub mod metadata;
pub mod plan;
pub mod post_process;
pub mod query;
pub mod repository;
pub mod resolver;
pub mod serialize;
pub mod transaction;
pub mod validate;

#[cfg(test)]
mod testing;
