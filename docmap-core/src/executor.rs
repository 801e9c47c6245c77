//! The contract between query builders and repositories.

use std::{
    fmt::{self, Debug},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use futures::channel::mpsc::UnboundedReceiver;

use crate::{
    client::ListenerRegistration,
    entity::Entity,
    error::DocumentStoreResult,
    plan::QueryExecutionPlan,
};

/// Runs query execution plans.
///
/// Repositories implement this trait; a [`QueryBuilder`](crate::builder::QueryBuilder)
/// holds one and hands it the finished plan.
#[async_trait]
pub trait QueryExecutor<T: Entity>: Send + Sync {
    /// Executes a plan.
    ///
    /// # Returns
    ///
    /// [`QueryOutcome::Items`] for one-shot reads, after post-processing, or
    /// [`QueryOutcome::Subscription`] when the plan carries a listener.
    async fn execute(&self, plan: QueryExecutionPlan<T>) -> DocumentStoreResult<QueryOutcome<T>>;
}

/// What executing a plan produced.
pub enum QueryOutcome<T> {
    Items(Vec<T>),
    Subscription(Subscription),
}

impl<T> Debug for QueryOutcome<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryOutcome::Items(items) => f.debug_tuple("Items").field(&items.len()).finish(),
            QueryOutcome::Subscription(subscription) => {
                f.debug_tuple("Subscription").field(subscription).finish()
            }
        }
    }
}

/// A live real-time query or document listener.
///
/// Listeners keep delivering until [`Subscription::unsubscribe`] is called. Dropping the
/// handle does not stop them. After `unsubscribe` returns, no further callback runs.
pub struct Subscription {
    gate: Arc<AtomicBool>,
    registration: ListenerRegistration,
}

impl Subscription {
    /// Wraps a client registration. Callbacks must check `gate` before running.
    pub fn new(gate: Arc<AtomicBool>, registration: ListenerRegistration) -> Self {
        Subscription { gate, registration }
    }

    pub fn is_active(&self) -> bool {
        self.gate.load(Ordering::Acquire)
    }

    pub fn unsubscribe(&self) {
        self.gate.store(false, Ordering::Release);
        self.registration.remove();
    }
}

impl Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

/// Result sets of a real-time query delivered as a stream.
pub type ListenStream<T> = UnboundedReceiver<DocumentStoreResult<Vec<T>>>;
