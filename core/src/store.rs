//! The authoritative counter store.
//!
//! Any durable store with row-level update, insert and a change-notification
//! mechanism can back the counter. The two writes of a commit (update the
//! value, append the action) are separate calls: a failure between them
//! leaves the value changed with no matching action in the log.
//!
//! # Implementations
//!
//! - `PostgresCounterStore` (in `ticket-sync-postgres`): durable, `LISTEN/NOTIFY` change feed
//! - `InMemoryCounterStore` (in `ticket-sync-testing`): fast, deterministic, fault injection

use crate::action::{ActionId, ActionKind, ActionRecord};
use crate::counter::{Counter, CounterId, CounterValue};
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Boxed future returned by the dyn-compatible store and channel traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Push notifications delivered by a store or channel subscription.
///
/// Delivery is best effort: the stream may end or skip items when the
/// underlying transport drops.
pub type NotificationStream<T> = Pin<Box<dyn Stream<Item = T> + Send>>;

/// Errors reported by the authoritative store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PersistenceError {
    /// The store could not be reached
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The counter row does not exist
    #[error("Counter not found: {0}")]
    CounterNotFound(CounterId),

    /// The action row does not exist
    #[error("Action not found: {0}")]
    ActionNotFound(ActionId),

    /// A row held data outside the domain (bad value, unknown action type)
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Any other database failure
    #[error("Database error: {0}")]
    Database(String),
}

/// Store of the singleton counter and its action log.
///
/// # Dyn Compatibility
///
/// Methods return boxed futures so the store can be shared as
/// `Arc<dyn CounterStore>` and captured by effects.
pub trait CounterStore: Send + Sync {
    /// Return the singleton counter, creating it at zero if absent.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError`] if the read or the insert fails.
    fn ensure_counter(&self) -> BoxFuture<'_, Result<Counter, PersistenceError>>;

    /// Read the current value.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::CounterNotFound`] for an unknown id.
    fn read_counter(&self, id: CounterId) -> BoxFuture<'_, Result<CounterValue, PersistenceError>>;

    /// Overwrite the value. No compare-and-swap: the last writer wins.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError`] if the update fails.
    fn write_counter(
        &self,
        id: CounterId,
        value: CounterValue,
    ) -> BoxFuture<'_, Result<(), PersistenceError>>;

    /// Append an action stamped with the store's current time.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError`] if the insert fails.
    fn append_action(
        &self,
        id: CounterId,
        kind: ActionKind,
    ) -> BoxFuture<'_, Result<ActionRecord, PersistenceError>>;

    /// Delete one action by identity.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::ActionNotFound`] if no row was deleted.
    fn delete_action(&self, action: ActionId) -> BoxFuture<'_, Result<(), PersistenceError>>;

    /// The most recent action of a given kind.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError`] if the query fails.
    fn last_action_of_kind(
        &self,
        id: CounterId,
        kind: ActionKind,
    ) -> BoxFuture<'_, Result<Option<ActionRecord>, PersistenceError>>;

    /// All actions of the counter, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError`] if the query fails.
    fn list_actions(&self, id: CounterId)
    -> BoxFuture<'_, Result<Vec<ActionRecord>, PersistenceError>>;

    /// Delete every action of the counter, returning how many were removed.
    /// The counter value is left alone.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError`] if the delete fails.
    fn clear_actions(&self, id: CounterId) -> BoxFuture<'_, Result<u64, PersistenceError>>;

    /// Subscribe to committed value changes.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError`] if the subscription cannot be set up.
    fn subscribe_counter_changes(
        &self,
        id: CounterId,
    ) -> BoxFuture<'_, Result<NotificationStream<CounterValue>, PersistenceError>>;

    /// Subscribe to newly inserted actions.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError`] if the subscription cannot be set up.
    fn subscribe_action_inserts(
        &self,
        id: CounterId,
    ) -> BoxFuture<'_, Result<NotificationStream<ActionRecord>, PersistenceError>>;
}
