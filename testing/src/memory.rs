//! In-memory transports for fast, deterministic tests.
//!
//! - [`InMemoryCounterStore`]: authoritative store with change feeds, per-operation
//!   fault injection, operation counters and optional latency
//! - [`InMemoryBroadcastBus`]: per-topic at-most-once broadcast
//! - [`InMemoryTabStorage`]: one device's shared key space; [`InMemoryTab`] is one
//!   tab on it

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use ticket_sync_core::action::{ActionId, ActionKind, ActionRecord};
use ticket_sync_core::channel::{BroadcastBus, PropagationError, TabSignal};
use ticket_sync_core::counter::{Counter, CounterId, CounterValue};
use ticket_sync_core::environment::{Clock, SystemClock};
use ticket_sync_core::store::{BoxFuture, CounterStore, NotificationStream, PersistenceError};
use tokio::sync::broadcast;

const FEED_CAPACITY: usize = 256;

/// The singleton counter's id in memory.
pub const COUNTER_ID: CounterId = CounterId::new(1);

/// Store operations that can be counted and made to fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StoreOperation {
    /// `ensure_counter`
    Ensure,
    /// `read_counter`
    Read,
    /// `write_counter`
    Write,
    /// `append_action`
    Append,
    /// `delete_action`
    Delete,
    /// `last_action_of_kind`
    LastOfKind,
    /// `list_actions`
    List,
    /// `clear_actions`
    Clear,
    /// Both change-feed subscriptions
    Subscribe,
}

#[derive(Default)]
struct StoreInner {
    counter: Option<CounterValue>,
    actions: Vec<ActionRecord>,
    next_action_id: i64,
    failing: HashSet<StoreOperation>,
    counts: HashMap<StoreOperation, usize>,
}

/// Authoritative store kept in memory.
///
/// Clones share the same data, so several sessions can point at one store.
#[derive(Clone)]
pub struct InMemoryCounterStore {
    inner: Arc<RwLock<StoreInner>>,
    clock: Arc<dyn Clock>,
    latency: Arc<RwLock<Option<Duration>>>,
    values: broadcast::Sender<CounterValue>,
    inserts: broadcast::Sender<ActionRecord>,
}

impl InMemoryCounterStore {
    /// Empty store stamping actions with the wall clock
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Empty store stamping actions with `clock`
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let (values, _) = broadcast::channel(FEED_CAPACITY);
        let (inserts, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            inner: Arc::new(RwLock::new(StoreInner {
                next_action_id: 1,
                ..StoreInner::default()
            })),
            clock,
            latency: Arc::new(RwLock::new(None)),
            values,
            inserts,
        }
    }

    /// Make `operation` fail (or succeed again)
    pub fn set_failing(&self, operation: StoreOperation, failing: bool) {
        let mut inner = self.inner.write().unwrap();
        if failing {
            inner.failing.insert(operation);
        } else {
            inner.failing.remove(&operation);
        }
    }

    /// Delay every operation by `latency`
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.write().unwrap() = latency;
    }

    /// How many times `operation` was attempted
    #[must_use]
    pub fn operation_count(&self, operation: StoreOperation) -> usize {
        self.inner
            .read()
            .unwrap()
            .counts
            .get(&operation)
            .copied()
            .unwrap_or(0)
    }

    /// Current value, if the counter exists
    #[must_use]
    pub fn value(&self) -> Option<CounterValue> {
        self.inner.read().unwrap().counter
    }

    /// Every stored action, oldest first
    #[must_use]
    pub fn actions(&self) -> Vec<ActionRecord> {
        let mut actions = self.inner.read().unwrap().actions.clone();
        actions.sort_by_key(|a| (a.timestamp, a.id));
        actions
    }

    /// Insert an action with an explicit timestamp, bypassing the clock.
    pub fn seed_action(&self, kind: ActionKind, timestamp: DateTime<Utc>) -> ActionRecord {
        let mut inner = self.inner.write().unwrap();
        let record = ActionRecord {
            id: ActionId::new(inner.next_action_id),
            counter_id: COUNTER_ID,
            kind,
            timestamp,
        };
        inner.next_action_id += 1;
        inner.actions.push(record.clone());
        record
    }

    async fn enter(&self, operation: StoreOperation) -> Result<(), PersistenceError> {
        let latency = *self.latency.read().unwrap();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let mut inner = self.inner.write().unwrap();
        *inner.counts.entry(operation).or_insert(0) += 1;
        if inner.failing.contains(&operation) {
            return Err(PersistenceError::ConnectionFailed(format!(
                "injected {operation:?} failure"
            )));
        }
        Ok(())
    }

    fn check_id(id: CounterId) -> Result<(), PersistenceError> {
        if id == COUNTER_ID {
            Ok(())
        } else {
            Err(PersistenceError::CounterNotFound(id))
        }
    }
}

impl Default for InMemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read().unwrap();
        f.debug_struct("InMemoryCounterStore")
            .field("value", &inner.counter)
            .field("actions", &inner.actions.len())
            .finish_non_exhaustive()
    }
}

fn feed<T: Clone + Send + 'static>(mut rx: broadcast::Receiver<T>) -> NotificationStream<T> {
    Box::pin(async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(item) => yield item,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "In-memory feed lagged");
                },
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

impl CounterStore for InMemoryCounterStore {
    fn ensure_counter(&self) -> BoxFuture<'_, Result<Counter, PersistenceError>> {
        Box::pin(async move {
            self.enter(StoreOperation::Ensure).await?;
            let mut inner = self.inner.write().unwrap();
            let value = *inner.counter.get_or_insert(CounterValue::ZERO);
            Ok(Counter {
                id: COUNTER_ID,
                value,
            })
        })
    }

    fn read_counter(&self, id: CounterId) -> BoxFuture<'_, Result<CounterValue, PersistenceError>> {
        Box::pin(async move {
            self.enter(StoreOperation::Read).await?;
            Self::check_id(id)?;
            self.inner
                .read()
                .unwrap()
                .counter
                .ok_or(PersistenceError::CounterNotFound(id))
        })
    }

    fn write_counter(
        &self,
        id: CounterId,
        value: CounterValue,
    ) -> BoxFuture<'_, Result<(), PersistenceError>> {
        Box::pin(async move {
            self.enter(StoreOperation::Write).await?;
            Self::check_id(id)?;
            {
                let mut inner = self.inner.write().unwrap();
                let slot = inner
                    .counter
                    .as_mut()
                    .ok_or(PersistenceError::CounterNotFound(id))?;
                *slot = value;
            }
            let _ = self.values.send(value);
            Ok(())
        })
    }

    fn append_action(
        &self,
        id: CounterId,
        kind: ActionKind,
    ) -> BoxFuture<'_, Result<ActionRecord, PersistenceError>> {
        Box::pin(async move {
            self.enter(StoreOperation::Append).await?;
            Self::check_id(id)?;
            let record = {
                let mut inner = self.inner.write().unwrap();
                let record = ActionRecord {
                    id: ActionId::new(inner.next_action_id),
                    counter_id: id,
                    kind,
                    timestamp: self.clock.now(),
                };
                inner.next_action_id += 1;
                inner.actions.push(record.clone());
                record
            };
            let _ = self.inserts.send(record.clone());
            Ok(record)
        })
    }

    fn delete_action(&self, action: ActionId) -> BoxFuture<'_, Result<(), PersistenceError>> {
        Box::pin(async move {
            self.enter(StoreOperation::Delete).await?;
            let mut inner = self.inner.write().unwrap();
            let position = inner
                .actions
                .iter()
                .position(|a| a.id == action)
                .ok_or(PersistenceError::ActionNotFound(action))?;
            inner.actions.remove(position);
            Ok(())
        })
    }

    fn last_action_of_kind(
        &self,
        id: CounterId,
        kind: ActionKind,
    ) -> BoxFuture<'_, Result<Option<ActionRecord>, PersistenceError>> {
        Box::pin(async move {
            self.enter(StoreOperation::LastOfKind).await?;
            Self::check_id(id)?;
            Ok(self
                .inner
                .read()
                .unwrap()
                .actions
                .iter()
                .filter(|a| a.kind == kind)
                .max_by_key(|a| (a.timestamp, a.id))
                .cloned())
        })
    }

    fn list_actions(
        &self,
        id: CounterId,
    ) -> BoxFuture<'_, Result<Vec<ActionRecord>, PersistenceError>> {
        Box::pin(async move {
            self.enter(StoreOperation::List).await?;
            Self::check_id(id)?;
            Ok(self.actions())
        })
    }

    fn clear_actions(&self, id: CounterId) -> BoxFuture<'_, Result<u64, PersistenceError>> {
        Box::pin(async move {
            self.enter(StoreOperation::Clear).await?;
            Self::check_id(id)?;
            let mut inner = self.inner.write().unwrap();
            let removed = inner.actions.len() as u64;
            inner.actions.clear();
            Ok(removed)
        })
    }

    fn subscribe_counter_changes(
        &self,
        id: CounterId,
    ) -> BoxFuture<'_, Result<NotificationStream<CounterValue>, PersistenceError>> {
        Box::pin(async move {
            self.enter(StoreOperation::Subscribe).await?;
            Self::check_id(id)?;
            Ok(feed(self.values.subscribe()))
        })
    }

    fn subscribe_action_inserts(
        &self,
        id: CounterId,
    ) -> BoxFuture<'_, Result<NotificationStream<ActionRecord>, PersistenceError>> {
        Box::pin(async move {
            self.enter(StoreOperation::Subscribe).await?;
            Self::check_id(id)?;
            Ok(feed(self.inserts.subscribe()))
        })
    }
}

/// Broadcast bus kept in memory. Clones share topics.
#[derive(Clone, Default)]
pub struct InMemoryBroadcastBus {
    topics: Arc<Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>>,
    failing: Arc<AtomicBool>,
    published: Arc<AtomicUsize>,
}

impl InMemoryBroadcastBus {
    /// Bus with no topics yet
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every publish fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of successful publishes
    #[must_use]
    pub fn published_count(&self) -> usize {
        self.published.load(Ordering::SeqCst)
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<Vec<u8>> {
        self.topics
            .lock()
            .unwrap()
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(FEED_CAPACITY).0)
            .clone()
    }
}

impl BroadcastBus for InMemoryBroadcastBus {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> BoxFuture<'_, Result<(), PropagationError>> {
        let topic = topic.to_string();
        Box::pin(async move {
            if self.failing.load(Ordering::SeqCst) {
                return Err(PropagationError::PublishFailed {
                    topic,
                    reason: "injected failure".to_string(),
                });
            }
            // No subscribers is not an error: the message is simply lost.
            let _ = self.sender(&topic).send(payload);
            self.published.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn subscribe(
        &self,
        topic: &str,
    ) -> BoxFuture<'_, Result<NotificationStream<Vec<u8>>, PropagationError>> {
        let rx = self.sender(topic).subscribe();
        Box::pin(async move { Ok(feed(rx)) })
    }
}

#[derive(Clone, Debug)]
struct TabWrite {
    tab: u64,
    key: String,
    value: String,
}

struct Device {
    values: Mutex<HashMap<String, String>>,
    events: broadcast::Sender<TabWrite>,
    next_tab: AtomicU64,
    failing: AtomicBool,
}

/// Shared key space of one device. Open a tab per session.
#[derive(Clone)]
pub struct InMemoryTabStorage {
    device: Arc<Device>,
}

impl InMemoryTabStorage {
    /// A fresh device
    #[must_use]
    pub fn new() -> Self {
        Self {
            device: Arc::new(Device {
                values: Mutex::new(HashMap::new()),
                events: broadcast::channel(FEED_CAPACITY).0,
                next_tab: AtomicU64::new(1),
                failing: AtomicBool::new(false),
            }),
        }
    }

    /// Open another tab on this device
    #[must_use]
    pub fn open_tab(&self) -> InMemoryTab {
        InMemoryTab {
            device: Arc::clone(&self.device),
            tab: self.device.next_tab.fetch_add(1, Ordering::SeqCst),
        }
    }

    /// Last value written under `key` by any tab
    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        self.device.values.lock().unwrap().get(key).cloned()
    }

    /// Make every write fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        self.device.failing.store(failing, Ordering::SeqCst);
    }
}

impl Default for InMemoryTabStorage {
    fn default() -> Self {
        Self::new()
    }
}

/// One tab on an [`InMemoryTabStorage`] device.
pub struct InMemoryTab {
    device: Arc<Device>,
    tab: u64,
}

impl TabSignal for InMemoryTab {
    fn write(&self, key: &str, value: &str) -> Result<(), PropagationError> {
        if self.device.failing.load(Ordering::SeqCst) {
            return Err(PropagationError::PublishFailed {
                topic: key.to_string(),
                reason: "storage unavailable".to_string(),
            });
        }
        self.device
            .values
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        let _ = self.device.events.send(TabWrite {
            tab: self.tab,
            key: key.to_string(),
            value: value.to_string(),
        });
        Ok(())
    }

    fn watch(&self, key: &str) -> NotificationStream<String> {
        let mut rx = self.device.events.subscribe();
        let key = key.to_string();
        let me = self.tab;
        Box::pin(async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(write) if write.tab != me && write.key == key => yield write.value,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {},
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}
