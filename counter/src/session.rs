//! Per-client session state machine.
//!
//! One [`SessionState`] per open client. The reducer is the busy gate: while
//! a mutation is in flight every further mutation intent is dropped without
//! queueing or error. Accepted mutations update `displayed_value` at once and
//! commit in the background; inbound observations overwrite it whenever they
//! arrive.

use crate::effects;
use std::sync::Arc;
use thiserror::Error;
use ticket_sync_core::action::{ActionId, ActionLog, ActionRecord};
use ticket_sync_core::counter::{Counter, CounterId, CounterValue, Mutation};
use ticket_sync_core::environment::Clock;
use ticket_sync_core::store::{CounterStore, PersistenceError};
use ticket_sync_core::{SmallVec, effect::Effect, reducer::Reducer, smallvec};
use ticket_sync_runtime::metrics::SessionMetrics;
use ticket_sync_runtime::propagation::{Fanout, Observation};

/// Client view of the counter.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SessionState {
    /// Set once the counter has been loaded
    pub counter_id: Option<CounterId>,
    /// What the client shows: optimistic, then overwritten by every observation
    pub displayed_value: CounterValue,
    /// Last value seen from an authoritative source
    pub confirmed_value: CounterValue,
    /// A mutation, undo or clear is in flight
    pub busy: bool,
    /// Local copy of the action history
    pub log: ActionLog,
    /// Transient user-readable failure
    pub error_message: Option<String>,
    /// Whether `Initialize` has completed
    pub initialized: bool,
}

/// Which write of a commit failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitStage {
    /// Nothing was written
    CounterWrite,
    /// The value was written but the action was not logged
    ActionAppend,
}

impl CommitStage {
    /// Metric label
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CounterWrite => "counter_write",
            Self::ActionAppend => "action_append",
        }
    }
}

/// Why an undo did not happen.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UndoError {
    /// The local history holds no increment
    #[error("Nothing to undo: no increment in the history")]
    NoIncrement,

    /// The counter is already at zero
    #[error("Nothing to undo: the counter is already at zero")]
    AtZero,

    /// The store's latest increment is not the one this client would remove
    #[error("History is out of sync with the server, try again after it refreshes")]
    OutOfSync,

    /// A store call failed before anything was written
    #[error("Undo failed: {0}")]
    Persistence(PersistenceError),

    /// The counter was decremented but the increment could not be removed
    #[error("Counter set to {value} but the history entry could not be removed: {error}")]
    LogDeleteFailed {
        /// Value written to the store
        value: CounterValue,
        /// Why the delete failed
        error: PersistenceError,
    },
}

/// Session inputs: commands from the user, results from the store, and
/// observations from the fanout.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionAction {
    // Commands
    /// Load (or lazily create) the counter and its history
    Initialize,
    /// +1
    Increment,
    /// -1
    Decrement,
    /// Set to zero
    Reset,
    /// Direct numeric entry
    SetTo {
        /// Requested value, floored and range-checked
        value: f64,
    },
    /// Remove the most recent increment and step the counter back
    UndoLastIncrement,
    /// Delete the whole action history, keeping the value
    ClearHistory,
    /// Dismiss the current error message
    ClearError,
    /// Something arrived on a propagation channel
    Observed(Observation),

    // Events
    /// Counter and history loaded
    Initialized {
        /// The singleton counter
        counter: Counter,
        /// Its history, any order
        actions: Vec<ActionRecord>,
    },
    /// Loading failed
    InitializationFailed {
        /// Why
        error: PersistenceError,
    },
    /// Both writes of a mutation succeeded
    Committed {
        /// Value written
        value: CounterValue,
        /// Action appended
        record: ActionRecord,
    },
    /// A commit write failed
    CommitFailed {
        /// Which write
        stage: CommitStage,
        /// Why
        error: PersistenceError,
    },
    /// Undo wrote the new value and removed the increment
    UndoCompleted {
        /// Value written
        value: CounterValue,
        /// The increment that was removed
        removed: ActionId,
    },
    /// Undo failed
    UndoFailed {
        /// Why
        error: UndoError,
    },
    /// History deleted
    HistoryCleared {
        /// Number of actions removed
        removed: u64,
    },
    /// History delete failed
    HistoryClearFailed {
        /// Why
        error: PersistenceError,
    },
}

/// Dependencies of one session.
#[derive(Clone)]
pub struct SessionEnvironment {
    /// Authoritative store
    pub store: Arc<dyn CounterStore>,
    /// Propagation channels
    pub fanout: Arc<Fanout>,
    /// Wall clock for the session's stats and CSV export. The reducer never
    /// reads it; record timestamps come from the store.
    pub clock: Arc<dyn Clock>,
}

impl SessionEnvironment {
    /// Bundle the dependencies
    #[must_use]
    pub fn new(store: Arc<dyn CounterStore>, fanout: Arc<Fanout>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            fanout,
            clock,
        }
    }
}

impl std::fmt::Debug for SessionEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEnvironment")
            .field("fanout", &self.fanout)
            .finish_non_exhaustive()
    }
}

/// The session reducer.
#[derive(Clone, Copy, Debug, Default)]
pub struct SessionReducer;

impl SessionReducer {
    /// Create the reducer
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn mutate(
        state: &mut SessionState,
        mutation: Mutation,
        env: &SessionEnvironment,
    ) -> SmallVec<[Effect<SessionAction>; 4]> {
        let Some(counter_id) = state.counter_id.filter(|_| state.initialized) else {
            SessionMetrics::record_ignored("uninitialized");
            tracing::debug!(?mutation, "Ignoring mutation before initialization");
            return SmallVec::new();
        };
        if state.busy {
            SessionMetrics::record_ignored("busy");
            tracing::debug!(?mutation, "Ignoring mutation while busy");
            return SmallVec::new();
        }

        let next = match mutation.apply(state.displayed_value) {
            Ok(next) => next,
            Err(error) => {
                SessionMetrics::record_ignored("invalid");
                tracing::debug!(?mutation, %error, "Mutation rejected");
                return SmallVec::new();
            },
        };

        let kind = mutation.action_kind();
        SessionMetrics::record_mutation(kind.as_str());
        tracing::debug!(from = %state.displayed_value, to = %next, %kind, "Mutation accepted");

        state.displayed_value = next;
        state.busy = true;
        state.error_message = None;

        smallvec![
            effects::signal_tabs(Arc::clone(&env.fanout), next),
            effects::commit(Arc::clone(&env.store), counter_id, next, kind),
        ]
    }

    fn undo(state: &mut SessionState, env: &SessionEnvironment) -> SmallVec<[Effect<SessionAction>; 4]> {
        let Some(counter_id) = state.counter_id.filter(|_| state.initialized) else {
            return SmallVec::new();
        };
        if state.busy {
            SessionMetrics::record_ignored("busy");
            tracing::debug!("Ignoring undo while busy");
            return SmallVec::new();
        }

        let Some(target) = state.log.last_increment().cloned() else {
            return Self::reject_undo(state, &UndoError::NoIncrement);
        };
        let Ok(next) = Mutation::Decrement.apply(state.displayed_value) else {
            return Self::reject_undo(state, &UndoError::AtZero);
        };

        state.busy = true;
        state.error_message = None;
        smallvec![effects::undo_increment(
            Arc::clone(&env.store),
            counter_id,
            target.id,
            next,
        )]
    }

    fn reject_undo(state: &mut SessionState, error: &UndoError) -> SmallVec<[Effect<SessionAction>; 4]> {
        SessionMetrics::record_undo("rejected");
        tracing::debug!(%error, "Undo rejected");
        state.error_message = Some(error.to_string());
        SmallVec::new()
    }

    fn propagate(env: &SessionEnvironment, value: CounterValue) -> SmallVec<[Effect<SessionAction>; 4]> {
        smallvec![
            effects::signal_tabs(Arc::clone(&env.fanout), value),
            effects::publish(Arc::clone(&env.fanout), value),
        ]
    }
}

impl Reducer for SessionReducer {
    type State = SessionState;
    type Action = SessionAction;
    type Environment = SessionEnvironment;

    #[allow(clippy::too_many_lines)] // one arm per action
    fn reduce(
        &self,
        state: &mut SessionState,
        action: SessionAction,
        env: &SessionEnvironment,
    ) -> SmallVec<[Effect<SessionAction>; 4]> {
        match action {
            SessionAction::Initialize => {
                smallvec![effects::initialize(Arc::clone(&env.store))]
            },
            SessionAction::Initialized { counter, actions } => {
                state.counter_id = Some(counter.id);
                state.displayed_value = counter.value;
                state.confirmed_value = counter.value;
                state.log = ActionLog::from_records(actions);
                state.busy = false;
                state.initialized = true;
                tracing::info!(
                    id = %counter.id,
                    value = %counter.value,
                    actions = state.log.len(),
                    "Session initialized"
                );
                SmallVec::new()
            },
            SessionAction::InitializationFailed { error } => {
                tracing::error!(%error, "Session initialization failed");
                state.error_message = Some(format!("Could not load the counter: {error}"));
                SmallVec::new()
            },

            SessionAction::Increment => Self::mutate(state, Mutation::Increment, env),
            SessionAction::Decrement => Self::mutate(state, Mutation::Decrement, env),
            SessionAction::Reset => Self::mutate(state, Mutation::Reset, env),
            SessionAction::SetTo { value } => Self::mutate(state, Mutation::SetTo(value), env),

            SessionAction::Committed { value, record } => {
                state.busy = false;
                state.confirmed_value = value;
                state.log.insert(record);
                smallvec![effects::publish(Arc::clone(&env.fanout), value)]
            },
            SessionAction::CommitFailed { stage, error } => {
                state.busy = false;
                SessionMetrics::record_commit_failure(stage.as_str());
                match stage {
                    CommitStage::CounterWrite => {
                        tracing::error!(%error, "Counter write failed");
                        state.error_message = Some(format!("Could not save the new value: {error}"));
                    },
                    CommitStage::ActionAppend => {
                        tracing::warn!(%error, "Counter written but action not logged; history diverges");
                        state.error_message = Some(format!("Value saved but history not updated: {error}"));
                    },
                }
                SmallVec::new()
            },

            SessionAction::UndoLastIncrement => Self::undo(state, env),
            SessionAction::UndoCompleted { value, removed } => {
                state.busy = false;
                state.displayed_value = value;
                state.confirmed_value = value;
                state.log.remove(removed);
                SessionMetrics::record_undo("completed");
                tracing::info!(%value, %removed, "Undo completed");
                Self::propagate(env, value)
            },
            SessionAction::UndoFailed { error } => {
                state.busy = false;
                SessionMetrics::record_undo("failed");
                tracing::warn!(%error, "Undo failed");
                if let UndoError::LogDeleteFailed { value, .. } = &error {
                    state.displayed_value = *value;
                    state.confirmed_value = *value;
                }
                state.error_message = Some(error.to_string());
                SmallVec::new()
            },

            SessionAction::ClearHistory => {
                let Some(counter_id) = state.counter_id.filter(|_| state.initialized) else {
                    return SmallVec::new();
                };
                if state.busy {
                    SessionMetrics::record_ignored("busy");
                    return SmallVec::new();
                }
                state.busy = true;
                smallvec![effects::clear_history(Arc::clone(&env.store), counter_id)]
            },
            SessionAction::HistoryCleared { removed } => {
                state.busy = false;
                state.log.clear();
                tracing::info!(removed, "History cleared");
                SmallVec::new()
            },
            SessionAction::HistoryClearFailed { error } => {
                state.busy = false;
                tracing::error!(%error, "History clear failed");
                state.error_message = Some(format!("Could not clear the history: {error}"));
                SmallVec::new()
            },

            SessionAction::ClearError => {
                state.error_message = None;
                SmallVec::new()
            },

            SessionAction::Observed(Observation::Value { value, channel }) => {
                if state.displayed_value != value {
                    tracing::trace!(from = %state.displayed_value, to = %value, %channel, "Applying observed value");
                }
                state.displayed_value = value;
                if channel.is_authoritative() {
                    state.confirmed_value = value;
                }
                SmallVec::new()
            },
            SessionAction::Observed(Observation::ActionInserted(record)) => {
                if Some(record.counter_id) == state.counter_id {
                    state.log.insert(record);
                }
                SmallVec::new()
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use ticket_sync_core::action::ActionKind;
    use ticket_sync_core::counter::MAX_TICKET;
    use ticket_sync_core::environment::SystemClock;
    use ticket_sync_runtime::propagation::{Channel, FanoutConfig};
    use ticket_sync_testing::memory::{
        COUNTER_ID, InMemoryBroadcastBus, InMemoryCounterStore, InMemoryTabStorage, StoreOperation,
    };
    use ticket_sync_testing::reducer_test::{assertions, run_effects};
    use ticket_sync_testing::{ReducerTest, test_clock};

    // ========== Test Fixtures ==========

    fn env_with(store: &Arc<InMemoryCounterStore>) -> SessionEnvironment {
        let fanout = Fanout::new(
            store.clone(),
            Arc::new(InMemoryBroadcastBus::new()),
            Arc::new(InMemoryTabStorage::new().open_tab()),
            FanoutConfig::default(),
        );
        SessionEnvironment::new(store.clone(), Arc::new(fanout), Arc::new(SystemClock))
    }

    fn env() -> SessionEnvironment {
        env_with(&Arc::new(InMemoryCounterStore::new()))
    }

    fn v(n: u32) -> CounterValue {
        CounterValue::new(n).unwrap()
    }

    fn ready_at(n: u32) -> SessionState {
        SessionState {
            counter_id: Some(COUNTER_ID),
            displayed_value: v(n),
            confirmed_value: v(n),
            initialized: true,
            ..SessionState::default()
        }
    }

    fn record(id: i64, kind: ActionKind) -> ActionRecord {
        ActionRecord {
            id: ActionId::new(id),
            counter_id: COUNTER_ID,
            kind,
            timestamp: test_clock().now() + chrono::TimeDelta::seconds(id),
        }
    }

    // ========== Busy Gate ==========

    #[test]
    fn accepted_increment_is_optimistic_and_sets_busy() {
        ReducerTest::new(SessionReducer::new())
            .with_env(env())
            .given_state(ready_at(4))
            .when_action(SessionAction::Increment)
            .then_state(|s| {
                assert_eq!(s.displayed_value, v(5));
                assert_eq!(s.confirmed_value, v(4));
                assert!(s.busy);
            })
            .then_effects(|effects| {
                assertions::assert_effects_count(effects, 2);
                assertions::assert_has_future_effect(effects);
            })
            .run();
    }

    #[test]
    fn second_mutation_while_busy_is_dropped() {
        ReducerTest::new(SessionReducer::new())
            .with_env(env())
            .given_state(ready_at(4))
            .when_action(SessionAction::Increment)
            .when_action(SessionAction::Increment)
            .then_state(|s| assert_eq!(s.displayed_value, v(5)))
            .then_effects(assertions::assert_no_effects)
            .run();
    }

    #[test]
    fn mutation_before_initialize_is_dropped() {
        ReducerTest::new(SessionReducer::new())
            .with_env(env())
            .given_state(SessionState::default())
            .when_action(SessionAction::Increment)
            .then_state(|s| {
                assert_eq!(s.displayed_value, CounterValue::ZERO);
                assert!(!s.busy);
            })
            .then_effects(assertions::assert_no_effects)
            .run();
    }

    // ========== Bounds ==========

    #[test]
    fn increment_at_max_is_rejected_silently() {
        ReducerTest::new(SessionReducer::new())
            .with_env(env())
            .given_state(ready_at(MAX_TICKET))
            .when_action(SessionAction::Increment)
            .then_state(|s| {
                assert_eq!(s.displayed_value, CounterValue::MAX);
                assert!(!s.busy);
                assert_eq!(s.error_message, None);
            })
            .then_effects(assertions::assert_no_effects)
            .run();
    }

    #[test]
    fn decrement_at_zero_is_rejected_silently() {
        ReducerTest::new(SessionReducer::new())
            .with_env(env())
            .given_state(ready_at(0))
            .when_action(SessionAction::Decrement)
            .then_state(|s| assert_eq!(s.displayed_value, CounterValue::ZERO))
            .then_effects(assertions::assert_no_effects)
            .run();
    }

    #[test]
    fn set_to_floors_and_rejects_out_of_range() {
        ReducerTest::new(SessionReducer::new())
            .with_env(env())
            .given_state(ready_at(0))
            .when_action(SessionAction::SetTo { value: 550.9 })
            .then_state(|s| assert_eq!(s.displayed_value, v(550)))
            .run();

        ReducerTest::new(SessionReducer::new())
            .with_env(env())
            .given_state(ready_at(7))
            .when_action(SessionAction::SetTo { value: 2000.5 })
            .then_state(|s| assert_eq!(s.displayed_value, v(7)))
            .then_effects(assertions::assert_no_effects)
            .run();
    }

    // ========== Commit ==========

    #[test]
    fn commit_failure_keeps_optimistic_value() {
        let mut state = ready_at(5);
        state.busy = true;
        ReducerTest::new(SessionReducer::new())
            .with_env(env())
            .given_state(state)
            .when_action(SessionAction::CommitFailed {
                stage: CommitStage::CounterWrite,
                error: PersistenceError::ConnectionFailed("down".into()),
            })
            .then_state(|s| {
                assert_eq!(s.displayed_value, v(5));
                assert!(!s.busy);
                assert!(s.error_message.as_deref().unwrap().contains("down"));
            })
            .then_effects(assertions::assert_no_effects)
            .run();
    }

    #[test]
    fn committed_record_is_logged_once() {
        let rec = record(1, ActionKind::Increment);
        let mut state = ready_at(1);
        state.busy = true;
        ReducerTest::new(SessionReducer::new())
            .with_env(env())
            .given_state(state)
            .when_action(SessionAction::Observed(Observation::ActionInserted(rec.clone())))
            .when_action(SessionAction::Committed {
                value: v(1),
                record: rec,
            })
            .then_state(|s| {
                assert_eq!(s.log.len(), 1);
                assert!(!s.busy);
                assert_eq!(s.confirmed_value, v(1));
            })
            .run();
    }

    #[tokio::test]
    async fn commit_effect_writes_value_then_appends() {
        let store = Arc::new(InMemoryCounterStore::new());
        store.ensure_counter().await.unwrap();
        let (_, effects) = ReducerTest::new(SessionReducer::new())
            .with_env(env_with(&store))
            .given_state(ready_at(0))
            .when_action(SessionAction::Increment)
            .run();

        let produced = run_effects(effects).await;
        assert!(matches!(
            produced.as_slice(),
            [SessionAction::Committed { value, record }]
                if *value == v(1) && record.kind == ActionKind::Increment
        ));
        assert_eq!(store.value(), Some(v(1)));
    }

    #[tokio::test]
    async fn append_failure_reports_divergence_stage() {
        let store = Arc::new(InMemoryCounterStore::new());
        store.ensure_counter().await.unwrap();
        store.set_failing(StoreOperation::Append, true);
        let (_, effects) = ReducerTest::new(SessionReducer::new())
            .with_env(env_with(&store))
            .given_state(ready_at(0))
            .when_action(SessionAction::Reset)
            .run();

        let produced = run_effects(effects).await;
        assert!(matches!(
            produced.as_slice(),
            [SessionAction::CommitFailed { stage: CommitStage::ActionAppend, .. }]
        ));
        // The value write already happened.
        assert_eq!(store.operation_count(StoreOperation::Write), 1);
    }

    // ========== Undo ==========

    #[test]
    fn undo_without_increment_reports_failure() {
        let mut state = ready_at(3);
        state.log = ActionLog::from_records([record(1, ActionKind::Decrement)]);
        ReducerTest::new(SessionReducer::new())
            .with_env(env())
            .given_state(state)
            .when_action(SessionAction::UndoLastIncrement)
            .then_state(|s| {
                assert_eq!(s.displayed_value, v(3));
                assert_eq!(s.log.len(), 1);
                assert!(!s.busy);
                assert_eq!(s.error_message, Some(UndoError::NoIncrement.to_string()));
            })
            .then_effects(assertions::assert_no_effects)
            .run();
    }

    #[test]
    fn undo_at_zero_reports_failure() {
        let mut state = ready_at(0);
        state.log = ActionLog::from_records([record(1, ActionKind::Increment)]);
        ReducerTest::new(SessionReducer::new())
            .with_env(env())
            .given_state(state)
            .when_action(SessionAction::UndoLastIncrement)
            .then_state(|s| {
                assert_eq!(s.displayed_value, CounterValue::ZERO);
                assert_eq!(s.error_message, Some(UndoError::AtZero.to_string()));
            })
            .then_effects(assertions::assert_no_effects)
            .run();
    }

    #[test]
    fn undo_completion_removes_by_identity() {
        let mut state = ready_at(1);
        state.busy = true;
        state.log = ActionLog::from_records([
            record(1, ActionKind::Increment),
            record(2, ActionKind::Increment),
            record(3, ActionKind::Decrement),
        ]);
        ReducerTest::new(SessionReducer::new())
            .with_env(env())
            .given_state(state)
            .when_action(SessionAction::UndoCompleted {
                value: v(0),
                removed: ActionId::new(2),
            })
            .then_state(|s| {
                assert_eq!(s.displayed_value, CounterValue::ZERO);
                let ids: Vec<i64> = s.log.iter().map(|r| r.id.get()).collect();
                assert_eq!(ids, vec![1, 3]);
                assert!(!s.busy);
            })
            .then_effects(|effects| assertions::assert_effects_count(effects, 2))
            .run();
    }

    #[tokio::test]
    async fn undo_effect_detects_out_of_sync_log() {
        let store = Arc::new(InMemoryCounterStore::new());
        store.ensure_counter().await.unwrap();
        store.write_counter(COUNTER_ID, v(2)).await.unwrap();
        let stored = store.append_action(COUNTER_ID, ActionKind::Increment).await.unwrap();

        // The local log believes a different increment is the latest.
        let mut state = ready_at(2);
        state.log = ActionLog::from_records([record(stored.id.get() + 100, ActionKind::Increment)]);

        let (_, effects) = ReducerTest::new(SessionReducer::new())
            .with_env(env_with(&store))
            .given_state(state)
            .when_action(SessionAction::UndoLastIncrement)
            .run();

        let produced = run_effects(effects).await;
        assert_eq!(
            produced,
            vec![SessionAction::UndoFailed {
                error: UndoError::OutOfSync
            }]
        );
        assert_eq!(store.value(), Some(v(2)));
        assert_eq!(store.actions().len(), 1);
    }

    #[tokio::test]
    async fn undo_write_failure_leaves_store_untouched() {
        let store = Arc::new(InMemoryCounterStore::new());
        store.ensure_counter().await.unwrap();
        store.write_counter(COUNTER_ID, v(1)).await.unwrap();
        let stored = store.append_action(COUNTER_ID, ActionKind::Increment).await.unwrap();
        store.set_failing(StoreOperation::Write, true);

        let mut state = ready_at(1);
        state.log = ActionLog::from_records([stored]);
        let (_, effects) = ReducerTest::new(SessionReducer::new())
            .with_env(env_with(&store))
            .given_state(state)
            .when_action(SessionAction::UndoLastIncrement)
            .run();

        let produced = run_effects(effects).await;
        assert!(matches!(
            produced.as_slice(),
            [SessionAction::UndoFailed { error: UndoError::Persistence(_) }]
        ));
        assert_eq!(store.value(), Some(v(1)));
        assert_eq!(store.actions().len(), 1);
        assert_eq!(store.operation_count(StoreOperation::Delete), 0);
    }

    // ========== Observations ==========

    #[test]
    fn observations_overwrite_display_last_write_wins() {
        ReducerTest::new(SessionReducer::new())
            .with_env(env())
            .given_state(ready_at(10))
            .when_action(SessionAction::Observed(Observation::Value {
                value: v(12),
                channel: Channel::Broadcast,
            }))
            .when_action(SessionAction::Observed(Observation::Value {
                value: v(11),
                channel: Channel::Poll,
            }))
            .then_state(|s| {
                assert_eq!(s.displayed_value, v(11));
                assert_eq!(s.confirmed_value, v(11));
            })
            .run();
    }

    #[test]
    fn push_only_observation_does_not_confirm() {
        ReducerTest::new(SessionReducer::new())
            .with_env(env())
            .given_state(ready_at(10))
            .when_action(SessionAction::Observed(Observation::Value {
                value: v(12),
                channel: Channel::TabSync,
            }))
            .then_state(|s| {
                assert_eq!(s.displayed_value, v(12));
                assert_eq!(s.confirmed_value, v(10));
            })
            .run();
    }

    // ========== History ==========

    #[test]
    fn clearing_history_keeps_value() {
        let mut state = ready_at(9);
        state.busy = true;
        state.log = ActionLog::from_records([record(1, ActionKind::Reset)]);
        ReducerTest::new(SessionReducer::new())
            .with_env(env())
            .given_state(state)
            .when_action(SessionAction::HistoryCleared { removed: 1 })
            .then_state(|s| {
                assert!(s.log.is_empty());
                assert_eq!(s.displayed_value, v(9));
                assert!(!s.busy);
            })
            .run();
    }

    #[test]
    fn clear_error_dismisses_message() {
        let mut state = ready_at(0);
        state.error_message = Some("boom".into());
        ReducerTest::new(SessionReducer::new())
            .with_env(env())
            .given_state(state)
            .when_action(SessionAction::ClearError)
            .then_state(|s| assert_eq!(s.error_message, None))
            .run();
    }
}
