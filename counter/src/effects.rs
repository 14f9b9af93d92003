//! Effect builders for the session reducer.
//!
//! Each builder captures what it needs by value and returns an [`Effect`]
//! whose future reports back as a [`SessionAction`] event.

use crate::session::{CommitStage, SessionAction, UndoError};
use std::sync::Arc;
use std::time::Instant;
use ticket_sync_core::action::{ActionId, ActionKind};
use ticket_sync_core::counter::{CounterId, CounterValue};
use ticket_sync_core::effect::Effect;
use ticket_sync_core::store::{CounterStore, PersistenceError};
use ticket_sync_runtime::metrics::PersistenceMetrics;
use ticket_sync_runtime::propagation::Fanout;

/// Time a store call and count its failure.
async fn timed<T, F>(operation: &'static str, call: F) -> Result<T, PersistenceError>
where
    F: Future<Output = Result<T, PersistenceError>>,
{
    let start = Instant::now();
    let result = call.await;
    PersistenceMetrics::record_operation(operation, start.elapsed());
    if result.is_err() {
        PersistenceMetrics::record_error(operation);
    }
    result
}

/// Load the counter, creating it if needed, and its action history.
pub fn initialize(store: Arc<dyn CounterStore>) -> Effect<SessionAction> {
    Effect::future(async move {
        let loaded = async {
            let counter = timed("ensure_counter", store.ensure_counter()).await?;
            let actions = timed("list_actions", store.list_actions(counter.id)).await?;
            Ok::<_, PersistenceError>((counter, actions))
        }
        .await;

        Some(match loaded {
            Ok((counter, actions)) => SessionAction::Initialized { counter, actions },
            Err(error) => SessionAction::InitializationFailed { error },
        })
    })
}

/// Write the new value, then append its action.
///
/// The two writes are independent: when the append fails the value stays
/// written.
pub fn commit(
    store: Arc<dyn CounterStore>,
    counter_id: CounterId,
    value: CounterValue,
    kind: ActionKind,
) -> Effect<SessionAction> {
    Effect::future(async move {
        if let Err(error) = timed("write_counter", store.write_counter(counter_id, value)).await {
            return Some(SessionAction::CommitFailed {
                stage: CommitStage::CounterWrite,
                error,
            });
        }

        Some(
            match timed("append_action", store.append_action(counter_id, kind)).await {
                Ok(record) => SessionAction::Committed { value, record },
                Err(error) => SessionAction::CommitFailed {
                    stage: CommitStage::ActionAppend,
                    error,
                },
            },
        )
    })
}

/// Step the counter back and remove `target`, the increment being undone.
///
/// Confirms first that `target` is still the store's latest increment so a
/// stale local log cannot remove the wrong record.
pub fn undo_increment(
    store: Arc<dyn CounterStore>,
    counter_id: CounterId,
    target: ActionId,
    value: CounterValue,
) -> Effect<SessionAction> {
    Effect::future(async move {
        let latest = match timed(
            "last_action_of_kind",
            store.last_action_of_kind(counter_id, ActionKind::Increment),
        )
        .await
        {
            Ok(latest) => latest,
            Err(error) => {
                return Some(SessionAction::UndoFailed {
                    error: UndoError::Persistence(error),
                });
            },
        };
        if latest.map(|record| record.id) != Some(target) {
            return Some(SessionAction::UndoFailed {
                error: UndoError::OutOfSync,
            });
        }

        if let Err(error) = timed("write_counter", store.write_counter(counter_id, value)).await {
            return Some(SessionAction::UndoFailed {
                error: UndoError::Persistence(error),
            });
        }

        Some(match timed("delete_action", store.delete_action(target)).await {
            Ok(()) => SessionAction::UndoCompleted {
                value,
                removed: target,
            },
            Err(error) => SessionAction::UndoFailed {
                error: UndoError::LogDeleteFailed { value, error },
            },
        })
    })
}

/// Delete every action of the counter.
pub fn clear_history(store: Arc<dyn CounterStore>, counter_id: CounterId) -> Effect<SessionAction> {
    Effect::future(async move {
        Some(
            match timed("clear_actions", store.clear_actions(counter_id)).await {
                Ok(removed) => SessionAction::HistoryCleared { removed },
                Err(error) => SessionAction::HistoryClearFailed { error },
            },
        )
    })
}

/// Tell the other tabs on this device.
pub fn signal_tabs(fanout: Arc<Fanout>, value: CounterValue) -> Effect<SessionAction> {
    Effect::fire_and_forget(async move { fanout.signal_tabs(value) })
}

/// Announce a committed value to other devices.
pub fn publish(fanout: Arc<Fanout>, value: CounterValue) -> Effect<SessionAction> {
    Effect::fire_and_forget(async move { fanout.publish(value).await })
}
