//! [`SyncSession`]: one client's handle on the shared counter.
//!
//! Owns the reducer [`Store`], the running [`Fanout`](ticket_sync_runtime::propagation::Fanout)
//! tasks and the pump that feeds their observations back into the reducer.

use crate::session::{SessionAction, SessionEnvironment, SessionReducer, SessionState};
use chrono::{Local, TimeZone};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use ticket_sync_core::action::ActionRecord;
use ticket_sync_core::counter::{CounterId, CounterValue, ValidationError, parse_entry};
use ticket_sync_core::environment::Clock;
use ticket_sync_core::stats::{Stats, compute_stats};
use ticket_sync_core::store::PersistenceError;
use ticket_sync_runtime::Store;
use ticket_sync_runtime::error::StoreError;
use ticket_sync_runtime::propagation::{FanoutHandle, Observation, Visibility, VisibilityTracker};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Default time a command waits for its store round trip.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

type SessionStore = Store<SessionState, SessionAction, SessionEnvironment, SessionReducer>;

/// Errors surfaced by [`SyncSession`].
///
/// Mutations dropped by the busy gate or rejected by range validation are
/// not errors; they leave the session untouched.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The counter could not be loaded
    #[error("Initialization failed: {0}")]
    Initialization(PersistenceError),

    /// Loading finished but its outcome never reached the session
    #[error("Initialization outcome was not observed ({skipped} session actions dropped)")]
    InitializationUnobserved {
        /// Actions the outcome subscription lagged past, 0 if none
        skipped: u64,
    },

    /// The session runtime refused or timed out
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Direct entry was not a number
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Session settings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionOptions {
    /// Upper bound on one command's store round trip
    pub command_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

/// A connected client session.
///
/// Dropping the session stops its background tasks; [`SyncSession::close`]
/// also drains in-flight effects.
pub struct SyncSession {
    store: SessionStore,
    fanout: Option<FanoutHandle>,
    pump: Option<JoinHandle<()>>,
    visibility: VisibilityTracker,
    clock: Arc<dyn Clock>,
    options: SessionOptions,
}

impl SyncSession {
    /// Load the counter and its history, then start listening on every
    /// enabled propagation channel.
    ///
    /// # Errors
    ///
    /// - [`SessionError::Initialization`]: the store could not load the counter
    /// - [`SessionError::Store`]: loading did not finish within the command timeout
    /// - [`SessionError::InitializationUnobserved`]: loading finished but its outcome was missed
    #[tracing::instrument(skip_all)]
    pub async fn connect(env: SessionEnvironment, options: SessionOptions) -> Result<Self, SessionError> {
        let fanout = Arc::clone(&env.fanout);
        let clock = Arc::clone(&env.clock);
        let store = Store::new(SessionState::default(), SessionReducer::new(), env);

        // Subscribe first so the outcome is kept until the round trip ends.
        let mut outcomes = store.subscribe_actions();
        let mut handle = store.send(SessionAction::Initialize).await?;
        handle.wait_with_timeout(options.command_timeout).await?;

        let counter_id = initialization_outcome(&mut outcomes)?;

        let (sink, observations) = mpsc::unbounded_channel();
        let (visibility, resumes) = VisibilityTracker::new();
        let handle = fanout.start(counter_id, sink, resumes).await;
        let pump = tokio::spawn(pump_observations(store.clone(), observations));

        tracing::info!(%counter_id, tasks = handle.task_count(), "Session connected");
        Ok(Self {
            store,
            fanout: Some(handle),
            pump: Some(pump),
            visibility,
            clock,
            options,
        })
    }

    /// Send an action and wait for its store round trip.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Store`] if the session is closing or the round
    /// trip exceeds the command timeout.
    pub async fn dispatch(&self, action: SessionAction) -> Result<(), SessionError> {
        let mut handle = self.store.send(action).await?;
        handle.wait_with_timeout(self.options.command_timeout).await?;
        Ok(())
    }

    /// +1. Ignored while busy or at the maximum.
    ///
    /// # Errors
    ///
    /// See [`SyncSession::dispatch`].
    pub async fn increment(&self) -> Result<(), SessionError> {
        self.dispatch(SessionAction::Increment).await
    }

    /// -1. Ignored while busy or at zero.
    ///
    /// # Errors
    ///
    /// See [`SyncSession::dispatch`].
    pub async fn decrement(&self) -> Result<(), SessionError> {
        self.dispatch(SessionAction::Decrement).await
    }

    /// Back to zero. Ignored while busy.
    ///
    /// # Errors
    ///
    /// See [`SyncSession::dispatch`].
    pub async fn reset(&self) -> Result<(), SessionError> {
        self.dispatch(SessionAction::Reset).await
    }

    /// Set a value directly. Floored; ignored when outside `0..=2000`.
    ///
    /// # Errors
    ///
    /// See [`SyncSession::dispatch`].
    pub async fn set_to(&self, value: f64) -> Result<(), SessionError> {
        self.dispatch(SessionAction::SetTo { value }).await
    }

    /// Set a value from user text.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Validation`] if `input` is not a number.
    pub async fn set_to_entry(&self, input: &str) -> Result<(), SessionError> {
        let value = parse_entry(input)?;
        self.set_to(value).await
    }

    /// Remove the most recent increment and step the counter back.
    ///
    /// A precondition or store failure lands in [`SyncSession::error_message`].
    ///
    /// # Errors
    ///
    /// See [`SyncSession::dispatch`].
    pub async fn undo_last_increment(&self) -> Result<(), SessionError> {
        self.dispatch(SessionAction::UndoLastIncrement).await
    }

    /// Delete the action history. The counter value is kept.
    ///
    /// # Errors
    ///
    /// See [`SyncSession::dispatch`].
    pub async fn clear_history(&self) -> Result<(), SessionError> {
        self.dispatch(SessionAction::ClearHistory).await
    }

    /// Dismiss the current error message.
    ///
    /// # Errors
    ///
    /// See [`SyncSession::dispatch`].
    pub async fn clear_error(&self) -> Result<(), SessionError> {
        self.dispatch(SessionAction::ClearError).await
    }

    /// What the client shows
    pub async fn displayed_value(&self) -> CounterValue {
        self.store.state(|s| s.displayed_value).await
    }

    /// Last value seen from an authoritative source
    pub async fn confirmed_value(&self) -> CounterValue {
        self.store.state(|s| s.confirmed_value).await
    }

    /// Whether a mutation is in flight
    pub async fn is_busy(&self) -> bool {
        self.store.state(|s| s.busy).await
    }

    /// Current user-readable failure, if any
    pub async fn error_message(&self) -> Option<String> {
        self.store.state(|s| s.error_message.clone()).await
    }

    /// Local action history, oldest first
    pub async fn actions(&self) -> Vec<ActionRecord> {
        self.store.state(|s| s.log.iter().cloned().collect()).await
    }

    /// Full session state
    pub async fn snapshot(&self) -> SessionState {
        self.store.state(Clone::clone).await
    }

    /// Rollups in the machine's local time zone.
    pub async fn stats(&self) -> Stats {
        self.stats_in(&Local).await
    }

    /// Rollups in `tz`.
    pub async fn stats_in<Tz: TimeZone>(&self, tz: &Tz) -> Stats {
        let now = self.clock.now().with_timezone(tz);
        self.store.state(|s| compute_stats(s.log.iter(), &now)).await
    }

    /// CSV export of [`SyncSession::stats`].
    pub async fn export_csv(&self) -> String {
        let today = self.clock.now().with_timezone(&Local).date_naive();
        self.stats().await.to_csv(today)
    }

    /// Report whether the client is on screen. Becoming visible again
    /// triggers an authoritative re-read.
    pub fn set_visibility(&self, visibility: Visibility) {
        if self.visibility.set(visibility) {
            tracing::debug!("Session resumed");
        }
    }

    /// Last reported visibility
    #[must_use]
    pub fn visibility(&self) -> Visibility {
        self.visibility.get()
    }

    /// Stop listening and wait for in-flight effects.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Store`] if effects are still running after the
    /// command timeout.
    pub async fn close(mut self) -> Result<(), SessionError> {
        if let Some(fanout) = self.fanout.take() {
            fanout.close();
        }
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.store.shutdown(self.options.command_timeout).await?;
        tracing::info!("Session closed");
        Ok(())
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

impl std::fmt::Debug for SyncSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncSession")
            .field("fanout", &self.fanout)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Drain the outcomes of a finished `Initialize` round trip.
fn initialization_outcome(
    outcomes: &mut broadcast::Receiver<SessionAction>,
) -> Result<CounterId, SessionError> {
    let mut counter_id = None;
    loop {
        match outcomes.try_recv() {
            Ok(SessionAction::Initialized { counter, .. }) => counter_id = Some(counter.id),
            Ok(SessionAction::InitializationFailed { error }) => {
                return Err(SessionError::Initialization(error));
            },
            Ok(_) => {},
            Err(TryRecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Initialization outcome overrun");
                return Err(SessionError::InitializationUnobserved { skipped });
            },
            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
        }
    }
    counter_id.ok_or(SessionError::InitializationUnobserved { skipped: 0 })
}

async fn pump_observations(store: SessionStore, mut observations: mpsc::UnboundedReceiver<Observation>) {
    while let Some(observation) = observations.recv().await {
        if let Err(error) = store.send(SessionAction::Observed(observation)).await {
            tracing::debug!(%error, "Observation pump stopped");
            break;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use ticket_sync_core::counter::Counter;

    fn loaded(id: i64) -> SessionAction {
        SessionAction::Initialized {
            counter: Counter {
                id: CounterId::new(id),
                value: CounterValue::ZERO,
            },
            actions: Vec::new(),
        }
    }

    #[test]
    fn outcome_yields_counter_id() {
        let (tx, mut rx) = broadcast::channel(8);
        tx.send(SessionAction::Initialize).unwrap();
        tx.send(loaded(3)).unwrap();
        assert_eq!(initialization_outcome(&mut rx).unwrap(), CounterId::new(3));
    }

    #[test]
    fn outcome_failure_is_reported() {
        let (tx, mut rx) = broadcast::channel(8);
        tx.send(SessionAction::InitializationFailed {
            error: PersistenceError::ConnectionFailed("refused".into()),
        })
        .unwrap();
        assert!(matches!(
            initialization_outcome(&mut rx),
            Err(SessionError::Initialization(PersistenceError::ConnectionFailed(_)))
        ));
    }

    #[test]
    fn overrun_outcome_reports_skipped_actions() {
        let (tx, mut rx) = broadcast::channel(2);
        for _ in 0..4 {
            tx.send(SessionAction::Initialize).unwrap();
        }
        tx.send(loaded(1)).unwrap();
        assert!(matches!(
            initialization_outcome(&mut rx),
            Err(SessionError::InitializationUnobserved { skipped: 3 })
        ));
    }

    #[test]
    fn missing_outcome_is_not_a_closed_channel() {
        let (tx, mut rx) = broadcast::channel::<SessionAction>(2);
        drop(tx);
        let error = initialization_outcome(&mut rx).unwrap_err();
        assert!(matches!(error, SessionError::InitializationUnobserved { skipped: 0 }));
        assert!(error.to_string().contains("not observed"));
    }
}
