//! `PostgreSQL` authoritative store for the shared ticket counter.
//!
//! Implements [`CounterStore`] on two tables:
//!
//! ```sql
//! counters(id, value CHECK (0..2000), singleton UNIQUE, updated_at)
//! counter_actions(id, counter_id, action_type CHECK (increment|decrement|reset), created_at)
//! ```
//!
//! Row triggers publish `pg_notify('counter_changes', ..)` on value updates and
//! `pg_notify('counter_action_inserts', ..)` on inserts; the subscription methods
//! turn those into streams with a dedicated `LISTEN` connection each.
//! [`PostgresBroadcastBus`] carries the low-latency `count-updated` broadcast
//! over the same mechanism.
//!
//! # Example
//!
//! ```ignore
//! use ticket_sync_postgres::PostgresCounterStore;
//!
//! let store = PostgresCounterStore::new("postgres://localhost/tickets").await?;
//! store.migrate().await?;
//! let counter = store.ensure_counter().await?;
//! ```

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::str::FromStr;
use std::time::Instant;
use ticket_sync_core::action::{ActionId, ActionKind, ActionRecord};
use ticket_sync_core::counter::{Counter, CounterId, CounterValue};
use ticket_sync_core::store::{BoxFuture, CounterStore, NotificationStream, PersistenceError};

mod notify;

pub use notify::PostgresBroadcastBus;

/// Default pool size.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// Notification channel for value updates.
pub const COUNTER_CHANGES_CHANNEL: &str = "counter_changes";

/// Notification channel for action inserts.
pub const ACTION_INSERTS_CHANNEL: &str = "counter_action_inserts";

/// PostgreSQL-backed counter store.
#[derive(Clone)]
pub struct PostgresCounterStore {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct CounterRow {
    id: i64,
    value: i32,
}

#[derive(sqlx::FromRow)]
struct ActionRow {
    id: i64,
    counter_id: i64,
    action_type: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<CounterRow> for Counter {
    type Error = PersistenceError;

    fn try_from(row: CounterRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: CounterId::new(row.id),
            value: decode_value(row.value)?,
        })
    }
}

impl TryFrom<ActionRow> for ActionRecord {
    type Error = PersistenceError;

    fn try_from(row: ActionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: ActionId::new(row.id),
            counter_id: CounterId::new(row.counter_id),
            kind: ActionKind::from_str(&row.action_type)
                .map_err(|e| PersistenceError::InvalidData(e.to_string()))?,
            timestamp: row.created_at,
        })
    }
}

fn decode_value(value: i32) -> Result<CounterValue, PersistenceError> {
    CounterValue::from_i64(i64::from(value)).map_err(|e| PersistenceError::InvalidData(e.to_string()))
}

/// Map a sqlx error, logging it and counting it against `query`.
fn db_error(query: &'static str) -> impl FnOnce(sqlx::Error) -> PersistenceError {
    move |e| {
        metrics::counter!("postgres.query.errors", "query" => query).increment(1);
        tracing::error!(query, error = %e, "Counter store query failed");
        match e {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                PersistenceError::ConnectionFailed(e.to_string())
            },
            other => PersistenceError::Database(other.to_string()),
        }
    }
}

fn record_duration(query: &'static str, start: Instant) {
    metrics::histogram!("postgres.query.duration_seconds", "query" => query)
        .record(start.elapsed().as_secs_f64());
}

impl PostgresCounterStore {
    /// Connect with the default pool size.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::ConnectionFailed`] if the database is unreachable.
    pub async fn new(database_url: &str) -> Result<Self, PersistenceError> {
        Self::with_max_connections(database_url, DEFAULT_MAX_CONNECTIONS).await
    }

    /// Connect with an explicit pool size.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::ConnectionFailed`] if the database is unreachable.
    pub async fn with_max_connections(
        database_url: &str,
        max_connections: u32,
    ) -> Result<Self, PersistenceError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| PersistenceError::ConnectionFailed(format!("Failed to connect: {e}")))?;
        Ok(Self::from_pool(pool))
    }

    /// Wrap an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create tables and notification triggers if missing.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Database`] if a migration fails.
    pub async fn migrate(&self) -> Result<(), PersistenceError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| PersistenceError::Database(format!("Migration failed: {e}")))?;
        Ok(())
    }

    /// The underlying pool
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl CounterStore for PostgresCounterStore {
    fn ensure_counter(&self) -> BoxFuture<'_, Result<Counter, PersistenceError>> {
        Box::pin(async move {
            let start = Instant::now();

            // Concurrent first callers both attempt the insert; the singleton
            // constraint keeps exactly one row.
            sqlx::query("INSERT INTO counters (value) VALUES (0) ON CONFLICT (singleton) DO NOTHING")
                .execute(&self.pool)
                .await
                .map_err(db_error("ensure_counter"))?;

            let row: CounterRow = sqlx::query_as("SELECT id, value FROM counters WHERE singleton")
                .fetch_one(&self.pool)
                .await
                .map_err(db_error("ensure_counter"))?;

            record_duration("ensure_counter", start);
            let counter = Counter::try_from(row)?;
            tracing::debug!(id = %counter.id, value = %counter.value, "Counter ready");
            Ok(counter)
        })
    }

    fn read_counter(&self, id: CounterId) -> BoxFuture<'_, Result<CounterValue, PersistenceError>> {
        Box::pin(async move {
            let start = Instant::now();
            let value: Option<(i32,)> = sqlx::query_as("SELECT value FROM counters WHERE id = $1")
                .bind(id.get())
                .fetch_optional(&self.pool)
                .await
                .map_err(db_error("read_counter"))?;
            record_duration("read_counter", start);

            let (value,) = value.ok_or(PersistenceError::CounterNotFound(id))?;
            decode_value(value)
        })
    }

    fn write_counter(
        &self,
        id: CounterId,
        value: CounterValue,
    ) -> BoxFuture<'_, Result<(), PersistenceError>> {
        Box::pin(async move {
            let start = Instant::now();
            let result = sqlx::query("UPDATE counters SET value = $1, updated_at = now() WHERE id = $2")
                .bind(value.as_i32())
                .bind(id.get())
                .execute(&self.pool)
                .await
                .map_err(db_error("write_counter"))?;
            record_duration("write_counter", start);

            if result.rows_affected() == 0 {
                return Err(PersistenceError::CounterNotFound(id));
            }
            Ok(())
        })
    }

    fn append_action(
        &self,
        id: CounterId,
        kind: ActionKind,
    ) -> BoxFuture<'_, Result<ActionRecord, PersistenceError>> {
        Box::pin(async move {
            let start = Instant::now();
            let row: ActionRow = sqlx::query_as(
                "INSERT INTO counter_actions (counter_id, action_type)
                 VALUES ($1, $2)
                 RETURNING id, counter_id, action_type, created_at",
            )
            .bind(id.get())
            .bind(kind.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(db_error("append_action"))?;
            record_duration("append_action", start);

            ActionRecord::try_from(row)
        })
    }

    fn delete_action(&self, action: ActionId) -> BoxFuture<'_, Result<(), PersistenceError>> {
        Box::pin(async move {
            let start = Instant::now();
            let result = sqlx::query("DELETE FROM counter_actions WHERE id = $1")
                .bind(action.get())
                .execute(&self.pool)
                .await
                .map_err(db_error("delete_action"))?;
            record_duration("delete_action", start);

            if result.rows_affected() == 0 {
                return Err(PersistenceError::ActionNotFound(action));
            }
            Ok(())
        })
    }

    fn last_action_of_kind(
        &self,
        id: CounterId,
        kind: ActionKind,
    ) -> BoxFuture<'_, Result<Option<ActionRecord>, PersistenceError>> {
        Box::pin(async move {
            let start = Instant::now();
            let row: Option<ActionRow> = sqlx::query_as(
                "SELECT id, counter_id, action_type, created_at
                 FROM counter_actions
                 WHERE counter_id = $1 AND action_type = $2
                 ORDER BY created_at DESC, id DESC
                 LIMIT 1",
            )
            .bind(id.get())
            .bind(kind.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("last_action_of_kind"))?;
            record_duration("last_action_of_kind", start);

            row.map(ActionRecord::try_from).transpose()
        })
    }

    fn list_actions(
        &self,
        id: CounterId,
    ) -> BoxFuture<'_, Result<Vec<ActionRecord>, PersistenceError>> {
        Box::pin(async move {
            let start = Instant::now();
            let rows: Vec<ActionRow> = sqlx::query_as(
                "SELECT id, counter_id, action_type, created_at
                 FROM counter_actions
                 WHERE counter_id = $1
                 ORDER BY created_at ASC, id ASC",
            )
            .bind(id.get())
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("list_actions"))?;
            record_duration("list_actions", start);

            tracing::debug!(count = rows.len(), "Loaded action log");
            rows.into_iter().map(ActionRecord::try_from).collect()
        })
    }

    fn clear_actions(&self, id: CounterId) -> BoxFuture<'_, Result<u64, PersistenceError>> {
        Box::pin(async move {
            let start = Instant::now();
            let result = sqlx::query("DELETE FROM counter_actions WHERE counter_id = $1")
                .bind(id.get())
                .execute(&self.pool)
                .await
                .map_err(db_error("clear_actions"))?;
            record_duration("clear_actions", start);

            tracing::info!(removed = result.rows_affected(), "Action history cleared");
            Ok(result.rows_affected())
        })
    }

    fn subscribe_counter_changes(
        &self,
        id: CounterId,
    ) -> BoxFuture<'_, Result<NotificationStream<CounterValue>, PersistenceError>> {
        Box::pin(async move { notify::counter_changes(&self.pool, id).await })
    }

    fn subscribe_action_inserts(
        &self,
        id: CounterId,
    ) -> BoxFuture<'_, Result<NotificationStream<ActionRecord>, PersistenceError>> {
        Box::pin(async move { notify::action_inserts(&self.pool, id).await })
    }
}
