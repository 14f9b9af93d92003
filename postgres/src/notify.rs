//! `LISTEN` streams over the trigger notifications, and a broadcast bus on
//! `pg_notify` for clients that share the database.

use crate::{ACTION_INSERTS_CHANNEL, COUNTER_CHANGES_CHANNEL, decode_value};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::postgres::{PgListener, PgPool};
use std::str::FromStr;
use std::time::Instant;
use ticket_sync_core::action::{ActionId, ActionKind, ActionRecord};
use ticket_sync_core::channel::{BroadcastBus, PropagationError};
use ticket_sync_core::counter::{CounterId, CounterValue};
use ticket_sync_core::store::{BoxFuture, NotificationStream, PersistenceError};

#[derive(Deserialize)]
struct CounterChanged {
    id: i64,
    value: i32,
}

#[derive(Deserialize)]
struct ActionInserted {
    id: i64,
    counter_id: i64,
    action_type: String,
    created_at: DateTime<Utc>,
}

async fn listen(pool: &PgPool, channel: &str) -> Result<PgListener, PersistenceError> {
    let mut listener = PgListener::connect_with(pool)
        .await
        .map_err(|e| PersistenceError::ConnectionFailed(format!("LISTEN connection failed: {e}")))?;
    listener
        .listen(channel)
        .await
        .map_err(|e| PersistenceError::Database(format!("LISTEN {channel} failed: {e}")))?;
    tracing::debug!(channel, "Listening for notifications");
    Ok(listener)
}

fn parse_change(payload: &str, id: CounterId) -> Result<Option<CounterValue>, PersistenceError> {
    let change: CounterChanged =
        serde_json::from_str(payload).map_err(|e| PersistenceError::InvalidData(e.to_string()))?;
    if change.id != id.get() {
        return Ok(None);
    }
    decode_value(change.value).map(Some)
}

fn parse_insert(payload: &str, id: CounterId) -> Result<Option<ActionRecord>, PersistenceError> {
    let insert: ActionInserted =
        serde_json::from_str(payload).map_err(|e| PersistenceError::InvalidData(e.to_string()))?;
    if insert.counter_id != id.get() {
        return Ok(None);
    }
    Ok(Some(ActionRecord {
        id: ActionId::new(insert.id),
        counter_id: id,
        kind: ActionKind::from_str(&insert.action_type)
            .map_err(|e| PersistenceError::InvalidData(e.to_string()))?,
        timestamp: insert.created_at,
    }))
}

pub(crate) async fn counter_changes(
    pool: &PgPool,
    id: CounterId,
) -> Result<NotificationStream<CounterValue>, PersistenceError> {
    let mut listener = listen(pool, COUNTER_CHANGES_CHANNEL).await?;
    Ok(Box::pin(async_stream::stream! {
        loop {
            match listener.recv().await {
                Ok(notification) => match parse_change(notification.payload(), id) {
                    Ok(Some(value)) => yield value,
                    Ok(None) => {},
                    Err(error) => tracing::warn!(%error, "Bad counter change payload"),
                },
                Err(error) => {
                    tracing::warn!(%error, "Counter change feed closed");
                    break;
                },
            }
        }
    }))
}

pub(crate) async fn action_inserts(
    pool: &PgPool,
    id: CounterId,
) -> Result<NotificationStream<ActionRecord>, PersistenceError> {
    let mut listener = listen(pool, ACTION_INSERTS_CHANNEL).await?;
    Ok(Box::pin(async_stream::stream! {
        loop {
            match listener.recv().await {
                Ok(notification) => match parse_insert(notification.payload(), id) {
                    Ok(Some(record)) => yield record,
                    Ok(None) => {},
                    Err(error) => tracing::warn!(%error, "Bad action insert payload"),
                },
                Err(error) => {
                    tracing::warn!(%error, "Action insert feed closed");
                    break;
                },
            }
        }
    }))
}

/// [`BroadcastBus`] over `NOTIFY`.
///
/// A topic maps to a notification channel of the same name. Delivery is
/// at-most-once to listeners connected at send time, and payloads must be
/// UTF-8 under the server's 8000 byte limit.
#[derive(Clone)]
pub struct PostgresBroadcastBus {
    pool: PgPool,
}

impl PostgresBroadcastBus {
    /// Publish and listen through `pool`.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl std::fmt::Debug for PostgresBroadcastBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresBroadcastBus").finish_non_exhaustive()
    }
}

impl BroadcastBus for PostgresBroadcastBus {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> BoxFuture<'_, Result<(), PropagationError>> {
        let topic = topic.to_string();
        Box::pin(async move {
            let text = String::from_utf8(payload).map_err(|e| PropagationError::Encoding(e.to_string()))?;
            let start = Instant::now();
            sqlx::query("SELECT pg_notify($1, $2)")
                .bind(&topic)
                .bind(&text)
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    metrics::counter!("postgres.query.errors", "query" => "broadcast_publish").increment(1);
                    PropagationError::PublishFailed {
                        topic: topic.clone(),
                        reason: e.to_string(),
                    }
                })?;
            metrics::histogram!("postgres.query.duration_seconds", "query" => "broadcast_publish")
                .record(start.elapsed().as_secs_f64());
            Ok(())
        })
    }

    fn subscribe(
        &self,
        topic: &str,
    ) -> BoxFuture<'_, Result<NotificationStream<Vec<u8>>, PropagationError>> {
        let topic = topic.to_string();
        Box::pin(async move {
            let mut listener = listen(&self.pool, &topic).await.map_err(|e| {
                PropagationError::SubscriptionFailed {
                    topic: topic.clone(),
                    reason: e.to_string(),
                }
            })?;
            let stream: NotificationStream<Vec<u8>> = Box::pin(async_stream::stream! {
                loop {
                    match listener.recv().await {
                        Ok(notification) => yield notification.payload().as_bytes().to_vec(),
                        Err(error) => {
                            tracing::warn!(%error, %topic, "Broadcast listener closed");
                            break;
                        },
                    }
                }
            });
            Ok(stream)
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn change_payload_for_other_counter_is_skipped() {
        let id = CounterId::new(1);
        assert_eq!(parse_change(r#"{"id":2,"value":5}"#, id).unwrap(), None);
        assert_eq!(
            parse_change(r#"{"id":1,"value":5}"#, id).unwrap(),
            Some(CounterValue::new(5).unwrap())
        );
    }

    #[test]
    fn out_of_range_change_is_invalid() {
        let result = parse_change(r#"{"id":1,"value":2001}"#, CounterId::new(1));
        assert!(matches!(result, Err(PersistenceError::InvalidData(_))));
    }

    #[test]
    fn insert_payload_decodes_postgres_timestamps() {
        let payload = r#"{"id":7,"counter_id":1,"action_type":"decrement","created_at":"2024-01-02T09:30:00.123456+00:00"}"#;
        let record = parse_insert(payload, CounterId::new(1)).unwrap().unwrap();
        assert_eq!(record.id, ActionId::new(7));
        assert_eq!(record.kind, ActionKind::Decrement);
        assert_eq!(record.timestamp.to_rfc3339(), "2024-01-02T09:30:00.123456+00:00");
    }

    #[test]
    fn unknown_action_type_is_invalid() {
        let payload = r#"{"id":7,"counter_id":1,"action_type":"jump","created_at":"2024-01-02T09:30:00Z"}"#;
        assert!(parse_insert(payload, CounterId::new(1)).is_err());
    }
}
