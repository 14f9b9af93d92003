//! Logged mutation records and the client-side action log.
//!
//! The action log is the audit trail behind statistics and undo. Records are
//! ordered by timestamp with ties broken by id, and are never edited in place:
//! the only removals are the single delete performed by undo and the bulk
//! "clear history" operation.

use crate::counter::{CounterId, CounterValue, Mutation};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Identifier of a logged action, assigned by the authoritative store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ActionId(i64);

impl ActionId {
    /// Wrap a raw store identifier
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Raw store identifier
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The three kinds of logged mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    /// One ticket forward
    Increment,
    /// One ticket back
    Decrement,
    /// Reset to zero, or a direct numeric entry
    Reset,
}

impl ActionKind {
    /// Storage name of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Increment => "increment",
            Self::Decrement => "decrement",
            Self::Reset => "reset",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown action type name read from storage.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown action type: {0}")]
pub struct UnknownActionKind(pub String);

impl FromStr for ActionKind {
    type Err = UnknownActionKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "increment" => Ok(Self::Increment),
            "decrement" => Ok(Self::Decrement),
            "reset" => Ok(Self::Reset),
            other => Err(UnknownActionKind(other.to_string())),
        }
    }
}

/// One logged mutation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRecord {
    /// Store-assigned identifier
    pub id: ActionId,
    /// Counter this action belongs to
    pub counter_id: CounterId,
    /// What happened
    pub kind: ActionKind,
    /// When the store recorded it
    pub timestamp: DateTime<Utc>,
}

impl ActionRecord {
    fn sort_key(&self) -> (DateTime<Utc>, ActionId) {
        (self.timestamp, self.id)
    }
}

/// In-memory, ordered copy of the action log held by one client.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ActionLog {
    records: Vec<ActionRecord>,
    ids: HashSet<ActionId>,
}

impl ActionLog {
    /// Create an empty log
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a log from records in any order, dropping duplicate ids.
    ///
    /// Sorts once; the first record per id in log order is kept.
    #[must_use]
    pub fn from_records(records: impl IntoIterator<Item = ActionRecord>) -> Self {
        let mut records: Vec<ActionRecord> = records.into_iter().collect();
        records.sort_by_key(ActionRecord::sort_key);
        let mut ids = HashSet::with_capacity(records.len());
        records.retain(|r| ids.insert(r.id));
        Self { records, ids }
    }

    /// Insert a record at its ordered position.
    ///
    /// Returns `false` and leaves the log untouched if a record with the same
    /// id is already present, so a record delivered by both the local commit
    /// and the insert feed is kept once.
    pub fn insert(&mut self, record: ActionRecord) -> bool {
        if !self.ids.insert(record.id) {
            return false;
        }
        let key = record.sort_key();
        let at = self.records.partition_point(|r| r.sort_key() <= key);
        self.records.insert(at, record);
        true
    }

    /// Whether a record with this id is present
    #[must_use]
    pub fn contains(&self, id: ActionId) -> bool {
        self.ids.contains(&id)
    }

    /// The most recent increment, scanning from the end.
    #[must_use]
    pub fn last_increment(&self) -> Option<&ActionRecord> {
        self.records
            .iter()
            .rev()
            .find(|r| r.kind == ActionKind::Increment)
    }

    /// Remove the record with this id.
    pub fn remove(&mut self, id: ActionId) -> Option<ActionRecord> {
        if !self.ids.remove(&id) {
            return None;
        }
        let index = self.records.iter().rposition(|r| r.id == id)?;
        Some(self.records.remove(index))
    }

    /// Remove the rightmost increment.
    pub fn remove_last_increment(&mut self) -> Option<ActionRecord> {
        let index = self
            .records
            .iter()
            .rposition(|r| r.kind == ActionKind::Increment)?;
        let record = self.records.remove(index);
        self.ids.remove(&record.id);
        Some(record)
    }

    /// Drop every record
    pub fn clear(&mut self) {
        self.records.clear();
        self.ids.clear();
    }

    /// Records in timestamp order.
    ///
    /// Each call starts a fresh pass over the log.
    pub fn iter(&self) -> impl Iterator<Item = &ActionRecord> + '_ {
        self.records.iter()
    }

    /// Number of records
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the log is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Recompute the counter by replaying the log from zero.
    ///
    /// Approximate: a direct numeric entry is logged as a reset and replays
    /// as zero. Transitions that would leave the valid range are skipped.
    #[must_use]
    pub fn replay(&self) -> CounterValue {
        self.records
            .iter()
            .fold(CounterValue::ZERO, |value, record| {
                let mutation = match record.kind {
                    ActionKind::Increment => Mutation::Increment,
                    ActionKind::Decrement => Mutation::Decrement,
                    ActionKind::Reset => Mutation::Reset,
                };
                mutation.apply(value).unwrap_or(value)
            })
    }
}

impl<'a> IntoIterator for &'a ActionLog {
    type Item = &'a ActionRecord;
    type IntoIter = std::slice::Iter<'a, ActionRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(id: i64, kind: ActionKind, second: u32) -> ActionRecord {
        ActionRecord {
            id: ActionId::new(id),
            counter_id: CounterId::new(1),
            kind,
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, second).unwrap(),
        }
    }

    #[test]
    fn insert_orders_by_timestamp_then_id() {
        let log = ActionLog::from_records([
            record(3, ActionKind::Reset, 5),
            record(2, ActionKind::Increment, 1),
            record(1, ActionKind::Decrement, 1),
        ]);
        let ids: Vec<i64> = log.iter().map(|r| r.id.get()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn loading_a_long_history_stays_fast() {
        // A year of busy days, delivered newest first with every record twice.
        let n: i64 = 200_000;
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let records: Vec<ActionRecord> = (0..n)
            .rev()
            .flat_map(|i| {
                let record = ActionRecord {
                    id: ActionId::new(i),
                    counter_id: CounterId::new(1),
                    kind: ActionKind::Increment,
                    timestamp: start + chrono::Duration::seconds(i * 60),
                };
                [record.clone(), record]
            })
            .collect();

        let began = std::time::Instant::now();
        let mut log = ActionLog::from_records(records);
        assert!(began.elapsed() < std::time::Duration::from_secs(5));

        assert_eq!(log.len(), usize::try_from(n).unwrap());
        assert!(log.iter().zip(log.iter().skip(1)).all(|(a, b)| a.id < b.id));
        assert!(log.contains(ActionId::new(n - 1)));
        let oldest = log.iter().next().unwrap().clone();
        assert!(!log.insert(oldest));
        assert_eq!(log.remove_last_increment().unwrap().id, ActionId::new(n - 1));
        assert!(!log.contains(ActionId::new(n - 1)));
    }

    #[test]
    fn insert_is_idempotent_by_id() {
        let mut log = ActionLog::new();
        assert!(log.insert(record(1, ActionKind::Increment, 0)));
        assert!(!log.insert(record(1, ActionKind::Increment, 0)));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn last_increment_skips_later_decrements() {
        let log = ActionLog::from_records([
            record(1, ActionKind::Increment, 0),
            record(2, ActionKind::Increment, 1),
            record(3, ActionKind::Decrement, 2),
        ]);
        assert_eq!(log.last_increment().unwrap().id, ActionId::new(2));
    }

    #[test]
    fn remove_targets_identity_not_position() {
        let mut log = ActionLog::from_records([
            record(1, ActionKind::Increment, 0),
            record(2, ActionKind::Increment, 1),
            record(3, ActionKind::Decrement, 2),
        ]);
        let removed = log.remove(ActionId::new(1)).unwrap();
        assert_eq!(removed.id, ActionId::new(1));
        assert!(log.contains(ActionId::new(2)));
        assert!(log.contains(ActionId::new(3)));
        assert!(log.remove(ActionId::new(1)).is_none());
    }

    #[test]
    fn remove_last_increment_keeps_decrement() {
        let mut log = ActionLog::from_records([
            record(1, ActionKind::Increment, 0),
            record(2, ActionKind::Increment, 1),
            record(3, ActionKind::Decrement, 2),
        ]);
        assert_eq!(log.remove_last_increment().unwrap().id, ActionId::new(2));
        let kinds: Vec<ActionKind> = log.iter().map(|r| r.kind).collect();
        assert_eq!(kinds, vec![ActionKind::Increment, ActionKind::Decrement]);
    }

    #[test]
    fn iteration_is_restartable() {
        let log = ActionLog::from_records([
            record(1, ActionKind::Increment, 0),
            record(2, ActionKind::Increment, 1),
        ]);
        assert_eq!(log.iter().count(), 2);
        assert_eq!(log.iter().count(), 2);
        assert_eq!((&log).into_iter().count(), 2);
    }

    #[test]
    fn replay_recomputes_value() {
        let log = ActionLog::from_records([
            record(1, ActionKind::Increment, 0),
            record(2, ActionKind::Increment, 1),
            record(3, ActionKind::Decrement, 2),
            record(4, ActionKind::Increment, 3),
        ]);
        assert_eq!(log.replay().get(), 2);

        let mut with_reset = log.clone();
        with_reset.insert(record(5, ActionKind::Reset, 4));
        assert_eq!(with_reset.replay(), CounterValue::ZERO);
    }

    #[test]
    fn kind_round_trips_through_storage_name() {
        for kind in [ActionKind::Increment, ActionKind::Decrement, ActionKind::Reset] {
            assert_eq!(kind.as_str().parse::<ActionKind>().unwrap(), kind);
        }
        assert!("set".parse::<ActionKind>().is_err());
    }
}
