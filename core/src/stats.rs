//! Daily, weekly and monthly rollups of the action log.
//!
//! Stats are derived on demand from whatever log the caller holds; nothing is
//! stored. Calendar math happens in the caller's time zone: the daily bucket
//! of an action is its local calendar date.
//!
//! - Weekly window: `[now - weekday offset days, now]`, weeks start on Sunday
//!   and the start keeps `now`'s time of day.
//! - Monthly window: `[local midnight on the 1st, now]`.

use crate::action::{ActionKind, ActionRecord};
use chrono::{DateTime, Datelike, NaiveDate, TimeDelta, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// Per-kind counts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    /// Number of increments
    pub increments: u64,
    /// Number of decrements
    pub decrements: u64,
    /// Number of resets (including direct entries)
    pub resets: u64,
}

impl Tally {
    fn record(&mut self, kind: ActionKind) {
        match kind {
            ActionKind::Increment => self.increments += 1,
            ActionKind::Decrement => self.decrements += 1,
            ActionKind::Reset => self.resets += 1,
        }
    }

    /// Sum of all kinds
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.increments + self.decrements + self.resets
    }
}

/// Counts for one calendar date.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyStats {
    /// Local calendar date
    pub date: NaiveDate,
    /// Counts for that date
    #[serde(flatten)]
    pub tally: Tally,
}

/// Rollups derived from an action log.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    /// One bucket per date seen, most recent first
    pub daily: Vec<DailyStats>,
    /// Current week (Sunday start) up to now
    pub weekly: Tally,
    /// Current month up to now
    pub monthly: Tally,
}

impl Stats {
    /// Render the export: monthly row, weekly row, blank line, daily table.
    #[must_use]
    pub fn to_csv(&self, today: NaiveDate) -> String {
        let mut out = String::from("Statistic,Period,Increments,Decrements,Resets\n");
        for (label, tally) in [("Monthly", &self.monthly), ("Weekly", &self.weekly)] {
            let _ = writeln!(
                out,
                "{label},{today},{},{},{}",
                tally.increments, tally.decrements, tally.resets
            );
        }
        out.push('\n');
        out.push_str("Date,Increments,Decrements,Resets\n");
        for day in &self.daily {
            let _ = writeln!(
                out,
                "{},{},{},{}",
                day.date, day.tally.increments, day.tally.decrements, day.tally.resets
            );
        }
        out
    }
}

/// Start of the week containing `now`: back to Sunday, same time of day.
fn week_start<Tz: TimeZone>(now: &DateTime<Tz>) -> DateTime<Utc> {
    let offset = i64::from(now.weekday().num_days_from_sunday());
    now.with_timezone(&Utc) - TimeDelta::days(offset)
}

/// Local midnight on the first day of `now`'s month.
fn month_start<Tz: TimeZone>(now: &DateTime<Tz>) -> DateTime<Utc> {
    let first = NaiveDate::from_ymd_opt(now.year(), now.month(), 1)
        .unwrap_or_else(|| now.date_naive())
        .and_time(chrono::NaiveTime::MIN);
    now.timezone()
        .from_local_datetime(&first)
        .earliest()
        .map_or_else(|| Utc.from_utc_datetime(&first), |t| t.with_timezone(&Utc))
}

/// Compute daily, weekly and monthly rollups as seen from `now`.
///
/// Each action lands in exactly one daily bucket and counts toward the
/// weekly and monthly tallies whose window contains its timestamp.
pub fn compute_stats<'a, Tz, I>(actions: I, now: &DateTime<Tz>) -> Stats
where
    Tz: TimeZone,
    I: IntoIterator<Item = &'a ActionRecord>,
{
    let tz = now.timezone();
    let now_utc = now.with_timezone(&Utc);
    let week_from = week_start(now);
    let month_from = month_start(now);

    let mut by_date: BTreeMap<NaiveDate, Tally> = BTreeMap::new();
    let mut weekly = Tally::default();
    let mut monthly = Tally::default();

    for action in actions {
        let date = action.timestamp.with_timezone(&tz).date_naive();
        by_date.entry(date).or_default().record(action.kind);

        if action.timestamp > now_utc {
            continue;
        }
        if action.timestamp >= week_from {
            weekly.record(action.kind);
        }
        if action.timestamp >= month_from {
            monthly.record(action.kind);
        }
    }

    let daily = by_date
        .into_iter()
        .rev()
        .map(|(date, tally)| DailyStats { date, tally })
        .collect();

    Stats {
        daily,
        weekly,
        monthly,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::action::ActionId;
    use crate::counter::CounterId;
    use chrono::FixedOffset;

    fn at(id: i64, kind: ActionKind, rfc3339: &str) -> ActionRecord {
        ActionRecord {
            id: ActionId::new(id),
            counter_id: CounterId::new(1),
            kind,
            timestamp: DateTime::parse_from_rfc3339(rfc3339)
                .unwrap()
                .with_timezone(&Utc),
        }
    }

    fn utc(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn daily_buckets_sorted_most_recent_first() {
        let actions = [
            at(1, ActionKind::Increment, "2024-01-01T10:00:00Z"),
            at(2, ActionKind::Increment, "2024-01-01T11:00:00Z"),
            at(3, ActionKind::Decrement, "2024-01-02T09:00:00Z"),
        ];
        let stats = compute_stats(&actions, &utc("2024-01-03T12:00:00Z"));

        assert_eq!(stats.daily.len(), 2);
        assert_eq!(stats.daily[0].date, NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
        assert_eq!(stats.daily[0].tally.decrements, 1);
        assert_eq!(stats.daily[0].tally.increments, 0);
        assert_eq!(stats.daily[1].date, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
        assert_eq!(stats.daily[1].tally.increments, 2);
    }

    #[test]
    fn weekly_window_starts_on_sunday() {
        // 2024-01-10 is a Wednesday; the week starts Sunday 2024-01-07 at 12:00.
        let now = utc("2024-01-10T12:00:00Z");
        let actions = [
            at(1, ActionKind::Increment, "2024-01-06T23:00:00Z"),
            at(2, ActionKind::Increment, "2024-01-07T12:00:00Z"),
            at(3, ActionKind::Reset, "2024-01-09T08:00:00Z"),
        ];
        let stats = compute_stats(&actions, &now);

        assert_eq!(stats.weekly.increments, 1);
        assert_eq!(stats.weekly.resets, 1);
        assert_eq!(stats.monthly.increments, 2);
        assert_eq!(stats.monthly.resets, 1);
    }

    #[test]
    fn monthly_window_excludes_previous_month() {
        let now = utc("2024-02-03T10:00:00Z");
        let actions = [
            at(1, ActionKind::Decrement, "2024-01-31T23:59:59Z"),
            at(2, ActionKind::Decrement, "2024-02-01T00:00:00Z"),
        ];
        let stats = compute_stats(&actions, &now);
        assert_eq!(stats.monthly.decrements, 1);
        // Both fall inside the week starting Sunday 2024-01-28.
        assert_eq!(stats.weekly.decrements, 2);
    }

    #[test]
    fn action_counts_toward_week_and_month_at_once() {
        let now = utc("2024-03-14T18:00:00Z");
        let actions = [at(1, ActionKind::Increment, "2024-03-13T09:00:00Z")];
        let stats = compute_stats(&actions, &now);
        assert_eq!(stats.weekly.increments, 1);
        assert_eq!(stats.monthly.increments, 1);
        assert_eq!(stats.daily[0].tally.total(), 1);
    }

    #[test]
    fn future_actions_only_land_in_daily() {
        let now = utc("2024-03-14T18:00:00Z");
        let actions = [at(1, ActionKind::Increment, "2024-03-14T19:00:00Z")];
        let stats = compute_stats(&actions, &now);
        assert_eq!(stats.weekly.total(), 0);
        assert_eq!(stats.monthly.total(), 0);
        assert_eq!(stats.daily.len(), 1);
    }

    #[test]
    fn daily_date_uses_local_zone() {
        let paris = FixedOffset::east_opt(3600).unwrap();
        let now = utc("2024-01-02T12:00:00Z").with_timezone(&paris);
        let actions = [at(1, ActionKind::Increment, "2024-01-01T23:30:00Z")];
        let stats = compute_stats(&actions, &now);
        assert_eq!(stats.daily[0].date, NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
    }

    #[test]
    fn csv_export_shape() {
        let actions = [
            at(1, ActionKind::Increment, "2024-01-01T10:00:00Z"),
            at(2, ActionKind::Decrement, "2024-01-02T10:00:00Z"),
        ];
        let stats = compute_stats(&actions, &utc("2024-01-02T12:00:00Z"));
        let csv = stats.to_csv(NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
        let lines: Vec<&str> = csv.lines().collect();

        assert_eq!(lines[0], "Statistic,Period,Increments,Decrements,Resets");
        assert_eq!(lines[1], "Monthly,2024-01-02,1,1,0");
        assert_eq!(lines[2], "Weekly,2024-01-02,1,1,0");
        assert_eq!(lines[3], "");
        assert_eq!(lines[4], "Date,Increments,Decrements,Resets");
        assert_eq!(lines[5], "2024-01-02,0,1,0");
        assert_eq!(lines[6], "2024-01-01,1,0,0");
    }
}
