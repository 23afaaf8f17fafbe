//! `ScheduleEntry` and the recurrence rules that drive it.

use chrono::{Datelike, NaiveDateTime, TimeZone, Timelike, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// A recurrence rule: a pure function of `(last_fire_ts, tz) -> next_fire_ts`.
/// Implementations must not consult global or mutable state — the entire
/// point of this trait is that two hosts computing the same entry's next
/// fire time from the same checkpoint converge on the same answer.
pub trait Recurrence: Send + Sync {
    fn next_fire_ts(&self, last_fire_ts: u64, tz: Tz) -> u64;
}

/// `next_fire_ts = last_fire_ts + period_secs`. DST-insensitive by
/// construction: it's pure arithmetic on Unix seconds, so `tz` is ignored.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FixedInterval {
    pub period_secs: u64,
}

impl Recurrence for FixedInterval {
    fn next_fire_ts(&self, last_fire_ts: u64, _tz: Tz) -> u64 {
        last_fire_ts + self.period_secs.max(1)
    }
}

/// Wall-clock-cron-style rule: fires at a specific local time of day,
/// optionally restricted to a set of weekdays. A 09:00 entry stays 09:00
/// local time across a DST transition because the arithmetic happens in
/// the timezone's local calendar, not in Unix seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyAt {
    pub hour: u32,
    pub minute: u32,
    pub second: u32,
    /// If `None`, fires every day.
    pub weekdays: Option<Vec<chrono::Weekday>>,
}

impl DailyAt {
    pub fn daily(hour: u32, minute: u32, second: u32) -> Self {
        DailyAt {
            hour,
            minute,
            second,
            weekdays: None,
        }
    }

    fn matches_weekday(&self, day: Weekday) -> bool {
        match &self.weekdays {
            None => true,
            Some(days) => days.contains(&day),
        }
    }
}

impl Recurrence for DailyAt {
    fn next_fire_ts(&self, last_fire_ts: u64, tz: Tz) -> u64 {
        let last_local = tz.timestamp_opt(last_fire_ts as i64, 0).unwrap();
        let mut candidate_date = last_local.date_naive();

        loop {
            let candidate_naive = NaiveDateTime::new(
                candidate_date,
                chrono::NaiveTime::from_hms_opt(self.hour, self.minute, self.second)
                    .expect("hour/minute/second must form a valid time of day"),
            );
            // Resolve the naive local time in the target timezone. On an
            // ambiguous (fall-back) local time prefer the earlier instant;
            // on a nonexistent (spring-forward) one, skip to the next day.
            let candidate_ts = match tz.from_local_datetime(&candidate_naive) {
                chrono::LocalResult::Single(dt) => Some(dt.timestamp()),
                chrono::LocalResult::Ambiguous(earlier, _later) => Some(earlier.timestamp()),
                chrono::LocalResult::None => None,
            };

            if let Some(ts) = candidate_ts {
                if ts > last_fire_ts as i64 && self.matches_weekday(candidate_date.weekday()) {
                    return ts as u64;
                }
            }
            candidate_date = candidate_date.succ_opt().expect("calendar date overflow");
        }
    }
}

/// A recurrence rule, erased to a trait object so `ScheduleEntry` doesn't
/// need to be generic over which rule it uses.
pub type BoxedRecurrence = Box<dyn Recurrence>;

/// A recurrence rule together with the entry metadata needed to materialize
/// `Task`s from it.
pub struct ScheduleEntry {
    pub key: String,
    pub group: String,
    pub name: String,
    pub data: Vec<u8>,
    pub ttl: u64,
    pub recurrence: BoxedRecurrence,
    /// If `true`, every missed fire (e.g. after the host was down a while)
    /// materializes its own task. If `false` (the default), consecutive
    /// missed fires coalesce into a single materialization at the most
    /// recent due slot.
    pub fire_all_missed: bool,
}

impl ScheduleEntry {
    pub fn new(
        key: impl Into<String>,
        group: impl Into<String>,
        name: impl Into<String>,
        data: Vec<u8>,
        ttl: u64,
        recurrence: BoxedRecurrence,
    ) -> Self {
        ScheduleEntry {
            key: key.into(),
            group: group.into(),
            name: name.into(),
            data,
            ttl,
            recurrence,
            fire_all_missed: false,
        }
    }

    pub fn fire_all_missed(mut self, value: bool) -> Self {
        self.fire_all_missed = value;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::UTC;

    #[test]
    fn fixed_interval_advances_by_period() {
        let rule = FixedInterval { period_secs: 60 };
        assert_eq!(rule.next_fire_ts(1_000, UTC), 1_060);
    }

    #[test]
    fn daily_at_finds_next_occurrence_same_day() {
        // 2024-01-01T00:00:00Z
        let rule = DailyAt::daily(9, 0, 0);
        let next = rule.next_fire_ts(1_704_067_200, UTC);
        // 2024-01-01T09:00:00Z
        assert_eq!(next, 1_704_099_600);
    }

    #[test]
    fn daily_at_rolls_to_next_day_once_time_has_passed() {
        let rule = DailyAt::daily(9, 0, 0);
        // last_fire_ts already past 09:00 on 2024-01-01
        let next = rule.next_fire_ts(1_704_099_600, UTC);
        // 2024-01-02T09:00:00Z
        assert_eq!(next, 1_704_186_000);
    }

    #[test]
    fn daily_at_restricted_to_weekdays() {
        // 2024-01-01 is a Monday.
        let rule = DailyAt {
            hour: 9,
            minute: 0,
            second: 0,
            weekdays: Some(vec![Weekday::Wed]),
        };
        let next = rule.next_fire_ts(1_704_067_200, UTC);
        // Next Wednesday 09:00 UTC is 2024-01-03T09:00:00Z.
        assert_eq!(next, 1_704_272_400);
    }
}
