//! Schedule matching.
//!
//! A [`Schedule`] fires when the current moment matches its calendar
//! pattern and its `interval` gate (if any) has opened since
//! `lastExecutedDateTime`.

use chrono::{Datelike, NaiveDateTime, Timelike, Weekday};

use crate::catalog::ArchiveType;

/// A single date/time field that is either "any" (the wildcard `*`) or a
/// concrete value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateField {
    Any,
    Value(u32),
}

impl DateField {
    fn matches(self, value: u32) -> bool {
        match self {
            DateField::Any => true,
            DateField::Value(v) => v == value,
        }
    }
}

/// Monday..Sunday bitmask, or "any" (every bit set is equivalent but kept
/// distinct so a schedule that explicitly lists all seven days round-trips
/// the same way the original file did).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeekdaySet {
    Any,
    Days(u8),
}

const MON: u8 = 1 << 0;
const TUE: u8 = 1 << 1;
const WED: u8 = 1 << 2;
const THU: u8 = 1 << 3;
const FRI: u8 = 1 << 4;
const SAT: u8 = 1 << 5;
const SUN: u8 = 1 << 6;

impl WeekdaySet {
    pub fn bit_for(weekday: Weekday) -> u8 {
        match weekday {
            Weekday::Mon => MON,
            Weekday::Tue => TUE,
            Weekday::Wed => WED,
            Weekday::Thu => THU,
            Weekday::Fri => FRI,
            Weekday::Sat => SAT,
            Weekday::Sun => SUN,
        }
    }

    fn matches(self, weekday: Weekday) -> bool {
        match self {
            WeekdaySet::Any => true,
            WeekdaySet::Days(mask) => mask & Self::bit_for(weekday) != 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    pub uuid: String,
    pub parent_uuid: Option<String>,
    pub year: DateField,
    pub month: DateField,
    pub day: DateField,
    pub weekdays: WeekdaySet,
    pub hour: DateField,
    pub minute: DateField,
    pub archive_type: ArchiveType,
    /// Minimum gap in seconds from `last_executed`, 0 meaning no gating.
    pub interval: u64,
    pub custom_text: Option<String>,
    pub enabled: bool,
    pub no_storage: bool,
    pub last_executed: Option<i64>,
}

impl Schedule {
    /// Content-equality ignoring `uuid`/`parent_uuid`/`last_executed`, used
    /// to discard duplicate `[schedule]` sections on load.
    pub fn content_eq(&self, other: &Schedule) -> bool {
        self.year == other.year
            && self.month == other.month
            && self.day == other.day
            && self.weekdays == other.weekdays
            && self.hour == other.hour
            && self.minute == other.minute
            && self.archive_type == other.archive_type
            && self.interval == other.interval
            && self.custom_text == other.custom_text
            && self.enabled == other.enabled
            && self.no_storage == other.no_storage
    }

    /// Whether `now` falls on this schedule's calendar pattern, irrespective
    /// of the interval gate.
    pub fn pattern_matches(&self, now: &NaiveDateTime) -> bool {
        self.year.matches(now.year() as u32)
            && self.month.matches(now.month())
            && self.day.matches(now.day())
            && self.weekdays.matches(now.weekday())
            && self.hour.matches(now.hour())
            && self.minute.matches(now.minute())
    }

    /// Whether the `interval` gate has opened since `last_executed`. An
    /// interval of 0 means no gating.
    pub fn interval_open(&self, now_epoch: i64) -> bool {
        if self.interval == 0 {
            return true;
        }
        match self.last_executed {
            None => true,
            Some(last) => now_epoch - last >= self.interval as i64,
        }
    }

    /// Whether this schedule should trigger right now: enabled, pattern
    /// matches, and the interval gate is open.
    pub fn should_trigger(&self, now: &NaiveDateTime) -> bool {
        self.enabled && self.pattern_matches(now) && self.interval_open(now.timestamp())
    }
}

/// Appends `schedule` to `schedules` unless a content-equal entry is
/// already present.
pub fn insert_deduped(schedules: &mut Vec<Schedule>, schedule: Schedule) {
    if !schedules.iter().any(|s| s.content_eq(&schedule)) {
        schedules.push(schedule);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_schedule() -> Schedule {
        Schedule {
            uuid: "u1".into(),
            parent_uuid: None,
            year: DateField::Any,
            month: DateField::Any,
            day: DateField::Any,
            weekdays: WeekdaySet::Any,
            hour: DateField::Value(3),
            minute: DateField::Value(0),
            archive_type: ArchiveType::Full,
            interval: 0,
            custom_text: None,
            enabled: true,
            no_storage: false,
            last_executed: None,
        }
    }

    #[test]
    fn pattern_matches_any_wildcards() {
        let s = base_schedule();
        let now = chrono::NaiveDate::from_ymd(2026, 7, 27)
            .and_hms(3, 0, 0);
        assert!(s.should_trigger(&now));
        let not_now = chrono::NaiveDate::from_ymd(2026, 7, 27).and_hms(3, 1, 0);
        assert!(!s.should_trigger(&not_now));
    }

    #[test]
    fn interval_gates_repeated_firing() {
        let mut s = base_schedule();
        s.interval = 3600;
        s.last_executed = Some(1_700_000_000);
        assert!(!s.interval_open(1_700_000_100));
        assert!(s.interval_open(1_700_003_600));
    }

    #[test]
    fn weekday_restriction() {
        let mut s = base_schedule();
        s.weekdays = WeekdaySet::Days(WeekdaySet::bit_for(Weekday::Mon));
        // 2026-07-27 is a Monday.
        let monday = chrono::NaiveDate::from_ymd(2026, 7, 27).and_hms(3, 0, 0);
        let tuesday = chrono::NaiveDate::from_ymd(2026, 7, 28).and_hms(3, 0, 0);
        assert!(s.should_trigger(&monday));
        assert!(!s.should_trigger(&tuesday));
    }

    #[test]
    fn dedup_discards_identical_content() {
        let mut schedules = Vec::new();
        let s1 = base_schedule();
        let mut s2 = base_schedule();
        s2.uuid = "u2".into(); // different uuid, identical content
        insert_deduped(&mut schedules, s1);
        insert_deduped(&mut schedules, s2);
        assert_eq!(schedules.len(), 1);
    }
}
