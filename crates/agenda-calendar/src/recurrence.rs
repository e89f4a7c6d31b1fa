//! Recurrence evaluation backed by the `rrule` crate.
//!
//! All timestamps are naive. Floating and local times are both evaluated as UTC
//! wall-clock, which keeps instance starts on the same clock time as the master.

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use rrule::RRuleSet;

use crate::error::{CalendarError, CalendarResult};
use crate::types::{saturating_add, saturating_sub, StoredEvent};

/// Longest backwards search for a previous instance, in doublings of one day.
const MAX_LOOKBACK_STEPS: u32 = 20;

/// Parsed recurrence set for one stored event, exception dates included.
#[derive(Debug, Clone)]
pub struct Recurrence {
    set: RRuleSet,
    start: NaiveDateTime,
}

fn ical_stamp(dt: &NaiveDateTime) -> String {
    format!("{}Z", dt.format("%Y%m%dT%H%M%S"))
}

fn build_rule_text(event: &StoredEvent) -> String {
    let mut lines = vec![format!("DTSTART:{}", ical_stamp(&event.start))];

    for rule in &event.rrules {
        let body = rule.trim().trim_start_matches("RRULE:");
        lines.push(format!("RRULE:{body}"));
    }
    for exdate in &event.exdates {
        lines.push(format!("EXDATE:{}", ical_stamp(exdate)));
    }

    lines.join("\n")
}

fn to_tz(dt: NaiveDateTime) -> DateTime<rrule::Tz> {
    let tz: rrule::Tz = Utc.into();
    dt.and_utc().with_timezone(&tz)
}

impl Recurrence {
    /// Parse the event's rules. Fails for events without rules or with rules
    /// the parser rejects.
    pub fn from_event(event: &StoredEvent) -> CalendarResult<Self> {
        if !event.recurs() {
            return Err(CalendarError::InvalidEventData(format!(
                "event '{}' does not recur",
                event.uid
            )));
        }

        let set: RRuleSet = build_rule_text(event).parse().map_err(|e| {
            CalendarError::InvalidEventData(format!(
                "failed to parse recurrence for event '{}': {}",
                event.uid, e
            ))
        })?;

        Ok(Self {
            set,
            start: event.start,
        })
    }

    /// Instance starts in `[from, to)`, at most `limit` of them.
    ///
    /// The crate treats both bounds as exclusive, so the query is widened by a
    /// second on each side and filtered afterwards.
    pub fn starts_between(&self, from: NaiveDateTime, to: NaiveDateTime, limit: u16) -> Vec<NaiveDateTime> {
        if to <= from || limit == 0 {
            return Vec::new();
        }

        let result = self
            .set
            .clone()
            .after(to_tz(saturating_sub(from, Duration::seconds(1))))
            .before(to_tz(saturating_add(to, Duration::seconds(1))))
            .all(limit);

        if result.limited {
            tracing::debug!(limit, "Recurrence expansion hit the instance limit");
        }

        result
            .dates
            .iter()
            .map(|d| d.naive_utc())
            .filter(|d| *d >= from && *d < to)
            .collect()
    }

    /// Whether an instance starts exactly at `at`.
    pub fn recurs_at(&self, at: NaiveDateTime) -> bool {
        self.starts_between(at, saturating_add(at, Duration::seconds(1)), 2)
            .iter()
            .any(|d| *d == at)
    }

    /// First instance strictly after `at`.
    pub fn next_after(&self, at: NaiveDateTime) -> Option<NaiveDateTime> {
        let result = self.set.clone().after(to_tz(at)).all(2);
        result
            .dates
            .iter()
            .map(|d| d.naive_utc())
            .find(|d| *d > at)
    }

    /// Last instance strictly before `at`.
    pub fn previous_before(&self, at: NaiveDateTime) -> Option<NaiveDateTime> {
        if at <= self.start {
            return None;
        }

        let mut span = Duration::days(1);
        for _ in 0..MAX_LOOKBACK_STEPS {
            let from = saturating_sub(at, span).max(self.start);
            if let Some(last) = self.starts_between(from, at, u16::MAX).last() {
                return Some(*last);
            }
            if from == self.start {
                return None;
            }
            span = span + span;
        }
        None
    }
}
