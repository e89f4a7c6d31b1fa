//! Turning stored events into concrete occurrences for a date window.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};

use crate::recurrence::Recurrence;
use crate::types::{saturating_add, saturating_sub, DateRange, Occurrence, StoredEvent};

/// Whether an instance spanning `start..end` shows up in `window`.
///
/// An instance that starts before the window only counts when it ends after the
/// window's first midnight. All-day events end exactly at midnight of the next
/// day, so yesterday's all-day event does not leak into today.
pub fn overlaps_window(start: NaiveDateTime, end: NaiveDateTime, window: &DateRange) -> bool {
    let window_start = window.start();
    let start_date = start.date();
    let end_date = end.date();

    let spans_into = start_date < window_start
        && (end_date > window_start || (end_date == window_start && end.time() > NaiveTime::MIN));

    spans_into || window.contains(start_date)
}

/// Occurrences of one event overlapping `window`, in start order.
///
/// Recurring events with rules that fail to parse produce nothing.
pub fn expand_event(event: &StoredEvent, window: &DateRange, limit: u16) -> Vec<Occurrence> {
    if !event.recurs() {
        if overlaps_window(event.start, event.end, window) {
            return vec![Occurrence::new(event.uid.clone(), event.start, event.end)];
        }
        return Vec::new();
    }

    let recurrence = match Recurrence::from_event(event) {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(uid = %event.uid, "Skipping recurring event: {}", e);
            return Vec::new();
        }
    };

    let duration = event.duration();
    let from = saturating_sub(
        saturating_sub(window.start_of_range(), duration),
        Duration::days(1),
    );
    let to = saturating_add(window.end_of_range(), Duration::days(1));

    recurrence
        .starts_between(from, to, limit)
        .into_iter()
        .map(|start| Occurrence::new(event.uid.clone(), start, saturating_add(start, duration)))
        .filter(|occ| overlaps_window(occ.start_time, occ.end_time, window))
        .collect()
}

/// Expand every event outside `excluded` notebooks, sorted by start then uid.
pub fn expand_events<'a>(
    events: impl IntoIterator<Item = &'a StoredEvent>,
    window: &DateRange,
    excluded: &BTreeSet<String>,
    limit: u16,
) -> Vec<Occurrence> {
    let mut occurrences: Vec<Occurrence> = events
        .into_iter()
        .filter(|event| !excluded.contains(&event.notebook_uid))
        .flat_map(|event| expand_event(event, window, limit))
        .collect();

    occurrences.sort_by(|a, b| {
        a.start_time
            .cmp(&b.start_time)
            .then_with(|| a.event_uid.cmp(&b.event_uid))
    });
    occurrences
}

/// Occurrence nearest to `at`.
///
/// An instance starting exactly at `at` wins, then the next one after it, then
/// the last one before it for series that already ended. Without `at`, or for
/// single events, the event's own times are used.
pub fn next_occurrence(event: Option<&StoredEvent>, at: Option<NaiveDateTime>) -> Option<Occurrence> {
    let event = event?;
    let own = Occurrence::new(event.uid.clone(), event.start, event.end);

    let at = match at {
        Some(at) if event.recurs() => at,
        _ => return Some(own),
    };

    let recurrence = match Recurrence::from_event(event) {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(uid = %event.uid, "Cannot evaluate recurrence: {}", e);
            return Some(own);
        }
    };

    let start = if recurrence.recurs_at(at) {
        Some(at)
    } else {
        recurrence
            .next_after(at)
            .or_else(|| recurrence.previous_before(at))
    };

    Some(match start {
        Some(start) => Occurrence::new(event.uid.clone(), start, saturating_add(start, event.duration())),
        None => own,
    })
}

/// The instance of `event` starting exactly at `at`, if there is one.
pub fn occurrence_at(event: &StoredEvent, at: NaiveDateTime) -> Option<Occurrence> {
    let starts_at = if event.recurs() {
        match Recurrence::from_event(event) {
            Ok(recurrence) => recurrence.recurs_at(at),
            Err(e) => {
                tracing::warn!(uid = %event.uid, "Cannot evaluate recurrence: {}", e);
                false
            }
        }
    } else {
        event.start == at
    };

    starts_at.then(|| Occurrence::new(event.uid.clone(), at, saturating_add(at, event.duration())))
}

/// Ids of the occurrences touching each day of `ranges`.
pub fn daily_occurrences(
    ranges: &[DateRange],
    occurrences: &[Occurrence],
) -> BTreeMap<NaiveDate, Vec<String>> {
    let mut buckets: BTreeMap<NaiveDate, Vec<String>> = BTreeMap::new();

    for range in ranges {
        for day in range.days() {
            if buckets.contains_key(&day) {
                continue;
            }
            let day_window = DateRange::day(day);
            let ids = occurrences
                .iter()
                .filter(|occ| overlaps_window(occ.start_time, occ.end_time, &day_window))
                .map(Occurrence::id)
                .collect();
            buckets.insert(day, ids);
        }
    }

    buckets
}
