//! Coalescing of view date ranges into minimal storage queries.

use chrono::{Duration, NaiveDate};

use crate::types::DateRange;

/// One storage query range together with the requests it covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedRange<V> {
    pub range: DateRange,
    pub members: Vec<(DateRange, V)>,
}

/// Merge requested ranges into disjoint covering ranges.
///
/// With `merge_adjacent` a range starting the day after a bucket ends joins
/// that bucket (Jan 5-10 and Jan 11-15 become one Jan 5-15 query). Without it
/// only overlapping ranges are merged. Every request lands in exactly one
/// bucket.
pub fn merge_ranges<V>(requests: Vec<(DateRange, V)>, merge_adjacent: bool) -> Vec<MergedRange<V>> {
    let mut requests = requests;
    requests.sort_by_key(|(range, _)| range.start());

    let reach = if merge_adjacent {
        Duration::days(1)
    } else {
        Duration::zero()
    };

    let mut merged: Vec<MergedRange<V>> = Vec::new();
    for (range, member) in requests {
        match merged.last_mut() {
            Some(bucket)
                if range.start()
                    <= bucket
                        .range
                        .end()
                        .checked_add_signed(reach)
                        .unwrap_or(NaiveDate::MAX) =>
            {
                let end = bucket.range.end().max(range.end());
                bucket.range = DateRange::new(bucket.range.start(), Some(end));
                bucket.members.push((range, member));
            }
            _ => merged.push(MergedRange {
                range,
                members: vec![(range, member)],
            }),
        }
    }
    merged
}
