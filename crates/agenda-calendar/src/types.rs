//! Calendar data model shared by storage, worker and manager.

use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

/// Whether a timestamp follows the local zone or is floating clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum TimeSpec {
    #[default]
    LocalZone,
    ClockTime,
}

/// Recurrence classification exposed to views.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Recur {
    #[default]
    Once,
    Daily,
    Weekly,
    Biweekly,
    Monthly,
    Yearly,
    Custom,
}

impl Recur {
    /// Classify a set of RRULE strings the way the agenda presents them.
    ///
    /// Only a single rule with a plain frequency and a known interval maps to a
    /// named value; everything else is `Custom`.
    pub fn classify(rules: &[String]) -> Self {
        let rule = match rules {
            [] => return Recur::Once,
            [rule] => rule,
            _ => return Recur::Custom,
        };

        let body = rule.trim().trim_start_matches("RRULE:");
        let mut freq = None;
        let mut interval = 1u32;

        for part in body.split(';').filter(|p| !p.is_empty()) {
            let (key, value) = match part.split_once('=') {
                Some(kv) => kv,
                None => return Recur::Custom,
            };
            match key.to_ascii_uppercase().as_str() {
                "FREQ" => freq = Some(value.to_ascii_uppercase()),
                "INTERVAL" => match value.parse() {
                    Ok(v) => interval = v,
                    Err(_) => return Recur::Custom,
                },
                "COUNT" | "UNTIL" | "WKST" => {}
                _ => return Recur::Custom,
            }
        }

        match (freq.as_deref(), interval) {
            (Some("DAILY"), 1) => Recur::Daily,
            (Some("WEEKLY"), 1) => Recur::Weekly,
            (Some("WEEKLY"), 2) => Recur::Biweekly,
            (Some("MONTHLY"), 1) => Recur::Monthly,
            (Some("YEARLY"), 1) => Recur::Yearly,
            _ => Recur::Custom,
        }
    }
}

/// Reminder classification derived from an event's display alarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Reminder {
    #[default]
    None,
    AtTime,
    FiveMinutes,
    FifteenMinutes,
    ThirtyMinutes,
    OneHour,
    TwoHours,
    OneDay,
    TwoDays,
}

impl Reminder {
    /// Alarm offset relative to the event start, in seconds (negative = before).
    pub fn offset_seconds(self) -> Option<i64> {
        match self {
            Reminder::None => None,
            Reminder::AtTime => Some(0),
            Reminder::FiveMinutes => Some(-5 * 60),
            Reminder::FifteenMinutes => Some(-15 * 60),
            Reminder::ThirtyMinutes => Some(-30 * 60),
            Reminder::OneHour => Some(-60 * 60),
            Reminder::TwoHours => Some(-2 * 60 * 60),
            Reminder::OneDay => Some(-24 * 60 * 60),
            Reminder::TwoDays => Some(-2 * 24 * 60 * 60),
        }
    }

    pub fn from_offset_seconds(seconds: i64) -> Self {
        match seconds {
            0 => Reminder::AtTime,
            -300 => Reminder::FiveMinutes,
            -900 => Reminder::FifteenMinutes,
            -1800 => Reminder::ThirtyMinutes,
            -3600 => Reminder::OneHour,
            -7200 => Reminder::TwoHours,
            -86400 => Reminder::OneDay,
            -172800 => Reminder::TwoDays,
            _ => Reminder::None,
        }
    }
}

/// Alarm attached to a stored event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Alarm {
    /// Notification shown `offset_seconds` relative to the start.
    Display { offset_seconds: i64 },
    /// External program invoked when the event fires.
    Procedure { program: String, arguments: String },
}

/// Event record as the storage collaborator hands it out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub uid: String,
    pub summary: String,
    pub description: String,
    pub location: String,
    pub start: NaiveDateTime,
    /// For all-day events this is midnight after the last day.
    pub end: NaiveDateTime,
    #[serde(default)]
    pub time_spec: TimeSpec,
    pub all_day: bool,
    #[serde(default)]
    pub rrules: Vec<String>,
    #[serde(default)]
    pub exdates: Vec<NaiveDateTime>,
    #[serde(default)]
    pub alarms: Vec<Alarm>,
    pub notebook_uid: String,
}

impl StoredEvent {
    pub fn recurs(&self) -> bool {
        !self.rrules.is_empty()
    }

    /// Length of one instance; never negative.
    pub fn duration(&self) -> Duration {
        (self.end - self.start).max(Duration::zero())
    }
}

/// Front-end view of an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub unique_id: String,
    pub display_label: String,
    pub description: String,
    pub location: String,
    pub start_time: NaiveDateTime,
    pub end_time: NaiveDateTime,
    pub time_spec: TimeSpec,
    pub all_day: bool,
    pub recur: Recur,
    pub recur_exception_dates: Vec<NaiveDateTime>,
    pub reminder: Reminder,
    pub alarm_program: Option<String>,
    pub calendar_uid: String,
    pub readonly: bool,
}

impl Event {
    /// Build the front-end view of a stored event.
    pub fn from_stored(stored: &StoredEvent, readonly: bool) -> Self {
        let alarm_program = stored.alarms.iter().find_map(|alarm| match alarm {
            Alarm::Procedure { program, arguments } if *arguments == stored.uid => {
                Some(program.clone())
            }
            _ => None,
        });

        let mut display_alarms = stored.alarms.iter().filter_map(|alarm| match alarm {
            Alarm::Display { offset_seconds } => Some(*offset_seconds),
            Alarm::Procedure { .. } => None,
        });
        let reminder = match (display_alarms.next(), display_alarms.next()) {
            (Some(offset), None) => Reminder::from_offset_seconds(offset),
            _ => Reminder::None,
        };

        Self {
            unique_id: stored.uid.clone(),
            display_label: stored.summary.clone(),
            description: stored.description.clone(),
            location: stored.location.clone(),
            start_time: stored.start,
            end_time: stored.end,
            time_spec: stored.time_spec,
            all_day: stored.all_day,
            recur: Recur::classify(&stored.rrules),
            recur_exception_dates: normalize_exceptions(stored.exdates.clone()),
            reminder,
            alarm_program,
            calendar_uid: stored.notebook_uid.clone(),
            readonly,
        }
    }
}

/// Sort and deduplicate an exception list.
pub fn normalize_exceptions(mut exceptions: Vec<NaiveDateTime>) -> Vec<NaiveDateTime> {
    exceptions.sort();
    exceptions.dedup();
    exceptions
}

/// One concrete instance of an event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Occurrence {
    pub event_uid: String,
    pub start_time: NaiveDateTime,
    pub end_time: NaiveDateTime,
}

impl Occurrence {
    pub fn new(event_uid: impl Into<String>, start_time: NaiveDateTime, end_time: NaiveDateTime) -> Self {
        Self {
            event_uid: event_uid.into(),
            start_time,
            end_time: end_time.max(start_time),
        }
    }

    /// Stable key: event uid plus the calendar day the instance starts on.
    pub fn id(&self) -> String {
        let day_start = self.start_time.date().and_time(NaiveTime::MIN);
        format!("{}-{}", self.event_uid, day_start.and_utc().timestamp_millis())
    }
}

/// Closed interval of calendar days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    start: NaiveDate,
    end: NaiveDate,
}

impl DateRange {
    /// A missing or earlier end collapses to a single day range.
    pub fn new(start: NaiveDate, end: Option<NaiveDate>) -> Self {
        let end = end.map_or(start, |end| end.max(start));
        Self { start, end }
    }

    pub fn day(date: NaiveDate) -> Self {
        Self::new(date, None)
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn end(&self) -> NaiveDate {
        self.end
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    pub fn covers(&self, other: &DateRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn num_days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    /// Every day in the range, in order.
    pub fn days(&self) -> impl Iterator<Item = NaiveDate> {
        let end = self.end;
        self.start.iter_days().take_while(move |d| *d <= end)
    }

    /// First instant of the range.
    pub fn start_of_range(&self) -> NaiveDateTime {
        self.start.and_time(NaiveTime::MIN)
    }

    /// Midnight after the last day.
    pub fn end_of_range(&self) -> NaiveDateTime {
        saturating_add(self.end.and_time(NaiveTime::MIN), Duration::days(1))
    }

    /// Whether an event spanning `start..end` may touch the range. This is the
    /// same test storage uses to pick events for a range.
    pub fn intersects(&self, start: NaiveDateTime, end: NaiveDateTime) -> bool {
        start < self.end_of_range() && end >= self.start_of_range()
    }
}

/// `at + delta`, clamped to the representable range.
pub fn saturating_add(at: NaiveDateTime, delta: Duration) -> NaiveDateTime {
    at.checked_add_signed(delta).unwrap_or(if delta < Duration::zero() {
        NaiveDateTime::MIN
    } else {
        NaiveDateTime::MAX
    })
}

/// `at - delta`, clamped to the representable range.
pub fn saturating_sub(at: NaiveDateTime, delta: Duration) -> NaiveDateTime {
    at.checked_sub_signed(delta).unwrap_or(if delta < Duration::zero() {
        NaiveDateTime::MAX
    } else {
        NaiveDateTime::MIN
    })
}

/// Notebook as tracked by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notebook {
    pub uid: String,
    pub name: String,
    pub description: String,
    pub color: String,
    pub is_default: bool,
    pub read_only: bool,
    pub local_calendar: bool,
    pub excluded: bool,
}

/// Notebook metadata as the storage collaborator hands it out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct NotebookRecord {
    pub uid: String,
    pub name: String,
    pub description: String,
    pub color: Option<String>,
    pub is_default: bool,
    pub read_only: bool,
    pub is_master: bool,
    pub is_shared: bool,
    pub plugin_name: String,
}

impl NotebookRecord {
    /// Stored on this device only: not synced by a plugin and not shared.
    pub fn is_local(&self) -> bool {
        self.is_master && !self.is_shared && self.plugin_name.is_empty()
    }
}
