//! Integration tests for CalendarManager against an in-memory SQLite store.
//!
//! A wrapper store counts range loads, can hold them behind a gate to keep a
//! request in flight, and can fail loads of ranges from a given day on.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agenda_calendar::{
    CalendarError, CalendarManager, CalendarResult, CalendarStorage, DateRange, HandleChange,
    ManagerNotification, MemorySettings, NotebookRecord, Occurrence, SettingsStore, SqliteStorage,
    StorageObserver, StoredEvent, TimeSpec, ViewId, ViewStatus,
};
use agenda_core::{CalendarConfig, DatabaseError};
use chrono::{NaiveDate, NaiveDateTime};
use parking_lot::Mutex;

const TIMEOUT: Duration = Duration::from_secs(10);

struct TestStorage {
    inner: SqliteStorage,
    range_loads: AtomicUsize,
    fail_from: Mutex<Option<NaiveDate>>,
    gate: Mutex<()>,
}

impl TestStorage {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: SqliteStorage::in_memory().unwrap(),
            range_loads: AtomicUsize::new(0),
            fail_from: Mutex::new(None),
            gate: Mutex::new(()),
        })
    }

    fn range_loads(&self) -> usize {
        self.range_loads.load(Ordering::SeqCst)
    }

    fn fail_ranges_from(&self, first: NaiveDate) {
        *self.fail_from.lock() = Some(first);
    }
}

impl CalendarStorage for TestStorage {
    fn load_range(&self, range: &DateRange) -> CalendarResult<Vec<StoredEvent>> {
        let _gate = self.gate.lock();
        self.range_loads.fetch_add(1, Ordering::SeqCst);
        if self.fail_from.lock().is_some_and(|first| range.start() >= first) {
            return Err(CalendarError::Storage(DatabaseError::QueryFailed(
                "disk unavailable".into(),
            )));
        }
        self.inner.load_range(range)
    }

    fn load_recurring(&self) -> CalendarResult<Vec<StoredEvent>> {
        self.inner.load_recurring()
    }

    fn notebooks(&self) -> CalendarResult<Vec<NotebookRecord>> {
        self.inner.notebooks()
    }

    fn notebook_is_read_only(&self, uid: &str) -> CalendarResult<bool> {
        self.inner.notebook_is_read_only(uid)
    }

    fn event(&self, uid: &str) -> CalendarResult<Option<StoredEvent>> {
        self.inner.event(uid)
    }

    fn subscribe(&self, observer: StorageObserver) {
        self.inner.subscribe(observer)
    }

    fn set_exceptions(&self, uid: &str, exceptions: &[NaiveDateTime]) -> CalendarResult<()> {
        self.inner.set_exceptions(uid, exceptions)
    }

    fn delete_event(&self, uid: &str) -> CalendarResult<()> {
        self.inner.delete_event(uid)
    }
}

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
}

fn at(d: u32, h: u32) -> NaiveDateTime {
    day(d).and_hms_opt(h, 0, 0).unwrap()
}

fn range(from: u32, to: u32) -> DateRange {
    DateRange::new(day(from), Some(day(to)))
}

fn notebook(uid: &str, read_only: bool) -> NotebookRecord {
    NotebookRecord {
        uid: uid.into(),
        name: uid.into(),
        read_only,
        is_master: true,
        ..Default::default()
    }
}

fn event(uid: &str, notebook: &str, start: NaiveDateTime) -> StoredEvent {
    StoredEvent {
        uid: uid.into(),
        summary: uid.into(),
        description: String::new(),
        location: String::new(),
        start,
        end: start + chrono::Duration::hours(1),
        time_spec: TimeSpec::LocalZone,
        all_day: false,
        rrules: vec![],
        exdates: vec![],
        alarms: vec![],
        notebook_uid: notebook.into(),
    }
}

struct Fixture {
    runtime: tokio::runtime::Runtime,
    storage: Arc<TestStorage>,
    settings: Arc<MemorySettings>,
}

impl Fixture {
    fn new() -> Self {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let storage = TestStorage::new();
        storage.inner.store_notebook(&notebook("personal", false)).unwrap();
        storage.inner.store_notebook(&notebook("work", false)).unwrap();
        storage.inner.store_notebook(&notebook("shared", true)).unwrap();

        storage.inner.store_event(&event("breakfast", "personal", at(6, 8))).unwrap();
        storage.inner.store_event(&event("standup", "work", at(6, 9))).unwrap();
        storage.inner.store_event(&event("review", "work", at(12, 14))).unwrap();
        storage.inner.store_event(&event("holiday", "shared", at(20, 10))).unwrap();

        Self {
            runtime,
            storage,
            settings: Arc::new(MemorySettings::new()),
        }
    }

    fn manager(&self) -> CalendarManager {
        CalendarManager::new(
            self.storage.clone(),
            self.settings.clone(),
            self.runtime.handle(),
            &CalendarConfig::default(),
        )
    }
}

type Deliveries = Rc<RefCell<Vec<Vec<Occurrence>>>>;

fn recorder() -> (Deliveries, impl FnMut(ViewId, &[Occurrence])) {
    let log: Deliveries = Rc::new(RefCell::new(Vec::new()));
    let sink = log.clone();
    (log, move |_: ViewId, occurrences: &[Occurrence]| {
        sink.borrow_mut().push(occurrences.to_vec())
    })
}

fn uids(occurrences: &[Occurrence]) -> Vec<&str> {
    occurrences.iter().map(|o| o.event_uid.as_str()).collect()
}

#[test]
fn test_overlapping_views_share_one_load() {
    let fixture = Fixture::new();
    let mut manager = fixture.manager();

    let (first_log, first) = recorder();
    let (second_log, second) = recorder();
    manager.register_view(range(5, 10), first);
    manager.register_view(range(8, 15), second);

    assert!(manager.wait_for_idle(TIMEOUT));
    assert_eq!(fixture.storage.range_loads(), 1);

    assert_eq!(first_log.borrow().len(), 1);
    assert_eq!(uids(&first_log.borrow()[0]), vec!["breakfast", "standup"]);
    assert_eq!(second_log.borrow().len(), 1);
    assert_eq!(uids(&second_log.borrow()[0]), vec!["review"]);
}

#[test]
fn test_adjacent_views_merge_but_gaps_do_not() {
    let fixture = Fixture::new();
    let mut manager = fixture.manager();

    let (_a, first) = recorder();
    let (_b, second) = recorder();
    let (_c, third) = recorder();
    manager.register_view(range(5, 10), first);
    manager.register_view(range(11, 15), second);
    manager.register_view(range(20, 21), third);

    assert!(manager.wait_for_idle(TIMEOUT));
    assert_eq!(fixture.storage.range_loads(), 2);
}

#[test]
fn test_range_changes_before_pass_are_debounced() {
    let fixture = Fixture::new();
    let mut manager = fixture.manager();

    let (log, callback) = recorder();
    let view = manager.register_view(DateRange::day(day(6)), callback);
    assert!(manager.wait_for_idle(TIMEOUT));
    let loads = fixture.storage.range_loads();

    manager.update_range(view, DateRange::day(day(7)));
    manager.update_range(view, DateRange::day(day(8)));
    manager.update_range(view, DateRange::day(day(12)));
    assert_eq!(manager.view_status(view), Some(ViewStatus::Dirty));

    assert!(manager.wait_for_idle(TIMEOUT));
    assert_eq!(fixture.storage.range_loads(), loads + 1);
    assert_eq!(log.borrow().len(), 2);
    assert_eq!(uids(&log.borrow()[1]), vec!["review"]);
    assert_eq!(manager.view_status(view), Some(ViewStatus::Clean));
}

#[test]
fn test_superseded_range_is_not_delivered() {
    let fixture = Fixture::new();
    let mut manager = fixture.manager();

    let (log, callback) = recorder();
    let view = manager.register_view(DateRange::day(day(1)), callback);
    assert!(manager.wait_for_idle(TIMEOUT));
    assert_eq!(log.borrow().len(), 1);

    let gate = fixture.storage.gate.lock();
    manager.update_range(view, DateRange::day(day(6)));
    manager.process_events();
    assert_eq!(manager.view_status(view), Some(ViewStatus::Loading));

    manager.update_range(view, DateRange::day(day(12)));
    manager.process_events();
    drop(gate);

    assert!(manager.wait_for_idle(TIMEOUT));
    let deliveries = log.borrow();
    assert_eq!(deliveries.len(), 2);
    assert_eq!(uids(&deliveries[1]), vec!["review"]);
}

#[test]
fn test_unregistered_view_gets_nothing_from_inflight_load() {
    let fixture = Fixture::new();
    let mut manager = fixture.manager();

    let (log, callback) = recorder();
    let view = manager.register_view(DateRange::day(day(1)), callback);
    assert!(manager.wait_for_idle(TIMEOUT));

    let gate = fixture.storage.gate.lock();
    manager.update_range(view, DateRange::day(day(6)));
    manager.process_events();
    manager.unregister_view(view);
    drop(gate);

    assert!(manager.wait_for_idle(TIMEOUT));
    assert_eq!(log.borrow().len(), 1);
    assert_eq!(manager.view_status(view), None);
}

#[test]
fn test_failed_load_keeps_previous_delivery() {
    let fixture = Fixture::new();
    let mut manager = fixture.manager();

    let (log, callback) = recorder();
    let view = manager.register_view(DateRange::day(day(6)), callback);
    assert!(manager.wait_for_idle(TIMEOUT));

    fixture.storage.fail_ranges_from(NaiveDate::MIN);
    manager.update_range(view, DateRange::day(day(12)));
    assert!(manager.wait_for_idle(TIMEOUT));

    assert_eq!(log.borrow().len(), 1);
    assert_eq!(manager.view_status(view), Some(ViewStatus::Clean));
    assert_eq!(uids(manager.view_occurrences(view).unwrap()), vec!["breakfast", "standup"]);
}

#[test]
fn test_exclusion_round_trip() {
    let fixture = Fixture::new();
    let mut manager = fixture.manager();

    let notifications = Rc::new(RefCell::new(Vec::new()));
    let sink = notifications.clone();
    manager.subscribe(move |n| sink.borrow_mut().push(n.clone()));

    let (log, callback) = recorder();
    manager.register_view(DateRange::day(day(6)), callback);
    assert!(manager.wait_for_idle(TIMEOUT));

    manager.exclude_notebook("work", true);
    assert!(manager.wait_for_idle(TIMEOUT));
    assert_eq!(uids(log.borrow().last().unwrap()), vec!["breakfast"]);
    assert_eq!(manager.excluded_notebooks(), BTreeSet::from(["work".to_string()]));
    assert!(fixture.settings.bool_value("exclude/work", false));
    assert!(notifications
        .borrow()
        .contains(&ManagerNotification::ExcludedNotebooksChanged));

    let deliveries = log.borrow().len();
    manager.exclude_notebook("work", true);
    assert!(manager.wait_for_idle(TIMEOUT));
    assert_eq!(log.borrow().len(), deliveries);

    manager.set_excluded_notebooks(&BTreeSet::new());
    assert!(manager.wait_for_idle(TIMEOUT));
    assert_eq!(uids(log.borrow().last().unwrap()), vec!["breakfast", "standup"]);
    assert_eq!(fixture.settings.value("exclude/work"), None);
}

#[test]
fn test_exclusion_survives_restart() {
    let fixture = Fixture::new();
    {
        let mut manager = fixture.manager();
        assert!(manager.wait_for_idle(TIMEOUT));
        manager.exclude_notebook("personal", true);
        manager.shutdown();
    }

    let mut manager = fixture.manager();
    let (log, callback) = recorder();
    manager.register_view(DateRange::day(day(6)), callback);
    assert!(manager.wait_for_idle(TIMEOUT));
    assert_eq!(uids(&log.borrow()[0]), vec!["standup"]);
}

#[test]
fn test_reload_marks_deleted_event_absent() {
    let fixture = Fixture::new();
    let mut manager = fixture.manager();

    let resets = Rc::new(RefCell::new(0));
    let counter = resets.clone();
    manager.subscribe(move |n| {
        if *n == ManagerNotification::ModelReset {
            *counter.borrow_mut() += 1;
        }
    });

    let (log, callback) = recorder();
    manager.register_view(DateRange::day(day(6)), callback);
    assert!(manager.wait_for_idle(TIMEOUT));

    let handle = manager.event_handle("standup");
    let far = manager.event_handle("holiday");
    assert!(handle.is_present());
    assert!(!far.is_present());

    let removed = Rc::new(RefCell::new(false));
    let flag = removed.clone();
    handle.subscribe(move |_, change| {
        if change == HandleChange::Removed {
            *flag.borrow_mut() = true;
        }
    });

    fixture.storage.inner.delete_event("standup").unwrap();
    assert!(manager.wait_for_idle(TIMEOUT));

    assert!(*removed.borrow());
    assert_eq!(handle.event(), None);
    assert_eq!(handle.last_known().unwrap().display_label, "standup");
    assert!(Rc::ptr_eq(&handle, &manager.event_handle("standup")));
    assert_eq!(manager.event("standup"), None);

    // Tracked handles outside every view are looked up on reset.
    assert!(far.is_present());
    assert_eq!(far.event().unwrap().calendar_uid, "shared");

    assert_eq!(uids(log.borrow().last().unwrap()), vec!["breakfast"]);
    assert_eq!(*resets.borrow(), 2);
}

#[test]
fn test_partial_reset_drops_events_missing_from_loaded_ranges() {
    let fixture = Fixture::new();
    fixture
        .storage
        .inner
        .store_event(&event("doomed", "personal", at(6, 12)))
        .unwrap();
    let mut manager = fixture.manager();

    let (near_log, near) = recorder();
    let (far_log, far) = recorder();
    manager.register_view(DateRange::day(day(6)), near);
    let far_view = manager.register_view(range(20, 25), far);
    assert!(manager.wait_for_idle(TIMEOUT));
    assert_eq!(
        uids(near_log.borrow().last().unwrap()),
        vec!["breakfast", "standup", "doomed"]
    );
    assert_eq!(uids(far_log.borrow().last().unwrap()), vec!["holiday"]);

    let handle = manager.event_handle("doomed");
    assert!(handle.is_present());

    fixture.storage.fail_ranges_from(day(20));
    fixture.storage.inner.delete_event("doomed").unwrap();
    assert!(manager.wait_for_idle(TIMEOUT));

    assert_eq!(
        uids(near_log.borrow().last().unwrap()),
        vec!["breakfast", "standup"]
    );
    assert_eq!(manager.event("doomed"), None);
    assert!(!handle.is_present());

    // The failed range keeps what it had.
    assert_eq!(far_log.borrow().len(), 1);
    assert_eq!(manager.view_status(far_view), Some(ViewStatus::Clean));
    assert!(manager.event("holiday").is_some());
}

#[test]
fn test_back_to_back_reloads_deliver_once() {
    let fixture = Fixture::new();
    let mut manager = fixture.manager();

    let resets = Rc::new(RefCell::new(0));
    let counter = resets.clone();
    manager.subscribe(move |n| {
        if *n == ManagerNotification::ModelReset {
            *counter.borrow_mut() += 1;
        }
    });

    let (log, callback) = recorder();
    manager.register_view(DateRange::day(day(6)), callback);
    assert!(manager.wait_for_idle(TIMEOUT));
    assert_eq!(log.borrow().len(), 1);
    let loads = fixture.storage.range_loads();

    manager.request_full_reload();
    manager.request_full_reload();
    assert!(manager.wait_for_idle(TIMEOUT));

    assert_eq!(log.borrow().len(), 2);
    assert_eq!(fixture.storage.range_loads(), loads + 1);
    assert_eq!(*resets.borrow(), 2);
    assert_eq!(uids(&log.borrow()[1]), vec!["breakfast", "standup"]);
}

#[test]
fn test_reload_supersedes_inflight_load() {
    let fixture = Fixture::new();
    let mut manager = fixture.manager();

    let (log, callback) = recorder();
    let view = manager.register_view(DateRange::day(day(1)), callback);
    assert!(manager.wait_for_idle(TIMEOUT));
    assert_eq!(log.borrow().len(), 1);

    let gate = fixture.storage.gate.lock();
    manager.update_range(view, DateRange::day(day(6)));
    manager.process_events();
    assert_eq!(manager.view_status(view), Some(ViewStatus::Loading));

    manager.request_full_reload();
    drop(gate);
    assert!(manager.wait_for_idle(TIMEOUT));

    let deliveries = log.borrow();
    assert_eq!(deliveries.len(), 2);
    assert_eq!(uids(&deliveries[1]), vec!["breakfast", "standup"]);
    assert_eq!(manager.view_status(view), Some(ViewStatus::Clean));
}

#[test]
fn test_events_of_deleted_notebook_are_not_delivered() {
    let fixture = Fixture::new();
    fixture
        .storage
        .inner
        .store_event(&event("orphan", "retired", at(6, 10)))
        .unwrap();
    let mut manager = fixture.manager();

    let (log, callback) = recorder();
    manager.register_view(DateRange::day(day(6)), callback);
    assert!(manager.wait_for_idle(TIMEOUT));

    assert_eq!(uids(log.borrow().last().unwrap()), vec!["breakfast", "standup"]);
    assert_eq!(manager.event("orphan"), None);
    assert!(!manager.event_handle("orphan").is_present());
}

#[test]
fn test_storage_notifier_triggers_reload() {
    let fixture = Fixture::new();
    let mut manager = fixture.manager();
    let (log, callback) = recorder();
    manager.register_view(DateRange::day(day(6)), callback);
    assert!(manager.wait_for_idle(TIMEOUT));

    let notifier = manager.storage_notifier();
    std::thread::spawn(move || notifier.notify("external sync"))
        .join()
        .unwrap();

    assert!(manager.wait_for_idle(TIMEOUT));
    assert_eq!(log.borrow().len(), 2);
    assert_eq!(log.borrow()[0], log.borrow()[1]);
}

#[test]
fn test_notebook_color_propagates_to_handles() {
    let fixture = Fixture::new();
    let mut manager = fixture.manager();
    let (_log, callback) = recorder();
    manager.register_view(DateRange::day(day(6)), callback);
    assert!(manager.wait_for_idle(TIMEOUT));

    assert_eq!(manager.notebook_color("personal"), "#00aeef");
    assert_eq!(manager.notebook_color("work"), "red");
    assert_eq!(manager.notebook_color("nope"), "black");

    let handle = manager.event_handle("standup");
    let changes = Rc::new(RefCell::new(Vec::new()));
    let sink = changes.clone();
    handle.subscribe(move |_, change| sink.borrow_mut().push(change));

    manager.set_notebook_color("work", "#123456");
    assert_eq!(handle.color().as_deref(), Some("#123456"));
    assert_eq!(*changes.borrow(), vec![HandleChange::Color]);
    assert_eq!(
        fixture.settings.string_value("colors/work").as_deref(),
        Some("#123456")
    );

    manager.set_notebook_color("work", "#123456");
    assert_eq!(changes.borrow().len(), 1);
}

#[test]
fn test_next_occurrence_falls_back_to_last_instance() {
    let fixture = Fixture::new();
    let mut series = event("weekly", "personal", at(1, 18));
    series.rrules = vec!["FREQ=WEEKLY;COUNT=3".into()];
    fixture.storage.inner.store_event(&series).unwrap();

    let mut manager = fixture.manager();
    let (_log, callback) = recorder();
    manager.register_view(DateRange::day(day(1)), callback);
    assert!(manager.wait_for_idle(TIMEOUT));

    let next = manager.next_occurrence("weekly", Some(at(9, 0))).unwrap();
    assert_eq!(next.start_time, at(15, 18));

    let exact = manager.next_occurrence("weekly", Some(at(8, 18))).unwrap();
    assert_eq!(exact.start_time, at(8, 18));

    let ended = manager.next_occurrence("weekly", Some(at(31, 0))).unwrap();
    assert_eq!(ended.start_time, at(15, 18));

    assert!(manager.next_occurrence("missing", Some(at(1, 0))).is_none());
    assert!(manager.occurrence("weekly", at(8, 18)).is_some());
    assert!(manager.occurrence("weekly", at(9, 18)).is_none());
}

#[test]
fn test_removing_one_instance_of_series() {
    let fixture = Fixture::new();
    let mut series = event("gym", "personal", at(1, 7));
    series.rrules = vec!["FREQ=DAILY".into()];
    fixture.storage.inner.store_event(&series).unwrap();

    let mut manager = fixture.manager();
    let (log, callback) = recorder();
    manager.register_view(range(2, 4), callback);
    assert!(manager.wait_for_idle(TIMEOUT));
    assert_eq!(log.borrow()[0].len(), 3);
    assert_eq!(manager.event_count_for_date(day(3)), 1);

    manager.remove_event("gym", Some(at(3, 7)));
    assert!(manager.wait_for_idle(TIMEOUT));

    let starts: Vec<_> = log
        .borrow()
        .last()
        .unwrap()
        .iter()
        .map(|o| o.start_time)
        .collect();
    assert_eq!(starts, vec![at(2, 7), at(4, 7)]);
    assert_eq!(manager.event_count_for_date(day(3)), 0);
    assert_eq!(
        fixture.storage.inner.event("gym").unwrap().unwrap().exdates,
        vec![at(3, 7)]
    );
}

#[test]
fn test_exception_edits() {
    let fixture = Fixture::new();
    let mut series = event("gym", "personal", at(1, 7));
    series.rrules = vec!["FREQ=DAILY".into()];
    fixture.storage.inner.store_event(&series).unwrap();

    let mut manager = fixture.manager();
    let (_log, callback) = recorder();
    manager.register_view(range(1, 7), callback);
    assert!(manager.wait_for_idle(TIMEOUT));

    manager.set_exceptions("gym", vec![at(5, 7), at(2, 7), at(5, 7)]);
    assert!(manager.wait_for_idle(TIMEOUT));
    assert_eq!(
        manager.event("gym").unwrap().recur_exception_dates,
        vec![at(2, 7), at(5, 7)]
    );

    manager.remove_exception("gym", 0);
    assert!(manager.wait_for_idle(TIMEOUT));
    assert_eq!(manager.event("gym").unwrap().recur_exception_dates, vec![at(5, 7)]);

    manager.add_exception("gym", at(6, 7));
    assert!(manager.wait_for_idle(TIMEOUT));
    assert_eq!(
        manager.event("gym").unwrap().recur_exception_dates,
        vec![at(5, 7), at(6, 7)]
    );

    // Out of range and non-recurring targets are ignored.
    manager.remove_exception("gym", 9);
    manager.add_exception("breakfast", at(6, 8));
    assert!(manager.is_idle());
}

#[test]
fn test_read_only_event_cannot_be_removed() {
    let fixture = Fixture::new();
    let mut manager = fixture.manager();
    let (_log, callback) = recorder();
    manager.register_view(DateRange::day(day(20)), callback);
    assert!(manager.wait_for_idle(TIMEOUT));
    assert!(manager.event("holiday").unwrap().readonly);

    manager.remove_event("holiday", None);
    assert!(manager.is_idle());
    assert!(fixture.storage.inner.event("holiday").unwrap().is_some());
}
