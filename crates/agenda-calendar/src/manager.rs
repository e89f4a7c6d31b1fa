//! Dispatch-side calendar manager.
//!
//! The manager owns every piece of view-facing state: registered views, the
//! dirty set, cached raw events, the notebook registry and the event handles.
//! It lives on one thread (it is `!Send`) and only ever talks to the worker
//! through messages. Work queued for the dispatch thread (refresh passes,
//! worker replies, storage notifications) runs when the owner calls
//! [`CalendarManager::process_events`] or [`CalendarManager::wait_for_idle`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::rc::Rc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use agenda_core::CalendarConfig;
use chrono::{NaiveDate, NaiveDateTime};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::error::CalendarResult;
use crate::expand::{daily_occurrences, expand_events, next_occurrence, occurrence_at};
use crate::identity::{EventHandle, EventIdentityCache};
use crate::merge::{merge_ranges, MergedRange};
use crate::notebooks::NotebookRegistry;
use crate::settings::SettingsStore;
use crate::storage::CalendarStorage;
use crate::types::{normalize_exceptions, DateRange, Event, Notebook, Occurrence, StoredEvent};
use crate::worker::{RangeLoad, WorkerHandle, WorkerReply, WorkerRequest};

/// Opaque identity of a registered view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ViewId(u64);

impl std::fmt::Display for ViewId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "view-{}", self.0)
    }
}

/// Where a view stands relative to its last delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewStatus {
    Clean,
    Dirty,
    Loading,
}

/// Manager-level change notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerNotification {
    NotebooksChanged,
    ExcludedNotebooksChanged,
    NotebookColorChanged(String),
    /// The event cache was replaced by a fresh snapshot.
    ModelReset,
}

/// Messages queued for the dispatch thread.
#[derive(Debug)]
pub enum DispatchMessage {
    RefreshPass,
    StorageModified(String),
    Worker(WorkerReply),
}

/// Thread-safe handle for reporting that the backing store changed.
#[derive(Clone)]
pub struct StorageChangeNotifier {
    tx: Sender<DispatchMessage>,
}

impl StorageChangeNotifier {
    pub fn notify(&self, info: &str) {
        let _ = self.tx.send(DispatchMessage::StorageModified(info.to_string()));
    }
}

type DeliveryCallback = Box<dyn FnMut(ViewId, &[Occurrence])>;
type NotificationCallback = Box<dyn FnMut(&ManagerNotification)>;

struct ViewState {
    range: DateRange,
    status: ViewStatus,
    callback: DeliveryCallback,
    /// Last delivered list and the range it was built for.
    delivered: Option<(DateRange, Vec<Occurrence>)>,
}

/// View membership of one in-flight `LoadRanges` request.
struct PassState {
    buckets: Vec<MergedRange<ViewId>>,
}

/// Calendar cache shared by all agenda views of the process.
///
/// Construct one per process and hand it to views by reference.
pub struct CalendarManager {
    worker: WorkerHandle,
    tx: Sender<DispatchMessage>,
    rx: Receiver<DispatchMessage>,

    views: BTreeMap<ViewId, ViewState>,
    next_view_id: u64,
    dirty: BTreeSet<ViewId>,
    pass_scheduled: bool,
    reset_pending: bool,
    init_complete: bool,

    generation: u64,
    reload_token: CancellationToken,
    pending_requests: usize,
    next_request_id: u64,
    in_flight: HashMap<u64, PassState>,

    raw_events: HashMap<String, StoredEvent>,
    events: HashMap<String, Event>,
    daily: BTreeMap<NaiveDate, Vec<String>>,

    registry: NotebookRegistry,
    identity: EventIdentityCache,
    subscribers: Vec<NotificationCallback>,

    merge_adjacent: bool,
    occurrence_limit: u16,
}

impl CalendarManager {
    /// Create the manager, spawn its worker on `runtime` and start the initial
    /// notebook load.
    pub fn new(
        storage: Arc<dyn CalendarStorage>,
        settings: Arc<dyn SettingsStore>,
        runtime: &Handle,
        config: &CalendarConfig,
    ) -> Self {
        let (tx, rx) = mpsc::channel();

        let observer_tx = tx.clone();
        storage.subscribe(Box::new(move |info: &str| {
            let _ = observer_tx.send(DispatchMessage::StorageModified(info.to_string()));
        }));

        let reply_tx = tx.clone();
        let worker = WorkerHandle::spawn(runtime, storage, move |reply| {
            let _ = reply_tx.send(DispatchMessage::Worker(reply));
        });

        let mut manager = Self {
            worker,
            tx,
            rx,
            views: BTreeMap::new(),
            next_view_id: 1,
            dirty: BTreeSet::new(),
            pass_scheduled: false,
            reset_pending: false,
            init_complete: false,
            generation: 0,
            reload_token: CancellationToken::new(),
            pending_requests: 0,
            next_request_id: 1,
            in_flight: HashMap::new(),
            raw_events: HashMap::new(),
            events: HashMap::new(),
            daily: BTreeMap::new(),
            registry: NotebookRegistry::new(
                settings,
                config.default_colors.clone(),
                config.fallback_color.clone(),
            ),
            identity: EventIdentityCache::new(),
            subscribers: Vec::new(),
            merge_adjacent: config.merge_adjacent_days,
            occurrence_limit: config.max_occurrences_per_event,
        };

        tracing::info!("Calendar manager started");
        manager.request_full_reload();
        manager
    }

    // ---- views ----

    /// Register a view interested in `range`. The callback receives every
    /// delivery for this view.
    pub fn register_view<F>(&mut self, range: DateRange, callback: F) -> ViewId
    where
        F: FnMut(ViewId, &[Occurrence]) + 'static,
    {
        let id = ViewId(self.next_view_id);
        self.next_view_id += 1;

        self.views.insert(
            id,
            ViewState {
                range,
                status: ViewStatus::Dirty,
                callback: Box::new(callback),
                delivered: None,
            },
        );
        tracing::debug!(view = %id, start = %range.start(), end = %range.end(), "View registered");
        self.mark_dirty(id);
        id
    }

    pub fn update_range(&mut self, id: ViewId, range: DateRange) {
        let Some(view) = self.views.get_mut(&id) else {
            tracing::debug!(view = %id, "Ignoring range change for unknown view");
            return;
        };
        if view.range == range {
            return;
        }
        view.range = range;
        self.mark_dirty(id);
    }

    /// Forget a view. Results still in flight for it are dropped.
    pub fn unregister_view(&mut self, id: ViewId) {
        if self.views.remove(&id).is_some() {
            tracing::debug!(view = %id, "View unregistered");
            self.rebuild_daily();
        }
        self.dirty.remove(&id);
    }

    /// Last list delivered to a view.
    pub fn view_occurrences(&self, id: ViewId) -> Option<&[Occurrence]> {
        self.views
            .get(&id)?
            .delivered
            .as_ref()
            .map(|(_, occurrences)| occurrences.as_slice())
    }

    pub fn view_status(&self, id: ViewId) -> Option<ViewStatus> {
        self.views.get(&id).map(|v| v.status)
    }

    pub fn view_range(&self, id: ViewId) -> Option<DateRange> {
        self.views.get(&id).map(|v| v.range)
    }

    fn mark_dirty(&mut self, id: ViewId) {
        if let Some(view) = self.views.get_mut(&id) {
            view.status = ViewStatus::Dirty;
            self.dirty.insert(id);
            self.schedule_pass();
        }
    }

    fn mark_all_dirty(&mut self) {
        let ids: Vec<ViewId> = self.views.keys().copied().collect();
        for id in ids {
            self.mark_dirty(id);
        }
    }

    fn schedule_pass(&mut self) {
        if self.pass_scheduled || !self.init_complete {
            return;
        }
        self.pass_scheduled = true;
        let _ = self.tx.send(DispatchMessage::RefreshPass);
    }

    // ---- notebooks ----

    pub fn notebooks(&self) -> &[Notebook] {
        self.registry.notebooks()
    }

    pub fn default_notebook(&self) -> Option<&Notebook> {
        self.registry.default_notebook()
    }

    pub fn notebook_color(&self, uid: &str) -> String {
        self.registry.color(uid)
    }

    /// Persist a color override and push it to every handle of the notebook.
    pub fn set_notebook_color(&mut self, uid: &str, color: &str) {
        match self.registry.set_color(uid, color) {
            Ok(true) => {
                self.identity.refresh_color(uid, color);
                self.notify(ManagerNotification::NotebookColorChanged(uid.to_string()));
            }
            Ok(false) => {}
            Err(e) => tracing::warn!(notebook = uid, "Failed to store notebook color: {}", e),
        }
    }

    pub fn excluded_notebooks(&self) -> BTreeSet<String> {
        self.registry.excluded()
    }

    pub fn set_excluded_notebooks(&mut self, excluded: &BTreeSet<String>) {
        let result = self.registry.set_excluded_set(excluded);
        self.exclusion_updated(result);
    }

    pub fn exclude_notebook(&mut self, uid: &str, excluded: bool) {
        let result = self.registry.set_excluded(uid, excluded);
        self.exclusion_updated(result);
    }

    fn exclusion_updated(&mut self, result: CalendarResult<bool>) {
        match result {
            Ok(true) => {
                self.notify(ManagerNotification::ExcludedNotebooksChanged);
                self.mark_all_dirty();
            }
            Ok(false) => {}
            Err(e) => tracing::warn!("Failed to store notebook exclusion: {}", e),
        }
    }

    // ---- notifications ----

    /// Handle for reporting storage changes from any thread.
    pub fn storage_notifier(&self) -> StorageChangeNotifier {
        StorageChangeNotifier {
            tx: self.tx.clone(),
        }
    }

    pub fn subscribe<F>(&mut self, callback: F)
    where
        F: FnMut(&ManagerNotification) + 'static,
    {
        self.subscribers.push(Box::new(callback));
    }

    fn notify(&mut self, notification: ManagerNotification) {
        for subscriber in &mut self.subscribers {
            subscriber(&notification);
        }
    }

    // ---- events ----

    /// Current data for an event; `None` if it is not in the cache.
    pub fn event(&self, uid: &str) -> Option<Event> {
        self.events.get(uid).cloned()
    }

    /// Shared handle for an event, bound right away when the event is cached.
    pub fn event_handle(&mut self, uid: &str) -> Rc<EventHandle> {
        let handle = self.identity.get_or_create(uid);
        if !handle.is_present() {
            if let Some(event) = self.events.get(uid) {
                let color = self.registry.color(&event.calendar_uid);
                self.identity.retarget(uid, event.clone(), color);
            }
        }
        handle
    }

    /// The instance of an event starting exactly at `start`.
    pub fn occurrence(&self, uid: &str, start: NaiveDateTime) -> Option<Occurrence> {
        occurrence_at(self.raw_events.get(uid)?, start)
    }

    /// Instance at or after `at`, falling back to the last one before it.
    pub fn next_occurrence(&self, uid: &str, at: Option<NaiveDateTime>) -> Option<Occurrence> {
        next_occurrence(self.raw_events.get(uid), at)
    }

    /// Number of delivered occurrences touching `date`.
    pub fn event_count_for_date(&self, date: NaiveDate) -> usize {
        self.daily.get(&date).map_or(0, Vec::len)
    }

    fn recurring_event(&self, uid: &str, operation: &str) -> Option<&StoredEvent> {
        let Some(event) = self.raw_events.get(uid) else {
            tracing::warn!(uid, operation, "Event not found");
            return None;
        };
        if !event.recurs() {
            tracing::warn!(uid, operation, "Event does not recur");
            return None;
        }
        Some(event)
    }

    /// Hide one instance of a recurring event.
    pub fn add_exception(&mut self, uid: &str, at: NaiveDateTime) {
        let Some(event) = self.recurring_event(uid, "add_exception") else {
            return;
        };
        if event.exdates.contains(&at) {
            tracing::debug!(uid, "Exception already present");
            return;
        }
        let mut exceptions = event.exdates.clone();
        exceptions.push(at);
        self.send_exceptions(uid, exceptions);
    }

    /// Remove the exception at `index` of the event's sorted exception list.
    pub fn remove_exception(&mut self, uid: &str, index: usize) {
        let Some(event) = self.recurring_event(uid, "remove_exception") else {
            return;
        };
        let mut exceptions = normalize_exceptions(event.exdates.clone());
        if index >= exceptions.len() {
            tracing::warn!(uid, index, count = exceptions.len(), "Exception index out of range");
            return;
        }
        exceptions.remove(index);
        self.send_exceptions(uid, exceptions);
    }

    /// Replace the exception list. Lists equal after sorting are a no-op.
    pub fn set_exceptions(&mut self, uid: &str, exceptions: Vec<NaiveDateTime>) {
        let Some(event) = self.recurring_event(uid, "set_exceptions") else {
            return;
        };
        let exceptions = normalize_exceptions(exceptions);
        if exceptions == normalize_exceptions(event.exdates.clone()) {
            return;
        }
        self.send_exceptions(uid, exceptions);
    }

    fn send_exceptions(&mut self, uid: &str, exceptions: Vec<NaiveDateTime>) {
        self.send(WorkerRequest::SetExceptions {
            uid: uid.to_string(),
            exceptions: normalize_exceptions(exceptions),
        });
    }

    /// Delete an event. For a recurring event with `occurrence` set, only that
    /// instance is removed.
    pub fn remove_event(&mut self, uid: &str, occurrence: Option<NaiveDateTime>) {
        let Some(event) = self.raw_events.get(uid) else {
            tracing::warn!(uid, "Cannot remove unknown event");
            return;
        };
        if self.registry.is_read_only(&event.notebook_uid) {
            tracing::warn!(uid, notebook = %event.notebook_uid, "Cannot remove event from read-only notebook");
            return;
        }
        self.send(WorkerRequest::DeleteEvent {
            uid: uid.to_string(),
            occurrence,
        });
    }

    // ---- reload ----

    /// Drop everything cached and reload notebooks and all views.
    ///
    /// A reload still in flight is cancelled; its result is never applied.
    pub fn request_full_reload(&mut self) {
        self.generation += 1;
        self.reload_token.cancel();
        self.reload_token = CancellationToken::new();

        tracing::debug!(generation = self.generation, "Full reload requested");
        self.send(WorkerRequest::Reload {
            generation: self.generation,
            token: self.reload_token.clone(),
        });
    }

    fn send(&mut self, request: WorkerRequest) -> bool {
        match self.worker.send(request) {
            Ok(()) => {
                self.pending_requests += 1;
                true
            }
            Err(e) => {
                tracing::warn!("Dropping calendar request: {}", e);
                false
            }
        }
    }

    // ---- dispatch ----

    /// Run everything queued for the dispatch thread. Returns the number of
    /// messages handled.
    pub fn process_events(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(message) = self.rx.try_recv() {
            self.handle_message(message);
            handled += 1;
        }
        handled
    }

    /// Whether nothing is queued, scheduled or in flight.
    pub fn is_idle(&self) -> bool {
        self.pending_requests == 0 && !self.pass_scheduled && self.in_flight.is_empty()
    }

    /// Process messages until idle or until `timeout` passes. Returns whether
    /// the manager became idle.
    pub fn wait_for_idle(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.process_events();
            if self.is_idle() {
                return true;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            match self.rx.recv_timeout(remaining) {
                Ok(message) => self.handle_message(message),
                Err(RecvTimeoutError::Timeout) => return false,
                Err(RecvTimeoutError::Disconnected) => return false,
            }
        }
    }

    /// Stop the worker. Requests issued afterwards are dropped.
    pub fn shutdown(&mut self) {
        self.reload_token.cancel();
        self.worker.shutdown();
        tracing::info!("Calendar manager stopped");
    }

    fn handle_message(&mut self, message: DispatchMessage) {
        match message {
            DispatchMessage::RefreshPass => self.run_pass(),
            DispatchMessage::StorageModified(info) => {
                tracing::info!(info = %info, "Calendar storage changed, reloading");
                self.request_full_reload();
            }
            DispatchMessage::Worker(reply) => {
                self.pending_requests = self.pending_requests.saturating_sub(1);
                self.handle_reply(reply);
            }
        }
    }

    fn handle_reply(&mut self, reply: WorkerReply) {
        match reply {
            WorkerReply::Reloaded {
                generation,
                notebooks,
            } => {
                if generation != self.generation {
                    tracing::debug!(generation, current = self.generation, "Discarding stale reload");
                    return;
                }
                match notebooks {
                    Ok(records) => {
                        if self.registry.load_all(records) {
                            self.refresh_handle_colors();
                            self.notify(ManagerNotification::NotebooksChanged);
                        }
                    }
                    Err(e) => tracing::warn!("Failed to load notebooks, keeping previous set: {}", e),
                }
                self.init_complete = true;
                self.reset_pending = true;
                self.mark_all_dirty();
                self.schedule_pass();
            }
            WorkerReply::ReloadCancelled { generation } => {
                tracing::debug!(generation, "Reload cancelled");
            }
            WorkerReply::RangesLoaded(load) => self.apply_load(load),
            WorkerReply::MutationDone { uid, result } => match result {
                Ok(()) => tracing::debug!(uid = %uid, "Calendar change stored"),
                Err(e) => tracing::warn!(
                    uid = %uid,
                    reason = %e,
                    "Calendar change failed: {}",
                    e.user_message()
                ),
            },
        }
    }

    fn refresh_handle_colors(&self) {
        for notebook in self.registry.notebooks() {
            self.identity.refresh_color(&notebook.uid, &notebook.color);
        }
    }

    /// Merge the dirty views and send one load for them.
    fn run_pass(&mut self) {
        self.pass_scheduled = false;
        if !self.init_complete {
            return;
        }

        let dirty = std::mem::take(&mut self.dirty);
        let requests: Vec<(DateRange, ViewId)> = dirty
            .iter()
            .filter_map(|id| self.views.get(id).map(|v| (v.range, *id)))
            .collect();

        let reset = std::mem::take(&mut self.reset_pending);
        if requests.is_empty() && !reset {
            return;
        }

        let buckets = merge_ranges(requests, self.merge_adjacent);
        for bucket in &buckets {
            for (_, id) in &bucket.members {
                if let Some(view) = self.views.get_mut(id) {
                    view.status = ViewStatus::Loading;
                }
            }
        }

        let request_id = self.next_request_id;
        self.next_request_id += 1;
        let ranges: Vec<DateRange> = buckets.iter().map(|b| b.range).collect();
        let tracked = if reset {
            self.tracked_uids()
        } else {
            Vec::new()
        };

        tracing::debug!(
            request_id,
            generation = self.generation,
            reset,
            views = dirty.len(),
            ranges = ranges.len(),
            "Running refresh pass"
        );

        let sent = self.send(WorkerRequest::LoadRanges {
            request_id,
            generation: self.generation,
            reset,
            ranges,
            tracked,
        });

        if sent {
            self.in_flight.insert(request_id, PassState { buckets });
        } else {
            self.reset_pending |= reset;
            for id in dirty {
                if let Some(view) = self.views.get_mut(&id) {
                    view.status = ViewStatus::Dirty;
                    self.dirty.insert(id);
                }
            }
        }
    }

    fn tracked_uids(&self) -> Vec<String> {
        let mut uids: Vec<String> = self.identity.uids().map(str::to_string).collect();
        uids.sort();
        uids
    }

    fn apply_load(&mut self, mut load: RangeLoad) {
        let Some(pass) = self.in_flight.remove(&load.request_id) else {
            tracing::warn!(request_id = load.request_id, "Load reply for unknown request");
            return;
        };
        if load.generation != self.generation {
            tracing::debug!(
                generation = load.generation,
                current = self.generation,
                "Discarding stale load"
            );
            return;
        }

        self.ingest(&mut load, &pass.buckets);

        for (index, bucket) in pass.buckets.iter().enumerate() {
            if !load.bucket_ok(index) {
                tracing::warn!(
                    start = %bucket.range.start(),
                    end = %bucket.range.end(),
                    "Load failed, keeping previous data"
                );
                for (_, id) in &bucket.members {
                    if let Some(view) = self.views.get_mut(id) {
                        if view.status == ViewStatus::Loading {
                            view.status = ViewStatus::Clean;
                        }
                    }
                }
                continue;
            }

            for (requested, id) in &bucket.members {
                let Some(view) = self.views.get(id) else {
                    tracing::debug!(view = %id, "Skipping delivery to unregistered view");
                    continue;
                };
                if view.range == *requested || bucket.range.covers(&view.range) {
                    self.deliver(*id);
                }
            }
        }
    }

    /// Fold freshly loaded events into the cache. A complete reset load
    /// replaces the cache; a partial one only drops what it proves is gone.
    fn ingest(&mut self, load: &mut RangeLoad, buckets: &[MergedRange<ViewId>]) {
        let snapshot = load.snapshot().is_some();
        if snapshot {
            self.raw_events.clear();
            self.events.clear();
        } else if load.reset {
            let gone = self.disproved(load, buckets);
            for uid in &gone {
                self.raw_events.remove(uid);
                self.events.remove(uid);
                self.identity.mark_absent(uid);
            }
            tracing::debug!(removed = gone.len(), "Partial reset, pruned events not found in loaded ranges");
        }

        for stored in load.take_events() {
            let event = Event::from_stored(&stored, self.registry.is_read_only(&stored.notebook_uid));
            let color = self.registry.color(&stored.notebook_uid);
            self.identity.retarget(&stored.uid, event.clone(), color);
            self.events.insert(stored.uid.clone(), event);
            self.raw_events.insert(stored.uid.clone(), stored);
        }

        if snapshot {
            let removed = self.identity.mark_absent_except(&load.seen);
            tracing::debug!(events = self.raw_events.len(), removed, "Event cache reset");
            self.notify(ManagerNotification::ModelReset);
        }
    }

    /// Cached uids a partial reset load shows are gone: they fall in a scope
    /// that was read successfully but were not returned, or a tracked lookup
    /// found nothing.
    fn disproved(&self, load: &RangeLoad, buckets: &[MergedRange<ViewId>]) -> BTreeSet<String> {
        let loaded: Vec<DateRange> = buckets
            .iter()
            .enumerate()
            .filter(|(index, _)| load.range_ok(*index))
            .map(|(_, bucket)| bucket.range)
            .collect();
        let recurring_loaded = load.recurring.is_ok();

        self.raw_events
            .values()
            .filter(|event| !load.seen.contains(&event.uid))
            .filter(|event| {
                if event.recurs() {
                    recurring_loaded
                } else {
                    loaded.iter().any(|range| range.intersects(event.start, event.end))
                }
            })
            .map(|event| event.uid.clone())
            .chain(load.missing.iter().cloned())
            .collect()
    }

    fn deliver(&mut self, id: ViewId) {
        let excluded = self.registry.excluded();
        let Some(view) = self.views.get_mut(&id) else {
            return;
        };

        let occurrences = expand_events(
            self.raw_events.values(),
            &view.range,
            &excluded,
            self.occurrence_limit,
        );

        view.status = ViewStatus::Clean;
        self.dirty.remove(&id);
        tracing::debug!(view = %id, count = occurrences.len(), "Delivering occurrences");
        (view.callback)(id, &occurrences);
        view.delivered = Some((view.range, occurrences));
        self.rebuild_daily();
    }

    /// Per-day ids over the ranges of the latest deliveries only.
    fn rebuild_daily(&mut self) {
        self.daily.clear();
        for (range, occurrences) in self.views.values().filter_map(|v| v.delivered.as_ref()) {
            self.daily.extend(daily_occurrences(&[*range], occurrences));
        }
    }
}

impl Drop for CalendarManager {
    fn drop(&mut self) {
        self.reload_token.cancel();
    }
}
