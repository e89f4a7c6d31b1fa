//! Worker context running all storage I/O off the dispatch thread.
//!
//! Requests are processed strictly in order by one task on the tokio runtime.
//! Each storage call runs in `spawn_blocking`; the sent-event ledger moves into
//! the blocking closure and back out, so nothing is shared with the dispatch
//! side. Replies are plain records.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::NaiveDateTime;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{CalendarError, CalendarResult};
use crate::storage::CalendarStorage;
use crate::types::{normalize_exceptions, DateRange, NotebookRecord, StoredEvent};

/// Work sent from the dispatch context.
#[derive(Debug)]
pub enum WorkerRequest {
    /// Forget which events were sent and list notebooks again.
    Reload {
        generation: u64,
        token: CancellationToken,
    },
    /// Load every range plus the recurring series.
    LoadRanges {
        request_id: u64,
        generation: u64,
        reset: bool,
        ranges: Vec<DateRange>,
        /// Uids the dispatch side holds handles for; looked up on reset loads.
        tracked: Vec<String>,
    },
    SetExceptions {
        uid: String,
        exceptions: Vec<NaiveDateTime>,
    },
    /// Delete an event, or with `occurrence` set on a recurring event, hide
    /// only that instance.
    DeleteEvent {
        uid: String,
        occurrence: Option<NaiveDateTime>,
    },
    Shutdown,
}

/// Result of a `LoadRanges` request.
#[derive(Debug)]
pub struct RangeLoad {
    pub request_id: u64,
    pub generation: u64,
    pub reset: bool,
    /// Recurring series not sent before.
    pub recurring: CalendarResult<Vec<StoredEvent>>,
    /// One entry per requested range, in request order.
    pub buckets: Vec<CalendarResult<Vec<StoredEvent>>>,
    /// Tracked events found outside the requested ranges.
    pub tracked: Vec<StoredEvent>,
    /// Every uid read from storage, sent before or not. Events of notebooks
    /// that no longer exist are left out.
    pub seen: HashSet<String>,
    /// Tracked uids storage no longer has.
    pub missing: Vec<String>,
    /// Whether every read succeeded.
    pub complete: bool,
}

impl RangeLoad {
    fn failed(request_id: u64, generation: u64, reset: bool) -> Self {
        Self {
            request_id,
            generation,
            reset,
            recurring: Err(CalendarError::WorkerUnavailable),
            buckets: Vec::new(),
            tracked: Vec::new(),
            seen: HashSet::new(),
            missing: Vec::new(),
            complete: false,
        }
    }

    /// Whether range `index` itself was read.
    pub fn range_ok(&self, index: usize) -> bool {
        matches!(self.buckets.get(index), Some(Ok(_)))
    }

    /// Whether the data for bucket `index` can be delivered.
    pub fn bucket_ok(&self, index: usize) -> bool {
        self.recurring.is_ok() && self.range_ok(index)
    }

    /// Uids of the whole store, when this is a reset load where every read
    /// succeeded.
    pub fn snapshot(&self) -> Option<&HashSet<String>> {
        (self.reset && self.complete).then_some(&self.seen)
    }

    /// All newly sent events, recurring first.
    pub fn take_events(&mut self) -> Vec<StoredEvent> {
        let mut events = match &mut self.recurring {
            Ok(events) => std::mem::take(events),
            Err(_) => Vec::new(),
        };
        for events_in_bucket in self.buckets.iter_mut().flatten() {
            events.append(events_in_bucket);
        }
        events.append(&mut self.tracked);
        events
    }
}

/// Replies delivered back to the dispatch context.
#[derive(Debug)]
pub enum WorkerReply {
    Reloaded {
        generation: u64,
        notebooks: CalendarResult<Vec<NotebookRecord>>,
    },
    ReloadCancelled {
        generation: u64,
    },
    RangesLoaded(RangeLoad),
    MutationDone {
        uid: String,
        result: CalendarResult<()>,
    },
}

/// Dispatch-side handle to the worker task.
pub struct WorkerHandle {
    tx: mpsc::UnboundedSender<WorkerRequest>,
    task: JoinHandle<()>,
    stopping: bool,
}

impl WorkerHandle {
    /// Spawn the worker task on `runtime`. `reply` is called from worker
    /// threads and must only hand the reply over to the dispatch context.
    pub fn spawn<F>(runtime: &Handle, storage: Arc<dyn CalendarStorage>, reply: F) -> Self
    where
        F: Fn(WorkerReply) + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = runtime.spawn(run(rx, storage, reply));
        Self {
            tx,
            task,
            stopping: false,
        }
    }

    pub fn send(&self, request: WorkerRequest) -> CalendarResult<()> {
        self.tx
            .send(request)
            .map_err(|_| CalendarError::WorkerUnavailable)
    }

    /// Ask the worker to stop after the requests already queued.
    pub fn shutdown(&mut self) {
        if !std::mem::replace(&mut self.stopping, true) {
            let _ = self.tx.send(WorkerRequest::Shutdown);
        }
    }

    /// Whether the worker task has not exited yet.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run<F>(mut rx: mpsc::UnboundedReceiver<WorkerRequest>, storage: Arc<dyn CalendarStorage>, reply: F)
where
    F: Fn(WorkerReply) + Send + Sync + 'static,
{
    tracing::debug!("Calendar worker started");
    let mut sent_events: HashSet<String> = HashSet::new();

    while let Some(request) = rx.recv().await {
        match request {
            WorkerRequest::Shutdown => break,
            WorkerRequest::Reload { generation, token } => {
                sent_events.clear();
                reply(reload(&storage, generation, token).await);
            }
            WorkerRequest::LoadRanges {
                request_id,
                generation,
                reset,
                ranges,
                tracked,
            } => {
                let storage = storage.clone();
                let ledger = std::mem::take(&mut sent_events);
                let outcome = tokio::task::spawn_blocking(move || {
                    let mut ledger = ledger;
                    let load = load_ranges(&*storage, &mut ledger, request_id, generation, reset, &ranges, &tracked);
                    (ledger, load)
                })
                .await;

                match outcome {
                    Ok((ledger, load)) => {
                        sent_events = ledger;
                        reply(WorkerReply::RangesLoaded(load));
                    }
                    Err(e) => {
                        tracing::error!("Range load task failed: {}", e);
                        reply(WorkerReply::RangesLoaded(RangeLoad::failed(request_id, generation, reset)));
                    }
                }
            }
            WorkerRequest::SetExceptions { uid, exceptions } => {
                let result = blocking(&storage, {
                    let uid = uid.clone();
                    move |storage| set_exceptions(storage, &uid, exceptions)
                })
                .await;
                reply(WorkerReply::MutationDone { uid, result });
            }
            WorkerRequest::DeleteEvent { uid, occurrence } => {
                let result = blocking(&storage, {
                    let uid = uid.clone();
                    move |storage| delete_event(storage, &uid, occurrence)
                })
                .await;
                reply(WorkerReply::MutationDone { uid, result });
            }
        }
    }

    tracing::debug!("Calendar worker stopped");
}

async fn blocking<T, F>(storage: &Arc<dyn CalendarStorage>, work: F) -> CalendarResult<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn CalendarStorage) -> CalendarResult<T> + Send + 'static,
{
    let storage = storage.clone();
    tokio::task::spawn_blocking(move || work(&*storage))
        .await
        .map_err(|e| {
            tracing::error!("Storage task failed: {}", e);
            CalendarError::WorkerUnavailable
        })?
}

#[tracing::instrument(level = "debug", skip(storage, token))]
async fn reload(storage: &Arc<dyn CalendarStorage>, generation: u64, token: CancellationToken) -> WorkerReply {
    if token.is_cancelled() {
        return WorkerReply::ReloadCancelled { generation };
    }

    let notebooks = blocking(storage, |storage| storage.notebooks());
    tokio::select! {
        _ = token.cancelled() => WorkerReply::ReloadCancelled { generation },
        notebooks = notebooks => WorkerReply::Reloaded { generation, notebooks },
    }
}

#[tracing::instrument(level = "debug", skip(storage, ledger, ranges, tracked))]
fn load_ranges(
    storage: &dyn CalendarStorage,
    ledger: &mut HashSet<String>,
    request_id: u64,
    generation: u64,
    reset: bool,
    ranges: &[DateRange],
    tracked: &[String],
) -> RangeLoad {
    if reset {
        ledger.clear();
    }

    let mut complete = true;

    let notebooks: Option<HashSet<String>> = match storage.notebooks() {
        Ok(records) => Some(records.into_iter().map(|n| n.uid).collect()),
        Err(e) => {
            tracing::warn!("Failed to list notebooks, not filtering events: {}", e);
            complete = false;
            None
        }
    };
    let orphaned = |event: &StoredEvent| {
        notebooks
            .as_ref()
            .is_some_and(|known| !known.contains(&event.notebook_uid))
    };

    let mut seen = HashSet::new();
    let mut unsent = |events: Vec<StoredEvent>, seen: &mut HashSet<String>| -> Vec<StoredEvent> {
        events
            .into_iter()
            .filter(|event| {
                if orphaned(event) {
                    tracing::debug!(uid = %event.uid, notebook = %event.notebook_uid, "Skipping event of unknown notebook");
                    return false;
                }
                seen.insert(event.uid.clone());
                ledger.insert(event.uid.clone())
            })
            .collect()
    };

    let recurring = storage.load_recurring().map(|events| unsent(events, &mut seen));
    if let Err(e) = &recurring {
        tracing::warn!("Failed to load recurring events: {}", e);
        complete = false;
    }

    let buckets: Vec<_> = ranges
        .iter()
        .map(|range| match storage.load_range(range) {
            Ok(events) => Ok(unsent(events, &mut seen)),
            Err(e) => {
                tracing::warn!(
                    start = %range.start(),
                    end = %range.end(),
                    transient = e.is_transient(),
                    "Failed to load range: {}",
                    e
                );
                complete = false;
                Err(e)
            }
        })
        .collect();

    let mut found = Vec::new();
    let mut missing = Vec::new();
    if reset {
        for uid in tracked.iter().filter(|uid| !seen.contains(*uid)) {
            match storage.event(uid) {
                Ok(Some(event)) if !orphaned(&event) => found.push(event),
                Ok(_) => missing.push(uid.clone()),
                Err(e) => {
                    tracing::warn!(uid = %uid, "Failed to look up tracked event: {}", e);
                    complete = false;
                }
            }
        }
    }
    let tracked = unsent(found, &mut seen);

    tracing::debug!(
        generation,
        reset,
        complete,
        sent = ledger.len(),
        "Loaded calendar ranges"
    );

    RangeLoad {
        request_id,
        generation,
        reset,
        recurring,
        buckets,
        tracked,
        seen,
        missing,
        complete,
    }
}

fn writable_event(storage: &dyn CalendarStorage, uid: &str) -> CalendarResult<StoredEvent> {
    let event = storage
        .event(uid)?
        .ok_or_else(|| CalendarError::EventNotFound(uid.to_string()))?;
    if storage.notebook_is_read_only(&event.notebook_uid)? {
        return Err(CalendarError::InvalidArgument(format!(
            "notebook '{}' is read-only",
            event.notebook_uid
        )));
    }
    Ok(event)
}

fn set_exceptions(storage: &dyn CalendarStorage, uid: &str, exceptions: Vec<NaiveDateTime>) -> CalendarResult<()> {
    let event = writable_event(storage, uid)?;
    if !event.recurs() {
        return Err(CalendarError::InvalidArgument(format!(
            "event '{uid}' does not recur"
        )));
    }
    storage.set_exceptions(uid, &normalize_exceptions(exceptions))
}

fn delete_event(storage: &dyn CalendarStorage, uid: &str, occurrence: Option<NaiveDateTime>) -> CalendarResult<()> {
    let event = writable_event(storage, uid)?;
    match occurrence {
        Some(at) if event.recurs() => {
            let mut exceptions = event.exdates;
            exceptions.push(at);
            storage.set_exceptions(uid, &normalize_exceptions(exceptions))
        }
        _ => storage.delete_event(uid),
    }
}
