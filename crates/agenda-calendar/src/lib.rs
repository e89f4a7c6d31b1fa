//! In-process calendar cache for agenda views.
//!
//! Views register the date ranges they show; the [`CalendarManager`] merges
//! pending ranges into few storage loads on a worker task, expands recurring
//! events into concrete occurrences and hands each view its list. Notebook
//! colors and exclusion are persisted through a [`SettingsStore`].

pub mod error;
pub mod expand;
pub mod identity;
pub mod manager;
pub mod merge;
pub mod notebooks;
pub mod recurrence;
pub mod settings;
pub mod storage;
pub mod types;
pub mod worker;

pub use error::{CalendarError, CalendarResult};
pub use identity::{EventHandle, EventIdentityCache, HandleChange};
pub use manager::{
    CalendarManager, DispatchMessage, ManagerNotification, StorageChangeNotifier, ViewId,
    ViewStatus,
};
pub use merge::{merge_ranges, MergedRange};
pub use notebooks::NotebookRegistry;
pub use settings::{JsonSettings, MemorySettings, SettingsStore};
pub use storage::{CalendarStorage, SqliteStorage, StorageObserver};
pub use types::{
    Alarm, DateRange, Event, Notebook, NotebookRecord, Occurrence, Recur, Reminder, StoredEvent,
    TimeSpec,
};
