//! Storage collaborator interface and a SQLite implementation of it.

use std::path::Path;

use chrono::{DateTime, NaiveDateTime};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;

use crate::error::{CalendarError, CalendarResult};
use crate::types::{DateRange, NotebookRecord, StoredEvent, TimeSpec};

/// Callback fired after the backing store changed. The argument is a free-form
/// hint and only useful for logging.
pub type StorageObserver = Box<dyn Fn(&str) + Send + Sync>;

/// Persistent event store consumed by the worker.
pub trait CalendarStorage: Send + Sync {
    /// Non-recurring events that may touch `range`.
    fn load_range(&self, range: &DateRange) -> CalendarResult<Vec<StoredEvent>>;

    /// Every recurring series, regardless of date.
    fn load_recurring(&self) -> CalendarResult<Vec<StoredEvent>>;

    /// Notebooks in enumeration order.
    fn notebooks(&self) -> CalendarResult<Vec<NotebookRecord>>;

    fn notebook_is_read_only(&self, uid: &str) -> CalendarResult<bool>;

    /// One event by uid, recurring or not.
    fn event(&self, uid: &str) -> CalendarResult<Option<StoredEvent>>;

    fn subscribe(&self, observer: StorageObserver);

    /// Replace the exception dates of a recurring event.
    fn set_exceptions(&self, uid: &str, exceptions: &[NaiveDateTime]) -> CalendarResult<()>;

    fn delete_event(&self, uid: &str) -> CalendarResult<()>;
}

fn to_millis(dt: &NaiveDateTime) -> i64 {
    dt.and_utc().timestamp_millis()
}

fn from_millis(ms: i64) -> NaiveDateTime {
    DateTime::from_timestamp_millis(ms)
        .unwrap_or_default()
        .naive_utc()
}

fn json_column<T: DeserializeOwned>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

const EVENT_COLUMNS: &str = "uid, notebook_uid, summary, description, location, start_ms, end_ms, \
     time_spec, all_day, rrules_json, exdates_json, alarms_json";

/// SQLite-backed calendar store.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
    observers: Mutex<Vec<StorageObserver>>,
}

impl SqliteStorage {
    /// Open (or create) the database at the given path.
    pub fn new<P: AsRef<Path>>(path: P) -> CalendarResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    CalendarError::Storage(agenda_core::DatabaseError::ConnectionFailed(
                        e.to_string(),
                    ))
                })?;
            }
        }
        Self::from_connection(Connection::open(path)?)
    }

    /// Create an in-memory store (tests and demos).
    pub fn in_memory() -> CalendarResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> CalendarResult<Self> {
        let storage = Self {
            conn: Mutex::new(conn),
            observers: Mutex::new(Vec::new()),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    /// Initialize the database schema.
    fn init_schema(&self) -> CalendarResult<()> {
        self.conn.lock().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS notebooks (
                uid TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT NOT NULL,
                color TEXT,
                is_default INTEGER NOT NULL,
                read_only INTEGER NOT NULL,
                is_master INTEGER NOT NULL,
                is_shared INTEGER NOT NULL,
                plugin_name TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS events (
                uid TEXT PRIMARY KEY,
                notebook_uid TEXT NOT NULL,
                summary TEXT NOT NULL,
                description TEXT NOT NULL,
                location TEXT NOT NULL,
                start_ms INTEGER NOT NULL,
                end_ms INTEGER NOT NULL,
                time_spec TEXT NOT NULL,
                all_day INTEGER NOT NULL,
                recurring INTEGER NOT NULL,
                rrules_json TEXT NOT NULL,
                exdates_json TEXT NOT NULL,
                alarms_json TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_events_notebook ON events(notebook_uid);
            CREATE INDEX IF NOT EXISTS idx_events_start ON events(start_ms);
            "#,
        )?;
        Ok(())
    }

    fn notify_changed(&self, info: &str) {
        tracing::debug!(info, "Calendar storage modified");
        for observer in self.observers.lock().iter() {
            observer(info);
        }
    }

    /// Insert or update a notebook, keeping its enumeration position.
    pub fn store_notebook(&self, notebook: &NotebookRecord) -> CalendarResult<()> {
        self.conn.lock().execute(
            r#"
            INSERT INTO notebooks
            (uid, name, description, color, is_default, read_only, is_master, is_shared, plugin_name)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(uid) DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                color = excluded.color,
                is_default = excluded.is_default,
                read_only = excluded.read_only,
                is_master = excluded.is_master,
                is_shared = excluded.is_shared,
                plugin_name = excluded.plugin_name
            "#,
            params![
                notebook.uid,
                notebook.name,
                notebook.description,
                notebook.color,
                notebook.is_default as i32,
                notebook.read_only as i32,
                notebook.is_master as i32,
                notebook.is_shared as i32,
                notebook.plugin_name,
            ],
        )?;
        self.notify_changed(&format!("notebook:{}", notebook.uid));
        Ok(())
    }

    /// Insert or replace an event.
    pub fn store_event(&self, event: &StoredEvent) -> CalendarResult<()> {
        let time_spec = match event.time_spec {
            TimeSpec::LocalZone => "local",
            TimeSpec::ClockTime => "clock",
        };

        self.conn.lock().execute(
            &format!(
                "INSERT OR REPLACE INTO events ({EVENT_COLUMNS}, recurring) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
            ),
            params![
                event.uid,
                event.notebook_uid,
                event.summary,
                event.description,
                event.location,
                to_millis(&event.start),
                to_millis(&event.end),
                time_spec,
                event.all_day as i32,
                serde_json::to_string(&event.rrules)?,
                serde_json::to_string(&event.exdates)?,
                serde_json::to_string(&event.alarms)?,
                event.recurs() as i32,
            ],
        )?;
        self.notify_changed(&format!("event:{}", event.uid));
        Ok(())
    }

    fn query_events(&self, sql: &str, params: impl rusqlite::Params) -> CalendarResult<Vec<StoredEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, Self::row_to_event)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn row_to_event(row: &rusqlite::Row) -> rusqlite::Result<StoredEvent> {
        let time_spec: String = row.get(7)?;
        Ok(StoredEvent {
            uid: row.get(0)?,
            notebook_uid: row.get(1)?,
            summary: row.get(2)?,
            description: row.get(3)?,
            location: row.get(4)?,
            start: from_millis(row.get(5)?),
            end: from_millis(row.get(6)?),
            time_spec: match time_spec.as_str() {
                "clock" => TimeSpec::ClockTime,
                _ => TimeSpec::LocalZone,
            },
            all_day: row.get::<_, i32>(8)? != 0,
            rrules: json_column(row, 9)?,
            exdates: json_column(row, 10)?,
            alarms: json_column(row, 11)?,
        })
    }
}

impl CalendarStorage for SqliteStorage {
    fn load_range(&self, range: &DateRange) -> CalendarResult<Vec<StoredEvent>> {
        self.query_events(
            &format!(
                "SELECT {EVENT_COLUMNS} FROM events \
                 WHERE recurring = 0 AND start_ms < ?1 AND end_ms >= ?2 \
                 ORDER BY start_ms ASC"
            ),
            params![
                to_millis(&range.end_of_range()),
                to_millis(&range.start_of_range())
            ],
        )
    }

    fn load_recurring(&self) -> CalendarResult<Vec<StoredEvent>> {
        self.query_events(
            &format!("SELECT {EVENT_COLUMNS} FROM events WHERE recurring = 1 ORDER BY start_ms ASC"),
            [],
        )
    }

    fn notebooks(&self) -> CalendarResult<Vec<NotebookRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT uid, name, description, color, is_default, read_only, is_master, is_shared, plugin_name \
             FROM notebooks ORDER BY rowid ASC",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok(NotebookRecord {
                uid: row.get(0)?,
                name: row.get(1)?,
                description: row.get(2)?,
                color: row.get(3)?,
                is_default: row.get::<_, i32>(4)? != 0,
                read_only: row.get::<_, i32>(5)? != 0,
                is_master: row.get::<_, i32>(6)? != 0,
                is_shared: row.get::<_, i32>(7)? != 0,
                plugin_name: row.get(8)?,
            })
        })?;

        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn notebook_is_read_only(&self, uid: &str) -> CalendarResult<bool> {
        let read_only: Option<i32> = self
            .conn
            .lock()
            .query_row(
                "SELECT read_only FROM notebooks WHERE uid = ?1",
                params![uid],
                |row| row.get(0),
            )
            .optional()?;

        read_only
            .map(|v| v != 0)
            .ok_or_else(|| CalendarError::NotebookNotFound(uid.to_string()))
    }

    fn event(&self, uid: &str) -> CalendarResult<Option<StoredEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("SELECT {EVENT_COLUMNS} FROM events WHERE uid = ?1"))?;
        Ok(stmt.query_row(params![uid], Self::row_to_event).optional()?)
    }

    fn subscribe(&self, observer: StorageObserver) {
        self.observers.lock().push(observer);
    }

    fn set_exceptions(&self, uid: &str, exceptions: &[NaiveDateTime]) -> CalendarResult<()> {
        let updated = self.conn.lock().execute(
            "UPDATE events SET exdates_json = ?1 WHERE uid = ?2 AND recurring = 1",
            params![serde_json::to_string(exceptions)?, uid],
        )?;
        if updated == 0 {
            return Err(CalendarError::EventNotFound(uid.to_string()));
        }
        self.notify_changed(&format!("event:{uid}"));
        Ok(())
    }

    fn delete_event(&self, uid: &str) -> CalendarResult<()> {
        let deleted = self
            .conn
            .lock()
            .execute("DELETE FROM events WHERE uid = ?1", params![uid])?;
        if deleted == 0 {
            return Err(CalendarError::EventNotFound(uid.to_string()));
        }
        self.notify_changed(&format!("event:{uid}"));
        Ok(())
    }
}
