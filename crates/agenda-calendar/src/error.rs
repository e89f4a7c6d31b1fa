//! Calendar-specific error types.

use agenda_core::{DatabaseError, RusqliteErrorExt, SettingsError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CalendarError {
    #[error("Event not found: {0}")]
    EventNotFound(String),

    #[error("Notebook not found: {0}")]
    NotebookNotFound(String),

    #[error("Invalid event data: {0}")]
    InvalidEventData(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Storage error: {0}")]
    Storage(#[from] DatabaseError),

    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Calendar worker is not running")]
    WorkerUnavailable,
}

impl From<rusqlite::Error> for CalendarError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(err.into_database_error())
    }
}

impl CalendarError {
    /// User-friendly error message for UI display.
    pub fn user_message(&self) -> String {
        match self {
            Self::EventNotFound(_) => "Event not found".to_string(),
            Self::NotebookNotFound(_) => "Calendar not found".to_string(),
            Self::InvalidEventData(msg) => format!("Invalid event: {}", msg),
            Self::InvalidArgument(msg) => format!("Invalid request: {}", msg),
            Self::Storage(e) => e.user_message().to_string(),
            Self::Settings(e) => e.user_message().to_string(),
            Self::Serialization(_) => "Local calendar data is damaged".to_string(),
            Self::WorkerUnavailable => "Calendar is shutting down".to_string(),
        }
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Storage(DatabaseError::ConnectionFailed(_) | DatabaseError::QueryFailed(_))
                | Self::WorkerUnavailable
        )
    }
}

pub type CalendarResult<T> = Result<T, CalendarError>;
