//! Error types shared by the agenda crates.
//!
//! Every error carries a `user_message()` that is safe to show next to an
//! agenda view; the `Display` text is meant for logs.

use thiserror::Error;

/// Failures of the local calendar database.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Calendar database unavailable: {0}")]
    ConnectionFailed(String),

    #[error("Calendar query failed: {0}")]
    QueryFailed(String),

    #[error("Calendar database corrupted: {0}")]
    Corruption(String),
}

impl DatabaseError {
    pub fn user_message(&self) -> &'static str {
        match self {
            DatabaseError::ConnectionFailed(_) => "Calendar data is not available right now.",
            DatabaseError::QueryFailed(_) => "Events could not be loaded. Please try again.",
            DatabaseError::Corruption(_) => "Calendar data is damaged.",
        }
    }
}

/// Errors from the key/value store holding notebook overrides.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Failed to read settings: {0}")]
    Read(String),

    #[error("Failed to write settings: {0}")]
    Write(String),

    #[error("Settings file is malformed: {0}")]
    Malformed(String),
}

impl SettingsError {
    pub fn user_message(&self) -> &'static str {
        match self {
            SettingsError::Read(_) => "Calendar preferences could not be read.",
            SettingsError::Write(_) => "Calendar preferences could not be saved.",
            SettingsError::Malformed(_) => "Calendar preferences were damaged and have been reset.",
        }
    }
}

/// Conversion of SQLite failures into [`DatabaseError`].
pub trait RusqliteErrorExt {
    fn into_database_error(self) -> DatabaseError;
}

impl RusqliteErrorExt for rusqlite::Error {
    fn into_database_error(self) -> DatabaseError {
        match &self {
            rusqlite::Error::SqliteFailure(err, _)
                if matches!(
                    err.code,
                    rusqlite::ErrorCode::DatabaseCorrupt | rusqlite::ErrorCode::NotADatabase
                ) =>
            {
                DatabaseError::Corruption(self.to_string())
            }
            rusqlite::Error::SqliteFailure(err, _)
                if matches!(
                    err.code,
                    rusqlite::ErrorCode::CannotOpen | rusqlite::ErrorCode::DatabaseBusy
                ) =>
            {
                DatabaseError::ConnectionFailed(self.to_string())
            }
            _ => DatabaseError::QueryFailed(self.to_string()),
        }
    }
}
