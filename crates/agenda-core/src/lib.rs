pub mod config;
pub mod error;

pub use config::{
    CalendarConfig, Config, LoggingConfig, ValidationResult, DEFAULT_FALLBACK_COLOR,
    DEFAULT_NOTEBOOK_COLORS,
};
pub use error::{DatabaseError, RusqliteErrorExt, SettingsError};

use anyhow::Result;

/// Initialize logging for the application.
///
/// `RUST_LOG` wins over `default_filter`; an unparsable filter falls back to "info".
pub fn init(default_filter: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    tracing::info!("Agenda core initialized");
    Ok(())
}
