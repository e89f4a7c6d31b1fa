use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Configuration validation errors
#[derive(Debug, Clone)]
pub struct ConfigValidationError {
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Result of config validation
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<ConfigValidationError>,
    pub warnings: Vec<ConfigValidationError>,
}

impl ValidationResult {
    /// Returns true if there are no errors (warnings are OK)
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Add an error
    pub fn add_error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ConfigValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Add a warning
    pub fn add_warning(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.warnings.push(ConfigValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Get a user-friendly message summarizing all errors
    pub fn error_summary(&self) -> String {
        if self.errors.is_empty() {
            return String::new();
        }
        self.errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Application configuration directory
    pub config_dir: PathBuf,

    /// Calendar cache settings
    #[serde(default)]
    pub calendar: CalendarConfig,

    /// Log output settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Palette handed out to notebooks that have neither a stored nor a user color.
pub const DEFAULT_NOTEBOOK_COLORS: [&str; 6] = ["#00aeef", "red", "blue", "green", "pink", "yellow"];

/// Color reported for notebooks the registry does not know about.
pub const DEFAULT_FALLBACK_COLOR: &str = "black";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarConfig {
    /// SQLite database holding events and notebooks
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// JSON file holding notebook exclusion and color overrides
    #[serde(default = "default_settings_path")]
    pub settings_path: PathBuf,

    /// Round-robin palette for notebooks without a color
    #[serde(default = "default_notebook_colors")]
    pub default_colors: Vec<String>,

    /// Color reported for unknown notebooks
    #[serde(default = "default_fallback_color")]
    pub fallback_color: String,

    /// Merge view ranges that only touch (Jan 5-10 + Jan 11-15) into one load
    #[serde(default = "default_merge_adjacent_days")]
    pub merge_adjacent_days: bool,

    /// Upper bound on instances produced for one recurring event per window
    #[serde(default = "default_max_occurrences")]
    pub max_occurrences_per_event: u16,

    /// Number of days shown by the command line agenda
    #[serde(default = "default_agenda_days")]
    pub agenda_days: u32,
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("agenda")
}

fn default_database_path() -> PathBuf {
    default_data_dir().join("calendar.db")
}

fn default_settings_path() -> PathBuf {
    default_data_dir().join("calendar_settings.json")
}

fn default_notebook_colors() -> Vec<String> {
    DEFAULT_NOTEBOOK_COLORS.iter().map(|c| c.to_string()).collect()
}

fn default_fallback_color() -> String {
    DEFAULT_FALLBACK_COLOR.to_string()
}

fn default_merge_adjacent_days() -> bool {
    true
}

fn default_max_occurrences() -> u16 {
    1000
}

fn default_agenda_days() -> u32 {
    7
}

impl Default for CalendarConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            settings_path: default_settings_path(),
            default_colors: default_notebook_colors(),
            fallback_color: default_fallback_color(),
            merge_adjacent_days: default_merge_adjacent_days(),
            max_occurrences_per_event: default_max_occurrences(),
            agenda_days: default_agenda_days(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter used when RUST_LOG is not set (e.g. "info", "agenda_calendar=debug")
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("agenda");

        Self {
            config_dir,
            calendar: CalendarConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file, creating default if it doesn't exist
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;
        Self::load_from(&config_path)
    }

    /// Load configuration from an explicit path, writing defaults there if missing
    pub fn load_from(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            let config = Self::default();
            config.save_to(config_path)?;
            return Ok(config);
        }

        let contents =
            std::fs::read_to_string(config_path).context("Failed to read config file")?;

        let config: Config = toml::from_str(&contents).context("Failed to parse config file")?;

        Ok(config)
    }

    /// Load configuration and validate it
    ///
    /// Returns the config along with any validation warnings.
    /// Returns an error if validation fails with critical errors.
    pub fn load_validated() -> Result<(Self, ValidationResult)> {
        let config = Self::load()?;
        let validation = config.validate();

        if !validation.is_valid() {
            anyhow::bail!(
                "Configuration validation failed: {}",
                validation.error_summary()
            );
        }

        for warning in &validation.warnings {
            tracing::warn!("Config warning: {}", warning);
        }

        Ok((config, validation))
    }

    /// Validate the configuration
    ///
    /// Returns a ValidationResult containing any errors or warnings.
    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.calendar.default_colors.is_empty() {
            result.add_error(
                "calendar.default_colors",
                "At least one default notebook color is required",
            );
        } else if self.calendar.default_colors.iter().any(|c| c.trim().is_empty()) {
            result.add_error(
                "calendar.default_colors",
                "Default notebook colors cannot be empty strings",
            );
        }

        if self.calendar.fallback_color.trim().is_empty() {
            result.add_error("calendar.fallback_color", "Fallback color cannot be empty");
        }

        if self.calendar.max_occurrences_per_event == 0 {
            result.add_error(
                "calendar.max_occurrences_per_event",
                "Occurrence limit must be greater than 0",
            );
        }

        if self.calendar.agenda_days == 0 {
            result.add_error("calendar.agenda_days", "Agenda must cover at least one day");
        } else if self.calendar.agenda_days > 366 {
            result.add_warning(
                "calendar.agenda_days",
                "Agenda covers more than a year, loads may be slow",
            );
        }

        if let Some(parent) = self.calendar.database_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                result.add_warning(
                    "calendar.database_path",
                    format!("Directory does not exist yet: {}", parent.display()),
                );
            }
        }

        if self.logging.filter.trim().is_empty() {
            result.add_warning("logging.filter", "Empty log filter, falling back to info");
        }

        result
    }

    /// Save configuration to the default location
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;
        self.save_to(&config_path)
    }

    /// Save configuration to an explicit path
    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        // Ensure config directory exists
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(config_path, contents).context("Failed to write config file")?;

        Ok(())
    }

    /// Get the path to the configuration file
    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("agenda");

        Ok(config_dir.join("config.toml"))
    }
}
