use std::sync::Arc;
use std::time::Duration;

use agenda_calendar::{CalendarManager, DateRange, JsonSettings, Occurrence, SqliteStorage};
use anyhow::{Context, Result};

fn main() -> Result<()> {
    let (config, _) = agenda_core::Config::load_validated()?;
    agenda_core::init(&config.logging.filter)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("agenda-worker")
        .build()
        .context("Failed to build runtime")?;

    let calendar = &config.calendar;
    let storage = Arc::new(
        SqliteStorage::new(&calendar.database_path).context("Failed to open calendar database")?,
    );
    let settings = Arc::new(
        JsonSettings::open(&calendar.settings_path).context("Failed to open calendar settings")?,
    );

    let mut manager = CalendarManager::new(storage, settings, runtime.handle(), calendar);

    let today = chrono::Local::now().date_naive();
    let last_day = today + chrono::Duration::days(i64::from(calendar.agenda_days) - 1);
    let view = manager.register_view(DateRange::new(today, Some(last_day)), |_, _| {});

    if !manager.wait_for_idle(Duration::from_secs(30)) {
        tracing::warn!("Timed out waiting for calendar data");
    }

    let occurrences: &[Occurrence] = manager.view_occurrences(view).unwrap_or_default();
    println!("Agenda {} to {}", today, last_day);
    if occurrences.is_empty() {
        println!("  (nothing scheduled)");
    }
    for occurrence in occurrences {
        let label = manager
            .event(&occurrence.event_uid)
            .map(|e| e.display_label)
            .unwrap_or_else(|| occurrence.event_uid.clone());
        println!(
            "  {}  {}",
            occurrence.start_time.format("%a %d %b %H:%M"),
            label
        );
    }

    manager.shutdown();
    tracing::info!("Agenda finished");
    Ok(())
}
