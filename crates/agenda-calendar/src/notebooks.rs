//! Known notebooks with their colors and exclusion state.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::Value;

use crate::error::CalendarResult;
use crate::settings::{color_key, exclude_key, SettingsStore};
use crate::types::{Notebook, NotebookRecord};

/// Mirror of the store's notebooks plus user overrides from settings.
pub struct NotebookRegistry {
    notebooks: Vec<Notebook>,
    loaded: bool,
    settings: Arc<dyn SettingsStore>,
    palette: Vec<String>,
    fallback_color: String,
}

impl NotebookRegistry {
    pub fn new(settings: Arc<dyn SettingsStore>, palette: Vec<String>, fallback_color: String) -> Self {
        Self {
            notebooks: Vec::new(),
            loaded: false,
            settings,
            palette,
            fallback_color,
        }
    }

    /// Rebuild from the store's records. Returns whether anything changed; the
    /// first load always counts as a change.
    ///
    /// Color precedence is user override, then the store's color, then the
    /// palette handed out round-robin in enumeration order.
    pub fn load_all(&mut self, records: Vec<NotebookRecord>) -> bool {
        let mut next_palette_color = 0usize;

        let notebooks: Vec<Notebook> = records
            .into_iter()
            .map(|record| {
                let color = self
                    .settings
                    .string_value(&color_key(&record.uid))
                    .filter(|c| !c.is_empty())
                    .or_else(|| record.color.clone().filter(|c| !c.is_empty()))
                    .unwrap_or_else(|| {
                        let color = self.palette_color(next_palette_color);
                        next_palette_color += 1;
                        color
                    });

                Notebook {
                    excluded: self.settings.bool_value(&exclude_key(&record.uid), false),
                    local_calendar: record.is_local(),
                    uid: record.uid,
                    name: record.name,
                    description: record.description,
                    color,
                    is_default: record.is_default,
                    read_only: record.read_only,
                }
            })
            .collect();

        let defaults = notebooks
            .iter()
            .filter(|n| n.is_default && !n.excluded)
            .count();
        if defaults > 1 {
            tracing::warn!(defaults, "Store reports more than one default notebook");
            debug_assert!(defaults <= 1, "more than one default notebook");
        }

        let changed = !self.loaded || notebooks != self.notebooks;
        self.notebooks = notebooks;
        self.loaded = true;

        if changed {
            tracing::debug!(count = self.notebooks.len(), "Notebooks changed");
        }
        changed
    }

    fn palette_color(&self, index: usize) -> String {
        if self.palette.is_empty() {
            return self.fallback_color.clone();
        }
        self.palette[index % self.palette.len()].clone()
    }

    pub fn notebooks(&self) -> &[Notebook] {
        &self.notebooks
    }

    pub fn notebook(&self, uid: &str) -> Option<&Notebook> {
        self.notebooks.iter().find(|n| n.uid == uid)
    }

    /// The default notebook, if one is visible.
    pub fn default_notebook(&self) -> Option<&Notebook> {
        self.notebooks.iter().find(|n| n.is_default && !n.excluded)
    }

    pub fn is_read_only(&self, uid: &str) -> bool {
        self.notebook(uid).is_some_and(|n| n.read_only)
    }

    /// Uids of excluded notebooks.
    pub fn excluded(&self) -> BTreeSet<String> {
        self.notebooks
            .iter()
            .filter(|n| n.excluded)
            .map(|n| n.uid.clone())
            .collect()
    }

    /// Display color, or the fallback for unknown notebooks.
    pub fn color(&self, uid: &str) -> String {
        self.notebook(uid)
            .map(|n| n.color.clone())
            .unwrap_or_else(|| self.fallback_color.clone())
    }

    /// Flip exclusion for one notebook. Unknown uids and unchanged state are
    /// no-ops; returns whether anything changed.
    pub fn set_excluded(&mut self, uid: &str, excluded: bool) -> CalendarResult<bool> {
        let Some(index) = self.notebooks.iter().position(|n| n.uid == uid) else {
            tracing::debug!(uid, "Ignoring exclusion change for unknown notebook");
            return Ok(false);
        };
        if self.notebooks[index].excluded == excluded {
            return Ok(false);
        }

        let key = exclude_key(uid);
        if excluded {
            self.settings.set_value(&key, Value::Bool(true))?;
        } else {
            self.settings.remove(&key)?;
        }
        self.notebooks[index].excluded = excluded;
        Ok(true)
    }

    /// Make exactly `excluded` the excluded set (restricted to known notebooks).
    pub fn set_excluded_set(&mut self, excluded: &BTreeSet<String>) -> CalendarResult<bool> {
        let updates: Vec<(String, bool)> = self
            .notebooks
            .iter()
            .filter(|n| n.excluded != excluded.contains(&n.uid))
            .map(|n| (n.uid.clone(), !n.excluded))
            .collect();

        let mut changed = false;
        for (uid, value) in updates {
            changed |= self.set_excluded(&uid, value)?;
        }
        Ok(changed)
    }

    /// Persist a color override. Unknown uids and unchanged colors are no-ops.
    pub fn set_color(&mut self, uid: &str, color: &str) -> CalendarResult<bool> {
        let Some(index) = self.notebooks.iter().position(|n| n.uid == uid) else {
            tracing::debug!(uid, "Ignoring color change for unknown notebook");
            return Ok(false);
        };
        if self.notebooks[index].color == color {
            return Ok(false);
        }

        self.settings
            .set_value(&color_key(uid), Value::String(color.to_string()))?;
        self.notebooks[index].color = color.to_string();
        Ok(true)
    }
}
