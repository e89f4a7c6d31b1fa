//! Long-lived event handles keyed by event uid.
//!
//! Handles survive reloads. A reload rebinds them to fresh data; events that
//! disappeared keep their last known data but report absence through
//! [`EventHandle::event`] and [`EventHandle::is_present`].

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use crate::types::Event;

/// What changed on a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleChange {
    Data,
    Color,
    Removed,
}

type HandleCallback = Box<dyn Fn(&EventHandle, HandleChange)>;

#[derive(Default)]
struct HandleState {
    last_known: Option<Event>,
    present: bool,
    color: Option<String>,
}

/// Shared front-end handle for one event.
pub struct EventHandle {
    uid: String,
    state: RefCell<HandleState>,
    subscribers: RefCell<Vec<HandleCallback>>,
}

impl std::fmt::Debug for EventHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("EventHandle")
            .field("uid", &self.uid)
            .field("present", &state.present)
            .field("color", &state.color)
            .finish()
    }
}

impl EventHandle {
    fn new(uid: String) -> Self {
        Self {
            uid,
            state: RefCell::new(HandleState::default()),
            subscribers: RefCell::new(Vec::new()),
        }
    }

    pub fn unique_id(&self) -> &str {
        &self.uid
    }

    /// Current data; `None` if never bound or gone from storage.
    pub fn event(&self) -> Option<Event> {
        let state = self.state.borrow();
        if state.present {
            state.last_known.clone()
        } else {
            None
        }
    }

    /// Data from the last time the event was seen, even if it is gone now.
    pub fn last_known(&self) -> Option<Event> {
        self.state.borrow().last_known.clone()
    }

    pub fn is_present(&self) -> bool {
        self.state.borrow().present
    }

    /// Color of the owning notebook.
    pub fn color(&self) -> Option<String> {
        self.state.borrow().color.clone()
    }

    pub fn calendar_uid(&self) -> Option<String> {
        self.state
            .borrow()
            .last_known
            .as_ref()
            .map(|e| e.calendar_uid.clone())
    }

    /// Register a change callback. Callbacks must not subscribe re-entrantly.
    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(&EventHandle, HandleChange) + 'static,
    {
        self.subscribers.borrow_mut().push(Box::new(callback));
    }

    fn notify(&self, change: HandleChange) {
        for callback in self.subscribers.borrow().iter() {
            callback(self, change);
        }
    }

    fn bind(&self, event: Event, color: String) {
        let (data_changed, color_changed) = {
            let mut state = self.state.borrow_mut();
            let data_changed = !state.present || state.last_known.as_ref() != Some(&event);
            let color_changed = state.color.as_deref() != Some(color.as_str());
            state.last_known = Some(event);
            state.present = true;
            state.color = Some(color);
            (data_changed, color_changed)
        };

        if data_changed {
            self.notify(HandleChange::Data);
        }
        if color_changed {
            self.notify(HandleChange::Color);
        }
    }

    fn mark_absent(&self) -> bool {
        let was_present = {
            let mut state = self.state.borrow_mut();
            std::mem::replace(&mut state.present, false)
        };
        if was_present {
            self.notify(HandleChange::Removed);
        }
        was_present
    }

    fn set_color(&self, color: &str) {
        let changed = {
            let mut state = self.state.borrow_mut();
            if state.color.as_deref() == Some(color) {
                false
            } else {
                state.color = Some(color.to_string());
                true
            }
        };
        if changed {
            self.notify(HandleChange::Color);
        }
    }
}

/// One handle per event uid, for the lifetime of the cache.
#[derive(Default)]
pub struct EventIdentityCache {
    handles: HashMap<String, Rc<EventHandle>>,
}

impl EventIdentityCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing handle for `uid`, or a new unbound one.
    pub fn get_or_create(&mut self, uid: &str) -> Rc<EventHandle> {
        self.handles
            .entry(uid.to_string())
            .or_insert_with(|| Rc::new(EventHandle::new(uid.to_string())))
            .clone()
    }

    /// Rebind an existing handle to fresh data. Uids without a handle are
    /// ignored; returns whether a handle was updated.
    pub fn retarget(&self, uid: &str, event: Event, color: String) -> bool {
        match self.handles.get(uid) {
            Some(handle) => {
                handle.bind(event, color);
                true
            }
            None => false,
        }
    }

    /// After a full snapshot, flag every handle whose uid is not in `present`.
    pub fn mark_absent_except(&self, present: &HashSet<String>) -> usize {
        let mut removed = 0;
        for (uid, handle) in &self.handles {
            if !present.contains(uid) && handle.mark_absent() {
                removed += 1;
            }
        }
        removed
    }

    /// Flag one handle as gone from storage. Returns whether it was present.
    pub fn mark_absent(&self, uid: &str) -> bool {
        self.handles.get(uid).is_some_and(|handle| handle.mark_absent())
    }

    /// Push a new notebook color to every handle of that notebook.
    pub fn refresh_color(&self, notebook_uid: &str, color: &str) {
        for handle in self.handles.values() {
            if handle.calendar_uid().as_deref() == Some(notebook_uid) {
                handle.set_color(color);
            }
        }
    }

    /// Uids that have a handle, bound or not.
    pub fn uids(&self) -> impl Iterator<Item = &str> {
        self.handles.keys().map(String::as_str)
    }
}
