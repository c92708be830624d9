//! Timer entries and their cancellation handles.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

pub(crate) type Action = Box<dyn FnMut()>;

/// A scheduled action, shared between the queue and its handle.
pub(crate) struct TimerEntry {
    pub(crate) interval: Option<Duration>,
    pub(crate) cancelled: Cell<bool>,
    pub(crate) action: RefCell<Action>,
}

impl TimerEntry {
    pub(crate) fn new(interval: Option<Duration>, action: Action) -> Rc<Self> {
        Rc::new(Self {
            interval,
            cancelled: Cell::new(false),
            action: RefCell::new(action),
        })
    }

    fn cancel(&self) {
        self.cancelled.set(true);

        // Release captured state right away unless the action is running;
        // in that case the scheduler drops it once the call returns.
        if let Ok(mut action) = self.action.try_borrow_mut() {
            *action = Box::new(|| {});
        }
    }
}

/// Pending timers ordered by due time, then by registration.
#[derive(Default)]
pub(crate) struct TimerQueue {
    entries: BTreeMap<(Instant, u64), Rc<TimerEntry>>,
    next_seq: u64,
}

impl TimerQueue {
    pub(crate) fn insert(&mut self, due: Instant, entry: Rc<TimerEntry>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert((due, seq), entry);
    }

    /// Keys of every timer due at or before `now`, in firing order.
    pub(crate) fn due_keys(&self, now: Instant) -> Vec<(Instant, u64)> {
        self.entries
            .range(..=(now, u64::MAX))
            .map(|(key, _)| *key)
            .collect()
    }

    pub(crate) fn take(&mut self, key: &(Instant, u64)) -> Option<Rc<TimerEntry>> {
        self.entries.remove(key)
    }

    /// Earliest due time among live timers, dropping cancelled heads.
    pub(crate) fn next_due(&mut self) -> Option<Instant> {
        while let Some((key, entry)) = self.entries.first_key_value() {
            if entry.cancelled.get() {
                let key = *key;
                self.entries.remove(&key);
                continue;
            }
            return Some(key.0);
        }
        None
    }

    pub(crate) fn live(&self) -> usize {
        self.entries
            .values()
            .filter(|entry| !entry.cancelled.get())
            .count()
    }
}

/// Handle to a scheduled timer. Dropping it cancels the timer.
///
/// Cancelling from inside the timer's own action is allowed: the running
/// call completes and the timer never fires again.
#[must_use = "dropping the handle cancels the timer"]
pub struct TimerHandle {
    entry: Option<Rc<TimerEntry>>,
}

impl TimerHandle {
    pub(crate) fn new(entry: Rc<TimerEntry>) -> Self {
        Self { entry: Some(entry) }
    }

    /// Let the timer run without a handle. A detached recurring timer
    /// lives as long as the scheduler.
    pub fn detach(mut self) {
        self.entry = None;
    }

    /// Cancel the timer now.
    pub fn cancel(self) {
        drop(self);
    }

    /// True while the timer has not been cancelled.
    pub fn is_active(&self) -> bool {
        self.entry
            .as_ref()
            .map(|entry| !entry.cancelled.get())
            .unwrap_or(false)
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            entry.cancel();
        }
    }
}

impl std::fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerHandle")
            .field("active", &self.is_active())
            .finish()
    }
}
