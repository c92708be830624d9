//! Cooperative scheduler for the control loop.
//!
//! # Data Flow
//! ```text
//! control loop ── run_once() ──▶ queued tasks (from any thread)
//!                                 ──▶ due timers (loop thread only)
//!                                 ──▶ bounded wait on the wakeup condvar
//!
//! signal thread / I/O tasks ── SchedulerHandle::{terminate, wake, schedule}
//!                                 ──▶ flag + notify under the wakeup mutex
//! ```
//!
//! # Design Decisions
//! - Timers are single-threaded (`Rc`), only the handle is `Send + Sync`
//! - A wakeup sets a flag under the mutex the waiter checks before
//!   sleeping, so it cannot be lost between check and wait
//! - One `run_once` fires only what was due when it started; work created
//!   while firing waits for the next call

pub mod timer;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

pub use timer::TimerHandle;
use timer::{TimerEntry, TimerQueue};

type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct Pending {
    tasks: VecDeque<Task>,
    woken: bool,
}

#[derive(Default)]
struct Shared {
    terminating: AtomicBool,
    pending: Mutex<Pending>,
    wakeup: Condvar,
}

/// Thread-safe handle for talking to the scheduler from other threads.
#[derive(Clone)]
pub struct SchedulerHandle {
    shared: Arc<Shared>,
}

impl SchedulerHandle {
    /// Request termination. The control loop observes it on its next check.
    ///
    /// Safe to call from a signal gateway callback.
    pub fn terminate(&self) {
        self.shared.terminating.store(true, Ordering::SeqCst);
        self.wake();
    }

    /// Interrupt a pending wait so the loop runs another iteration.
    pub fn wake(&self) {
        let mut pending = self.shared.pending.lock();
        pending.woken = true;
        self.shared.wakeup.notify_all();
    }

    /// Run `task` on the loop thread during the next `run_once`.
    pub fn schedule<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut pending = self.shared.pending.lock();
        pending.tasks.push_back(Box::new(task));
        pending.woken = true;
        self.shared.wakeup.notify_all();
    }

    /// True once termination has been requested.
    pub fn is_terminating(&self) -> bool {
        self.shared.terminating.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerHandle")
            .field("terminating", &self.is_terminating())
            .finish()
    }
}

/// Single-threaded timer scheduler driven by the control loop.
pub struct Scheduler {
    shared: Arc<Shared>,
    timers: RefCell<TimerQueue>,
    tick_interval: Duration,
}

impl Scheduler {
    /// Create a scheduler whose waits never exceed `tick_interval`.
    pub fn new(tick_interval: Duration) -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            timers: RefCell::new(TimerQueue::default()),
            tick_interval,
        }
    }

    /// A cloneable, `Send` handle for other threads.
    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Request termination from the loop thread.
    pub fn terminate(&self) {
        self.handle().terminate();
    }

    /// True once termination has been requested.
    pub fn is_terminating(&self) -> bool {
        self.shared.terminating.load(Ordering::SeqCst)
    }

    /// Run `action` once at `due`.
    pub fn schedule_at<F>(&self, due: Instant, action: F) -> TimerHandle
    where
        F: FnMut() + 'static,
    {
        let entry = TimerEntry::new(None, Box::new(action));
        self.timers.borrow_mut().insert(due, Rc::clone(&entry));
        TimerHandle::new(entry)
    }

    /// Run `action` once after `delay`.
    pub fn schedule_after<F>(&self, delay: Duration, action: F) -> TimerHandle
    where
        F: FnMut() + 'static,
    {
        self.schedule_at(Instant::now() + delay, action)
    }

    /// Run `action` every `interval`, first after one interval.
    pub fn schedule_recurring<F>(&self, interval: Duration, action: F) -> TimerHandle
    where
        F: FnMut() + 'static,
    {
        let entry = TimerEntry::new(Some(interval), Box::new(action));
        self.timers
            .borrow_mut()
            .insert(Instant::now() + interval, Rc::clone(&entry));
        TimerHandle::new(entry)
    }

    /// Number of timers that have not been cancelled.
    pub fn pending_timers(&self) -> usize {
        self.timers.borrow().live()
    }

    /// Perform one unit of due work, then wait for more.
    ///
    /// Returns true once termination has been requested.
    pub fn run_once(&self) -> bool {
        self.advance(Instant::now());
        if self.is_terminating() {
            return true;
        }

        self.wait();
        self.is_terminating()
    }

    /// Run queued tasks and every timer due at `now`, without waiting.
    pub fn advance(&self, now: Instant) {
        self.run_tasks();
        self.fire_timers(now);
    }

    fn run_tasks(&self) {
        let tasks = std::mem::take(&mut self.shared.pending.lock().tasks);
        for task in tasks {
            task();
        }
    }

    fn fire_timers(&self, now: Instant) {
        let due = self.timers.borrow().due_keys(now);

        for key in due {
            let entry = match self.timers.borrow_mut().take(&key) {
                Some(entry) => entry,
                None => continue,
            };
            if entry.cancelled.get() {
                continue;
            }

            {
                let mut action = entry.action.borrow_mut();
                (&mut *action)();
            }

            if entry.cancelled.get() {
                // Cancelled by its own action; drop captured state now.
                *entry.action.borrow_mut() = Box::new(|| {});
                continue;
            }

            if let Some(interval) = entry.interval {
                let mut next = key.0 + interval;
                if next <= now {
                    next = now + interval;
                }
                self.timers.borrow_mut().insert(next, entry);
            }
        }
    }

    fn wait(&self) {
        let now = Instant::now();
        let mut deadline = now + self.tick_interval;
        if let Some(next) = self.timers.borrow_mut().next_due() {
            deadline = deadline.min(next);
        }
        if deadline <= now {
            return;
        }

        let mut pending = self.shared.pending.lock();
        if !pending.woken && pending.tasks.is_empty() && !self.is_terminating() {
            let _ = self.shared.wakeup.wait_until(&mut pending, deadline);
        }
        pending.woken = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn one_shot_timer_fires_once() {
        let scheduler = Scheduler::new(Duration::from_millis(10));
        let hits = Rc::new(Cell::new(0));
        let h = Rc::clone(&hits);
        let start = Instant::now();
        let _timer = scheduler.schedule_at(start + Duration::from_secs(1), move || h.set(h.get() + 1));

        scheduler.advance(start);
        assert_eq!(hits.get(), 0);

        scheduler.advance(start + Duration::from_secs(1));
        scheduler.advance(start + Duration::from_secs(5));
        assert_eq!(hits.get(), 1);
        assert_eq!(scheduler.pending_timers(), 0);
    }

    #[test]
    fn recurring_timer_fires_every_interval() {
        let scheduler = Scheduler::new(Duration::from_millis(10));
        let hits = Rc::new(Cell::new(0));
        let h = Rc::clone(&hits);
        let start = Instant::now();
        let timer = scheduler.schedule_recurring(Duration::from_secs(1), move || h.set(h.get() + 1));

        for i in 1..=3 {
            scheduler.advance(start + Duration::from_secs(i) + Duration::from_millis(5));
        }
        assert_eq!(hits.get(), 3);

        drop(timer);
        scheduler.advance(start + Duration::from_secs(10));
        assert_eq!(hits.get(), 3);
    }

    #[test]
    fn dropping_handle_cancels() {
        let scheduler = Scheduler::new(Duration::from_millis(10));
        let hits = Rc::new(Cell::new(0));
        let h = Rc::clone(&hits);
        let start = Instant::now();
        let timer = scheduler.schedule_at(start, move || h.set(h.get() + 1));
        assert!(timer.is_active());
        timer.cancel();

        scheduler.advance(start + Duration::from_secs(1));
        assert_eq!(hits.get(), 0);
    }

    #[test]
    fn cancel_from_inside_the_action() {
        let scheduler = Scheduler::new(Duration::from_millis(10));
        let hits = Rc::new(Cell::new(0));
        let slot: Rc<RefCell<Option<TimerHandle>>> = Rc::new(RefCell::new(None));

        let h = Rc::clone(&hits);
        let s = Rc::clone(&slot);
        let timer = scheduler.schedule_recurring(Duration::from_secs(1), move || {
            h.set(h.get() + 1);
            // Dispose of our own handle mid-fire.
            s.borrow_mut().take();
        });
        *slot.borrow_mut() = Some(timer);

        let start = Instant::now();
        scheduler.advance(start + Duration::from_secs(2));
        scheduler.advance(start + Duration::from_secs(4));
        assert_eq!(hits.get(), 1);
        assert_eq!(scheduler.pending_timers(), 0);
    }

    #[test]
    fn same_tick_timers_fire_in_registration_order() {
        let scheduler = Scheduler::new(Duration::from_millis(10));
        let order = Rc::new(RefCell::new(Vec::new()));
        let due = Instant::now();

        let timers: Vec<_> = (0..5)
            .map(|i| {
                let order = Rc::clone(&order);
                scheduler.schedule_at(due, move || order.borrow_mut().push(i))
            })
            .collect();

        scheduler.advance(due);
        assert_eq!(*order.borrow(), vec![0, 1, 2, 3, 4]);
        drop(timers);
    }

    #[test]
    fn detached_timer_still_fires() {
        let scheduler = Scheduler::new(Duration::from_millis(10));
        let hits = Rc::new(Cell::new(0));
        let h = Rc::clone(&hits);
        let due = Instant::now();
        scheduler.schedule_at(due, move || h.set(h.get() + 1)).detach();

        scheduler.advance(due);
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn timers_created_while_firing_wait_for_next_round() {
        let scheduler = Rc::new(Scheduler::new(Duration::from_millis(10)));
        let hits = Rc::new(Cell::new(0));
        let due = Instant::now();

        let inner = Rc::clone(&scheduler);
        let h = Rc::clone(&hits);
        scheduler
            .schedule_at(due, move || {
                let h = Rc::clone(&h);
                inner.schedule_at(due, move || h.set(h.get() + 1)).detach();
            })
            .detach();

        scheduler.advance(due);
        assert_eq!(hits.get(), 0);
        scheduler.advance(due);
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn terminate_from_another_thread_interrupts_wait() {
        let scheduler = Scheduler::new(Duration::from_secs(30));
        let handle = scheduler.handle();

        let started = Instant::now();
        let thread = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            handle.terminate();
        });

        let mut terminated = false;
        while !terminated {
            terminated = scheduler.run_once();
            assert!(started.elapsed() < Duration::from_secs(10));
        }
        thread.join().unwrap();
        assert!(scheduler.is_terminating());
    }

    #[test]
    fn scheduled_tasks_run_on_loop_thread() {
        let scheduler = Scheduler::new(Duration::from_millis(10));
        let handle = scheduler.handle();
        let (tx, rx) = std::sync::mpsc::channel();

        std::thread::spawn(move || {
            handle.schedule(move || {
                tx.send(std::thread::current().id()).unwrap();
            });
        })
        .join()
        .unwrap();

        assert!(!scheduler.run_once());
        assert_eq!(rx.try_recv().unwrap(), std::thread::current().id());
    }
}
