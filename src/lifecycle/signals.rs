//! OS signal handling.
//!
//! # Responsibilities
//! - Block the managed signals for the whole process
//! - Wait for them on one dedicated thread
//! - Dispatch each delivery to the most recently registered handler
//!
//! # Design Decisions
//! - Signals are consumed synchronously with `sigwait`, never through
//!   asynchronous handlers, so callbacks run in a normal thread context
//! - Handlers for one signal form a stack; only the top one runs
//! - SIGUSR1 is reserved: it wakes the waiter thread at shutdown
//! - Callbacks run while the handler table is locked. They must be short,
//!   must not block, and must not register or drop a handler themselves.

use std::collections::HashMap;
use std::os::unix::thread::JoinHandleExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use nix::sys::pthread::pthread_kill;
use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow, Signal};
use parking_lot::Mutex;
use thiserror::Error;

/// Signal used internally to interrupt the waiter thread.
pub const WAKEUP_SIGNAL: Signal = Signal::SIGUSR1;

type Callback = Box<dyn Fn() + Send + 'static>;

/// Errors raised by the signal gateway.
#[derive(Debug, Error)]
pub enum SignalError {
    /// The process signal mask could not be changed.
    #[error("failed to block signals: {0}")]
    Mask(nix::errno::Errno),

    /// The waiter thread could not be started.
    #[error("failed to spawn signal thread: {0}")]
    Spawn(std::io::Error),

    /// A caller asked for the internal wakeup signal.
    #[error("signal {0:?} is reserved for internal use")]
    Reserved(Signal),

    /// A handler was registered for a signal the gateway does not block.
    #[error("signal {0:?} is not managed by this gateway")]
    Unmanaged(Signal),
}

struct Slot {
    callback: Callback,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Insertion-ordered handler list with O(1) removal by slot key.
///
/// Slots are linked by index, freed slots are recycled. A key stays valid
/// until it is removed, whatever happens to its neighbours.
#[derive(Default)]
struct HandlerList {
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl HandlerList {
    fn push(&mut self, callback: Callback) -> usize {
        let slot = Slot {
            callback,
            prev: self.tail,
            next: None,
        };

        let key = match self.free.pop() {
            Some(key) => {
                self.slots[key] = Some(slot);
                key
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };

        match self.tail {
            Some(tail) => {
                if let Some(prev) = self.slot_mut(tail) {
                    prev.next = Some(key);
                }
            }
            None => self.head = Some(key),
        }

        self.tail = Some(key);
        self.len += 1;
        key
    }

    fn remove(&mut self, key: usize) -> bool {
        let slot = match self.slots.get_mut(key).and_then(Option::take) {
            Some(slot) => slot,
            None => return false,
        };

        match slot.prev {
            Some(prev) => {
                if let Some(p) = self.slot_mut(prev) {
                    p.next = slot.next;
                }
            }
            None => self.head = slot.next,
        }

        match slot.next {
            Some(next) => {
                if let Some(n) = self.slot_mut(next) {
                    n.prev = slot.prev;
                }
            }
            None => self.tail = slot.prev,
        }

        self.free.push(key);
        self.len -= 1;
        true
    }

    fn last(&self) -> Option<&Callback> {
        self.tail
            .and_then(|key| self.slots.get(key))
            .and_then(Option::as_ref)
            .map(|slot| &slot.callback)
    }

    fn len(&self) -> usize {
        self.len
    }

    fn slot_mut(&mut self, key: usize) -> Option<&mut Slot> {
        self.slots.get_mut(key).and_then(Option::as_mut)
    }
}

/// State shared between the gateway, its handler tokens and the waiter thread.
#[derive(Default)]
struct Shared {
    handlers: Mutex<HashMap<Signal, HandlerList>>,
    terminate: AtomicBool,
}

impl Shared {
    /// Run the newest handler for `signal`. Returns false if there is none.
    fn dispatch(&self, signal: Signal) -> bool {
        let handlers = self.handlers.lock();
        match handlers.get(&signal).and_then(HandlerList::last) {
            Some(callback) => {
                // The lock stays held so the handler cannot be removed mid-call.
                callback();
                true
            }
            None => false,
        }
    }

    fn register(&self, signal: Signal, callback: Callback) -> usize {
        self.handlers
            .lock()
            .entry(signal)
            .or_default()
            .push(callback)
    }

    fn unregister(&self, signal: Signal, key: usize) {
        let mut handlers = self.handlers.lock();
        if let Some(list) = handlers.get_mut(&signal) {
            list.remove(key);
            if list.len() == 0 {
                handlers.remove(&signal);
            }
        }
    }
}

/// Owner of the process signal mask and the signal waiter thread.
///
/// Must be created before any other thread is spawned: the block is
/// installed on the calling thread and inherited by threads created later.
/// Only one instance should exist per process. Dropping it stops the waiter
/// thread and restores the previous mask of the dropping thread.
pub struct SignalGateway {
    shared: Arc<Shared>,
    managed: Vec<Signal>,
    previous_mask: SigSet,
    thread: Option<JoinHandle<()>>,
}

impl SignalGateway {
    /// Block `signals` (plus the reserved wakeup signal) and start waiting.
    pub fn new(signals: &[Signal]) -> Result<Self, SignalError> {
        if signals.contains(&WAKEUP_SIGNAL) {
            return Err(SignalError::Reserved(WAKEUP_SIGNAL));
        }

        let mut mask = SigSet::empty();
        mask.add(WAKEUP_SIGNAL);
        for signal in signals {
            mask.add(*signal);
        }

        let mut previous_mask = SigSet::empty();
        pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&mask), Some(&mut previous_mask))
            .map_err(SignalError::Mask)?;

        let shared = Arc::new(Shared::default());
        let thread_shared = Arc::clone(&shared);
        let spawned = std::thread::Builder::new()
            .name("signal-gateway".to_string())
            .spawn(move || wait_for_signals(mask, thread_shared));

        let thread = match spawned {
            Ok(thread) => thread,
            Err(e) => {
                let _ = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&previous_mask), None);
                return Err(SignalError::Spawn(e));
            }
        };

        tracing::debug!(signals = ?signals, "Signal gateway started");

        Ok(Self {
            shared,
            managed: signals.to_vec(),
            previous_mask,
            thread: Some(thread),
        })
    }

    /// Push a handler for `signal`. It stays installed until the returned
    /// token is dropped.
    pub fn register_handler<F>(&self, signal: Signal, callback: F) -> Result<SignalHandler, SignalError>
    where
        F: Fn() + Send + 'static,
    {
        if signal == WAKEUP_SIGNAL {
            return Err(SignalError::Reserved(signal));
        }
        if !self.managed.contains(&signal) {
            return Err(SignalError::Unmanaged(signal));
        }

        let key = self.shared.register(signal, Box::new(callback));
        tracing::debug!(signal = ?signal, "Signal handler installed");

        Ok(SignalHandler {
            shared: Arc::clone(&self.shared),
            signal,
            key,
        })
    }
}

impl Drop for SignalGateway {
    fn drop(&mut self) {
        self.shared.terminate.store(true, Ordering::Release);

        if let Some(thread) = self.thread.take() {
            if let Err(e) = pthread_kill(thread.as_pthread_t(), WAKEUP_SIGNAL) {
                tracing::warn!(error = %e, "Failed to wake signal thread");
            }
            let _ = thread.join();
        }

        // Errors are ignored, the process is most likely shutting down anyway.
        let _ = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&self.previous_mask), None);
        tracing::debug!("Signal gateway stopped");
    }
}

fn wait_for_signals(mask: SigSet, shared: Arc<Shared>) {
    while !shared.terminate.load(Ordering::Acquire) {
        let signal = match mask.wait() {
            Ok(signal) => signal,
            Err(e) => {
                tracing::debug!(error = %e, "sigwait failed");
                continue;
            }
        };

        if shared.terminate.load(Ordering::Acquire) {
            break;
        }
        if signal == WAKEUP_SIGNAL {
            continue;
        }

        tracing::debug!(signal = ?signal, "Signal received");
        if !shared.dispatch(signal) {
            tracing::debug!(signal = ?signal, "No handler installed, signal ignored");
        }
    }

    tracing::debug!("Signal thread terminated");
}

/// Token for an installed handler. Dropping it uninstalls exactly that
/// handler, wherever it sits in the signal's stack.
#[must_use = "dropping the token uninstalls the handler"]
pub struct SignalHandler {
    shared: Arc<Shared>,
    signal: Signal,
    key: usize,
}

impl SignalHandler {
    /// The signal this handler is installed for.
    pub fn signal(&self) -> Signal {
        self.signal
    }
}

impl Drop for SignalHandler {
    fn drop(&mut self) {
        self.shared.unregister(self.signal, self.key);
        tracing::debug!(signal = ?self.signal, "Signal handler uninstalled");
    }
}
