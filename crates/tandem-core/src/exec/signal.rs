//! Thread-safe completion signals.
//!
//! `WaitableEvent` is the blocking signal used for the harness handshakes
//! (channel created, done, shutdown phases). `ShutdownSignal` is a broadcast
//! latch that can also take part in a `crossbeam::select!`, which is how a
//! blocked `send` notices shutdown while waiting for its reply.

use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;

/// How a signaled event behaves after a waiter wakes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetPolicy {
    /// Stays signaled until `reset` is called; wakes every waiter.
    Manual,
    /// Wakes one waiter and clears itself.
    Automatic,
}

/// A signal that threads can block on.
#[derive(Debug)]
pub struct WaitableEvent {
    signaled: Mutex<bool>,
    cond: Condvar,
    policy: ResetPolicy,
}

impl WaitableEvent {
    pub fn new(policy: ResetPolicy) -> Self {
        Self {
            signaled: Mutex::new(false),
            cond: Condvar::new(),
            policy,
        }
    }

    pub fn manual() -> Self {
        Self::new(ResetPolicy::Manual)
    }

    pub fn automatic() -> Self {
        Self::new(ResetPolicy::Automatic)
    }

    pub fn signal(&self) {
        let mut signaled = self.signaled.lock();
        *signaled = true;
        match self.policy {
            ResetPolicy::Manual => {
                self.cond.notify_all();
            }
            ResetPolicy::Automatic => {
                self.cond.notify_one();
            }
        }
    }

    pub fn reset(&self) {
        *self.signaled.lock() = false;
    }

    /// Peek at the state without consuming an automatic signal.
    pub fn is_signaled(&self) -> bool {
        *self.signaled.lock()
    }

    /// Block until signaled.
    pub fn wait(&self) {
        let mut signaled = self.signaled.lock();
        while !*signaled {
            self.cond.wait(&mut signaled);
        }
        if self.policy == ResetPolicy::Automatic {
            *signaled = false;
        }
    }

    /// Block until signaled or `timeout` elapses. Returns whether the event
    /// was signaled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut signaled = self.signaled.lock();
        while !*signaled {
            if self.cond.wait_until(&mut signaled, deadline).timed_out() {
                break;
            }
        }
        let was_signaled = *signaled;
        if was_signaled && self.policy == ResetPolicy::Automatic {
            *signaled = false;
        }
        was_signaled
    }
}

/// Broadcast latch signaled once, observed by any number of clones.
///
/// Signaling drops the only sender, so every clone of the receiver sees a
/// disconnect. That makes the signal selectable next to other crossbeam
/// channels without ever sending a value.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    trigger: Arc<Mutex<Option<Sender<()>>>>,
    latch: Receiver<()>,
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, rx) = channel::bounded(0);
        Self {
            trigger: Arc::new(Mutex::new(Some(tx))),
            latch: rx,
        }
    }

    pub fn signal(&self) {
        self.trigger.lock().take();
    }

    pub fn is_signaled(&self) -> bool {
        matches!(self.latch.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Receiver that becomes ready (disconnected) once signaled.
    pub fn receiver(&self) -> &Receiver<()> {
        &self.latch
    }

    pub fn wait(&self) {
        let _ = self.latch.recv();
    }
}
