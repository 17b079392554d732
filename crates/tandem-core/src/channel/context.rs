//! State shared between a channel's listener thread and its IPC thread.
//!
//! The listener thread pushes a `PendingSyncCall` before it blocks and pops
//! it after it wakes. The IPC thread resolves entries as replies arrive, or
//! resolves all of them when the connection goes away. Both sides only touch
//! the stack under the context mutex.

use crate::exec::ShutdownSignal;
use crate::transport::{CallId, Message};
use crate::{Result, TandemError};
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Whether a blocked call keeps running its thread's other work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Pumping {
    /// Pure wait; everything else queued on the thread runs after the reply.
    #[default]
    Disabled,
    /// Keep dispatching tasks and incoming requests while waiting.
    Enabled,
}

impl Pumping {
    pub fn is_enabled(&self) -> bool {
        matches!(self, Pumping::Enabled)
    }
}

impl From<bool> for Pumping {
    fn from(pump: bool) -> Self {
        if pump {
            Pumping::Enabled
        } else {
            Pumping::Disabled
        }
    }
}

/// How a pending call was resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    Reply { ok: bool, payload: Value },
    Closed,
}

/// Per-channel delivery counters.
#[derive(Debug, Default)]
pub struct ChannelStats {
    protocol_violations: AtomicU64,
    messages_dispatched: AtomicU64,
    replies_sent: AtomicU64,
}

/// Point-in-time copy of `ChannelStats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub protocol_violations: u64,
    pub messages_dispatched: u64,
    pub replies_sent: u64,
}

impl ChannelStats {
    pub fn record_violation(&self) {
        self.protocol_violations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dispatched(&self) {
        self.messages_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reply_sent(&self) {
        self.replies_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            protocol_violations: self.protocol_violations.load(Ordering::Relaxed),
            messages_dispatched: self.messages_dispatched.load(Ordering::Relaxed),
            replies_sent: self.replies_sent.load(Ordering::Relaxed),
        }
    }
}

struct PendingSyncCall {
    id: CallId,
    pumping: Pumping,
    completion: Sender<CallOutcome>,
    resolved: bool,
}

#[derive(Default)]
struct CallStack {
    calls: Vec<PendingSyncCall>,
    closed: bool,
}

/// Receiving half handed to the thread that issued a call.
#[derive(Debug)]
pub struct CallWaiter {
    id: CallId,
    completion: Receiver<CallOutcome>,
}

impl CallWaiter {
    pub fn id(&self) -> CallId {
        self.id
    }

    pub fn completion(&self) -> &Receiver<CallOutcome> {
        &self.completion
    }
}

/// The call stack of one channel plus the signals needed to wake it.
pub struct SyncContext {
    channel: String,
    state: Mutex<CallStack>,
    shutdown: ShutdownSignal,
    stats: Arc<ChannelStats>,
}

impl std::fmt::Debug for SyncContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncContext")
            .field("channel", &self.channel)
            .field("pending_calls", &self.pending_calls())
            .finish()
    }
}

impl SyncContext {
    pub fn new(channel: impl Into<String>, shutdown: ShutdownSignal, stats: Arc<ChannelStats>) -> Self {
        Self {
            channel: channel.into(),
            state: Mutex::new(CallStack::default()),
            shutdown,
            stats,
        }
    }

    /// Register an outstanding call on top of the stack.
    ///
    /// Fails with `ChannelClosed` once the channel has closed, so a send
    /// issued after the close can never block.
    pub fn push_call(&self, id: CallId, pumping: Pumping) -> Result<CallWaiter> {
        let (tx, rx) = channel::bounded(1);
        let mut state = self.state.lock();
        if state.closed {
            return Err(TandemError::channel_closed(&self.channel));
        }
        state.calls.push(PendingSyncCall {
            id,
            pumping,
            completion: tx,
            resolved: false,
        });
        debug!(
            "Channel {}: call {} pushed (depth {})",
            self.channel,
            id,
            state.calls.len()
        );
        Ok(CallWaiter { id, completion: rx })
    }

    /// Remove a call once its waiter has woken.
    pub fn pop_call(&self, id: CallId) {
        let mut state = self.state.lock();
        match state.calls.iter().rposition(|call| call.id == id) {
            Some(index) => {
                if index + 1 != state.calls.len() {
                    debug!(
                        "Channel {}: call {} left the stack out of order",
                        self.channel, id
                    );
                }
                state.calls.remove(index);
            }
            None => debug!("Channel {}: call {} already popped", self.channel, id),
        }
    }

    /// Resolve the call matching `reply`. Runs on the IPC thread.
    ///
    /// Returns `false` when the reply was reported as a protocol violation
    /// instead of being delivered.
    pub fn deliver_reply(&self, reply: Message) -> bool {
        let Some(id) = reply.call_id else {
            self.report_violation(format!("reply {} carries no call id", reply.name));
            return false;
        };

        let mut state = self.state.lock();
        let Some(index) = state.calls.iter().rposition(|call| call.id == id) else {
            drop(state);
            self.report_violation(format!("reply {} matches no outstanding call {}", reply.name, id));
            return false;
        };

        let top = state.calls.len() - 1;
        if index != top && !state.calls[top].pumping.is_enabled() {
            let blocked = state.calls[top].id;
            drop(state);
            self.report_violation(format!(
                "reply for call {} arrived while call {} waits without pumping",
                id, blocked
            ));
            state = self.state.lock();
        }

        let Some(call) = state.calls.iter_mut().rfind(|call| call.id == id) else {
            return false;
        };
        if call.resolved {
            drop(state);
            self.report_violation(format!("duplicate reply for call {}", id));
            return false;
        }
        call.resolved = true;
        let _ = call.completion.try_send(CallOutcome::Reply {
            ok: reply.ok,
            payload: reply.payload,
        });
        debug!("Channel {}: call {} resolved", self.channel, id);
        true
    }

    /// Mark the channel closed and resolve every pending call on the stack.
    ///
    /// Returns how many calls were woken.
    pub fn close_all(&self) -> usize {
        let mut state = self.state.lock();
        state.closed = true;
        let mut woken = 0;
        for call in state.calls.iter_mut().filter(|call| !call.resolved) {
            call.resolved = true;
            let _ = call.completion.try_send(CallOutcome::Closed);
            woken += 1;
        }
        if woken > 0 {
            debug!(
                "Channel {}: closed with {} outstanding call(s)",
                self.channel, woken
            );
        }
        woken
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn pending_calls(&self) -> usize {
        self.state.lock().calls.len()
    }

    pub fn shutdown_signal(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    pub fn stats(&self) -> &Arc<ChannelStats> {
        &self.stats
    }

    fn report_violation(&self, message: String) {
        warn!("Protocol violation on channel {}: {}", self.channel, message);
        self.stats.record_violation();
    }
}
