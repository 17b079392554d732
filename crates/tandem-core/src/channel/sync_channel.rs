//! Blocking calls over a transport driven by another thread.
//!
//! A `SyncChannel` is opened on a dispatch loop thread (the listener thread)
//! and stays affine to it. Incoming replies are matched on the IPC thread
//! through the shared `SyncContext`; every other incoming message is posted
//! to the listener loop and dispatched there through the handler registry.
//!
//! `send` blocks the listener thread. With `Pumping::Enabled` it keeps
//! running the loop while it waits, so the peer can call back in and nested
//! requests get answered. With `Pumping::Disabled` nothing else runs on the
//! thread until the reply arrives; queued messages are dispatched afterwards
//! in arrival order.

use super::context::{CallOutcome, ChannelStats, Pumping, StatsSnapshot, SyncContext};
use super::handler::{DelayedReply, Handler, HandlerRegistry};
use crate::exec::dispatch::{self, LoopHandle, PumpOutcome};
use crate::exec::{IoHandle, ShutdownSignal};
use crate::transport::{
    ChannelDirectory, ChannelMode, ChannelName, Message, MessageKind, Transport, TransportListener,
};
use crate::{Result, TandemError};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// A request type with a typed reply.
pub trait Request: Serialize {
    /// Handler registry key.
    const NAME: &'static str;
    type Reply: DeserializeOwned;
}

/// Everything needed to open one end of a channel.
#[derive(Debug, Clone)]
pub struct ChannelSpec {
    pub name: ChannelName,
    pub mode: ChannelMode,
    pub directory: Arc<ChannelDirectory>,
    pub shutdown: ShutdownSignal,
}

impl ChannelSpec {
    pub fn new(name: ChannelName, mode: ChannelMode, directory: Arc<ChannelDirectory>) -> Self {
        Self {
            name,
            mode,
            directory,
            shutdown: ShutdownSignal::new(),
        }
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = shutdown;
        self
    }
}

pub(crate) struct ChannelCore {
    name: ChannelName,
    mode: ChannelMode,
    transport: Mutex<Option<Transport>>,
    context: Arc<SyncContext>,
    handlers: RwLock<HandlerRegistry>,
    listener_loop: LoopHandle,
    next_call_id: AtomicU64,
    stats: Arc<ChannelStats>,
}

impl ChannelCore {
    fn transmit(&self, message: Message) -> Result<()> {
        match self.transport.lock().as_ref() {
            Some(transport) => transport.send(message),
            None => Err(TandemError::channel_closed(self.name.as_str())),
        }
    }

    pub(crate) fn send_reply(&self, reply: Message) -> Result<()> {
        self.transmit(reply)?;
        self.stats.record_reply_sent();
        Ok(())
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.context.is_closed() || self.transport.lock().is_none()
    }

    fn close(&self) {
        let transport = self.transport.lock().take();
        let woken = self.context.close_all();
        if let Some(transport) = transport {
            info!(
                "Closing channel {} ({} call(s) outstanding)",
                self.name, woken
            );
            transport.close();
        }
    }
}

/// Receives transport callbacks on the IPC thread.
struct ChannelListener {
    name: ChannelName,
    context: Arc<SyncContext>,
    inbox: LoopHandle,
    core: Weak<ChannelCore>,
}

impl TransportListener for ChannelListener {
    fn on_message(&self, message: Message) {
        if message.is_reply() {
            self.context.deliver_reply(message);
            return;
        }

        let core = self.core.clone();
        let name = self.name.clone();
        let posted = self.inbox.post_task(move || match core.upgrade() {
            Some(core) => ChannelHandle { core }.dispatch(message),
            None => debug!("Channel {} destroyed; dropping {}", name, message.name),
        });
        if !posted {
            debug!("Listener loop for {} has stopped; message dropped", self.name);
        }
    }

    fn on_connected(&self, peer: SocketAddr) {
        info!("Channel {} connected to {}", self.name, peer);
    }

    fn on_closed(&self, reason: &TandemError) {
        let woken = self.context.close_all();
        info!(
            "Channel {} closed: {} ({} call(s) resolved)",
            self.name, reason, woken
        );
    }
}

/// Shared reference to an open channel.
///
/// Handlers and actors receive one of these. Cloning is cheap; the channel
/// closes when its owning `SyncChannel` is dropped regardless of how many
/// handles remain.
#[derive(Clone)]
pub struct ChannelHandle {
    core: Arc<ChannelCore>,
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("name", &self.core.name)
            .field("mode", &self.core.mode)
            .finish()
    }
}

impl ChannelHandle {
    pub fn name(&self) -> &ChannelName {
        &self.core.name
    }

    pub fn mode(&self) -> ChannelMode {
        self.core.mode
    }

    /// Send a sync request and block until it resolves.
    ///
    /// Returns the reply payload, `PeerRejected` for a failure reply,
    /// `ChannelClosed` when the connection is gone (now or while waiting)
    /// and `Shutdown` when the channel's shutdown signal fires first.
    pub fn send(&self, name: &str, payload: Value, pumping: Pumping) -> Result<Value> {
        let core = &self.core;
        let context = &core.context;
        if !core.listener_loop.is_current() {
            debug!(
                "Sync call {} on channel {} issued off its listener thread",
                name, core.name
            );
        }
        if context.shutdown_signal().is_signaled() {
            return Err(TandemError::Shutdown {
                channel: core.name.to_string(),
            });
        }

        let id = core.next_call_id.fetch_add(1, Ordering::Relaxed);
        let waiter = context.push_call(id, pumping)?;
        if let Err(e) = core.transmit(Message::request(name, id, payload)) {
            context.pop_call(id);
            return Err(e);
        }
        debug!(
            "Channel {}: sent {} as call {} ({:?})",
            core.name, name, id, pumping
        );

        let shutdown = context.shutdown_signal().receiver();
        let outcome = match pumping {
            Pumping::Enabled => dispatch::pump_until(waiter.completion(), shutdown),
            Pumping::Disabled => dispatch::wait_for(waiter.completion(), shutdown),
        };
        context.pop_call(id);

        match outcome {
            PumpOutcome::Completed(CallOutcome::Reply { ok: true, payload }) => Ok(payload),
            PumpOutcome::Completed(CallOutcome::Reply { ok: false, payload }) => {
                Err(TandemError::PeerRejected {
                    name: name.to_string(),
                    message: match payload {
                        Value::String(message) => message,
                        other => other.to_string(),
                    },
                })
            }
            PumpOutcome::Completed(CallOutcome::Closed) | PumpOutcome::Abandoned => {
                Err(TandemError::channel_closed(core.name.as_str()))
            }
            PumpOutcome::Shutdown => Err(TandemError::Shutdown {
                channel: core.name.to_string(),
            }),
        }
    }

    /// Typed `send`.
    pub fn call<R: Request>(&self, request: &R, pumping: Pumping) -> Result<R::Reply> {
        let payload = serde_json::to_value(request)?;
        let reply = self.send(R::NAME, payload, pumping)?;
        serde_json::from_value(reply).map_err(|e| TandemError::Json {
            message: format!("Failed to parse reply to {}: {}", R::NAME, e),
            source: Some(e),
        })
    }

    /// Send an unsolicited message.
    pub fn post(&self, name: &str, payload: Value) -> Result<()> {
        if self.core.context.is_closed() {
            return Err(TandemError::channel_closed(self.core.name.as_str()));
        }
        self.core.transmit(Message::unsolicited(name, payload))
    }

    /// Add or replace handlers on the open channel.
    pub fn register_handlers(&self, register: impl FnOnce(&mut HandlerRegistry)) {
        register(&mut self.core.handlers.write());
    }

    /// Close the transport. Outstanding calls on both ends resolve with
    /// `ChannelClosed`.
    pub fn close(&self) {
        self.core.close();
    }

    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    pub fn pending_calls(&self) -> usize {
        self.core.context.pending_calls()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.core.stats.snapshot()
    }

    /// Address the server end listens on.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.core
            .transport
            .lock()
            .as_ref()
            .and_then(Transport::local_addr)
    }

    /// Loop this channel dispatches on.
    pub fn listener_loop(&self) -> &LoopHandle {
        &self.core.listener_loop
    }

    fn dispatch(&self, message: Message) {
        self.core.stats.record_dispatched();
        let handler = self.core.handlers.read().lookup(&message.name);

        match message.kind {
            MessageKind::SyncRequest => {
                let Some(call_id) = message.call_id else {
                    warn!(
                        "Protocol violation on channel {}: request {} carries no call id",
                        self.core.name, message.name
                    );
                    self.core.stats.record_violation();
                    return;
                };
                let reply = DelayedReply::new(
                    &message,
                    call_id,
                    self.core.name.to_string(),
                    Arc::downgrade(&self.core),
                    Arc::clone(&self.core.stats),
                );
                match handler {
                    Some(Handler::Request(handler)) => handler(self, message, reply),
                    _ => {
                        warn!(
                            "No request handler for {} on channel {}",
                            message.name, self.core.name
                        );
                        if let Err(e) = reply.send_error(format!("no handler for {}", message.name)) {
                            debug!("Failure reply not delivered: {}", e);
                        }
                    }
                }
            }
            MessageKind::Unsolicited => match handler {
                Some(Handler::Message(handler)) => handler(self, message),
                Some(Handler::Request(_)) => warn!(
                    "{} arrived unsolicited on channel {} but expects a reply",
                    message.name, self.core.name
                ),
                None => debug!(
                    "No handler for {} on channel {}; dropped",
                    message.name, self.core.name
                ),
            },
            MessageKind::SyncReply => {
                self.core.context.deliver_reply(message);
            }
        }
    }
}

/// Owning end of a channel. Dropping it closes the channel.
#[derive(Debug)]
pub struct SyncChannel {
    handle: ChannelHandle,
}

impl SyncChannel {
    /// Open a channel bound to the calling dispatch loop thread.
    ///
    /// Handlers are installed before the transport starts, so nothing the
    /// peer sends can arrive ahead of them.
    pub fn open(spec: ChannelSpec, handlers: HandlerRegistry, io: &IoHandle) -> Result<Self> {
        let listener_loop = dispatch::current().ok_or_else(|| TandemError::Thread {
            message: format!(
                "Channel {} must be opened on a dispatch loop thread",
                spec.name
            ),
        })?;

        let stats = Arc::new(ChannelStats::default());
        let context = Arc::new(SyncContext::new(
            spec.name.as_str(),
            spec.shutdown,
            Arc::clone(&stats),
        ));

        let mut open_error = None;
        let core = Arc::new_cyclic(|weak: &Weak<ChannelCore>| {
            let listener = Arc::new(ChannelListener {
                name: spec.name.clone(),
                context: Arc::clone(&context),
                inbox: listener_loop.clone(),
                core: weak.clone(),
            });
            let transport = match Transport::open(
                spec.name.clone(),
                spec.mode,
                spec.directory,
                io,
                listener,
            ) {
                Ok(transport) => Some(transport),
                Err(e) => {
                    open_error = Some(e);
                    None
                }
            };
            ChannelCore {
                name: spec.name,
                mode: spec.mode,
                transport: Mutex::new(transport),
                context,
                handlers: RwLock::new(handlers),
                listener_loop,
                next_call_id: AtomicU64::new(1),
                stats,
            }
        });

        if let Some(e) = open_error {
            return Err(e);
        }

        debug!("Opened {:?} channel {}", core.mode, core.name);
        Ok(Self {
            handle: ChannelHandle { core },
        })
    }

    pub fn handle(&self) -> ChannelHandle {
        self.handle.clone()
    }
}

impl std::ops::Deref for SyncChannel {
    type Target = ChannelHandle;

    fn deref(&self) -> &ChannelHandle {
        &self.handle
    }
}

impl Drop for SyncChannel {
    fn drop(&mut self) {
        if !self.handle.core.listener_loop.is_current() {
            warn!(
                "Channel {} destroyed off its listener thread",
                self.handle.core.name
            );
        }
        self.handle.close();
        debug!("Destroyed channel {}", self.handle.core.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{IoThread, LoopThread};
    use serde::Deserialize;
    use serde_json::json;
    use std::time::Duration;

    #[derive(Serialize)]
    struct Triple {
        value: i64,
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Tripled(i64);

    impl Request for Triple {
        const NAME: &'static str = "triple";
        type Reply = Tripled;
    }

    /// Run `f` on `thread` and wait for its result.
    fn on_loop<T, F>(thread: &LoopThread, f: F) -> T
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = crossbeam::channel::bounded(1);
        assert!(thread.handle().post_task(move || {
            let _ = tx.send(f());
        }));
        rx.recv_timeout(Duration::from_secs(10)).unwrap()
    }

    struct Pair {
        server_loop: LoopThread,
        client_loop: LoopThread,
        server: Arc<Mutex<Option<SyncChannel>>>,
        client: Arc<Mutex<Option<SyncChannel>>>,
        _io: IoThread,
    }

    impl Pair {
        fn open(name: &str, server_handlers: HandlerRegistry) -> Self {
            let io = IoThread::start(format!("{}_ipc", name)).unwrap();
            let directory = Arc::new(ChannelDirectory::new());
            let server_loop = LoopThread::start(format!("{}_server", name)).unwrap();
            let client_loop = LoopThread::start(format!("{}_client", name)).unwrap();

            let spec = ChannelSpec::new(ChannelName::new(name), ChannelMode::Server, Arc::clone(&directory));
            let handle = io.handle();
            let server = on_loop(&server_loop, move || {
                SyncChannel::open(spec, server_handlers, &handle).unwrap()
            });
            let spec = ChannelSpec::new(ChannelName::new(name), ChannelMode::Client, directory);
            let handle = io.handle();
            let client = on_loop(&client_loop, move || {
                SyncChannel::open(spec, HandlerRegistry::new(), &handle).unwrap()
            });

            Self {
                server_loop,
                client_loop,
                server: Arc::new(Mutex::new(Some(server))),
                client: Arc::new(Mutex::new(Some(client))),
                _io: io,
            }
        }

        fn client(&self) -> ChannelHandle {
            self.client.lock().as_ref().unwrap().handle()
        }

        fn close(self) {
            let client = Arc::clone(&self.client);
            on_loop(&self.client_loop, move || drop(client.lock().take()));
            let server = Arc::clone(&self.server);
            on_loop(&self.server_loop, move || drop(server.lock().take()));
        }
    }

    #[test]
    fn test_open_off_loop_thread_fails() {
        let io = IoThread::start("chan_off_loop").unwrap();
        let spec = ChannelSpec::new(
            ChannelName::new("off_loop"),
            ChannelMode::Server,
            Arc::new(ChannelDirectory::new()),
        );

        let err = SyncChannel::open(spec, HandlerRegistry::new(), &io.handle()).unwrap_err();
        assert!(matches!(err, TandemError::Thread { .. }));
    }

    #[test]
    fn test_typed_call_round_trip() {
        let mut handlers = HandlerRegistry::new();
        handlers.on_call("triple", |_, payload| {
            let value = payload["value"].as_i64().ok_or("missing value")?;
            Ok(json!(value * 3))
        });
        let pair = Pair::open("chan_triple", handlers);

        let client = pair.client();
        let reply = on_loop(&pair.client_loop, move || {
            client.call(&Triple { value: 7 }, Pumping::Disabled)
        });

        assert_eq!(reply.unwrap(), Tripled(21));
        pair.close();
    }

    #[test]
    fn test_failure_reply_is_peer_rejected() {
        let mut handlers = HandlerRegistry::new();
        handlers.on_call("divide", |_, _| Err("division by zero".to_string()));
        let pair = Pair::open("chan_reject", handlers);

        let client = pair.client();
        let result = on_loop(&pair.client_loop, move || {
            client.send("divide", json!([1, 0]), Pumping::Enabled)
        });

        match result {
            Err(TandemError::PeerRejected { name, message }) => {
                assert_eq!(name, "divide");
                assert_eq!(message, "division by zero");
            }
            other => panic!("unexpected result: {:?}", other),
        }
        pair.close();
    }

    #[test]
    fn test_unhandled_request_gets_failure_reply() {
        let pair = Pair::open("chan_unhandled", HandlerRegistry::new());

        let client = pair.client();
        let result = on_loop(&pair.client_loop, move || {
            client.send("nobody_home", Value::Null, Pumping::Disabled)
        });

        let err = result.unwrap_err();
        assert!(!err.is_delivery_failure());
        pair.close();
    }

    #[test]
    fn test_dropped_token_sends_failure() {
        let mut handlers = HandlerRegistry::new();
        handlers.on_request("forgetful", |_, _, reply| drop(reply));
        let pair = Pair::open("chan_forgetful", handlers);

        let client = pair.client();
        let result = on_loop(&pair.client_loop, move || {
            client.send("forgetful", Value::Null, Pumping::Disabled)
        });

        assert!(matches!(result, Err(TandemError::PeerRejected { .. })));
        pair.close();
    }

    #[test]
    fn test_send_after_close_fails_immediately() {
        let pair = Pair::open("chan_closed", HandlerRegistry::new());

        let client = pair.client();
        let result = on_loop(&pair.client_loop, move || {
            client.close();
            client.send("anything", Value::Null, Pumping::Disabled)
        });

        assert!(result.unwrap_err().is_channel_closed());
        pair.close();
    }

    #[test]
    fn test_shutdown_signal_fails_send() {
        let pair = Pair::open("chan_shutdown", HandlerRegistry::new());
        let shutdown = ShutdownSignal::new();
        shutdown.signal();

        let io = IoThread::start("chan_shutdown_ipc2").unwrap();
        let handle = io.handle();
        let spec = ChannelSpec::new(
            ChannelName::new("chan_shutdown_2"),
            ChannelMode::Server,
            Arc::new(ChannelDirectory::new()),
        )
        .with_shutdown(shutdown);
        let result = on_loop(&pair.server_loop, move || {
            let channel = SyncChannel::open(spec, HandlerRegistry::new(), &handle).unwrap();
            channel.send("anything", Value::Null, Pumping::Enabled)
        });

        assert!(matches!(result, Err(TandemError::Shutdown { .. })));
        pair.close();
    }
}
