//! One actor with its own listener and IPC threads.
//!
//! # Lifecycle
//!
//! `Created → Starting → ChannelReady → Running → ShuttingDown → Stopped`
//!
//! `start` posts the startup task to the listener loop. That task starts the
//! IPC thread, opens the channel, signals "channel created" and then runs
//! the actor. `shutdown` tears everything down in three phases so the IPC
//! thread is still alive while the channel is destroyed:
//!
//! 1. listener loop: drop the channel, drain to idle
//! 2. IPC thread: drain to idle, signal `ipc_done`
//! 3. listener loop: drain to idle, signal `listener_done`
//!
//! Only then is the IPC thread stopped, followed by the listener loop.
//! Skipping `shutdown`, calling it twice, or starting twice panics.

use crate::channel::{ChannelHandle, ChannelSpec, HandlerRegistry, SyncChannel};
use crate::config::ThreadConfig;
use crate::exec::dispatch::{self, LoopHandle};
use crate::exec::{IoThread, LoopThread, ShutdownSignal, WaitableEvent};
use crate::transport::{ChannelDirectory, ChannelMode, ChannelName};
use crate::{Result, TandemError};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Where an endpoint is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Created,
    Starting,
    ChannelReady,
    Running,
    ShuttingDown,
    Stopped,
}

/// Application logic driven by an endpoint.
pub trait Actor: Send + 'static {
    /// Install message handlers. Runs on the listener thread before the
    /// channel opens.
    fn register_handlers(&self, _handlers: &mut HandlerRegistry, _endpoint: &EndpointContext) {}

    /// Runs on the listener thread once the channel is ready. Call
    /// `endpoint.done()` when this actor's part is finished, here or later
    /// from a handler.
    fn run(&mut self, channel: &ChannelHandle, endpoint: &EndpointContext);
}

/// Channel and thread naming for one endpoint.
#[derive(Debug, Clone)]
pub struct EndpointOptions {
    pub channel: ChannelName,
    pub mode: ChannelMode,
    /// Thread name prefix.
    pub label: String,
}

impl EndpointOptions {
    /// Threads are named after the channel.
    pub fn new(channel: ChannelName, mode: ChannelMode) -> Self {
        Self {
            label: channel.as_str().to_string(),
            channel,
            mode,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

struct EndpointShared {
    label: String,
    state: Mutex<EndpointState>,
    channel_created: WaitableEvent,
    done: WaitableEvent,
    ipc_done: WaitableEvent,
    listener_done: WaitableEvent,
    channel: Mutex<Option<SyncChannel>>,
    actor: Mutex<Option<Box<dyn Actor>>>,
    io: Mutex<Option<IoThread>>,
    startup_error: Mutex<Option<TandemError>>,
    shutdown: ShutdownSignal,
}

impl EndpointShared {
    fn state(&self) -> EndpointState {
        *self.state.lock()
    }

    /// Move to `to`, panicking unless the current state is in `from`.
    fn advance(&self, from: &[EndpointState], to: EndpointState) -> EndpointState {
        let mut state = self.state.lock();
        let previous = *state;
        assert!(
            from.contains(&previous),
            "endpoint {}: cannot move from {:?} to {:?}",
            self.label,
            previous,
            to
        );
        *state = to;
        previous
    }

    /// Like `advance` but returns `false` instead of panicking.
    fn try_advance(&self, from: EndpointState, to: EndpointState) -> bool {
        let mut state = self.state.lock();
        if *state != from {
            return false;
        }
        *state = to;
        true
    }

    fn fail_startup(&self, error: TandemError) {
        error!("Endpoint {} failed to start: {}", self.label, error);
        *self.startup_error.lock() = Some(error);
        self.channel_created.signal();
        self.done.signal();
    }
}

/// What an actor sees of its endpoint. Cheap to clone; handlers may keep one.
#[derive(Clone)]
pub struct EndpointContext {
    shared: Arc<EndpointShared>,
    listener: LoopHandle,
}

impl std::fmt::Debug for EndpointContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointContext")
            .field("label", &self.shared.label)
            .field("state", &self.shared.state())
            .finish()
    }
}

impl EndpointContext {
    pub fn label(&self) -> &str {
        &self.shared.label
    }

    /// Signal that this actor's part of the scenario is finished.
    pub fn done(&self) {
        debug!("Endpoint {} done", self.shared.label);
        self.shared.done.signal();
    }

    pub fn done_event(&self) -> &WaitableEvent {
        &self.shared.done
    }

    pub fn shutdown_signal(&self) -> &ShutdownSignal {
        &self.shared.shutdown
    }

    pub fn listener_loop(&self) -> &LoopHandle {
        &self.listener
    }

    /// The open channel, if it has not been reset.
    pub fn channel(&self) -> Option<ChannelHandle> {
        self.shared.channel.lock().as_ref().map(SyncChannel::handle)
    }

    /// Close the transport but keep the channel object.
    pub fn close_channel(&self) {
        self.assert_on_listener("close_channel");
        if let Some(channel) = self.channel() {
            channel.close();
        }
    }

    /// Destroy the channel now instead of at shutdown.
    pub fn reset_channel(&self) {
        self.assert_on_listener("reset_channel");
        let channel = self.shared.channel.lock().take();
        drop(channel);
    }

    fn assert_on_listener(&self, operation: &str) {
        assert!(
            self.listener.is_current(),
            "endpoint {}: {} must run on the listener thread",
            self.shared.label,
            operation
        );
    }
}

enum ListenerLoop {
    NotStarted,
    Owned(LoopThread),
    Shared(LoopHandle),
}

/// An actor plus the threads and channel it runs on.
pub struct Endpoint {
    options: EndpointOptions,
    directory: Arc<ChannelDirectory>,
    listener: ListenerLoop,
    shared: Arc<EndpointShared>,
    pending_actor: Option<Box<dyn Actor>>,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("label", &self.options.label)
            .field("channel", &self.options.channel)
            .field("mode", &self.options.mode)
            .field("state", &self.shared.state())
            .finish()
    }
}

impl Endpoint {
    pub fn new(options: EndpointOptions, directory: Arc<ChannelDirectory>, actor: impl Actor) -> Self {
        let shared = Arc::new(EndpointShared {
            label: options.label.clone(),
            state: Mutex::new(EndpointState::Created),
            channel_created: WaitableEvent::manual(),
            done: WaitableEvent::manual(),
            ipc_done: WaitableEvent::manual(),
            listener_done: WaitableEvent::manual(),
            channel: Mutex::new(None),
            actor: Mutex::new(None),
            io: Mutex::new(None),
            startup_error: Mutex::new(None),
            shutdown: ShutdownSignal::new(),
        });
        Self {
            options,
            directory,
            listener: ListenerLoop::NotStarted,
            shared,
            pending_actor: Some(Box::new(actor)),
        }
    }

    pub fn label(&self) -> &str {
        &self.options.label
    }

    pub fn mode(&self) -> ChannelMode {
        self.options.mode
    }

    pub fn channel_name(&self) -> &ChannelName {
        &self.options.channel
    }

    pub fn state(&self) -> EndpointState {
        self.shared.state()
    }

    pub fn done_event(&self) -> &WaitableEvent {
        &self.shared.done
    }

    /// Signal that wakes any call blocked on this endpoint's channel with
    /// `TandemError::Shutdown`.
    pub fn shutdown_signal(&self) -> &ShutdownSignal {
        &self.shared.shutdown
    }

    /// Listener loop this endpoint runs on, once started.
    pub fn listener_handle(&self) -> Option<LoopHandle> {
        match &self.listener {
            ListenerLoop::NotStarted => None,
            ListenerLoop::Owned(thread) => Some(thread.handle()),
            ListenerLoop::Shared(handle) => Some(handle.clone()),
        }
    }

    /// Run on `owner`'s listener loop instead of starting one.
    ///
    /// `owner` must already be started, and this endpoint must be shut down
    /// before it.
    pub fn share_listener_loop(&mut self, owner: &Endpoint) {
        assert_eq!(
            self.state(),
            EndpointState::Created,
            "endpoint {}: listener loop can only be shared before start",
            self.options.label
        );
        let Some(handle) = owner.listener_handle() else {
            panic!(
                "endpoint {}: owner {} has no listener loop yet",
                self.options.label, owner.options.label
            );
        };
        debug!(
            "Endpoint {} shares listener loop {}",
            self.options.label,
            handle.name()
        );
        self.listener = ListenerLoop::Shared(handle);
    }

    /// Start the listener loop (unless shared) and post the startup task.
    pub fn start(&mut self) -> Result<()> {
        self.shared
            .advance(&[EndpointState::Created], EndpointState::Starting);

        let listener = match &self.listener {
            ListenerLoop::Shared(handle) => handle.clone(),
            ListenerLoop::Owned(thread) => thread.handle(),
            ListenerLoop::NotStarted => {
                let thread = LoopThread::start(format!(
                    "{}{}",
                    self.options.label,
                    ThreadConfig::LISTENER_SUFFIX
                ))?;
                let handle = thread.handle();
                self.listener = ListenerLoop::Owned(thread);
                handle
            }
        };

        let Some(actor) = self.pending_actor.take() else {
            panic!("endpoint {}: actor already taken", self.options.label);
        };
        let endpoint = EndpointContext {
            shared: Arc::clone(&self.shared),
            listener: listener.clone(),
        };
        let spec = ChannelSpec::new(
            self.options.channel.clone(),
            self.options.mode,
            Arc::clone(&self.directory),
        )
        .with_shutdown(self.shared.shutdown.clone());
        let ipc_name = format!("{}{}", self.options.label, ThreadConfig::IPC_SUFFIX);

        info!(
            "Starting endpoint {} ({:?} on {})",
            self.options.label, self.options.mode, self.options.channel
        );
        if !listener.post_task(move || on_start(actor, endpoint, spec, ipc_name)) {
            return Err(TandemError::Thread {
                message: format!("listener loop {} is not running", listener.name()),
            });
        }
        Ok(())
    }

    /// Block until the channel exists (or startup failed).
    pub fn wait_for_channel_creation(&self) -> Result<()> {
        assert_ne!(
            self.state(),
            EndpointState::Created,
            "endpoint {}: waiting for a channel that was never started",
            self.options.label
        );
        self.shared.channel_created.wait();
        match self.shared.startup_error.lock().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn wait_done(&self) {
        self.shared.done.wait();
    }

    /// Tear down the channel and both threads. See the module docs for the
    /// phase ordering.
    pub fn shutdown(&mut self) {
        let previous = self.shared.advance(
            &[
                EndpointState::Created,
                EndpointState::Starting,
                EndpointState::ChannelReady,
                EndpointState::Running,
            ],
            EndpointState::ShuttingDown,
        );
        info!(
            "Shutting down endpoint {} (was {:?})",
            self.options.label, previous
        );

        if let Some(listener) = self.listener_handle() {
            let shared = Arc::clone(&self.shared);
            let phase_loop = listener.clone();
            let posted = listener.post_task(move || shutdown_listener_first(shared, phase_loop));
            assert!(
                posted,
                "endpoint {}: listener loop {} stopped before the endpoint shut down",
                self.options.label,
                listener.name()
            );
            self.shared.ipc_done.wait();
            self.shared.listener_done.wait();
        }

        let io = self.shared.io.lock().take();
        if let Some(mut io) = io {
            io.stop();
        }
        if let ListenerLoop::Owned(thread) = &mut self.listener {
            thread.stop();
        }

        self.shared
            .advance(&[EndpointState::ShuttingDown], EndpointState::Stopped);
        info!("Endpoint {} stopped", self.options.label);
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        assert_eq!(
            self.shared.state(),
            EndpointState::Stopped,
            "endpoint {} dropped without shutdown",
            self.options.label
        );
    }
}

/// Startup task; runs on the listener loop.
fn on_start(mut actor: Box<dyn Actor>, endpoint: EndpointContext, spec: ChannelSpec, ipc_name: String) {
    let shared = Arc::clone(&endpoint.shared);
    if shared.state() != EndpointState::Starting {
        debug!("Endpoint {} shut down before it started", shared.label);
        *shared.actor.lock() = Some(actor);
        return;
    }

    let io = match IoThread::start(ipc_name) {
        Ok(io) => io,
        Err(e) => {
            *shared.actor.lock() = Some(actor);
            shared.fail_startup(e);
            return;
        }
    };
    let io_handle = io.handle();
    *shared.io.lock() = Some(io);

    let mut handlers = HandlerRegistry::new();
    actor.register_handlers(&mut handlers, &endpoint);

    let channel = match SyncChannel::open(spec, handlers, &io_handle) {
        Ok(channel) => channel,
        Err(e) => {
            *shared.actor.lock() = Some(actor);
            shared.fail_startup(e);
            return;
        }
    };
    let handle = channel.handle();
    *shared.channel.lock() = Some(channel);

    shared.try_advance(EndpointState::Starting, EndpointState::ChannelReady);
    shared.channel_created.signal();
    shared.try_advance(EndpointState::ChannelReady, EndpointState::Running);

    actor.run(&handle, &endpoint);
    drop(handle);
    // Kept until shutdown so it is dropped on this thread.
    *shared.actor.lock() = Some(actor);
}

/// Phase 1: on the listener loop.
fn shutdown_listener_first(shared: Arc<EndpointShared>, listener: LoopHandle) {
    let channel = shared.channel.lock().take();
    drop(channel);
    let actor = shared.actor.lock().take();
    drop(actor);
    dispatch::run_until_idle();

    let io = shared.io.lock().as_ref().map(IoThread::handle);
    let Some(io) = io else {
        // No IPC thread was ever started.
        shared.ipc_done.signal();
        shutdown_listener_second(shared);
        return;
    };

    let ipc_shared = Arc::clone(&shared);
    let posted = io.post_after_idle(move || {
        // Phase 2: on the IPC thread, now idle.
        ipc_shared.ipc_done.signal();
        let listener_shared = Arc::clone(&ipc_shared);
        if !listener.post_task(move || shutdown_listener_second(listener_shared)) {
            ipc_shared.listener_done.signal();
        }
    });
    if !posted {
        shared.ipc_done.signal();
        shutdown_listener_second(shared);
    }
}

/// Phase 3: back on the listener loop.
fn shutdown_listener_second(shared: Arc<EndpointShared>) {
    dispatch::run_until_idle();
    shared.listener_done.signal();
}
