//! Single-threaded dispatch loop.
//!
//! A `LoopThread` owns one OS thread that runs posted tasks to completion in
//! submission order. Code running on that thread can drain the queue without
//! blocking (`run_until_idle`) or keep running tasks until an external
//! completion arrives (`pump_until`), which is what lets a blocked sync call
//! keep answering nested requests from its peer.
//!
//! # Thread Safety
//!
//! `LoopHandle` is `Send + Sync` and may post from any thread. The receiving
//! half of the queue lives in a thread-local on the loop thread and is never
//! touched from elsewhere.

use crate::{Result, TandemError};
use crossbeam::channel::{self, Receiver, Sender};
use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, warn};

/// A unit of work posted to a loop.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

enum LoopMessage {
    Run(Task),
    Quit,
}

static NEXT_LOOP_ID: AtomicU64 = AtomicU64::new(1);

struct CurrentLoop {
    handle: LoopHandle,
    queue: Receiver<LoopMessage>,
}

thread_local! {
    static CURRENT: RefCell<Option<CurrentLoop>> = const { RefCell::new(None) };
    static QUIT_REQUESTED: Cell<bool> = const { Cell::new(false) };
}

/// Cloneable handle for posting work to a loop.
#[derive(Clone)]
pub struct LoopHandle {
    id: u64,
    name: Arc<str>,
    queue: Sender<LoopMessage>,
}

impl std::fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

impl LoopHandle {
    /// Post a task. Returns `false` once the loop has exited.
    pub fn post_task<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.queue.send(LoopMessage::Run(Box::new(task))).is_ok()
    }

    /// Whether the caller is running on this loop's thread.
    pub fn is_current(&self) -> bool {
        current_loop_id() == Some(self.id)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Id of the loop running on this thread, if any.
fn current_loop_id() -> Option<u64> {
    CURRENT.with(|current| current.borrow().as_ref().map(|c| c.handle.id))
}

/// Handle to the loop running on the calling thread.
pub fn current() -> Option<LoopHandle> {
    CURRENT.with(|current| current.borrow().as_ref().map(|c| c.handle.clone()))
}

fn current_queue() -> Option<Receiver<LoopMessage>> {
    CURRENT.with(|current| current.borrow().as_ref().map(|c| c.queue.clone()))
}

/// Whether the calling thread is running a dispatch loop.
pub fn on_loop_thread() -> bool {
    current_loop_id().is_some()
}

/// Run every task already queued on the current loop, then return.
///
/// Tasks posted while draining are run too. A quit request seen while
/// draining is remembered and honored by the outer `run`.
pub fn run_until_idle() {
    let Some(queue) = current_queue() else {
        warn!("run_until_idle called off a dispatch loop thread");
        return;
    };
    while let Ok(message) = queue.try_recv() {
        match message {
            LoopMessage::Run(task) => task(),
            LoopMessage::Quit => {
                QUIT_REQUESTED.with(|quit| quit.set(true));
                break;
            }
        }
    }
}

/// How a pumped wait ended.
#[derive(Debug, PartialEq, Eq)]
pub enum PumpOutcome<T> {
    Completed(T),
    /// The completion sender was dropped without a value.
    Abandoned,
    /// The shutdown latch fired first.
    Shutdown,
}

/// Keep running the current loop's tasks until `completion` yields a value
/// or `shutdown` disconnects.
///
/// The completion is checked before every task, so a call that resolved
/// while a task ran returns without picking up more work. Off a loop thread
/// this degrades to a plain blocking wait.
pub fn pump_until<T>(completion: &Receiver<T>, shutdown: &Receiver<()>) -> PumpOutcome<T> {
    let Some(queue) = current_queue() else {
        warn!("pump_until called off a dispatch loop thread; waiting without pumping");
        return wait_for(completion, shutdown);
    };

    loop {
        match completion.try_recv() {
            Ok(value) => return PumpOutcome::Completed(value),
            Err(channel::TryRecvError::Disconnected) => return PumpOutcome::Abandoned,
            Err(channel::TryRecvError::Empty) => {}
        }

        crossbeam::select! {
            recv(completion) -> value => {
                return match value {
                    Ok(value) => PumpOutcome::Completed(value),
                    Err(_) => PumpOutcome::Abandoned,
                };
            }
            recv(shutdown) -> _ => return PumpOutcome::Shutdown,
            recv(queue) -> message => match message {
                Ok(LoopMessage::Run(task)) => task(),
                Ok(LoopMessage::Quit) => {
                    debug!("Quit requested while pumping; deferring until the wait ends");
                    QUIT_REQUESTED.with(|quit| quit.set(true));
                }
                // Every sender is gone; nothing more can be pumped.
                Err(_) => return wait_for(completion, shutdown),
            },
        }
    }
}

/// Block without running any other task.
pub fn wait_for<T>(completion: &Receiver<T>, shutdown: &Receiver<()>) -> PumpOutcome<T> {
    crossbeam::select! {
        recv(completion) -> value => match value {
            Ok(value) => PumpOutcome::Completed(value),
            Err(_) => PumpOutcome::Abandoned,
        },
        recv(shutdown) -> _ => PumpOutcome::Shutdown,
    }
}

/// An OS thread running a dispatch loop.
pub struct LoopThread {
    handle: LoopHandle,
    join: Option<JoinHandle<()>>,
}

impl LoopThread {
    /// Spawn the thread and start its loop.
    pub fn start(name: impl Into<String>) -> Result<Self> {
        let name: String = name.into();
        let (tx, rx) = channel::unbounded();
        let handle = LoopHandle {
            id: NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed),
            name: Arc::from(name.as_str()),
            queue: tx,
        };

        let thread_handle = handle.clone();
        let join = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                CURRENT.with(|current| {
                    *current.borrow_mut() = Some(CurrentLoop {
                        handle: thread_handle,
                        queue: rx,
                    });
                });
                run();
                CURRENT.with(|current| current.borrow_mut().take());
            })
            .map_err(|e| TandemError::Thread {
                message: format!("Failed to spawn loop thread {}: {}", name, e),
            })?;

        debug!("Started dispatch loop {}", name);

        Ok(Self {
            handle,
            join: Some(join),
        })
    }

    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    pub fn is_running(&self) -> bool {
        self.join.is_some()
    }

    /// Ask the loop to exit once the tasks queued ahead of the request have
    /// run, and join the thread.
    ///
    /// Must not be called from the loop's own thread.
    pub fn stop(&mut self) {
        let Some(join) = self.join.take() else {
            return;
        };
        assert!(
            !self.handle.is_current(),
            "dispatch loop {} cannot stop itself",
            self.handle.name
        );
        let _ = self.handle.queue.send(LoopMessage::Quit);
        if let Err(panic) = join.join() {
            std::panic::resume_unwind(panic);
        }
        debug!("Stopped dispatch loop {}", self.handle.name);
    }
}

impl Drop for LoopThread {
    fn drop(&mut self) {
        if self.join.is_some() && !std::thread::panicking() {
            self.stop();
        }
    }
}

/// Run tasks on the current thread's loop until a quit request.
fn run() {
    let Some(queue) = current_queue() else {
        return;
    };
    QUIT_REQUESTED.with(|quit| quit.set(false));
    loop {
        if QUIT_REQUESTED.with(|quit| quit.get()) {
            break;
        }
        match queue.recv() {
            Ok(LoopMessage::Run(task)) => task(),
            Ok(LoopMessage::Quit) | Err(_) => break,
        }
    }
}
