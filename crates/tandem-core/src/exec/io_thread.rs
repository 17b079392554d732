//! Dedicated IPC thread.
//!
//! Each endpoint's transport runs on its own OS thread driving a
//! current-thread tokio runtime. Connection tasks are spawned onto that
//! runtime; plain closures can be posted too and run in order between I/O
//! events. Stopping the thread drops the runtime, which cancels every
//! connection task and closes its sockets.

use crate::config::ChannelConfig;
use crate::{Result, TandemError};
use std::future::Future;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tracing::{debug, error};

use super::dispatch::Task;

enum IoTask {
    Run(Task),
    /// Drain posted work and let spawned tasks make progress, then run the
    /// closure.
    AfterIdle(Task),
    Quit,
}

/// Cloneable handle for posting work to an IPC thread.
#[derive(Clone)]
pub struct IoHandle {
    name: Arc<str>,
    tasks: mpsc::UnboundedSender<IoTask>,
    runtime: tokio::runtime::Handle,
}

impl std::fmt::Debug for IoHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoHandle").field("name", &self.name).finish()
    }
}

impl IoHandle {
    /// Post a closure. Returns `false` once the thread has stopped.
    pub fn post_task<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.tasks.send(IoTask::Run(Box::new(task))).is_ok()
    }

    /// Drain the thread to idle, then run `task` on it.
    pub fn post_after_idle<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.tasks.send(IoTask::AfterIdle(Box::new(task))).is_ok()
    }

    /// Spawn an async task onto the thread's runtime.
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.runtime.spawn(future);
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// An OS thread owning a current-thread tokio runtime.
pub struct IoThread {
    handle: IoHandle,
    join: Option<JoinHandle<()>>,
}

impl IoThread {
    /// Spawn the thread and wait until its runtime is ready to accept work.
    pub fn start(name: impl Into<String>) -> Result<Self> {
        let name: String = name.into();
        let (tasks_tx, tasks_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = crossbeam::channel::bounded(1);

        let thread_name = name.clone();
        let join = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        error!("Failed to build runtime for {}: {}", thread_name, e);
                        let _ = ready_tx.send(Err(e.to_string()));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(runtime.handle().clone()));
                runtime.block_on(drive(tasks_rx));
                debug!("IPC thread {} leaving its runtime", thread_name);
            })
            .map_err(|e| TandemError::Thread {
                message: format!("Failed to spawn IPC thread {}: {}", name, e),
            })?;

        let runtime = match ready_rx.recv() {
            Ok(Ok(runtime)) => runtime,
            Ok(Err(message)) => {
                let _ = join.join();
                return Err(TandemError::Thread { message });
            }
            Err(_) => {
                let _ = join.join();
                return Err(TandemError::Thread {
                    message: format!("IPC thread {} exited during startup", name),
                });
            }
        };

        debug!("Started IPC thread {}", name);

        Ok(Self {
            handle: IoHandle {
                name: Arc::from(name),
                tasks: tasks_tx,
                runtime,
            },
            join: Some(join),
        })
    }

    pub fn handle(&self) -> IoHandle {
        self.handle.clone()
    }

    pub fn is_running(&self) -> bool {
        self.join.is_some()
    }

    /// Stop the runtime and join the thread. Spawned connection tasks are
    /// dropped with the runtime.
    pub fn stop(&mut self) {
        let Some(join) = self.join.take() else {
            return;
        };
        let _ = self.handle.tasks.send(IoTask::Quit);
        if let Err(panic) = join.join() {
            std::panic::resume_unwind(panic);
        }
        debug!("Stopped IPC thread {}", self.handle.name);
    }
}

impl Drop for IoThread {
    fn drop(&mut self) {
        if self.join.is_some() && !std::thread::panicking() {
            self.stop();
        }
    }
}

async fn drive(mut tasks: mpsc::UnboundedReceiver<IoTask>) {
    while let Some(task) = tasks.recv().await {
        match task {
            IoTask::Run(task) => task(),
            IoTask::AfterIdle(task) => {
                if !drain(&mut tasks).await {
                    return;
                }
                task();
            }
            IoTask::Quit => return,
        }
    }
}

/// Run queued closures and yield to spawned tasks until nothing is left.
/// Returns `false` if a quit request was consumed.
async fn drain(tasks: &mut mpsc::UnboundedReceiver<IoTask>) -> bool {
    for _ in 0..ChannelConfig::IO_DRAIN_YIELDS {
        while let Ok(task) = tasks.try_recv() {
            match task {
                IoTask::Run(task) | IoTask::AfterIdle(task) => task(),
                IoTask::Quit => return false,
            }
        }
        tokio::task::yield_now().await;
    }
    true
}
