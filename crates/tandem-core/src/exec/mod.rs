//! Execution contexts for endpoints.
//!
//! - **Dispatch loop**: the logical ("listener") thread; runs posted tasks in
//!   order and can pump while a sync call is outstanding
//! - **IPC thread**: owns the tokio runtime that drives the transport
//! - **Signals**: blocking events and the shutdown latch shared across both

pub mod dispatch;
pub mod io_thread;
pub mod signal;

pub use dispatch::{LoopHandle, LoopThread, PumpOutcome, Task};
pub use io_thread::{IoHandle, IoThread};
pub use signal::{ResetPolicy, ShutdownSignal, WaitableEvent};
