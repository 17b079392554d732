//! Synchronous calls layered over the async transport.
//!
//! - **Context**: the call stack shared by the listener and IPC threads
//! - **Handlers**: `name → handler` registry and the delayed-reply token
//! - **SyncChannel**: blocking `send`, with or without pumping

pub mod context;
pub mod handler;
pub mod sync_channel;

pub use context::{CallOutcome, CallWaiter, ChannelStats, Pumping, StatsSnapshot, SyncContext};
pub use handler::{DelayedReply, HandlerRegistry, MessageHandler, RequestHandler};
pub use sync_channel::{ChannelHandle, ChannelSpec, Request, SyncChannel};
