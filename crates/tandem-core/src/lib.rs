//! Tandem Core - blocking request/reply calls over a thread-owned async channel.
//!
//! Each endpoint runs two threads: a listener thread with a dispatch loop
//! where application code and message handlers run, and an IPC thread that
//! drives the transport on a tokio runtime. `ChannelHandle::send` blocks the
//! listener thread until the peer answers. While blocked it can keep
//! pumping its loop, which lets two endpoints call into each other and nest
//! calls without deadlocking.
//!
//! # Example
//!
//! ```rust,ignore
//! use tandem_core::{
//!     run_scenario, Actor, ChannelDirectory, ChannelHandle, ChannelMode, ChannelName, Endpoint,
//!     EndpointContext, EndpointOptions, HandlerRegistry, Pumping,
//! };
//! use std::sync::Arc;
//!
//! struct Answerer;
//!
//! impl Actor for Answerer {
//!     fn register_handlers(&self, handlers: &mut HandlerRegistry, endpoint: &EndpointContext) {
//!         let endpoint = endpoint.clone();
//!         handlers.on_call("answer_to_life", move |_, _| {
//!             endpoint.done();
//!             Ok(serde_json::json!(42))
//!         });
//!     }
//!
//!     fn run(&mut self, _channel: &ChannelHandle, _endpoint: &EndpointContext) {}
//! }
//!
//! struct Asker;
//!
//! impl Actor for Asker {
//!     fn run(&mut self, channel: &ChannelHandle, endpoint: &EndpointContext) {
//!         let answer = channel.send("answer_to_life", serde_json::Value::Null, Pumping::Disabled);
//!         println!("{:?}", answer);
//!         endpoint.done();
//!     }
//! }
//!
//! let directory = Arc::new(ChannelDirectory::new());
//! let name = ChannelName::new("demo");
//! run_scenario(vec![
//!     Endpoint::new(EndpointOptions::new(name.clone(), ChannelMode::Server), directory.clone(), Answerer),
//!     Endpoint::new(EndpointOptions::new(name, ChannelMode::Client), directory, Asker),
//! ])?;
//! ```

pub mod channel;
pub mod config;
pub mod error;
pub mod exec;
pub mod harness;
pub mod scenarios;
pub mod transport;

// Re-export commonly used types
pub use channel::{
    ChannelHandle, ChannelSpec, ChannelStats, DelayedReply, HandlerRegistry, Pumping, Request,
    StatsSnapshot, SyncChannel, SyncContext,
};
pub use config::{ChannelConfig, ThreadConfig};
pub use error::{Result, TandemError};
pub use exec::{IoHandle, IoThread, LoopHandle, LoopThread, ShutdownSignal, WaitableEvent};
pub use harness::{run_scenario, Actor, Endpoint, EndpointContext, EndpointOptions, EndpointState};
pub use scenarios::{CallResult, Event, Scenario};
pub use transport::{ChannelDirectory, ChannelMode, ChannelName, Message, MessageKind};
