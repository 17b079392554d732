//! Message handlers keyed by message name.
//!
//! Unsolicited messages go to a `MessageHandler`. Sync requests go to a
//! `RequestHandler`, which receives a `DelayedReply` token: answer through it
//! before returning, or move it somewhere and answer later from any thread.

use super::sync_channel::{ChannelCore, ChannelHandle};
use super::ChannelStats;
use crate::transport::{CallId, Message};
use crate::{Result, TandemError};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Handler for unsolicited messages.
pub type MessageHandler = Arc<dyn Fn(&ChannelHandle, Message) + Send + Sync>;

/// Handler for sync requests.
pub type RequestHandler = Arc<dyn Fn(&ChannelHandle, Message, DelayedReply) + Send + Sync>;

#[derive(Clone)]
pub(crate) enum Handler {
    Message(MessageHandler),
    Request(RequestHandler),
}

/// `name → handler` map consulted for every incoming message.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Handler>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("HandlerRegistry").field("names", &names).finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle unsolicited messages named `name`.
    pub fn on_message<F>(&mut self, name: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(&ChannelHandle, Message) + Send + Sync + 'static,
    {
        self.insert(name.into(), Handler::Message(Arc::new(handler)))
    }

    /// Handle sync requests named `name`, replying through the token.
    pub fn on_request<F>(&mut self, name: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(&ChannelHandle, Message, DelayedReply) + Send + Sync + 'static,
    {
        self.insert(name.into(), Handler::Request(Arc::new(handler)))
    }

    /// Handle sync requests named `name` with an immediate answer.
    ///
    /// `Err` becomes a failure reply carrying the message.
    pub fn on_call<F>(&mut self, name: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(&ChannelHandle, Value) -> std::result::Result<Value, String> + Send + Sync + 'static,
    {
        self.on_request(name, move |channel, request, reply| {
            let sent = match handler(channel, request.payload) {
                Ok(value) => reply.send(value),
                Err(message) => reply.send_error(message),
            };
            if let Err(e) = sent {
                debug!("Reply to {} not delivered: {}", request.name, e);
            }
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Copy every handler from `other`, replacing same-named entries.
    pub fn merge(&mut self, other: HandlerRegistry) {
        self.handlers.extend(other.handlers);
    }

    pub(crate) fn lookup(&self, name: &str) -> Option<Handler> {
        self.handlers.get(name).cloned()
    }

    fn insert(&mut self, name: String, handler: Handler) -> &mut Self {
        if self.handlers.insert(name.clone(), handler).is_some() {
            debug!("Replaced handler for {}", name);
        }
        self
    }
}

/// The obligation to answer one sync request.
///
/// Exactly one reply goes out per token. Dropping a token without answering
/// sends a failure reply so the caller does not block forever. Once the
/// originating channel is gone, answering is reported as a protocol
/// violation and returns an error.
pub struct DelayedReply {
    name: String,
    call_id: CallId,
    routing_id: u32,
    channel_name: String,
    channel: Weak<ChannelCore>,
    stats: Arc<ChannelStats>,
    fulfilled: bool,
}

impl std::fmt::Debug for DelayedReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelayedReply")
            .field("name", &self.name)
            .field("call_id", &self.call_id)
            .field("channel", &self.channel_name)
            .finish()
    }
}

impl DelayedReply {
    pub(crate) fn new(
        request: &Message,
        call_id: CallId,
        channel_name: String,
        channel: Weak<ChannelCore>,
        stats: Arc<ChannelStats>,
    ) -> Self {
        Self {
            name: request.name.clone(),
            call_id,
            routing_id: request.routing_id,
            channel_name,
            channel,
            stats,
            fulfilled: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    /// Answer the request with `payload`.
    pub fn send(mut self, payload: Value) -> Result<()> {
        self.fulfilled = true;
        let reply = Message::reply(self.name.clone(), self.call_id, payload).with_routing_id(self.routing_id);
        self.deliver(reply)
    }

    /// Answer the request with a failure.
    pub fn send_error(mut self, message: impl Into<String>) -> Result<()> {
        self.fulfilled = true;
        let reply = Message::failure_reply(self.name.clone(), self.call_id, message)
            .with_routing_id(self.routing_id);
        self.deliver(reply)
    }

    fn deliver(&self, reply: Message) -> Result<()> {
        let Some(core) = self.open_channel() else {
            warn!(
                "Delayed reply {} (call {}) sent after channel {} was destroyed",
                self.name, self.call_id, self.channel_name
            );
            self.stats.record_violation();
            return Err(TandemError::ProtocolViolation {
                channel: self.channel_name.clone(),
                message: format!("delayed reply {} outlived its channel", self.name),
            });
        };
        core.send_reply(reply)
    }

    fn open_channel(&self) -> Option<Arc<ChannelCore>> {
        self.channel.upgrade().filter(|core| !core.is_closed())
    }
}

impl Drop for DelayedReply {
    fn drop(&mut self) {
        if self.fulfilled {
            return;
        }
        self.fulfilled = true;
        let Some(core) = self.open_channel() else {
            debug!(
                "Unanswered request {} (call {}) dropped with channel {}",
                self.name, self.call_id, self.channel_name
            );
            return;
        };
        warn!(
            "Request {} (call {}) dropped without a reply; answering with a failure",
            self.name, self.call_id
        );
        let reply = Message::failure_reply(self.name.clone(), self.call_id, "request dropped without a reply")
            .with_routing_id(self.routing_id);
        if let Err(e) = core.send_reply(reply) {
            debug!("Failure reply for {} not delivered: {}", self.name, e);
        }
    }
}
