//! Message model and framing.
//!
//! Every message crosses the transport as a 4-byte big-endian length prefix
//! followed by a UTF-8 JSON body.
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```

use crate::config::ChannelConfig;
use crate::{Result, TandemError};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Routing id used when a channel carries a single logical route.
pub const CONTROL_ROUTING_ID: u32 = 0;

/// Identifier correlating a sync request with its reply.
pub type CallId = u64;

/// Kind tag carried by every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Fire-and-forget; no reply expected.
    Unsolicited,
    /// Blocks the sender until a matching `SyncReply` arrives.
    SyncRequest,
    /// Answer to a `SyncRequest`, matched by call id.
    SyncReply,
}

/// A unit of communication between two endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub routing_id: u32,
    pub kind: MessageKind,
    /// Handler registry key.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<CallId>,
    /// Success flag; only meaningful on replies.
    #[serde(default = "default_ok")]
    pub ok: bool,
    #[serde(default)]
    pub payload: serde_json::Value,
}

fn default_ok() -> bool {
    true
}

impl Message {
    /// Create an unsolicited message.
    pub fn unsolicited(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            routing_id: CONTROL_ROUTING_ID,
            kind: MessageKind::Unsolicited,
            name: name.into(),
            call_id: None,
            ok: true,
            payload,
        }
    }

    /// Create a sync request carrying `call_id`.
    pub fn request(name: impl Into<String>, call_id: CallId, payload: serde_json::Value) -> Self {
        Self {
            routing_id: CONTROL_ROUTING_ID,
            kind: MessageKind::SyncRequest,
            name: name.into(),
            call_id: Some(call_id),
            ok: true,
            payload,
        }
    }

    /// Create a successful reply for the given call.
    pub fn reply(name: impl Into<String>, call_id: CallId, payload: serde_json::Value) -> Self {
        Self {
            routing_id: CONTROL_ROUTING_ID,
            kind: MessageKind::SyncReply,
            name: name.into(),
            call_id: Some(call_id),
            ok: true,
            payload,
        }
    }

    /// Create a failure reply; the payload carries the error text.
    pub fn failure_reply(name: impl Into<String>, call_id: CallId, error: impl Into<String>) -> Self {
        Self {
            routing_id: CONTROL_ROUTING_ID,
            kind: MessageKind::SyncReply,
            name: name.into(),
            call_id: Some(call_id),
            ok: false,
            payload: serde_json::Value::String(error.into()),
        }
    }

    pub fn with_routing_id(mut self, routing_id: u32) -> Self {
        self.routing_id = routing_id;
        self
    }

    pub fn is_sync_request(&self) -> bool {
        self.kind == MessageKind::SyncRequest
    }

    pub fn is_reply(&self) -> bool {
        self.kind == MessageKind::SyncReply
    }

    /// Serialize to a frame body.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse a frame body.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| TandemError::Json {
            message: format!("Failed to parse message frame: {}", e),
            source: Some(e),
        })
    }
}

/// Read a length-prefixed frame from an async reader.
///
/// Returns `None` on clean EOF (peer closed connection).
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    if len > ChannelConfig::MAX_MESSAGE_SIZE {
        return Err(TandemError::FrameTooLarge {
            size: len,
            max: ChannelConfig::MAX_MESSAGE_SIZE,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > ChannelConfig::MAX_MESSAGE_SIZE {
        return Err(TandemError::FrameTooLarge {
            size: payload.len(),
            max: ChannelConfig::MAX_MESSAGE_SIZE,
        });
    }
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}
