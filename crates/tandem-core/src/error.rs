//! Error types for tandem.
//!
//! A failed synchronous call is an expected outcome (the peer went away, the
//! connection dropped, the peer answered with an error), so every `send`
//! returns one of these variants instead of panicking. Harness contract
//! violations are not represented here; they are assertion failures.

use thiserror::Error;

/// Main error type for tandem channels and endpoints.
#[derive(Debug, Error)]
pub enum TandemError {
    // Delivery failures: the call never produced an answer from the peer
    #[error("Channel closed: {channel}")]
    ChannelClosed { channel: String },

    #[error("Channel {channel} was shut down while a call was outstanding")]
    Shutdown { channel: String },

    // The peer received the request and answered with an error
    #[error("Peer rejected {name}: {message}")]
    PeerRejected { name: String, message: String },

    // Reported, never returned from a send
    #[error("Protocol violation on {channel}: {message}")]
    ProtocolViolation { channel: String, message: String },

    #[error("No listening channel registered under {name}")]
    UnknownChannel { name: String },

    #[error("Frame of {size} bytes exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Thread error: {message}")]
    Thread { message: String },

    #[error("{0}")]
    Other(String),
}

/// Result type alias for tandem operations.
pub type Result<T> = std::result::Result<T, TandemError>;

impl From<std::io::Error> for TandemError {
    fn from(err: std::io::Error) -> Self {
        TandemError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for TandemError {
    fn from(err: serde_json::Error) -> Self {
        TandemError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl TandemError {
    pub fn channel_closed(channel: impl Into<String>) -> Self {
        TandemError::ChannelClosed {
            channel: channel.into(),
        }
    }

    /// True when the request never reached the peer or was never answered.
    ///
    /// `PeerRejected` is the other side of this split: the peer saw the
    /// request and explicitly answered with a failure.
    pub fn is_delivery_failure(&self) -> bool {
        matches!(
            self,
            TandemError::ChannelClosed { .. } | TandemError::Shutdown { .. }
        )
    }

    pub fn is_channel_closed(&self) -> bool {
        matches!(self, TandemError::ChannelClosed { .. })
    }
}
