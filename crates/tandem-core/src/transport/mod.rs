//! Point-to-point message transport between two endpoints.
//!
//! Uses length-prefixed JSON frames over `127.0.0.1` TCP connections.
//!
//! # Architecture
//!
//! - **Directory**: maps channel names to the server's listening address
//! - **Connection**: one server and one client per name, driven on the IPC thread
//! - **Protocol**: message envelope and framing shared by both sides

pub mod connection;
pub mod directory;
pub mod protocol;

pub use connection::{ChannelMode, Transport, TransportListener};
pub use directory::{ChannelDirectory, ChannelName};
pub use protocol::{read_frame, write_frame, CallId, Message, MessageKind, CONTROL_ROUTING_ID};
