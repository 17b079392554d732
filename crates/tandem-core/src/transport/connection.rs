//! Point-to-point loopback TCP transport.
//!
//! A `Server` channel binds `127.0.0.1:0`, publishes the address in the
//! `ChannelDirectory` and accepts exactly one peer. A `Client` channel
//! resolves the name and connects. Either way the connection is then driven
//! by one task on the IPC thread that reads frames into the listener and
//! writes queued outgoing messages.
//!
//! # Thread Safety
//!
//! `Transport` itself may be used from any thread; sending only enqueues.
//! All `TransportListener` callbacks run on the IPC thread, in receive order.

use super::directory::{ChannelDirectory, ChannelName};
use super::protocol::{read_frame, write_frame, Message};
use crate::config::ChannelConfig;
use crate::exec::IoHandle;
use crate::{Result, TandemError};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, warn};

/// Which side of the channel an endpoint plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMode {
    /// Offers the connection point; must be listening before clients start.
    Server,
    /// Connects to an existing server.
    Client,
}

impl ChannelMode {
    pub fn is_server(&self) -> bool {
        matches!(self, ChannelMode::Server)
    }

    pub fn is_client(&self) -> bool {
        matches!(self, ChannelMode::Client)
    }
}

/// Receives transport events on the IPC thread.
pub trait TransportListener: Send + Sync + 'static {
    /// A complete message arrived from the peer.
    fn on_message(&self, message: Message);

    /// The peer connection is established.
    fn on_connected(&self, _peer: SocketAddr) {}

    /// The channel is gone: peer disconnect, connect failure, local close.
    /// Called exactly once per transport.
    fn on_closed(&self, reason: &TandemError);
}

/// One end of a channel.
pub struct Transport {
    name: ChannelName,
    mode: ChannelMode,
    outgoing: mpsc::UnboundedSender<Message>,
    close_tx: watch::Sender<bool>,
    local_addr: Option<SocketAddr>,
    directory: Arc<ChannelDirectory>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

impl Transport {
    /// Open the channel. Servers are listening (and published) when this
    /// returns; clients connect in the background and report failure through
    /// `on_closed`.
    pub fn open(
        name: ChannelName,
        mode: ChannelMode,
        directory: Arc<ChannelDirectory>,
        io: &IoHandle,
        listener: Arc<dyn TransportListener>,
    ) -> Result<Self> {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = watch::channel(false);

        let local_addr = match mode {
            ChannelMode::Server => {
                let socket = std::net::TcpListener::bind((ChannelConfig::LISTEN_HOST, 0))?;
                socket.set_nonblocking(true)?;
                let addr = socket.local_addr()?;
                directory.publish(&name, addr);
                io.spawn(serve(name.clone(), socket, outgoing_rx, close_rx, listener));
                Some(addr)
            }
            ChannelMode::Client => {
                io.spawn(connect(
                    name.clone(),
                    Arc::clone(&directory),
                    outgoing_rx,
                    close_rx,
                    listener,
                ));
                None
            }
        };

        Ok(Self {
            name,
            mode,
            outgoing: outgoing_tx,
            close_tx,
            local_addr,
            directory,
        })
    }

    /// Queue a message for the peer. Fails once the connection task has
    /// ended.
    pub fn send(&self, message: Message) -> Result<()> {
        self.outgoing
            .send(message)
            .map_err(|_| TandemError::channel_closed(self.name.as_str()))
    }

    /// Close the connection. Outstanding listener state is told through
    /// `on_closed`.
    pub fn close(&self) {
        let _ = self.close_tx.send(true);
    }

    pub fn name(&self) -> &ChannelName {
        &self.name
    }

    pub fn mode(&self) -> ChannelMode {
        self.mode
    }

    /// Listening address, for server channels.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.close();
        if let Some(addr) = self.local_addr {
            self.directory.withdraw(&self.name, addr);
        }
    }
}

/// Resolves once the close flag is raised or the transport is dropped.
async fn closed(close_rx: &mut watch::Receiver<bool>) {
    loop {
        let is_closed = *close_rx.borrow();
        if is_closed {
            return;
        }
        if close_rx.changed().await.is_err() {
            return;
        }
    }
}

async fn serve(
    name: ChannelName,
    socket: std::net::TcpListener,
    outgoing: mpsc::UnboundedReceiver<Message>,
    mut close_rx: watch::Receiver<bool>,
    listener: Arc<dyn TransportListener>,
) {
    let tcp = match TcpListener::from_std(socket) {
        Ok(tcp) => tcp,
        Err(e) => {
            error!("Channel {} failed to register listener: {}", name, e);
            listener.on_closed(&TandemError::from(e));
            return;
        }
    };

    let stream = tokio::select! {
        accepted = tcp.accept() => match accepted {
            Ok((stream, peer_addr)) => {
                debug!("Channel {} accepted peer {}", name, peer_addr);
                listener.on_connected(peer_addr);
                stream
            }
            Err(e) => {
                error!("Channel {} accept error: {}", name, e);
                listener.on_closed(&TandemError::from(e));
                return;
            }
        },
        _ = closed(&mut close_rx) => {
            debug!("Channel {} closed before a peer connected", name);
            listener.on_closed(&TandemError::channel_closed(name.as_str()));
            return;
        }
    };

    // Point-to-point: stop listening once the peer is here.
    drop(tcp);
    run_connection(name, stream, outgoing, close_rx, listener).await;
}

async fn connect(
    name: ChannelName,
    directory: Arc<ChannelDirectory>,
    outgoing: mpsc::UnboundedReceiver<Message>,
    mut close_rx: watch::Receiver<bool>,
    listener: Arc<dyn TransportListener>,
) {
    let addr = match directory.resolve(&name) {
        Ok(addr) => addr,
        Err(e) => {
            warn!("Channel {} cannot connect: {}", name, e);
            listener.on_closed(&e);
            return;
        }
    };

    let stream = tokio::select! {
        result = tokio::time::timeout(ChannelConfig::CONNECT_TIMEOUT, TcpStream::connect(addr)) => {
            match result {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    warn!("Channel {} failed to connect to {}: {}", name, addr, e);
                    listener.on_closed(&TandemError::from(e));
                    return;
                }
                Err(_) => {
                    warn!("Channel {} timed out connecting to {}", name, addr);
                    listener.on_closed(&TandemError::channel_closed(name.as_str()));
                    return;
                }
            }
        }
        _ = closed(&mut close_rx) => {
            listener.on_closed(&TandemError::channel_closed(name.as_str()));
            return;
        }
    };

    debug!("Channel {} connected to {}", name, addr);
    listener.on_connected(addr);
    run_connection(name, stream, outgoing, close_rx, listener).await;
}

async fn run_connection(
    name: ChannelName,
    stream: TcpStream,
    mut outgoing: mpsc::UnboundedReceiver<Message>,
    mut close_rx: watch::Receiver<bool>,
    listener: Arc<dyn TransportListener>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Channel {} could not disable Nagle: {}", name, e);
    }
    let (mut reader, mut writer) = stream.into_split();

    let result = tokio::select! {
        result = read_loop(&mut reader, &*listener) => result,
        result = write_loop(&mut writer, &mut outgoing) => result,
        _ = closed(&mut close_rx) => Ok(()),
    };

    let reason = match result {
        Ok(()) => {
            debug!("Channel {} closed", name);
            TandemError::channel_closed(name.as_str())
        }
        Err(e) => {
            debug!("Channel {} ended: {}", name, e);
            e
        }
    };
    listener.on_closed(&reason);
}

async fn read_loop(reader: &mut OwnedReadHalf, listener: &dyn TransportListener) -> Result<()> {
    loop {
        let Some(frame) = read_frame(reader).await? else {
            return Ok(()); // Clean disconnect
        };
        match Message::decode(&frame) {
            Ok(message) => listener.on_message(message),
            Err(e) => warn!("Dropping undecodable frame: {}", e),
        }
    }
}

async fn write_loop(
    writer: &mut OwnedWriteHalf,
    outgoing: &mut mpsc::UnboundedReceiver<Message>,
) -> Result<()> {
    while let Some(message) = outgoing.recv().await {
        let body = match message.encode() {
            Ok(body) => body,
            Err(e) => {
                error!("Failed to encode {} message: {}", message.name, e);
                continue;
            }
        };
        write_frame(writer, &body).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::IoThread;
    use crossbeam::channel::{self, Receiver, Sender};
    use std::time::Duration;

    #[derive(Debug)]
    enum Event {
        Message(Message),
        Connected,
        Closed,
    }

    struct RecordingListener {
        events: Sender<Event>,
    }

    impl TransportListener for RecordingListener {
        fn on_message(&self, message: Message) {
            let _ = self.events.send(Event::Message(message));
        }

        fn on_connected(&self, _peer: SocketAddr) {
            let _ = self.events.send(Event::Connected);
        }

        fn on_closed(&self, _reason: &TandemError) {
            let _ = self.events.send(Event::Closed);
        }
    }

    fn recording() -> (Arc<dyn TransportListener>, Receiver<Event>) {
        let (tx, rx) = channel::unbounded();
        (Arc::new(RecordingListener { events: tx }), rx)
    }

    fn next(rx: &Receiver<Event>) -> Event {
        rx.recv_timeout(Duration::from_secs(5))
            .expect("transport event")
    }

    #[test]
    fn test_server_and_client_exchange_messages_in_order() {
        let mut io = IoThread::start("transport_io").unwrap();
        let directory = Arc::new(ChannelDirectory::new());
        let name = ChannelName::new("exchange");

        let (server_listener, server_events) = recording();
        let server = Transport::open(
            name.clone(),
            ChannelMode::Server,
            Arc::clone(&directory),
            &io.handle(),
            server_listener,
        )
        .unwrap();
        assert!(server.local_addr().is_some());
        assert!(directory.resolve(&name).is_ok());

        let (client_listener, client_events) = recording();
        let client = Transport::open(
            name.clone(),
            ChannelMode::Client,
            Arc::clone(&directory),
            &io.handle(),
            client_listener,
        )
        .unwrap();

        for i in 0..3 {
            client
                .send(Message::unsolicited("tick", serde_json::json!(i)))
                .unwrap();
        }

        assert!(matches!(next(&server_events), Event::Connected));
        for i in 0..3 {
            match next(&server_events) {
                Event::Message(message) => assert_eq!(message.payload, serde_json::json!(i)),
                other => panic!("Expected message, got: {:?}", other),
            }
        }
        assert!(matches!(next(&client_events), Event::Connected));

        drop(client);
        assert!(matches!(next(&client_events), Event::Closed));
        assert!(matches!(next(&server_events), Event::Closed));

        drop(server);
        assert!(directory.is_empty());
        io.stop();
    }

    #[test]
    fn test_client_without_server_reports_closed() {
        let mut io = IoThread::start("transport_orphan").unwrap();
        let directory = Arc::new(ChannelDirectory::new());

        let (listener, events) = recording();
        let client = Transport::open(
            ChannelName::new("nobody"),
            ChannelMode::Client,
            directory,
            &io.handle(),
            listener,
        )
        .unwrap();

        assert!(matches!(next(&events), Event::Closed));
        drop(client);
        io.stop();
    }

    #[test]
    fn test_close_before_peer_reports_closed() {
        let mut io = IoThread::start("transport_close").unwrap();
        let directory = Arc::new(ChannelDirectory::new());

        let (listener, events) = recording();
        let server = Transport::open(
            ChannelName::anonymous(),
            ChannelMode::Server,
            directory,
            &io.handle(),
            listener,
        )
        .unwrap();

        server.close();
        assert!(matches!(next(&events), Event::Closed));
        drop(server);
        io.stop();
    }
}
