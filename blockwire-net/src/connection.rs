//! Connections running their own read/write loop thread, with a FIFO outbound queue
//! and a protocol stage.

use std::sync::atomic::{AtomicBool, AtomicI16, AtomicI32, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use std::io::{self, Cursor};
use std::fmt;

use crossbeam_channel::{Receiver, Sender};
use arcstr::ArcStr;

use tracing::{debug, trace, warn};

use blockwire::event::Bus;

use crate::proto::{self, Packet, ProtocolError, HandshakePacket, PlayerPacket, ClientStatusPacket, ClientStatus};
use crate::transport::{send_all, TcpTransport, Transport};
use crate::endpoint::parse_endpoint;
use crate::config::ConnectionConfig;
use crate::dispatch::Registry;


/// Protocol stage of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Stage {
    /// Not yet connected.
    Connecting = 0,
    /// Handshake sent or expected.
    Handshaking = 1,
    /// Waiting for login or status.
    LoginOrStatus = 2,
    /// Logged in, playing.
    Play = 3,
    /// Disconnection requested.
    Disconnecting = 4,
    /// Loop terminated and transport closed.
    Closed = 5,
}

impl Stage {
    fn from_u8(n: u8) -> Self {
        match n {
            0 => Stage::Connecting,
            1 => Stage::Handshaking,
            2 => Stage::LoginOrStatus,
            3 => Stage::Play,
            4 => Stage::Disconnecting,
            _ => Stage::Closed,
        }
    }
}

/// Which end of the protocol a connection is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Notification emitted by a connection, from its loop thread.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// A packet has been written and flushed to the transport.
    PacketSent(Packet),
    /// A packet has been decoded, emitted before being dispatched.
    PacketReceived(Packet),
    /// A packet could not be sent and has been dropped.
    SendFailed { packet_id: u8, error: String },
    /// A received frame could not be decoded and has been dropped.
    DecodeFailed { error: String },
    /// The connection is closed.
    Closed,
}


/// State shared between a connection, its handles and its loop thread.
struct Shared {
    id: u64,
    role: Role,
    stage: AtomicU8,
    username: RwLock<ArcStr>,
    entity_id: AtomicI32,
    spawned: AtomicBool,
    health: AtomicI16,
    /// Checked by the loop before each iteration and each read.
    cancel: AtomicBool,
    tx: Sender<Packet>,
    rx: Receiver<Packet>,
    events: Bus<ConnectionEvent>,
}

/// A cheap, cloneable handle to a connection, usable from any thread to enqueue 
/// packets and read the connection state. Handlers receive such a handle.
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<Shared>,
}

impl ConnectionHandle {

    fn new(role: Role, username: ArcStr) -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            shared: Arc::new(Shared {
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
                role,
                stage: AtomicU8::new(Stage::Connecting as u8),
                username: RwLock::new(username),
                entity_id: AtomicI32::new(0),
                spawned: AtomicBool::new(false),
                health: AtomicI16::new(20),
                cancel: AtomicBool::new(false),
                tx,
                rx,
                events: Bus::new(),
            })
        }
    }

    /// A client handle not bound to any connection loop, packets sent to it are only
    /// queued.
    pub fn detached(username: &str) -> Self {
        Self::new(Role::Client, ArcStr::from(username))
    }

    /// Unique identifier of this connection in the process.
    #[inline]
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.shared.role
    }

    pub fn stage(&self) -> Stage {
        Stage::from_u8(self.shared.stage.load(Ordering::Acquire))
    }

    pub fn set_stage(&self, stage: Stage) {
        let prev = Stage::from_u8(self.shared.stage.swap(stage as u8, Ordering::AcqRel));
        if prev != stage {
            trace!("connection #{} stage {prev:?} -> {stage:?}", self.id());
        }
    }

    pub fn username(&self) -> ArcStr {
        self.shared.username.read().expect("poisoned").clone()
    }

    pub fn set_username(&self, username: ArcStr) {
        *self.shared.username.write().expect("poisoned") = username;
    }

    /// Entity id given by the server on login.
    pub fn entity_id(&self) -> i32 {
        self.shared.entity_id.load(Ordering::Relaxed)
    }

    pub fn set_entity_id(&self, entity_id: i32) {
        self.shared.entity_id.store(entity_id, Ordering::Relaxed);
    }

    /// Return true once the player has been positioned in the world, heartbeats are
    /// only sent when spawned.
    pub fn is_spawned(&self) -> bool {
        self.shared.spawned.load(Ordering::Relaxed)
    }

    pub fn set_spawned(&self, spawned: bool) {
        self.shared.spawned.store(spawned, Ordering::Relaxed);
    }

    pub fn health(&self) -> i16 {
        self.shared.health.load(Ordering::Relaxed)
    }

    pub fn set_health(&self, health: i16) {
        self.shared.health.store(health, Ordering::Relaxed);
    }

    /// Notifications of this connection.
    #[inline]
    pub fn events(&self) -> &Bus<ConnectionEvent> {
        &self.shared.events
    }

    /// Number of packets waiting in the outbound queue.
    pub fn queued(&self) -> usize {
        self.shared.rx.len()
    }

    /// Enqueue a packet, it will be sent by the loop thread after every packet 
    /// enqueued before it.
    pub fn send(&self, packet: Packet) -> Result<(), ConnectionError> {
        if self.stage() == Stage::Closed {
            return Err(ConnectionError::NotConnected);
        }
        // Our own receiver is alive as long as the shared state.
        let _ = self.shared.tx.send(packet);
        Ok(())
    }

    /// Send a chat message.
    pub fn send_chat(&self, message: &str) -> Result<(), ConnectionError> {
        self.send(Packet::chat(message))
    }

    /// Request respawn of the client's player, only valid if it is dead.
    pub fn respawn(&self) -> Result<(), ConnectionError> {
        if self.health() > 0 {
            return Err(ConnectionError::InvalidState("player is not dead"));
        }
        self.send(Packet::ClientStatus(ClientStatusPacket { status: ClientStatus::Respawn }))
    }

    /// Enqueue a disconnect packet, the loop stops once it has been sent. This can be
    /// called from handlers, unlike [`Connection::disconnect`].
    pub fn kick(&self, reason: &str) -> Result<(), ConnectionError> {
        self.send(Packet::disconnect(reason))
    }

}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id())
            .field("role", &self.role())
            .field("stage", &self.stage())
            .field("username", &self.username())
            .finish()
    }
}


/// A connection owning its loop thread. The loop thread owns the transport while 
/// running and gives it back when cancelled.
pub struct Connection {
    handle: ConnectionHandle,
    registry: Arc<Registry>,
    config: ConnectionConfig,
    thread: Option<JoinHandle<Option<Released>>>,
}

/// What a cancelled loop gives back to its connection.
struct Released {
    transport: Box<dyn Transport>,
    /// Remaining bytes of a frame that was partially written when cancelled, they
    /// must precede any other frame.
    unsent: Vec<u8>,
}

impl Connection {

    /// Create a new client connection with the given username, not yet connected.
    pub fn new(username: &str, registry: Arc<Registry>, config: ConnectionConfig) -> Self {
        Self {
            handle: ConnectionHandle::new(Role::Client, ArcStr::from(username)),
            registry,
            config,
            thread: None,
        }
    }

    /// Create a server-side connection for an accepted transport, its loop starts
    /// immediately and waits for the client's handshake.
    pub fn accept(transport: impl Transport + 'static, registry: Arc<Registry>, config: ConnectionConfig) -> io::Result<Self> {
        let mut conn = Self {
            handle: ConnectionHandle::new(Role::Server, ArcStr::new()),
            registry,
            config,
            thread: None,
        };
        conn.handle.set_stage(Stage::Handshaking);
        conn.start(Box::new(transport))?;
        Ok(conn)
    }

    #[inline]
    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    /// Return true if the loop thread is running.
    pub fn is_connected(&self) -> bool {
        self.thread.as_ref().is_some_and(|thread| !thread.is_finished())
    }

    /// Connect to the given endpoint, see [`parse_endpoint`] for accepted forms.
    pub fn connect(&mut self, endpoint: &str) -> Result<(), ConnectionError> {
        if self.is_connected() {
            return Err(ConnectionError::AlreadyConnected);
        }
        let (addr, host) = parse_endpoint(endpoint)?;
        debug!("connecting to {addr} ({host})");
        let transport = TcpTransport::connect(addr)?;
        self.connect_transport(transport, &host, addr.port())
    }

    /// Start the connection over an already opened transport, the handshake carrying 
    /// the given host and port is the first frame sent.
    pub fn connect_transport(&mut self, transport: impl Transport + 'static, host: &str, port: u16) -> Result<(), ConnectionError> {

        if self.is_connected() {
            return Err(ConnectionError::AlreadyConnected);
        }

        // Release a previous loop that terminated by itself.
        self.poll_closed();

        let shared = &self.handle.shared;
        while shared.rx.try_recv().is_ok() {}
        shared.cancel.store(false, Ordering::Release);
        self.handle.set_spawned(false);
        self.handle.set_stage(Stage::Handshaking);

        self.handle.send(Packet::Handshake(HandshakePacket {
            protocol_version: proto::PROTOCOL_VERSION,
            username: self.handle.username().to_string(),
            host: host.to_string(),
            port: port as i32,
        }))?;

        self.start(Box::new(transport))?;
        Ok(())

    }

    fn start(&mut self, transport: Box<dyn Transport>) -> io::Result<()> {

        let handle = self.handle.clone();
        let registry = Arc::clone(&self.registry);
        let config = self.config.clone();

        let thread = thread::Builder::new()
            .name(format!("connection-{}", self.handle.id()))
            .spawn(move || ConnectionLoop {
                transport, 
                handle, 
                registry, 
                config, 
                inbound: Vec::new(),
                outbound: None,
            }.run())?;

        self.thread = Some(thread);
        Ok(())

    }

    /// Stop the loop, then send a disconnect frame with the given reason and close the
    /// transport. Sending the frame is best effort and bounded by the close timeout, 
    /// so this returns even if the peer stopped reading.
    pub fn disconnect(&mut self, reason: &str) -> Result<(), ConnectionError> {

        let Some(thread) = self.thread.take() else {
            return Err(ConnectionError::NotConnected);
        };

        self.handle.shared.cancel.store(true, Ordering::Release);
        self.handle.set_stage(Stage::Disconnecting);

        // A loop that panicked has dropped its transport already.
        if let Ok(Some(Released { mut transport, mut unsent })) = thread.join() {

            let deadline = Instant::now() + self.config.close_timeout;
            let res = Packet::disconnect(reason).encode(&mut unsent)
                .and_then(|_| send_all(&mut transport, &unsent, deadline));

            match res {
                Ok(true) => {}
                Ok(false) => debug!("timed out sending disconnect frame on connection #{}", self.handle.id()),
                Err(e) => debug!("failed to send disconnect frame on connection #{}: {e}", self.handle.id()),
            }

            if let Err(e) = transport.close() {
                debug!("failed to close connection #{}: {e}", self.handle.id());
            }

        }

        self.finish();
        Ok(())

    }

    /// If the loop terminated by itself, release it and return true.
    pub fn poll_closed(&mut self) -> bool {
        if !self.thread.as_ref().is_some_and(|thread| thread.is_finished()) {
            return false;
        }
        if let Some(Ok(Some(mut released))) = self.thread.take().map(JoinHandle::join) {
            let _ = released.transport.close();
        }
        self.finish();
        true
    }

    fn finish(&self) {
        if self.handle.stage() != Stage::Closed {
            self.handle.set_stage(Stage::Closed);
            self.handle.events().emit(&ConnectionEvent::Closed);
        }
    }

}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.thread.is_some() {
            let _ = self.disconnect("Connection closed");
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("handle", &self.handle)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}


/// The loop running on a connection thread.
struct ConnectionLoop {
    transport: Box<dyn Transport>,
    handle: ConnectionHandle,
    registry: Arc<Registry>,
    config: ConnectionConfig,
    /// Received bytes not yet decoded, may end with a partial frame.
    inbound: Vec<u8>,
    /// The frame being written, if the transport didn't accept it entirely yet.
    outbound: Option<OutboundFrame>,
}

/// An encoded frame and how much of it has been written.
struct OutboundFrame {
    packet: Packet,
    data: Vec<u8>,
    written: usize,
}

impl ConnectionLoop {

    /// Run the loop until cancelled, returning the transport, or until the connection
    /// terminated by itself, in which case the transport is closed here.
    fn run(mut self) -> Option<Released> {

        let id = self.handle.id();
        let mut last_heartbeat = Instant::now();
        trace!("connection #{id} loop started");

        loop {

            if self.cancelled() {
                trace!("connection #{id} loop cancelled");
                return Some(self.release());
            }

            if self.handle.is_spawned() && last_heartbeat.elapsed() >= self.config.heartbeat_interval {
                let _ = self.handle.send(Packet::Player(PlayerPacket { on_ground: true }));
                last_heartbeat = Instant::now();
            }

            let res = match self.drain_outbound() {
                Ok(true) => self.read_inbound(),
                res => res,
            };

            match res {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    debug!("connection #{id} terminated: {e}");
                    break;
                }
            }

            thread::sleep(self.config.idle_sleep);

        }

        if self.cancelled() {
            return Some(self.release());
        }

        if let Err(e) = self.transport.close() {
            debug!("failed to close connection #{id}: {e}");
        }

        self.handle.set_stage(Stage::Closed);
        self.handle.events().emit(&ConnectionEvent::Closed);
        trace!("connection #{id} loop terminated");
        None

    }

    #[inline]
    fn cancelled(&self) -> bool {
        self.handle.shared.cancel.load(Ordering::Acquire)
    }

    fn release(self) -> Released {
        Released {
            transport: self.transport,
            unsent: self.outbound.map(|frame| frame.data[frame.written..].to_vec()).unwrap_or_default(),
        }
    }

    /// Send queued packets in order, returns false if the loop should stop. This 
    /// returns early when cancelled or when the transport doesn't accept bytes, the
    /// current frame is then resumed on the next iteration.
    fn drain_outbound(&mut self) -> io::Result<bool> {

        loop {

            if self.cancelled() {
                return Ok(true);
            }

            let mut frame = match self.outbound.take() {
                Some(frame) => frame,
                None => {
                    let Ok(packet) = self.handle.shared.rx.try_recv() else {
                        return Ok(true);
                    };
                    let mut data = Vec::new();
                    if let Err(e) = packet.encode(&mut data) {
                        self.send_failed(&packet, &e);
                        continue;
                    }
                    OutboundFrame { packet, data, written: 0 }
                }
            };

            match self.transport.send(&frame.data[frame.written..], self.config.write_wait) {
                Ok(len) => frame.written += len,
                // The peer has already seen part of this frame, the stream can't be
                // resynchronized.
                Err(e) if frame.written > 0 || is_fatal_write_error(&e) => return Err(e),
                Err(e) => {
                    self.send_failed(&frame.packet, &e);
                    continue;
                }
            }

            if frame.written < frame.data.len() {
                self.outbound = Some(frame);
                return Ok(true);
            }

            let disconnect = matches!(frame.packet, Packet::Disconnect(_));
            self.handle.events().emit(&ConnectionEvent::PacketSent(frame.packet));
            if disconnect {
                self.handle.set_stage(Stage::Disconnecting);
                return Ok(false);
            }

        }

    }

    fn send_failed(&self, packet: &Packet, e: &io::Error) {
        warn!("dropped packet {:#04X} on connection #{}: {e}", packet.id(), self.handle.id());
        self.handle.events().emit(&ConnectionEvent::SendFailed { 
            packet_id: packet.id(), 
            error: e.to_string(),
        });
    }

    /// Wait for incoming bytes and dispatch every complete frame, within the read 
    /// budget. Returns false if the loop should stop.
    fn read_inbound(&mut self) -> io::Result<bool> {

        let start = Instant::now();

        loop {

            while !self.inbound.is_empty() {

                if self.cancelled() {
                    return Ok(true);
                }

                let (res, consumed) = {
                    let mut cursor = Cursor::new(&self.inbound[..]);
                    let res = Packet::decode(&mut cursor);
                    (res, cursor.position() as usize)
                };

                match res {
                    Ok(packet) => {
                        self.inbound.drain(..consumed);
                        self.handle.events().emit(&ConnectionEvent::PacketReceived(packet.clone()));
                        self.registry.handle(&self.handle, &packet);
                        if let Packet::Disconnect(disconnect) = packet {
                            debug!("connection #{} closed by peer: {}", self.handle.id(), disconnect.reason);
                            self.handle.set_stage(Stage::Disconnecting);
                            return Ok(false);
                        }
                    }
                    // Wait for the rest of the frame.
                    Err(e) if e.is_incomplete() => break,
                    Err(e) => {
                        // At least the id byte is dropped.
                        self.inbound.drain(..consumed.max(1));
                        warn!("dropped frame on connection #{}: {e}", self.handle.id());
                        self.handle.events().emit(&ConnectionEvent::DecodeFailed { error: e.to_string() });
                        if self.config.strict {
                            return Ok(false);
                        }
                    }
                }

            }

            let Some(remaining) = self.config.read_budget.checked_sub(start.elapsed()) else {
                return Ok(true);
            };

            if self.cancelled() || self.transport.recv(&mut self.inbound, remaining)? == 0 {
                return Ok(true);
            }

        }

    }

}

/// Return true if the write error means that the transport is unusable.
fn is_fatal_write_error(e: &io::Error) -> bool {
    matches!(e.kind(), 
        io::ErrorKind::BrokenPipe | 
        io::ErrorKind::ConnectionReset | 
        io::ErrorKind::ConnectionAborted | 
        io::ErrorKind::NotConnected | 
        io::ErrorKind::UnexpectedEof | 
        io::ErrorKind::WriteZero)
}


/// Error type used by connection operations.
#[derive(thiserror::Error, Debug)]
pub enum ConnectionError {
    #[error("already connected")]
    AlreadyConnected,
    #[error("not connected")]
    NotConnected,
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),
}


#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn respawn_requires_dead() {

        let conn = ConnectionHandle::detached("Alice");
        assert!(matches!(conn.respawn(), Err(ConnectionError::InvalidState(_))));
        assert_eq!(conn.queued(), 0);

        conn.set_health(0);
        conn.respawn().unwrap();
        assert_eq!(conn.queued(), 1);

    }

    #[test]
    fn stages() {
        let conn = ConnectionHandle::detached("Alice");
        assert_eq!(conn.stage(), Stage::Connecting);
        conn.set_stage(Stage::Play);
        assert_eq!(conn.stage(), Stage::Play);
        conn.set_stage(Stage::Closed);
        assert!(matches!(conn.send_chat("hi"), Err(ConnectionError::NotConnected)));
    }

}
