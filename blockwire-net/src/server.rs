//! The server accepting connections, dispatching their packets to a shared world and 
//! broadcasting world changes back to them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use std::net::SocketAddr;
use std::collections::HashMap;
use std::io;

use crossbeam_channel::{Receiver, Sender};
use mio::{Events, Interest, Poll, Token, Waker};
use mio::net::TcpListener;
use glam::{DVec3, IVec3, Vec2};
use arcstr::ArcStr;

use tracing::{debug, info, instrument, warn};

use blockwire::event::{BlockEvent, EntityEvent, Event, SubscriberId};
use blockwire::world::{World, WorldError, TICK_DURATION};
use blockwire::block::Block;
use blockwire::face::Face;
use blockwire::chunk;

use crate::proto::{self, Packet, LoginPacket, SpawnPositionPacket, PositionLookPacket, 
    UpdateHealthPacket, DigStatus, BlockChangePacket, EntityPacket, DestroyEntityPacket,
    TimeUpdatePacket, KeepAlivePacket};
use crate::connection::{Connection, ConnectionHandle, Stage};
use crate::dispatch::{Registry, RegistryBuilder};
use crate::transport::{TcpTransport, Transport};
use crate::config::ConnectionConfig;


/// Maximum number of players announced on login.
const MAX_PLAYERS: u8 = 20;
/// Ticks between two keep alive and time updates.
const KEEP_ALIVE_INTERVAL: u64 = 20;
/// Polling token of the listener in the acceptor's poll.
const LISTENER_TOKEN: Token = Token(0);
/// Polling token used to wake the acceptor when stopping.
const WAKER_TOKEN: Token = Token(1);


/// A server hosting a single world.
pub struct Server {
    state: Arc<ServerState>,
    registry: Arc<Registry>,
    config: ConnectionConfig,
    /// Connections owned by the server, their loops run on their own threads.
    connections: Vec<Connection>,
    /// Transports accepted by the acceptor thread, not yet given a connection.
    accepted_tx: Sender<TcpTransport>,
    accepted_rx: Receiver<TcpTransport>,
    acceptor: Option<Acceptor>,
    /// World subscription of the bridge broadcasting world changes.
    bridge: SubscriberId,
    /// Number of ticks run.
    ticks: u64,
}

/// State shared with packet handlers and the world bridge.
struct ServerState {
    world: Arc<World>,
    /// Handles of connections that completed their handshake.
    clients: RwLock<HashMap<u64, ConnectionHandle>>,
}

impl ServerState {

    /// Send a packet to every playing client.
    fn broadcast(&self, packet: &Packet) {
        for client in self.clients.read().expect("poisoned").values() {
            if client.stage() == Stage::Play {
                let _ = client.send(packet.clone());
            }
        }
    }

    fn broadcast_chat(&self, message: &str) {
        let message = message.chars().take(proto::CHAT_MAX_LEN).collect::<String>();
        info!("chat: {message}");
        self.broadcast(&Packet::chat(message));
    }

    /// Forget a client, returning its handle if it was known.
    fn remove_client(&self, id: u64) -> Option<ConnectionHandle> {
        self.clients.write().expect("poisoned").remove(&id)
    }

}

impl Server {

    /// Create a server for the given world, no listener is bound yet.
    pub fn new(world: Arc<World>, config: ConnectionConfig) -> Self {

        let state = Arc::new(ServerState {
            world: Arc::clone(&world),
            clients: RwLock::new(HashMap::new()),
        });

        let weak_state = Arc::downgrade(&state);
        let bridge = world.events().subscribe(move |event: &Event| {
            if let Some(state) = weak_state.upgrade() {
                bridge_world_event(&state, event);
            }
        });

        let (accepted_tx, accepted_rx) = crossbeam_channel::unbounded();

        Self {
            registry: Arc::new(server_registry(&state).build()),
            state,
            config,
            connections: Vec::new(),
            accepted_tx,
            accepted_rx,
            acceptor: None,
            bridge,
            ticks: 0,
        }

    }

    #[inline]
    pub fn world(&self) -> &Arc<World> {
        &self.state.world
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of clients that completed their handshake.
    pub fn client_count(&self) -> usize {
        self.state.clients.read().expect("poisoned").len()
    }

    /// Bind a TCP listener to the given address, connections accepted by it are 
    /// started on the next tick. Returns the bound address.
    pub fn bind(&mut self, addr: SocketAddr) -> io::Result<SocketAddr> {

        let poll = Poll::new()?;
        let mut listener = TcpListener::bind(addr)?;
        poll.registry().register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let local_addr = listener.local_addr()?;

        let running = Arc::new(AtomicBool::new(true));
        let thread_running = Arc::clone(&running);
        let accepted_tx = self.accepted_tx.clone();

        let thread = thread::Builder::new()
            .name("acceptor".to_string())
            .spawn(move || run_acceptor(poll, listener, thread_running, accepted_tx))?;

        self.acceptor = Some(Acceptor { running, waker, thread: Some(thread) });

        info!("server bound to {local_addr}");
        Ok(local_addr)

    }

    /// Start a server-side connection over the given transport.
    pub fn add_transport(&mut self, transport: impl Transport + 'static) -> io::Result<ConnectionHandle> {
        let conn = Connection::accept(transport, Arc::clone(&self.registry), self.config.clone())?;
        let handle = conn.handle().clone();
        debug!("connection #{} accepted", handle.id());
        self.connections.push(conn);
        Ok(handle)
    }

    /// Run a single tick on the server and waits for this function to approximately 
    /// last for 50 ms (20 TPS), there is no sleep if the tick was too long, in such 
    /// case a warning is logged.
    pub fn tick_padded(&mut self) -> io::Result<()> {

        let start = Instant::now();
        self.tick()?;
        let elapsed = start.elapsed();

        if let Some(missing) = TICK_DURATION.checked_sub(elapsed) {
            thread::sleep(missing);
        } else {
            warn!("tick too long {:?}, expected {:?}", elapsed, TICK_DURATION);
        }

        Ok(())

    }

    /// Run a single tick: start accepted connections, run due scheduled updates, keep
    /// clients alive and release closed connections.
    pub fn tick(&mut self) -> io::Result<()> {

        while let Ok(transport) = self.accepted_rx.try_recv() {
            self.add_transport(transport)?;
        }

        self.state.world.do_scheduled_updates();

        self.ticks += 1;
        if self.ticks % KEEP_ALIVE_INTERVAL == 0 {
            self.state.broadcast(&Packet::KeepAlive(KeepAlivePacket { id: self.ticks as i32 }));
            self.state.broadcast(&Packet::TimeUpdate(TimeUpdatePacket { 
                age: self.ticks as i64, 
                time: self.ticks as i64 % 24000,
            }));
        }

        let state = &self.state;
        self.connections.retain_mut(|conn| {
            if !conn.poll_closed() {
                return true;
            }
            let id = conn.handle().id();
            debug!("connection #{id} closed");
            if state.remove_client(id).is_some() {
                state.broadcast_chat(&format!("{} left the game", conn.handle().username()));
            }
            false
        });

        Ok(())

    }

    /// Run ticks until the given flag is cleared.
    pub fn run(&mut self, running: &AtomicBool) -> io::Result<()> {
        while running.load(Ordering::Relaxed) {
            self.tick_padded()?;
        }
        Ok(())
    }

    /// Stop accepting connections, disconnect every client and save the world.
    #[instrument(skip_all)]
    pub fn stop(&mut self) -> Result<(), WorldError> {

        self.acceptor.take();

        for mut conn in self.connections.drain(..) {
            self.state.remove_client(conn.handle().id());
            let _ = conn.disconnect("Server closed");
        }

        info!("saving world...");
        self.state.world.save()?;
        info!("world saved");
        Ok(())

    }

}

impl Drop for Server {
    fn drop(&mut self) {
        self.state.world.events().unsubscribe(self.bridge);
    }
}


/// The thread accepting TCP connections while the server runs.
struct Acceptor {
    running: Arc<AtomicBool>,
    /// Wakes the acceptor's poll so that it observes the running flag.
    waker: Waker,
    thread: Option<JoinHandle<()>>,
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Err(e) = self.waker.wake() {
            warn!("failed to wake acceptor: {e}");
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn run_acceptor(mut poll: Poll, listener: TcpListener, running: Arc<AtomicBool>, accepted: Sender<TcpTransport>) {

    let mut events = Events::with_capacity(16);

    while running.load(Ordering::Relaxed) {

        if let Err(e) = poll.poll(&mut events, None) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            warn!("acceptor poll failed: {e}");
            break;
        }

        if !events.iter().any(|event| event.token() == LISTENER_TOKEN) {
            continue;
        }

        // Readiness is edge-triggered, accept until the backlog is empty.
        loop {
            match listener.accept() {
                Ok((stream, addr)) => match TcpTransport::new(stream) {
                    Ok(transport) => {
                        info!("accepted connection from {addr}");
                        if accepted.send(transport).is_err() {
                            return;
                        }
                    }
                    Err(e) => warn!("failed to setup connection from {addr}: {e}"),
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("failed to accept connection: {e}");
                    break;
                }
            }
        }

    }

    debug!("acceptor stopped");

}


/// Build the handlers of server connections.
fn server_registry(state: &Arc<ServerState>) -> RegistryBuilder {

    fn with_state<F>(state: Weak<ServerState>, handler: F) -> impl Fn(&ConnectionHandle, &Packet) + Send + Sync + 'static
    where
        F: Fn(&ServerState, &ConnectionHandle, &Packet) + Send + Sync + 'static,
    {
        move |conn: &ConnectionHandle, packet: &Packet| {
            if let Some(state) = state.upgrade() {
                handler(&state, conn, packet);
            }
        }
    }

    RegistryBuilder::new()
        .on(0x00, |_, _| {})
        .on(0x02, with_state(Arc::downgrade(state), handle_handshake))
        .on(0x03, with_state(Arc::downgrade(state), handle_chat))
        .on(0x0A, |_, _| {})
        .on(0x0D, |_, _| {})
        .on(0x0E, with_state(Arc::downgrade(state), handle_digging))
        .on(0x0F, with_state(Arc::downgrade(state), handle_place_block))
        .on(0xFF, with_state(Arc::downgrade(state), handle_disconnect))

}

fn handle_handshake(state: &ServerState, conn: &ConnectionHandle, packet: &Packet) {

    let Packet::Handshake(handshake) = packet else { return };

    if conn.stage() != Stage::Handshaking {
        warn!("connection #{}: unexpected handshake", conn.id());
        return;
    }

    if handshake.protocol_version != proto::PROTOCOL_VERSION {
        let reason = if handshake.protocol_version < proto::PROTOCOL_VERSION {
            "Outdated client!"
        } else {
            "Outdated server!"
        };
        let _ = conn.kick(reason);
        return;
    }

    if handshake.username.is_empty() {
        let _ = conn.kick("Invalid username!");
        return;
    }

    conn.set_username(ArcStr::from(handshake.username.as_str()));
    conn.set_stage(Stage::LoginOrStatus);
    conn.set_entity_id(conn.id() as i32);

    let world = &state.world;
    let spawn = world.spawn_point();

    let packets = [
        Packet::Login(LoginPacket {
            entity_id: conn.entity_id(),
            level_type: world.level_type().to_string(),
            game_mode: 1,
            dimension: 0,
            difficulty: 1,
            max_players: MAX_PLAYERS,
        }),
        Packet::SpawnPosition(SpawnPositionPacket { pos: spawn }),
        Packet::PositionLook(PositionLookPacket {
            pos: spawn.as_dvec3() + DVec3::new(0.5, 0.0, 0.5),
            stance: spawn.y as f64 + 1.62,
            look: Vec2::ZERO,
            on_ground: false,
        }),
        Packet::UpdateHealth(UpdateHealthPacket { health: 20, food: 20, saturation: 5.0 }),
    ];

    for packet in packets {
        let _ = conn.send(packet);
    }

    conn.set_stage(Stage::Play);
    state.clients.write().expect("poisoned").insert(conn.id(), conn.clone());
    info!("{} joined with connection #{} ({}:{})", handshake.username, conn.id(), handshake.host, handshake.port);
    state.broadcast_chat(&format!("{} joined the game", handshake.username));

}

fn handle_chat(state: &ServerState, conn: &ConnectionHandle, packet: &Packet) {
    let Packet::Chat(chat) = packet else { return };
    if conn.stage() == Stage::Play {
        state.broadcast_chat(&format!("<{}> {}", conn.username(), chat.message));
    }
}

fn handle_digging(state: &ServerState, conn: &ConnectionHandle, packet: &Packet) {

    let Packet::Digging(digging) = packet else { return };
    if conn.stage() != Stage::Play {
        return;
    }

    // Players are in creative mode, blocks break as soon as digging starts.
    if let DigStatus::Started | DigStatus::Finished = digging.status {
        let pos = IVec3::new(digging.x, digging.y as i32, digging.z);
        if let Err(e) = state.world.set_block(pos, Block::AIR) {
            warn!("connection #{}: failed to break block at {pos}: {e}", conn.id());
        }
    }

}

fn handle_place_block(state: &ServerState, conn: &ConnectionHandle, packet: &Packet) {

    let Packet::PlaceBlock(place) = packet else { return };
    if conn.stage() != Stage::Play {
        return;
    }

    let Some(face) = u8::try_from(place.direction).ok().and_then(Face::from_id) else {
        return;
    };

    let Some(stack) = place.stack.filter(|stack| stack.id > 0 && stack.id < 256) else {
        return;
    };

    let target = IVec3::new(place.x, place.y as i32, place.z) + face.delta();
    if !chunk::is_valid_y(target.y) {
        return;
    }

    let res = state.world.safe_get_block(target).and_then(|current| {
        if current.is_air() {
            let block = Block::new(stack.id as u8, stack.damage as u8 & 0x0F);
            state.world.set_block(target, block).map(|_| ())
        } else {
            // Resynchronize the client that predicted the placement.
            let _ = conn.send(block_change_packet(target, current));
            Ok(())
        }
    });

    if let Err(e) = res {
        warn!("connection #{}: failed to place block at {target}: {e}", conn.id());
    }

}

fn handle_disconnect(state: &ServerState, conn: &ConnectionHandle, packet: &Packet) {
    let Packet::Disconnect(disconnect) = packet else { return };
    if state.remove_client(conn.id()).is_some() {
        info!("{} left: {}", conn.username(), disconnect.reason);
        state.broadcast_chat(&format!("{} left the game", conn.username()));
    }
}


/// Translate world events to packets broadcast to clients.
fn bridge_world_event(state: &ServerState, event: &Event) {
    match *event {
        Event::Block { pos, inner: BlockEvent::Set { block, .. } } => {
            state.broadcast(&block_change_packet(pos, block));
        }
        Event::Entity { id, inner: EntityEvent::Spawn { .. } } => {
            state.broadcast(&Packet::Entity(EntityPacket { entity_id: id }));
        }
        Event::Entity { id, inner: EntityEvent::Remove } => {
            state.broadcast(&Packet::DestroyEntity(DestroyEntityPacket { entity_ids: vec![id] }));
        }
    }
}

fn block_change_packet(pos: IVec3, block: Block) -> Packet {
    Packet::BlockChange(BlockChangePacket {
        x: pos.x,
        y: pos.y as u8,
        z: pos.z,
        block: block.id as i16,
        metadata: block.metadata,
    })
}
