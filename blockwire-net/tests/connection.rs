use std::sync::Arc;
use std::time::{Duration, Instant};
use std::io::{self, Write};
use std::thread;

use glam::{DVec3, Vec2};

use blockwire_net::client::client_registry;
use blockwire_net::config::ConnectionConfig;
use blockwire_net::connection::{Connection, ConnectionError, ConnectionEvent, Stage};
use blockwire_net::proto::{self, Packet, KeepAlivePacket, PositionLookPacket, PlayerPacket};
use blockwire_net::transport::{MemoryTransport, Transport};


fn test_config(strict: bool) -> ConnectionConfig {
    ConnectionConfig {
        heartbeat_interval: Duration::from_millis(50),
        strict,
        ..ConnectionConfig::default()
    }
}

/// Create a client connection connected to the returned peer transport.
fn connected(strict: bool) -> (Connection, MemoryTransport) {
    let (local, peer) = MemoryTransport::pair();
    let mut conn = Connection::new("Alice", Arc::new(client_registry().build()), test_config(strict));
    conn.connect_transport(local, "example.org", 25565).unwrap();
    (conn, peer)
}

fn write_packet(peer: &mut MemoryTransport, packet: &Packet) {
    packet.encode(peer).unwrap();
    peer.flush().unwrap();
}

/// Assert that the peer has received nothing more before the end of the stream.
fn assert_ended(peer: &mut MemoryTransport) {
    let mut rest = Vec::new();
    let err = peer.recv(&mut rest, Duration::from_secs(5)).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    assert!(rest.is_empty());
}

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < Duration::from_secs(5) {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    false
}

#[test]
fn handshake_first() {

    let (local, mut peer) = MemoryTransport::pair();
    let mut conn = Connection::new("Alice", Arc::new(client_registry().build()), test_config(false));

    // Queued before connecting, discarded so that the handshake comes first.
    conn.handle().send_chat("too early").unwrap();
    conn.connect_transport(local, "example.org", 25565).unwrap();
    conn.handle().send_chat("hello").unwrap();

    match Packet::decode(&mut peer).unwrap() {
        Packet::Handshake(handshake) => {
            assert_eq!(handshake.protocol_version, proto::PROTOCOL_VERSION);
            assert_eq!(handshake.username, "Alice");
            assert_eq!(handshake.host, "example.org");
            assert_eq!(handshake.port, 25565);
        }
        packet => panic!("unexpected first packet: {packet:?}"),
    }

    assert_eq!(Packet::decode(&mut peer).unwrap(), Packet::chat("hello"));
    assert_eq!(conn.handle().stage(), Stage::Handshaking);

}

#[test]
fn already_connected() {
    let (mut conn, _peer) = connected(false);
    let (other, _other_peer) = MemoryTransport::pair();
    assert!(matches!(conn.connect_transport(other, "h", 1), Err(ConnectionError::AlreadyConnected)));
    assert!(conn.is_connected());
}

#[test]
fn fifo_order() {

    let (conn, mut peer) = connected(false);
    let (_, sent) = conn.handle().events().subscribe_channel();

    for message in ["A", "B", "C"] {
        conn.handle().send_chat(message).unwrap();
    }

    assert!(matches!(Packet::decode(&mut peer).unwrap(), Packet::Handshake(_)));
    for message in ["A", "B", "C"] {
        assert_eq!(Packet::decode(&mut peer).unwrap(), Packet::chat(message));
    }

    let sent = sent.iter()
        .filter_map(|event| match event {
            ConnectionEvent::PacketSent(Packet::Chat(chat)) => Some(chat.message),
            _ => None,
        })
        .take(3)
        .collect::<Vec<_>>();
    assert_eq!(sent, ["A", "B", "C"]);

}

#[test]
fn unknown_frame_not_fatal() {

    let (conn, mut peer) = connected(false);
    let (_, events) = conn.handle().events().subscribe_channel();
    assert!(matches!(Packet::decode(&mut peer).unwrap(), Packet::Handshake(_)));

    peer.write_all(&[0x7F]).unwrap();
    write_packet(&mut peer, &Packet::KeepAlive(KeepAlivePacket { id: 99 }));

    // The keep alive is still answered after the unknown frame.
    assert_eq!(Packet::decode(&mut peer).unwrap(), Packet::KeepAlive(KeepAlivePacket { id: 99 }));
    assert!(conn.is_connected());

    let failed = events.try_iter().any(|event| matches!(event, ConnectionEvent::DecodeFailed { .. }));
    assert!(failed);

}

#[test]
fn strict_mode_terminates() {

    let (conn, mut peer) = connected(true);
    assert!(matches!(Packet::decode(&mut peer).unwrap(), Packet::Handshake(_)));

    peer.write_all(&[0x7F]).unwrap();
    peer.flush().unwrap();

    assert!(wait_until(|| !conn.is_connected()));
    assert_eq!(conn.handle().stage(), Stage::Closed);

}

#[test]
fn disconnect_stops_loop() {

    let (mut conn, mut peer) = connected(false);
    assert!(matches!(Packet::decode(&mut peer).unwrap(), Packet::Handshake(_)));

    conn.disconnect("Bye!").unwrap();
    assert!(!conn.is_connected());
    assert_eq!(conn.handle().stage(), Stage::Closed);

    // Nothing is sent after the disconnect frame, and the transport is closed.
    assert!(matches!(conn.handle().send_chat("late"), Err(ConnectionError::NotConnected)));
    assert_eq!(Packet::decode(&mut peer).unwrap(), Packet::disconnect("Bye!"));
    assert_ended(&mut peer);

    assert!(matches!(conn.disconnect("again"), Err(ConnectionError::NotConnected)));

}

#[test]
fn kick_stops_sending() {

    let (conn, mut peer) = connected(false);
    assert!(matches!(Packet::decode(&mut peer).unwrap(), Packet::Handshake(_)));

    conn.handle().kick("Bye!").unwrap();
    // Either queued behind the disconnect packet or refused once closed.
    let _ = conn.handle().send_chat("after");

    assert_eq!(Packet::decode(&mut peer).unwrap(), Packet::disconnect("Bye!"));
    assert!(wait_until(|| conn.handle().stage() == Stage::Closed));
    assert!(!conn.is_connected());
    assert_ended(&mut peer);

}

#[test]
fn disconnect_with_stalled_peer() {

    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let mut conn = Connection::new("Alice", Arc::new(client_registry().build()), test_config(false));
    conn.connect(&listener.local_addr().unwrap().to_string()).unwrap();
    // Accepted but never read, socket buffers fill up.
    let (_stream, _) = listener.accept().unwrap();

    let message = "x".repeat(proto::CHAT_MAX_LEN);
    for _ in 0..200_000 {
        conn.handle().send_chat(&message).unwrap();
    }
    assert!(wait_until(|| conn.handle().queued() < 200_000));
    thread::sleep(Duration::from_millis(100));

    let (tx, rx) = crossbeam_channel::bounded(1);
    thread::spawn(move || {
        let res = conn.disconnect("Bye!");
        let _ = tx.send((res.is_ok(), conn.handle().stage()));
    });

    let (ok, stage) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(ok);
    assert_eq!(stage, Stage::Closed);

}

#[test]
fn peer_disconnect_closes() {

    let (conn, mut peer) = connected(false);
    let (_, events) = conn.handle().events().subscribe_channel();
    assert!(matches!(Packet::decode(&mut peer).unwrap(), Packet::Handshake(_)));

    write_packet(&mut peer, &Packet::disconnect("Server closed"));
    assert!(wait_until(|| conn.handle().stage() == Stage::Closed));
    assert!(events.iter().any(|event| matches!(event, ConnectionEvent::Closed)));

}

#[test]
fn heartbeat_once_spawned() {

    let (conn, mut peer) = connected(false);
    assert!(matches!(Packet::decode(&mut peer).unwrap(), Packet::Handshake(_)));

    let position_look = Packet::PositionLook(PositionLookPacket {
        pos: DVec3::new(0.5, 4.0, 0.5),
        stance: 5.62,
        look: Vec2::new(90.0, 0.0),
        on_ground: false,
    });
    write_packet(&mut peer, &position_look);

    // Echoed first, then heartbeats.
    assert_eq!(Packet::decode(&mut peer).unwrap(), position_look);
    assert!(conn.handle().is_spawned());
    assert_eq!(Packet::decode(&mut peer).unwrap(), Packet::Player(PlayerPacket { on_ground: true }));
    assert_eq!(Packet::decode(&mut peer).unwrap(), Packet::Player(PlayerPacket { on_ground: true }));

}
