//! Default packet handlers of a client connection.

use tracing::{info, warn};

use crate::connection::{ConnectionHandle, Stage};
use crate::dispatch::RegistryBuilder;
use crate::proto::{Packet, KeepAlivePacket};


/// A registry builder with the handlers every client needs, more handlers can be 
/// registered on top of them.
pub fn client_registry() -> RegistryBuilder {
    RegistryBuilder::new()
        .on(0x00, handle_keep_alive)
        .on(0x01, handle_login)
        .on(0x03, handle_chat)
        .on(0x08, handle_update_health)
        .on(0x0D, handle_position_look)
        .on(0xFF, handle_disconnect)
}

fn send_or_warn(conn: &ConnectionHandle, packet: Packet) {
    if let Err(e) = conn.send(packet) {
        warn!("connection #{}: failed to answer: {e}", conn.id());
    }
}

fn handle_keep_alive(conn: &ConnectionHandle, packet: &Packet) {
    if let Packet::KeepAlive(KeepAlivePacket { id }) = *packet {
        send_or_warn(conn, Packet::KeepAlive(KeepAlivePacket { id }));
    }
}

fn handle_login(conn: &ConnectionHandle, packet: &Packet) {
    if let Packet::Login(login) = packet {
        info!("logged in as entity #{} in a {} world", login.entity_id, login.level_type);
        conn.set_entity_id(login.entity_id);
        conn.set_stage(Stage::Play);
    }
}

fn handle_chat(_conn: &ConnectionHandle, packet: &Packet) {
    if let Packet::Chat(chat) = packet {
        info!("chat: {}", chat.message);
    }
}

fn handle_update_health(conn: &ConnectionHandle, packet: &Packet) {
    if let Packet::UpdateHealth(health) = packet {
        conn.set_health(health.health);
    }
}

/// The server positions the player, the same packet must be echoed to confirm.
fn handle_position_look(conn: &ConnectionHandle, packet: &Packet) {
    if let Packet::PositionLook(position_look) = packet {
        conn.set_spawned(true);
        send_or_warn(conn, Packet::PositionLook(position_look.clone()));
    }
}

fn handle_disconnect(_conn: &ConnectionHandle, packet: &Packet) {
    if let Packet::Disconnect(disconnect) = packet {
        info!("disconnected by server: {}", disconnect.reason);
    }
}


#[cfg(test)]
mod tests {

    use glam::{DVec3, Vec2};

    use crate::proto::{LoginPacket, PositionLookPacket, UpdateHealthPacket};
    use super::*;

    #[test]
    fn default_handlers() {

        let registry = client_registry().build();
        let conn = ConnectionHandle::detached("Alice");

        registry.handle(&conn, &Packet::KeepAlive(KeepAlivePacket { id: 42 }));
        assert_eq!(conn.queued(), 1);

        registry.handle(&conn, &Packet::Login(LoginPacket {
            entity_id: 12,
            level_type: "flat".to_string(),
            game_mode: 1,
            dimension: 0,
            difficulty: 1,
            max_players: 8,
        }));
        assert_eq!(conn.stage(), Stage::Play);
        assert_eq!(conn.entity_id(), 12);

        assert!(!conn.is_spawned());
        registry.handle(&conn, &Packet::PositionLook(PositionLookPacket {
            pos: DVec3::new(0.5, 4.0, 0.5),
            stance: 5.62,
            look: Vec2::ZERO,
            on_ground: true,
        }));
        assert!(conn.is_spawned());
        assert_eq!(conn.queued(), 2);

        registry.handle(&conn, &Packet::UpdateHealth(UpdateHealthPacket { health: 0, food: 20, saturation: 5.0 }));
        assert_eq!(conn.health(), 0);
        conn.respawn().unwrap();

    }

}
