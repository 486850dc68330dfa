//! Wire protocol definition, every packet is an id byte followed by its fields in a 
//! fixed order, there is no length prefix.

use std::io::{self, Read, Write};

use glam::{DVec3, IVec3, Vec2};

use blockwire::io::{ReadWireExt, WriteWireExt};
use blockwire::face::Face;


/// Protocol version sent in the handshake and checked by servers.
pub const PROTOCOL_VERSION: u8 = 39;

/// Maximum length of a username.
pub const USERNAME_MAX_LEN: usize = 16;
/// Maximum length of a host name in the handshake.
pub const HOST_MAX_LEN: usize = 255;
/// Maximum length of a chat message.
pub const CHAT_MAX_LEN: usize = 119;
/// Maximum length of a disconnect reason.
pub const REASON_MAX_LEN: usize = 256;
/// Maximum length of a level type.
pub const LEVEL_TYPE_MAX_LEN: usize = 16;


/// Any packet of the protocol, in both directions.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// Keep alive challenge, answered with the same id.
    KeepAlive(KeepAlivePacket),
    /// Sent by the server to accept a player and give its entity.
    Login(LoginPacket),
    /// First packet sent by the client.
    Handshake(HandshakePacket),
    /// A chat message, in both directions.
    Chat(ChatPacket),
    /// World age and time of day.
    TimeUpdate(TimeUpdatePacket),
    /// The world spawn position.
    SpawnPosition(SpawnPositionPacket),
    /// Health and food of the client's player.
    UpdateHealth(UpdateHealthPacket),
    /// The player is neither moving nor rotating, used as heartbeat.
    Player(PlayerPacket),
    /// Position and look of the player, in both directions.
    PositionLook(PositionLookPacket),
    /// The player digs a block.
    Digging(DiggingPacket),
    /// The player places a block against a face.
    PlaceBlock(PlaceBlockPacket),
    /// A list of entities to destroy on the client.
    DestroyEntity(DestroyEntityPacket),
    /// An entity now exists on the client.
    Entity(EntityPacket),
    /// A single block changed.
    BlockChange(BlockChangePacket),
    /// Client status change, like respawning.
    ClientStatus(ClientStatusPacket),
    /// Terminate the connection with a reason.
    Disconnect(DisconnectPacket),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepAlivePacket {
    pub id: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginPacket {
    pub entity_id: i32,
    pub level_type: String,
    pub game_mode: u8,
    pub dimension: i8,
    pub difficulty: u8,
    pub max_players: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakePacket {
    pub protocol_version: u8,
    pub username: String,
    pub host: String,
    pub port: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatPacket {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeUpdatePacket {
    pub age: i64,
    pub time: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnPositionPacket {
    pub pos: IVec3,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateHealthPacket {
    pub health: i16,
    pub food: i16,
    pub saturation: f32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerPacket {
    pub on_ground: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PositionLookPacket {
    pub pos: DVec3,
    pub stance: f64,
    pub look: Vec2,
    pub on_ground: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiggingPacket {
    pub status: DigStatus,
    pub x: i32,
    pub y: u8,
    pub z: i32,
    pub face: Face,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigStatus {
    Started,
    Cancelled,
    Finished,
    DropItem,
    Shoot,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceBlockPacket {
    pub x: i32,
    pub y: u8,
    pub z: i32,
    /// Face id clicked, `-1` when using the item without a target block.
    pub direction: i8,
    pub stack: Option<ItemStack>,
}

/// A stack of items as sent on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemStack {
    pub id: i16,
    pub size: u8,
    pub damage: i16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestroyEntityPacket {
    pub entity_ids: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityPacket {
    pub entity_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockChangePacket {
    pub x: i32,
    pub y: u8,
    pub z: i32,
    pub block: i16,
    pub metadata: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientStatusPacket {
    pub status: ClientStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    InitialSpawn,
    Respawn,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectPacket {
    pub reason: String,
}


impl Packet {

    /// The id byte of this packet.
    pub fn id(&self) -> u8 {
        match self {
            Packet::KeepAlive(_) => 0x00,
            Packet::Login(_) => 0x01,
            Packet::Handshake(_) => 0x02,
            Packet::Chat(_) => 0x03,
            Packet::TimeUpdate(_) => 0x04,
            Packet::SpawnPosition(_) => 0x06,
            Packet::UpdateHealth(_) => 0x08,
            Packet::Player(_) => 0x0A,
            Packet::PositionLook(_) => 0x0D,
            Packet::Digging(_) => 0x0E,
            Packet::PlaceBlock(_) => 0x0F,
            Packet::DestroyEntity(_) => 0x1D,
            Packet::Entity(_) => 0x1E,
            Packet::BlockChange(_) => 0x35,
            Packet::ClientStatus(_) => 0xCD,
            Packet::Disconnect(_) => 0xFF,
        }
    }

    /// Shortcut for a chat packet.
    pub fn chat(message: impl Into<String>) -> Self {
        Packet::Chat(ChatPacket { message: message.into() })
    }

    /// Shortcut for a disconnect packet.
    pub fn disconnect(reason: impl Into<String>) -> Self {
        Packet::Disconnect(DisconnectPacket { reason: reason.into() })
    }

    /// Decode a single packet, its id first.
    pub fn decode(read: &mut impl Read) -> Result<Self, ProtocolError> {
        let id = read.read_ubyte()?;
        Self::decode_body(id, read).map_err(io_to_protocol)?
            .ok_or(ProtocolError::UnknownPacket(id))
    }

    /// Decode the fields of the packet with the given id, or none if unknown.
    fn decode_body(id: u8, read: &mut impl Read) -> io::Result<Option<Self>> {
        Ok(Some(match id {
            0x00 => Packet::KeepAlive(KeepAlivePacket {
                id: read.read_int()?,
            }),
            0x01 => {
                let entity_id = read.read_int()?;
                let level_type = read.read_string16(LEVEL_TYPE_MAX_LEN)?;
                let game_mode = read.read_ubyte()?;
                let dimension = read.read_byte()?;
                let difficulty = read.read_ubyte()?;
                // Unused, was the world height.
                let _height = read.read_ubyte()?;
                Packet::Login(LoginPacket {
                    entity_id,
                    level_type,
                    game_mode,
                    dimension,
                    difficulty,
                    max_players: read.read_ubyte()?,
                })
            }
            0x02 => Packet::Handshake(HandshakePacket {
                protocol_version: read.read_ubyte()?,
                username: read.read_string16(USERNAME_MAX_LEN)?,
                host: read.read_string16(HOST_MAX_LEN)?,
                port: read.read_int()?,
            }),
            0x03 => Packet::Chat(ChatPacket {
                message: read.read_string16(CHAT_MAX_LEN)?,
            }),
            0x04 => Packet::TimeUpdate(TimeUpdatePacket {
                age: read.read_long()?,
                time: read.read_long()?,
            }),
            0x06 => Packet::SpawnPosition(SpawnPositionPacket {
                pos: IVec3::new(read.read_int()?, read.read_int()?, read.read_int()?),
            }),
            0x08 => Packet::UpdateHealth(UpdateHealthPacket {
                health: read.read_short()?,
                food: read.read_short()?,
                saturation: read.read_float()?,
            }),
            0x0A => Packet::Player(PlayerPacket {
                on_ground: read.read_bool()?,
            }),
            0x0D => {
                let x = read.read_double()?;
                let y = read.read_double()?;
                let stance = read.read_double()?;
                let z = read.read_double()?;
                let yaw = read.read_float()?;
                let pitch = read.read_float()?;
                Packet::PositionLook(PositionLookPacket {
                    pos: DVec3::new(x, y, z),
                    stance,
                    look: Vec2::new(yaw, pitch),
                    on_ground: read.read_bool()?,
                })
            }
            0x0E => Packet::Digging(DiggingPacket {
                status: match read.read_ubyte()? {
                    0 => DigStatus::Started,
                    1 => DigStatus::Cancelled,
                    2 => DigStatus::Finished,
                    4 => DigStatus::DropItem,
                    5 => DigStatus::Shoot,
                    status => return Err(new_invalid_packet_err(format_args!("invalid digging status: {status}"))),
                },
                x: read.read_int()?,
                y: read.read_ubyte()?,
                z: read.read_int()?,
                face: {
                    let face = read.read_ubyte()?;
                    Face::from_id(face)
                        .ok_or_else(|| new_invalid_packet_err(format_args!("invalid face: {face}")))?
                },
            }),
            0x0F => Packet::PlaceBlock(PlaceBlockPacket {
                x: read.read_int()?,
                y: read.read_ubyte()?,
                z: read.read_int()?,
                direction: read.read_byte()?,
                stack: read_item_stack(read)?,
            }),
            0x1D => {
                let count = read.read_ubyte()?;
                let entity_ids = (0..count)
                    .map(|_| read.read_int().map(|id| id as u32))
                    .collect::<io::Result<Vec<_>>>()?;
                Packet::DestroyEntity(DestroyEntityPacket { entity_ids })
            }
            0x1E => Packet::Entity(EntityPacket {
                entity_id: read.read_int()? as u32,
            }),
            0x35 => Packet::BlockChange(BlockChangePacket {
                x: read.read_int()?,
                y: read.read_ubyte()?,
                z: read.read_int()?,
                block: read.read_short()?,
                metadata: read.read_ubyte()?,
            }),
            0xCD => Packet::ClientStatus(ClientStatusPacket {
                status: match read.read_ubyte()? {
                    0 => ClientStatus::InitialSpawn,
                    1 => ClientStatus::Respawn,
                    status => return Err(new_invalid_packet_err(format_args!("invalid client status: {status}"))),
                },
            }),
            0xFF => Packet::Disconnect(DisconnectPacket {
                reason: read.read_string16(REASON_MAX_LEN)?,
            }),
            _ => return Ok(None),
        }))
    }

    /// Encode this packet, its id first then its fields in the same order as decoded.
    pub fn encode(&self, write: &mut impl Write) -> io::Result<()> {

        write.write_ubyte(self.id())?;

        match self {
            Packet::KeepAlive(packet) => {
                write.write_int(packet.id)?;
            }
            Packet::Login(packet) => {
                write.write_int(packet.entity_id)?;
                write.write_string16(&packet.level_type, LEVEL_TYPE_MAX_LEN)?;
                write.write_ubyte(packet.game_mode)?;
                write.write_byte(packet.dimension)?;
                write.write_ubyte(packet.difficulty)?;
                write.write_ubyte(0)?;
                write.write_ubyte(packet.max_players)?;
            }
            Packet::Handshake(packet) => {
                write.write_ubyte(packet.protocol_version)?;
                write.write_string16(&packet.username, USERNAME_MAX_LEN)?;
                write.write_string16(&packet.host, HOST_MAX_LEN)?;
                write.write_int(packet.port)?;
            }
            Packet::Chat(packet) => {
                write.write_string16(&packet.message, CHAT_MAX_LEN)?;
            }
            Packet::TimeUpdate(packet) => {
                write.write_long(packet.age)?;
                write.write_long(packet.time)?;
            }
            Packet::SpawnPosition(packet) => {
                write.write_int(packet.pos.x)?;
                write.write_int(packet.pos.y)?;
                write.write_int(packet.pos.z)?;
            }
            Packet::UpdateHealth(packet) => {
                write.write_short(packet.health)?;
                write.write_short(packet.food)?;
                write.write_float(packet.saturation)?;
            }
            Packet::Player(packet) => {
                write.write_bool(packet.on_ground)?;
            }
            Packet::PositionLook(packet) => {
                write.write_double(packet.pos.x)?;
                write.write_double(packet.pos.y)?;
                write.write_double(packet.stance)?;
                write.write_double(packet.pos.z)?;
                write.write_float(packet.look.x)?;
                write.write_float(packet.look.y)?;
                write.write_bool(packet.on_ground)?;
            }
            Packet::Digging(packet) => {
                write.write_ubyte(match packet.status {
                    DigStatus::Started => 0,
                    DigStatus::Cancelled => 1,
                    DigStatus::Finished => 2,
                    DigStatus::DropItem => 4,
                    DigStatus::Shoot => 5,
                })?;
                write.write_int(packet.x)?;
                write.write_ubyte(packet.y)?;
                write.write_int(packet.z)?;
                write.write_ubyte(packet.face.id())?;
            }
            Packet::PlaceBlock(packet) => {
                write.write_int(packet.x)?;
                write.write_ubyte(packet.y)?;
                write.write_int(packet.z)?;
                write.write_byte(packet.direction)?;
                write_item_stack(write, packet.stack)?;
            }
            Packet::DestroyEntity(packet) => {
                let count = u8::try_from(packet.entity_ids.len())
                    .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "too much entities to destroy"))?;
                write.write_ubyte(count)?;
                for &id in &packet.entity_ids {
                    write.write_int(id as i32)?;
                }
            }
            Packet::Entity(packet) => {
                write.write_int(packet.entity_id as i32)?;
            }
            Packet::BlockChange(packet) => {
                write.write_int(packet.x)?;
                write.write_ubyte(packet.y)?;
                write.write_int(packet.z)?;
                write.write_short(packet.block)?;
                write.write_ubyte(packet.metadata)?;
            }
            Packet::ClientStatus(packet) => {
                write.write_ubyte(match packet.status {
                    ClientStatus::InitialSpawn => 0,
                    ClientStatus::Respawn => 1,
                })?;
            }
            Packet::Disconnect(packet) => {
                write.write_string16(&packet.reason, REASON_MAX_LEN)?;
            }
        }

        Ok(())

    }

}


/// Error while decoding a packet.
#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    #[error("unknown packet id: {0:#04X}")]
    UnknownPacket(u8),
    #[error("invalid packet data: {0}")]
    InvalidData(String),
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

impl ProtocolError {

    /// Return true if the input ended in the middle of a frame, decoding can be 
    /// retried once more bytes are received.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, ProtocolError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof)
    }

}

/// Invalid data io errors are raised by field decoders, they are a content error and
/// not a stream error.
fn io_to_protocol(e: io::Error) -> ProtocolError {
    if e.kind() == io::ErrorKind::InvalidData {
        ProtocolError::InvalidData(e.to_string())
    } else {
        ProtocolError::Io(e)
    }
}

/// Return an invalid data io error with specific message.
fn new_invalid_packet_err(format: std::fmt::Arguments) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("invalid packet: {format}"))
}

fn read_item_stack(read: &mut impl Read) -> io::Result<Option<ItemStack>> {
    let id = read.read_short()?;
    Ok(if id >= 0 {
        Some(ItemStack {
            id,
            size: read.read_ubyte()?,
            damage: read.read_short()?,
        })
    } else {
        None
    })
}

fn write_item_stack(write: &mut impl Write, stack: Option<ItemStack>) -> io::Result<()> {
    if let Some(stack) = stack {
        write.write_short(stack.id)?;
        write.write_ubyte(stack.size)?;
        write.write_short(stack.damage)
    } else {
        write.write_short(-1)
    }
}
