//! Entities living in a world, each ticked once per entity tick with a physics update.

use std::fmt;

use glam::{DVec3, IVec3};

use crate::world::{World, WorldError};
use crate::block::Block;
use crate::chunk;


/// Result of a physics update, telling the world whether to keep the entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityStatus {
    Alive,
    Dead,
}

/// Physics capability of an entity, the world calls [`Self::physics_update`] once per 
/// entity tick, in spawn order. Updates are called without any world lock held, so 
/// entities may freely read and write blocks.
pub trait Entity: Send + fmt::Debug {

    /// Current position of the entity.
    fn pos(&self) -> DVec3;

    /// Advance the entity's physics by one tick.
    fn physics_update(&mut self, world: &World) -> Result<EntityStatus, WorldError>;

}


/// A block entity falling under gravity, placed back as a block where it lands.
#[derive(Debug, Clone)]
pub struct FallingBody {
    pos: DVec3,
    vel: DVec3,
    block: Block,
}

impl FallingBody {

    /// Gravity acceleration, in blocks per tick squared.
    const GRAVITY: f64 = 0.04;
    /// Velocity damping applied each tick.
    const DRAG: f64 = 0.98;

    pub fn new(pos: DVec3, block: Block) -> Self {
        Self { pos, vel: DVec3::ZERO, block }
    }

    #[inline]
    pub fn block(&self) -> Block {
        self.block
    }

}

impl Entity for FallingBody {

    fn pos(&self) -> DVec3 {
        self.pos
    }

    fn physics_update(&mut self, world: &World) -> Result<EntityStatus, WorldError> {

        self.vel.y = (self.vel.y - Self::GRAVITY) * Self::DRAG;
        let next = self.pos + self.vel;

        if next.y < 0.0 {
            return Ok(EntityStatus::Dead);
        }

        let below = next.floor().as_ivec3();
        if world.safe_get_block(below)?.is_air() {
            self.pos = next;
            return Ok(EntityStatus::Alive);
        }

        // Landed, rest on top of the obstacle.
        let rest = IVec3::new(below.x, below.y + 1, below.z);
        if chunk::is_valid_y(rest.y) && world.safe_get_block(rest)?.is_air() {
            world.set_block(rest, self.block)?;
        }

        Ok(EntityStatus::Dead)

    }

}
