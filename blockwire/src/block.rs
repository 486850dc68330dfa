//! Block values, the few block identifiers used by the engine, and the behaviors blocks
//! can have when their neighborhood changes or when a scheduled tick fires.

use std::time::{Duration, Instant};
use std::sync::Arc;
use std::fmt;

use glam::IVec3;

use crate::world::{World, WorldError};


/// Internal macro to easily define the block names registry.
macro_rules! blocks {
    (
        $($ident:ident / $id:literal : $name:literal),* $(,)?
    ) => {

        static NAMES: [&'static str; 256] = {
            let mut arr = [""; 256];
            $(arr[$id as usize] = $name;)*
            arr
        };

        $(pub const $ident: u8 = $id;)*

    };
}

blocks! {
    AIR/0:              "air",
    STONE/1:            "stone",
    GRASS/2:            "grass",
    DIRT/3:             "dirt",
    COBBLESTONE/4:      "cobblestone",
    WOOD/5:             "wood",
    SAPLING/6:          "sapling",
    BEDROCK/7:          "bedrock",
    WATER_MOVING/8:     "water_moving",
    WATER_STILL/9:      "water_still",
    LAVA_MOVING/10:     "lava_moving",
    LAVA_STILL/11:      "lava_still",
    SAND/12:            "sand",
    GRAVEL/13:          "gravel",
    GLASS/20:           "glass",
    TALL_GRASS/31:      "tall_grass",
    DEAD_BUSH/32:       "dead_bush",
    DANDELION/37:       "dandelion",
    POPPY/38:           "poppy",
    FARMLAND/60:        "farmland",
    IRON_DOOR/71:       "iron_door",
}

/// Get the name of a block given its id, unknown blocks have an empty name.
#[inline]
pub fn name(id: u8) -> &'static str {
    NAMES[id as usize]
}


/// A block value, its numeric type and its 4-bit metadata.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Block {
    pub id: u8,
    pub metadata: u8,
}

impl Block {

    /// The canonical air block.
    pub const AIR: Self = Self { id: AIR, metadata: 0 };

    #[inline]
    pub const fn new(id: u8, metadata: u8) -> Self {
        Self { id, metadata }
    }

    /// A block of the given type with zero metadata.
    #[inline]
    pub const fn of(id: u8) -> Self {
        Self { id, metadata: 0 }
    }

    #[inline]
    pub fn is_air(self) -> bool {
        self.id == AIR
    }

}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Block({}/{}:{})", self.id, name(self.id), self.metadata)
    }
}


/// Reaction logic of a block type. Both methods are called without any world lock 
/// held, so they are free to read and write the world.
pub trait BlockBehavior: Send + Sync {

    /// The block at `pos` or one of its direct neighbors changed, `origin` is the 
    /// position that was written (equal to `pos` for the written block itself).
    fn neighbor_changed(&self, world: &World, pos: IVec3, origin: IVec3) -> Result<(), WorldError> {
        let _ = (world, pos, origin);
        Ok(())
    }

    /// A tick previously scheduled at `pos` is due.
    fn scheduled_tick(&self, world: &World, pos: IVec3) -> Result<(), WorldError> {
        let _ = (world, pos);
        Ok(())
    }

}

/// Table of behaviors indexed by block id, blocks without behavior don't react.
#[derive(Clone)]
pub struct BlockBehaviors {
    inner: Box<[Option<Arc<dyn BlockBehavior>>]>,
}

impl BlockBehaviors {

    /// An empty table, no block reacts to anything.
    pub fn new() -> Self {
        Self { inner: vec![None; 256].into_boxed_slice() }
    }

    /// The default table, with plants needing support and flowing fluids.
    pub fn with_defaults() -> Self {

        let mut behaviors = Self::new();

        let soil = Arc::new(PlantBehavior { support: &[GRASS, DIRT, FARMLAND] });
        for id in [SAPLING, TALL_GRASS, DANDELION, POPPY] {
            behaviors.register(id, Arc::clone(&soil) as Arc<dyn BlockBehavior>);
        }
        behaviors.register(DEAD_BUSH, Arc::new(PlantBehavior { support: &[SAND] }));

        behaviors.register(WATER_MOVING, Arc::new(FlowingFluidBehavior { 
            flowing: WATER_MOVING,
            still: WATER_STILL, 
            delay: Duration::from_millis(250),
        }));
        behaviors.register(LAVA_MOVING, Arc::new(FlowingFluidBehavior { 
            flowing: LAVA_MOVING,
            still: LAVA_STILL, 
            delay: Duration::from_millis(1500),
        }));

        behaviors

    }

    /// Register the behavior of a block type, replacing any previous one.
    pub fn register(&mut self, id: u8, behavior: Arc<dyn BlockBehavior>) {
        self.inner[id as usize] = Some(behavior);
    }

    /// Get the behavior of a block type.
    #[inline]
    pub fn get(&self, id: u8) -> Option<&Arc<dyn BlockBehavior>> {
        self.inner[id as usize].as_ref()
    }

}

impl Default for BlockBehaviors {
    fn default() -> Self {
        Self::with_defaults()
    }
}


/// A plant is removed as soon as the block below it is not one of its support blocks.
pub struct PlantBehavior {
    pub support: &'static [u8],
}

impl BlockBehavior for PlantBehavior {

    fn neighbor_changed(&self, world: &World, pos: IVec3, _origin: IVec3) -> Result<(), WorldError> {
        let below = world.safe_get_block(pos - IVec3::Y)?;
        if pos.y == 0 || !self.support.contains(&below.id) {
            world.set_block(pos, Block::AIR)?;
        }
        Ok(())
    }

}

/// A flowing fluid schedules a tick for itself whenever its surrounding changes, when
/// the tick fires, the fluid settles into its still variant.
pub struct FlowingFluidBehavior {
    pub flowing: u8,
    pub still: u8,
    pub delay: Duration,
}

impl BlockBehavior for FlowingFluidBehavior {

    fn neighbor_changed(&self, world: &World, pos: IVec3, _origin: IVec3) -> Result<(), WorldError> {
        if !world.update_pending(pos) {
            world.schedule_block_update(Instant::now() + self.delay, pos);
        }
        Ok(())
    }

    fn scheduled_tick(&self, world: &World, pos: IVec3) -> Result<(), WorldError> {
        let block = world.get_block(pos)?;
        if block.id == self.flowing {
            world.set_block(pos, Block::new(self.still, block.metadata))?;
        }
        Ok(())
    }

}
