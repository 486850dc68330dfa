//! A world made of regions of chunks, with entities, block behaviors propagation and
//! scheduled block updates.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::io;

use indexmap::IndexMap;
use glam::IVec3;

use tracing::{debug, instrument, trace};

use crate::region::{self, Region, RegionError, ChunkRef};
use crate::event::{Bus, Event, BlockEvent, EntityEvent};
use crate::block::{Block, BlockBehaviors};
use crate::generator::ChunkGenerator;
use crate::entity::Entity;
use crate::chunk::{self, Chunk};

mod notify;
mod tick;

pub use tick::{ScheduledUpdate, EntityTicker, TICK_DURATION};


/// Shared handle to an entity owned by a world.
pub type EntityRef = Arc<Mutex<Box<dyn Entity>>>;


/// Data structure for a whole world. All methods take a shared reference, the world 
/// is meant to be shared between connections, its entity ticker and the server tick.
/// 
/// Locks are never held while block behaviors or entity physics run, so both can 
/// freely call back into the world.
pub struct World {
    /// Resident regions, the lock only guards the map structure.
    regions: RwLock<HashMap<(i32, i32), Arc<Region>>>,
    /// Entities in spawn order.
    entities: Mutex<IndexMap<u32, EntityRef>>,
    /// Next entity id to assign.
    next_entity_id: AtomicU32,
    /// Generator for chunks that are neither resident nor stored.
    generator: Option<Box<dyn ChunkGenerator>>,
    /// Directory of region files, transient world if absent.
    directory: RwLock<Option<PathBuf>>,
    /// When disabled, setting blocks doesn't notify behaviors.
    block_updates: AtomicBool,
    /// Pending scheduled updates, in scheduling order.
    pending: Mutex<Vec<ScheduledUpdate>>,
    /// Block behaviors used by propagation and scheduled updates.
    behaviors: BlockBehaviors,
    /// Notifications of block and entity changes.
    events: Bus<Event>,
}

impl World {

    /// Create a new transient world without generator, with the default behaviors.
    pub fn new() -> Self {
        Self {
            regions: RwLock::new(HashMap::new()),
            entities: Mutex::new(IndexMap::new()),
            next_entity_id: AtomicU32::new(1),
            generator: None,
            directory: RwLock::new(None),
            block_updates: AtomicBool::new(true),
            pending: Mutex::new(Vec::new()),
            behaviors: BlockBehaviors::with_defaults(),
            events: Bus::new(),
        }
    }

    /// Use the given generator for chunks that are not stored.
    pub fn with_generator(mut self, generator: impl ChunkGenerator + 'static) -> Self {
        self.generator = Some(Box::new(generator));
        self
    }

    /// Store regions in the given directory, regions are loaded from there lazily.
    pub fn with_directory(self, directory: impl Into<PathBuf>) -> Self {
        *self.directory.write().expect("poisoned") = Some(directory.into());
        self
    }

    /// Replace the block behaviors table.
    pub fn with_behaviors(mut self, behaviors: BlockBehaviors) -> Self {
        self.behaviors = behaviors;
        self
    }

    /// Notifications of this world.
    #[inline]
    pub fn events(&self) -> &Bus<Event> {
        &self.events
    }

    #[inline]
    pub fn behaviors(&self) -> &BlockBehaviors {
        &self.behaviors
    }

    /// Directory where regions are stored.
    pub fn directory(&self) -> Option<PathBuf> {
        self.directory.read().expect("poisoned").clone()
    }

    /// The level type advertised to clients, from the generator.
    pub fn level_type(&self) -> &str {
        self.generator.as_deref().map(|g| g.level_type()).unwrap_or("default")
    }

    /// The spawn point given by the generator.
    pub fn spawn_point(&self) -> IVec3 {
        self.generator.as_deref().map(|g| g.spawn_point()).unwrap_or(IVec3::new(0, 64, 0))
    }

    #[inline]
    pub fn block_updates_enabled(&self) -> bool {
        self.block_updates.load(Ordering::Relaxed)
    }

    pub fn set_block_updates_enabled(&self, enabled: bool) {
        self.block_updates.store(enabled, Ordering::Relaxed);
    }

    // =================== //
    //       REGIONS       //
    // =================== //

    /// Get the region at the given region position if resident.
    pub fn get_region(&self, rx: i32, rz: i32) -> Option<Arc<Region>> {
        self.regions.read().expect("poisoned").get(&(rx, rz)).cloned()
    }

    /// Number of resident regions.
    pub fn region_count(&self) -> usize {
        self.regions.read().expect("poisoned").len()
    }

    /// Get or create the region containing the given chunk.
    fn ensure_region(&self, cx: i32, cz: i32) -> Arc<Region> {

        let (rx, rz) = region::calc_region_pos(cx, cz);
        if let Some(region) = self.get_region(rx, rz) {
            return region;
        }

        let path = self.directory().map(|dir| dir.join(region::region_file_name(rx, rz)));
        let mut regions = self.regions.write().expect("poisoned");
        Arc::clone(regions.entry((rx, rz)).or_insert_with(|| {
            trace!("created region {rx}/{rz}");
            Region::new(rx, rz, path)
        }))

    }

    // =================== //
    //        CHUNKS       //
    // =================== //

    /// Get the chunk at the given chunk position, creating its region, loading it or
    /// generating it as needed.
    pub fn get_chunk(&self, cx: i32, cz: i32) -> Result<ChunkRef, WorldError> {
        let region = self.ensure_region(cx, cz);
        let (lx, lz) = region::calc_region_offset(cx, cz);
        Ok(region.get_chunk(lx, lz, self.generator.as_deref(), (cx, cz))?)
    }

    /// Get the chunk at the given chunk position only if already resident, this never
    /// creates, loads or generates anything.
    pub fn get_chunk_without_generation(&self, cx: i32, cz: i32) -> Option<ChunkRef> {
        let (rx, rz) = region::calc_region_pos(cx, cz);
        let (lx, lz) = region::calc_region_offset(cx, cz);
        self.get_region(rx, rz)?.get_chunk_without_generation(lx, lz)
    }

    /// Install a chunk at the given chunk position, replacing any resident one. The 
    /// returned handle is the one later returned by [`Self::get_chunk`].
    pub fn set_chunk(&self, cx: i32, cz: i32, chunk: Chunk) -> ChunkRef {
        let region = self.ensure_region(cx, cz);
        let (lx, lz) = region::calc_region_offset(cx, cz);
        region.set_chunk(lx, lz, chunk)
    }

    /// Remove a chunk from residency, optionally saving its whole region first. 
    /// Returns true if a chunk was resident.
    pub fn unload_chunk(&self, cx: i32, cz: i32, save: bool) -> Result<bool, WorldError> {
        let (rx, rz) = region::calc_region_pos(cx, cz);
        let (lx, lz) = region::calc_region_offset(cx, cz);
        let Some(region) = self.get_region(rx, rz) else {
            return Ok(false);
        };
        if save {
            self.ensure_directory()?;
        }
        Ok(region.unload_chunk(lx, lz, save)?.is_some())
    }

    // =================== //
    //        BLOCKS       //
    // =================== //

    /// Get the block at the given position, the chunk is resolved as in 
    /// [`Self::get_chunk`]. Positions outside of the world's height are an error.
    pub fn get_block(&self, pos: IVec3) -> Result<Block, WorldError> {
        let (cx, cz) = chunk::calc_chunk_pos(pos).ok_or(WorldError::OutOfRange(pos))?;
        let chunk = self.get_chunk(cx, cz)?;
        let block = chunk.read().expect("poisoned").get_block(chunk::calc_local_pos(pos));
        Ok(block)
    }

    /// Same as [`Self::get_block`], but positions outside of the world's height are
    /// air.
    pub fn safe_get_block(&self, pos: IVec3) -> Result<Block, WorldError> {
        if chunk::is_valid_y(pos.y) {
            self.get_block(pos)
        } else {
            Ok(Block::AIR)
        }
    }

    /// Set the block at the given position and return the previous one. The owning
    /// region is marked dirty, a block event is emitted and, if block updates are 
    /// enabled, the written block and its six neighbors are notified.
    pub fn set_block(&self, pos: IVec3, block: Block) -> Result<Block, WorldError> {

        let (cx, cz) = chunk::calc_chunk_pos(pos).ok_or(WorldError::OutOfRange(pos))?;
        let chunk = self.get_chunk(cx, cz)?;

        let local_pos = chunk::calc_local_pos(pos);
        let (prev, region) = {
            let mut chunk = chunk.write().expect("poisoned");
            let prev = chunk.get_block(local_pos);
            chunk.set_block(local_pos, block);
            (prev, chunk.region())
        };

        if let Some(region) = region {
            region.mark_dirty();
        }

        self.events.emit(&Event::Block { pos, inner: BlockEvent::Set { block, prev } });

        if self.block_updates_enabled() {
            self.propagate_block_change(pos)?;
        }

        Ok(prev)

    }

    // =================== //
    //       ENTITIES      //
    // =================== //

    /// Spawn an entity at the end of the entity list and return its id.
    pub fn spawn_entity(&self, entity: Box<dyn Entity>) -> u32 {
        let id = self.next_entity_id.fetch_add(1, Ordering::Relaxed);
        let pos = entity.pos();
        self.entities.lock().expect("poisoned").insert(id, Arc::new(Mutex::new(entity)));
        debug!("spawned entity #{id} at {pos}");
        self.events.emit(&Event::Entity { id, inner: EntityEvent::Spawn { pos } });
        id
    }

    /// Remove an entity, keeping the order of the others. Returns false if unknown.
    pub fn remove_entity(&self, id: u32) -> bool {
        let removed = self.entities.lock().expect("poisoned").shift_remove(&id).is_some();
        if removed {
            debug!("removed entity #{id}");
            self.events.emit(&Event::Entity { id, inner: EntityEvent::Remove });
        }
        removed
    }

    /// Get an entity by its id.
    pub fn get_entity(&self, id: u32) -> Option<EntityRef> {
        self.entities.lock().expect("poisoned").get(&id).cloned()
    }

    /// Ids of all entities, in spawn order.
    pub fn entity_ids(&self) -> Vec<u32> {
        self.entities.lock().expect("poisoned").keys().copied().collect()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.lock().expect("poisoned").len()
    }

    // =================== //
    //         SAVE        //
    // =================== //

    /// Persist every resident region to its region file in the world's directory, 
    /// only modified chunks are written. A transient world has nothing to save.
    #[instrument(skip_all)]
    pub fn save(&self) -> Result<(), WorldError> {

        if !self.ensure_directory()? {
            debug!("transient world, nothing saved");
            return Ok(());
        }

        for region in self.region_snapshot() {
            region.save()?;
        }

        Ok(())

    }

    /// Write every resident region to the given directory, which becomes the world's 
    /// directory. Chunks only stored in the previous directory are copied too.
    #[instrument(skip(self))]
    pub fn save_to(&self, directory: &Path) -> Result<(), WorldError> {

        std::fs::create_dir_all(directory)?;

        for region in self.region_snapshot() {
            let (rx, rz) = region.pos();
            region.save_to(&directory.join(region::region_file_name(rx, rz)))?;
        }

        *self.directory.write().expect("poisoned") = Some(directory.to_path_buf());
        Ok(())

    }

    fn region_snapshot(&self) -> Vec<Arc<Region>> {
        self.regions.read().expect("poisoned").values().cloned().collect()
    }

    /// Create the world's directory if any, returns false for transient worlds.
    fn ensure_directory(&self) -> io::Result<bool> {
        match self.directory() {
            Some(dir) => std::fs::create_dir_all(dir).map(|_| true),
            None => Ok(false),
        }
    }

}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World")
            .field("regions", &self.region_count())
            .field("entities", &self.entity_count())
            .field("directory", &self.directory())
            .finish_non_exhaustive()
    }
}


/// Error type used by world operations.
#[derive(thiserror::Error, Debug)]
pub enum WorldError {
    #[error("position out of range: {0}")]
    OutOfRange(IVec3),
    #[error("region: {0}")]
    Region(#[from] RegionError),
    #[error("io: {0}")]
    Io(#[from] io::Error),
}
