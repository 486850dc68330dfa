//! Regions group 32x32 chunks and map to a single region file on disk.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::io;

use tracing::{debug, trace};

use crate::generator::ChunkGenerator;
use crate::chunk::Chunk;

mod file;
pub use file::{RegionFile, ChunkReader, ChunkWriter};


/// Number of chunks along each horizontal axis of a region.
pub const REGION_WIDTH: i32 = 32;

/// Shared handle to a resident chunk, each chunk has its own lock.
pub type ChunkRef = Arc<RwLock<Chunk>>;


/// Calculate the region position of the given chunk position, rounding toward negative
/// infinity, so chunk `-1` lands in region `-1`.
#[inline]
pub fn calc_region_pos(cx: i32, cz: i32) -> (i32, i32) {
    (cx.div_euclid(REGION_WIDTH), cz.div_euclid(REGION_WIDTH))
}

/// Calculate the region-local offset of the given chunk position, always in `0..32`.
#[inline]
pub fn calc_region_offset(cx: i32, cz: i32) -> (u8, u8) {
    (cx.rem_euclid(REGION_WIDTH) as u8, cz.rem_euclid(REGION_WIDTH) as u8)
}

/// The file name of a region file at the given region position.
pub fn region_file_name(rx: i32, rz: i32) -> String {
    format!("r.{rx}.{rz}.mcr")
}


/// A square group of 32x32 chunks, owned by a world and backed by an optional region
/// file.
pub struct Region {
    rx: i32,
    rz: i32,
    /// Weak self reference given to chunks as their back-reference.
    this: Weak<Region>,
    /// Resident chunks, indexed by their region-local offset.
    chunks: Mutex<HashMap<(u8, u8), ChunkRef>>,
    /// Backing file path and its lazily opened handle.
    storage: Mutex<RegionStorage>,
    /// Set when a chunk has been installed, written or unloaded since the last save.
    dirty: AtomicBool,
}

struct RegionStorage {
    path: Option<PathBuf>,
    file: Option<RegionFile>,
}

impl RegionStorage {

    /// Open the backing file if not already, returns none if there is no path or if
    /// the file doesn't exist and `create` is false.
    fn open(&mut self, create: bool) -> Result<Option<&mut RegionFile>, RegionError> {

        if self.file.is_none() {

            let Some(path) = &self.path else {
                return Ok(None);
            };

            match RegionFile::open(path, create) {
                Ok(file) => {
                    debug!("opened region file {}", path.display());
                    self.file = Some(file);
                }
                Err(RegionError::Io(e)) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e),
            }

        }

        Ok(self.file.as_mut())

    }

    /// Read the chunk stored at the given offset, if any.
    fn load_chunk(&mut self, lx: u8, lz: u8) -> Result<Option<Chunk>, RegionError> {
        
        let Some(file) = self.open(false)? else {
            return Ok(None);
        };

        if !file.contains_chunk(lx as i32, lz as i32) {
            return Ok(None);
        }

        let mut chunk = Chunk::read_data_from(file.read_chunk(lx as i32, lz as i32)?)?;
        // The resident chunk is now identical to the stored one.
        chunk.set_modified(false);
        Ok(Some(chunk))

    }

}

impl Region {

    /// Create a new region at the given region position, its file path may be absent
    /// for transient worlds. The file itself is only opened when needed.
    pub fn new(rx: i32, rz: i32, path: Option<PathBuf>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            rx,
            rz,
            this: this.clone(),
            chunks: Mutex::new(HashMap::new()),
            storage: Mutex::new(RegionStorage { path, file: None }),
            dirty: AtomicBool::new(false),
        })
    }

    /// Region position of this region.
    #[inline]
    pub fn pos(&self) -> (i32, i32) {
        (self.rx, self.rz)
    }

    /// Current backing file path.
    pub fn path(&self) -> Option<PathBuf> {
        self.storage.lock().expect("poisoned").path.clone()
    }

    /// Return true if a chunk has been installed, written or unloaded since the last
    /// save.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Relaxed)
    }

    /// Mark the region as differing from its file, block writes go through this.
    #[inline]
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Relaxed);
    }

    /// Number of resident chunks.
    pub fn chunk_count(&self) -> usize {
        self.chunks.lock().expect("poisoned").len()
    }

    /// Get a resident chunk without loading, creating or generating anything.
    pub fn get_chunk_without_generation(&self, lx: u8, lz: u8) -> Option<ChunkRef> {
        self.chunks.lock().expect("poisoned").get(&(lx, lz)).cloned()
    }

    /// Get the chunk at the given region-local offset, loading it from the region 
    /// file, generating it or creating an empty one, in that order, if not resident.
    /// The world chunk coordinates are given to the generator.
    pub fn get_chunk(&self, 
        lx: u8, 
        lz: u8, 
        generator: Option<&dyn ChunkGenerator>,
        (cx, cz): (i32, i32),
    ) -> Result<ChunkRef, RegionError> {

        let mut chunks = self.chunks.lock().expect("poisoned");
        if let Some(chunk) = chunks.get(&(lx, lz)) {
            return Ok(Arc::clone(chunk));
        }

        let loaded = self.storage.lock().expect("poisoned").load_chunk(lx, lz)?;
        let mut chunk = match loaded {
            Some(chunk) => {
                trace!("loaded chunk {cx}/{cz} from region {}/{}", self.rx, self.rz);
                chunk
            }
            None => {
                let mut chunk = match generator {
                    Some(generator) => generator.generate(cx, cz),
                    None => Chunk::new(),
                };
                // Never persisted yet.
                chunk.set_modified(true);
                trace!("created chunk {cx}/{cz} in region {}/{}", self.rx, self.rz);
                chunk
            }
        };

        chunk.set_region(self.this.clone());
        let chunk = Arc::new(RwLock::new(chunk));
        chunks.insert((lx, lz), Arc::clone(&chunk));
        self.mark_dirty();
        Ok(chunk)

    }

    /// Install the given chunk at the given offset, replacing and detaching any 
    /// previous one. The chunk is marked modified and its back-reference points to 
    /// this region.
    pub fn set_chunk(&self, lx: u8, lz: u8, mut chunk: Chunk) -> ChunkRef {

        chunk.set_modified(true);
        chunk.set_region(self.this.clone());
        let chunk = Arc::new(RwLock::new(chunk));

        let prev = self.chunks.lock().expect("poisoned").insert((lx, lz), Arc::clone(&chunk));
        if let Some(prev) = prev {
            prev.write().expect("poisoned").set_region(Weak::new());
        }

        self.mark_dirty();
        chunk

    }

    /// Remove the chunk at the given offset from residency, its back-reference is 
    /// cleared. If `save` is true, the whole region is saved before removing it.
    pub fn unload_chunk(&self, lx: u8, lz: u8, save: bool) -> Result<Option<ChunkRef>, RegionError> {

        let mut chunks = self.chunks.lock().expect("poisoned");
        if !chunks.contains_key(&(lx, lz)) {
            return Ok(None);
        }

        if save {
            self.save_resident(&chunks)?;
        }

        let Some(chunk) = chunks.remove(&(lx, lz)) else {
            return Ok(None);
        };
        drop(chunks);

        chunk.write().expect("poisoned").set_region(Weak::new());
        self.mark_dirty();
        Ok(Some(chunk))

    }

    /// Write every modified resident chunk to the current backing file, clearing 
    /// their modified flag. Nothing is written if the region has no path.
    pub fn save(&self) -> Result<(), RegionError> {
        let chunks = self.chunks.lock().expect("poisoned");
        self.save_resident(&chunks)
    }

    fn save_resident(&self, chunks: &HashMap<(u8, u8), ChunkRef>) -> Result<(), RegionError> {

        let mut storage = self.storage.lock().expect("poisoned");
        if storage.path.is_none() {
            return Ok(());
        }

        let mut count = 0;
        for (&(lx, lz), chunk) in chunks {
            if Self::save_chunk(&mut storage, lx, lz, chunk, false)? {
                count += 1;
            }
        }

        self.dirty.store(false, Ordering::Relaxed);
        debug!("saved region {}/{}, {count} chunks written", self.rx, self.rz);
        Ok(())

    }

    /// Rebind this region to a new backing file and write its complete content there.
    /// Chunks only stored in the previous file are loaded first, so that the new file
    /// is a complete copy.
    pub fn save_to(&self, path: &Path) -> Result<(), RegionError> {

        let mut chunks = self.chunks.lock().expect("poisoned");
        let mut storage = self.storage.lock().expect("poisoned");

        for lx in 0..REGION_WIDTH as u8 {
            for lz in 0..REGION_WIDTH as u8 {
                if !chunks.contains_key(&(lx, lz)) {
                    if let Some(mut chunk) = storage.load_chunk(lx, lz)? {
                        chunk.set_region(self.this.clone());
                        chunks.insert((lx, lz), Arc::new(RwLock::new(chunk)));
                    }
                }
            }
        }

        storage.file = None;
        storage.path = Some(path.to_path_buf());

        for (&(lx, lz), chunk) in chunks.iter() {
            Self::save_chunk(&mut storage, lx, lz, chunk, true)?;
        }

        self.dirty.store(false, Ordering::Relaxed);
        debug!("saved region {}/{} to {}, {} chunks written", self.rx, self.rz, path.display(), chunks.len());
        Ok(())

    }

    /// Write a single chunk, only if modified unless `force` is set. Returns true if
    /// the chunk has been written.
    fn save_chunk(storage: &mut RegionStorage, lx: u8, lz: u8, chunk: &ChunkRef, force: bool) -> Result<bool, RegionError> {

        let mut chunk = chunk.write().expect("poisoned");
        if !force && !chunk.is_modified() {
            return Ok(false);
        }

        let Some(file) = storage.open(true)? else {
            return Ok(false);
        };

        let mut writer = file.write_chunk(lx as i32, lz as i32);
        chunk.write_data_to(&mut writer)?;
        writer.flush_chunk()?;

        chunk.set_modified(false);
        Ok(true)

    }

}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region")
            .field("pos", &(self.rx, self.rz))
            .field("path", &self.path())
            .finish_non_exhaustive()
    }
}


/// Error type used by region operations.
#[derive(thiserror::Error, Debug)]
pub enum RegionError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("region file too small: {0} bytes")]
    FileTooSmall(u64),
    #[error("region file not padded to sectors: {0} bytes")]
    FileNotPadded(u64),
    #[error("illegal sector range")]
    IllegalRange,
    #[error("illegal compression")]
    IllegalCompression,
    #[error("no chunk stored in slot")]
    EmptyChunk,
    #[error("chunk payload too large")]
    OutOfSector,
}


#[cfg(test)]
mod tests {

    use glam::IVec3;

    use crate::block::{self, Block};
    use super::*;

    #[test]
    fn region_pos_floor() {
        assert_eq!(calc_region_pos(0, 0), (0, 0));
        assert_eq!(calc_region_pos(31, 32), (0, 1));
        assert_eq!(calc_region_pos(-1, -32), (-1, -1));
        assert_eq!(calc_region_pos(-33, 0), (-2, 0));
        assert_eq!(calc_region_offset(-1, -32), (31, 0));
        assert_eq!(calc_region_offset(33, -33), (1, 31));
        assert_eq!(region_file_name(-1, 2), "r.-1.2.mcr");
    }

    #[test]
    fn back_reference() {

        let region = Region::new(0, 0, None);
        assert!(region.get_chunk_without_generation(1, 2).is_none());

        let chunk = region.get_chunk(1, 2, None, (1, 2)).unwrap();
        assert!(chunk.read().unwrap().is_in_region(&region));
        assert!(Arc::ptr_eq(&chunk, &region.get_chunk_without_generation(1, 2).unwrap()));

        let replacement = region.set_chunk(1, 2, Chunk::new());
        assert!(!chunk.read().unwrap().is_in_region(&region));
        assert!(replacement.read().unwrap().is_in_region(&region));
        assert!(replacement.read().unwrap().is_modified());

        let removed = region.unload_chunk(1, 2, false).unwrap().unwrap();
        assert!(Arc::ptr_eq(&removed, &replacement));
        assert!(removed.read().unwrap().region().is_none());
        assert_eq!(region.chunk_count(), 0);

    }

    #[test]
    fn save_only_modified() {

        let dir = std::env::temp_dir().join(format!("blockwire-region-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(region_file_name(0, 0));
        let _ = std::fs::remove_file(&path);

        let region = Region::new(0, 0, Some(path.clone()));
        let chunk = region.get_chunk(0, 0, None, (0, 0)).unwrap();
        chunk.write().unwrap().set_block(IVec3::new(1, 1, 1), Block::of(block::STONE));
        region.save().unwrap();
        assert!(!chunk.read().unwrap().is_modified());
        assert!(!region.is_dirty());

        let reloaded = Region::new(0, 0, Some(path.clone()));
        let chunk = reloaded.get_chunk(0, 0, None, (0, 0)).unwrap();
        let chunk = chunk.read().unwrap();
        assert!(!chunk.is_modified());
        assert_eq!(chunk.get_block(IVec3::new(1, 1, 1)), Block::of(block::STONE));

        let _ = std::fs::remove_dir_all(&dir);

    }

    #[test]
    fn unload_saves_whole_region() {

        let dir = std::env::temp_dir().join(format!("blockwire-region-unload-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(region_file_name(0, 0));
        let _ = std::fs::remove_file(&path);

        let region = Region::new(0, 0, Some(path.clone()));
        for lx in [0, 1] {
            let chunk = region.get_chunk(lx, 0, None, (lx as i32, 0)).unwrap();
            chunk.write().unwrap().set_block(IVec3::new(1, 10, 1), Block::of(block::GLASS));
        }

        region.unload_chunk(0, 0, true).unwrap().unwrap();
        assert_eq!(region.chunk_count(), 1);
        assert!(!region.get_chunk_without_generation(1, 0).unwrap().read().unwrap().is_modified());

        let reloaded = Region::new(0, 0, Some(path.clone()));
        for lx in [0, 1] {
            let chunk = reloaded.get_chunk(lx, 0, None, (lx as i32, 0)).unwrap();
            assert_eq!(chunk.read().unwrap().get_block(IVec3::new(1, 10, 1)), Block::of(block::GLASS));
        }

        let _ = std::fs::remove_dir_all(&dir);

    }


}
