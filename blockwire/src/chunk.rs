//! A chunk storing a 16x256x16 column of blocks, with coordinate transforms between
//! world, chunk and chunk-local block coordinates.

use std::io::{self, Read, Write};
use std::sync::{Arc, Weak};

use glam::IVec3;

use crate::io::{ReadWireExt, WriteWireExt};
use crate::region::Region;
use crate::block::{self, Block};
use crate::face::Face;


/// Chunk size in both X and Z coordinates.
pub const CHUNK_WIDTH: usize = 16;
/// Chunk height, also the height of the world.
pub const CHUNK_HEIGHT: usize = 256;
/// Internal chunk size, in number of elements per chunk.
const CHUNK_SIZE: usize = CHUNK_HEIGHT * CHUNK_WIDTH * CHUNK_WIDTH;


/// Calculate the index in the chunk's arrays for the given chunk-local position, the
/// layout is `xxxx zzzz yyyy yyyy`. Only firsts relevant bits are taken in each 
/// coordinate component, so a world position can be given directly.
#[inline]
fn calc_index(pos: IVec3) -> usize {
    debug_assert!(pos.y >= 0 && pos.y < CHUNK_HEIGHT as i32);
    let x = pos.x as u32 & 0b1111;
    let z = pos.z as u32 & 0b1111;
    let y = pos.y as u32 & 0b11111111;
    ((x << 12) | (z << 8) | y) as usize
}

/// Return true if the given Y coordinate is within world's height.
#[inline]
pub fn is_valid_y(y: i32) -> bool {
    y >= 0 && y < CHUNK_HEIGHT as i32
}

/// Calculate the chunk position corresponding to the given block position. This returns
/// no position if the Y coordinate is invalid. Arithmetic shift rounds toward negative
/// infinity, so `x = -1` lands in chunk `-1`.
#[inline]
pub fn calc_chunk_pos(pos: IVec3) -> Option<(i32, i32)> {
    is_valid_y(pos.y).then_some((pos.x >> 4, pos.z >> 4))
}

/// Calculate the chunk-local position of a block, X and Z components are always in
/// range `0..16`, the Y component is kept as-is.
#[inline]
pub fn calc_local_pos(pos: IVec3) -> IVec3 {
    IVec3::new(pos.x.rem_euclid(CHUNK_WIDTH as i32), pos.y, pos.z.rem_euclid(CHUNK_WIDTH as i32))
}

/// Calculate the position of the chunk adjacent to the given one on the given face,
/// vertical faces return the same chunk.
#[inline]
pub fn calc_relative_chunk_pos(cx: i32, cz: i32, face: Face) -> (i32, i32) {
    let delta = face.delta();
    (cx + delta.x, cz + delta.z)
}


/// Data structure storing every chunk-local block, chunks are a world subdivision of
/// 16x256x16 blocks.
#[derive(Clone)]
pub struct Chunk {
    /// The numeric identifier of the block.
    block: Box<[u8]>,
    /// Four bits metadata for each block.
    metadata: ChunkNibbleArray,
    /// Set when the chunk differs from what was last persisted.
    modified: bool,
    /// The region currently mapping this chunk, this is only set by the region itself
    /// when the chunk is installed into it.
    region: Weak<Region>,
}

impl Chunk {

    /// Create a new empty chunk, full of air blocks.
    pub fn new() -> Self {
        Self {
            block: vec![block::AIR; CHUNK_SIZE].into_boxed_slice(),
            metadata: ChunkNibbleArray::new(0),
            modified: false,
            region: Weak::new(),
        }
    }

    /// Get the block at the given position (rebased to chunk-local).
    /// Panics if Y component of the position is not between 0 and 256 (excluded).
    #[inline]
    pub fn get_block(&self, pos: IVec3) -> Block {
        let index = calc_index(pos);
        Block::new(self.block[index], self.metadata.get(index))
    }

    /// Set the block at the given position (rebased to chunk-local) and mark this chunk
    /// as modified.
    /// Panics if Y component of the position is not between 0 and 256 (excluded).
    #[inline]
    pub fn set_block(&mut self, pos: IVec3, block: Block) {
        let index = calc_index(pos);
        self.block[index] = block.id;
        self.metadata.set(index, block.metadata & 0x0F);
        self.modified = true;
    }

    /// Fill the given chunk-local area with the given block.
    /// Panics if Y component of the position is not between 0 and 256 (excluded).
    pub fn fill(&mut self, start: IVec3, size: IVec3, block: Block) {
        for x in start.x..start.x + size.x {
            for z in start.z..start.z + size.z {
                let mut index = calc_index(IVec3::new(x, start.y, z));
                for _ in start.y..start.y + size.y {
                    self.block[index] = block.id;
                    self.metadata.set(index, block.metadata & 0x0F);
                    index += 1;
                }
            }
        }
        self.modified = true;
    }

    /// Return true if this chunk has been modified since last saved.
    #[inline]
    pub fn is_modified(&self) -> bool {
        self.modified
    }

    #[inline]
    pub fn set_modified(&mut self, modified: bool) {
        self.modified = modified;
    }

    /// Get the region currently holding this chunk, if any.
    pub fn region(&self) -> Option<Arc<Region>> {
        self.region.upgrade()
    }

    /// Return true if this chunk's back-reference points to the given region.
    pub fn is_in_region(&self, region: &Arc<Region>) -> bool {
        Weak::ptr_eq(&self.region, &Arc::downgrade(region))
    }

    pub(crate) fn set_region(&mut self, region: Weak<Region>) {
        self.region = region;
    }

    /// Write the chunk's persisted payload: modified marker, block ids then metadata.
    pub fn write_data_to(&self, mut writer: impl Write) -> io::Result<()> {
        writer.write_bool(self.modified)?;
        writer.write_all(&self.block)?;
        writer.write_all(&self.metadata.inner)?;
        Ok(())
    }

    /// Read a chunk from the payload written by [`Self::write_data_to`]. The returned
    /// chunk is not attached to any region.
    pub fn read_data_from(mut reader: impl Read) -> io::Result<Self> {
        let mut chunk = Self::new();
        chunk.modified = reader.read_bool()?;
        reader.read_exact(&mut chunk.block)?;
        reader.read_exact(&mut chunk.metadata.inner)?;
        Ok(chunk)
    }

}

impl Default for Chunk {
    fn default() -> Self {
        Self::new()
    }
}

/// Special arrays for chunks that stores `u4 * CHUNK_SIZE` values.
#[derive(Clone)]
struct ChunkNibbleArray {
    inner: Box<[u8]>,
}

impl ChunkNibbleArray {

    fn new(init: u8) -> Self {
        debug_assert!(init <= 0x0F);
        Self { inner: vec![init << 4 | init; CHUNK_SIZE / 2].into_boxed_slice() }
    }

    #[inline]
    fn get(&self, index: usize) -> u8 {
        let slot = self.inner[index >> 1];
        if index & 1 == 0 {
            slot & 0x0F
        } else {
            slot >> 4
        }
    }

    #[inline]
    fn set(&mut self, index: usize, value: u8) {
        debug_assert!(value <= 0x0F);
        let slot = &mut self.inner[index >> 1];
        if index & 1 == 0 {
            *slot = (*slot & 0xF0) | value;
        } else {
            *slot = (*slot & 0x0F) | (value << 4);
        }
    }

}


#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn chunk_pos_floor() {
        assert_eq!(calc_chunk_pos(IVec3::new(0, 0, 0)), Some((0, 0)));
        assert_eq!(calc_chunk_pos(IVec3::new(15, 255, 16)), Some((0, 1)));
        assert_eq!(calc_chunk_pos(IVec3::new(-1, 64, -16)), Some((-1, -1)));
        assert_eq!(calc_chunk_pos(IVec3::new(-17, 64, 0)), Some((-2, 0)));
        assert_eq!(calc_chunk_pos(IVec3::new(0, -1, 0)), None);
        assert_eq!(calc_chunk_pos(IVec3::new(0, 256, 0)), None);
    }

    #[test]
    fn relative_chunk() {
        assert_eq!(calc_relative_chunk_pos(0, 0, Face::NegX), (-1, 0));
        assert_eq!(calc_relative_chunk_pos(3, -2, Face::PosZ), (3, -1));
        assert_eq!(calc_relative_chunk_pos(3, -2, Face::PosY), (3, -2));
    }

    #[test]
    fn local_pos() {
        assert_eq!(calc_local_pos(IVec3::new(-1, 10, -16)), IVec3::new(15, 10, 0));
        assert_eq!(calc_local_pos(IVec3::new(17, 0, 31)), IVec3::new(1, 0, 15));
    }

    #[test]
    fn block_storage() {

        let mut chunk = Chunk::new();
        assert!(!chunk.is_modified());
        assert_eq!(chunk.get_block(IVec3::new(3, 255, 7)), Block::AIR);

        chunk.set_block(IVec3::new(3, 255, 7), Block::new(block::STONE, 5));
        chunk.set_block(IVec3::new(3, 254, 7), Block::new(block::DIRT, 2));
        assert!(chunk.is_modified());
        assert_eq!(chunk.get_block(IVec3::new(3, 255, 7)), Block::new(block::STONE, 5));
        assert_eq!(chunk.get_block(IVec3::new(3, 254, 7)), Block::new(block::DIRT, 2));
        // World coordinates are rebased.
        assert_eq!(chunk.get_block(IVec3::new(-13, 255, 23)), Block::new(block::STONE, 5));

    }

    #[test]
    fn payload() {

        let mut chunk = Chunk::new();
        chunk.fill(IVec3::ZERO, IVec3::new(16, 2, 16), Block::new(block::BEDROCK, 0));
        chunk.set_block(IVec3::new(8, 100, 8), Block::new(block::GLASS, 9));

        let mut data = Vec::new();
        chunk.write_data_to(&mut data).unwrap();
        assert_eq!(data.len(), 1 + CHUNK_SIZE + CHUNK_SIZE / 2);

        let read = Chunk::read_data_from(&data[..]).unwrap();
        assert!(read.is_modified());
        assert!(read.region().is_none());
        assert_eq!(read.get_block(IVec3::new(0, 1, 15)), Block::new(block::BEDROCK, 0));
        assert_eq!(read.get_block(IVec3::new(8, 100, 8)), Block::new(block::GLASS, 9));
        assert_eq!(read.get_block(IVec3::new(8, 101, 8)), Block::AIR);

    }

}
