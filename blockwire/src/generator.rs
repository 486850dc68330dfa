//! Chunk generation capability consumed by the world when a chunk is first accessed.

use glam::IVec3;

use crate::block::{self, Block};
use crate::chunk::{Chunk, CHUNK_WIDTH};


/// A generator produces the initial content of chunks that are neither resident nor 
/// stored. Generation must be deterministic for a given chunk position.
pub trait ChunkGenerator: Send + Sync {

    /// Name of the level type, sent to clients on login.
    fn level_type(&self) -> &str {
        "default"
    }

    /// Generate the chunk at the given chunk coordinates.
    fn generate(&self, cx: i32, cz: i32) -> Chunk;

    /// A position where players can spawn safely.
    fn spawn_point(&self) -> IVec3 {
        IVec3::new(0, 64, 0)
    }

}


/// A generator of flat worlds made of horizontal layers, the same for every chunk.
#[derive(Debug, Clone)]
pub struct FlatGenerator {
    layers: Vec<(Block, u8)>,
}

impl FlatGenerator {

    /// Create a flat generator from bottom to top layers, each with its thickness.
    pub fn new(layers: Vec<(Block, u8)>) -> Self {
        Self { layers }
    }

    /// Height of the first air layer.
    pub fn surface(&self) -> i32 {
        self.layers.iter().map(|&(_, height)| height as i32).sum()
    }

}

impl Default for FlatGenerator {
    fn default() -> Self {
        Self::new(vec![
            (Block::of(block::BEDROCK), 1),
            (Block::of(block::DIRT), 2),
            (Block::of(block::GRASS), 1),
        ])
    }
}

impl ChunkGenerator for FlatGenerator {

    fn level_type(&self) -> &str {
        "flat"
    }

    fn generate(&self, _cx: i32, _cz: i32) -> Chunk {
        let mut chunk = Chunk::new();
        let mut y = 0;
        for &(block, height) in &self.layers {
            let size = IVec3::new(CHUNK_WIDTH as i32, height as i32, CHUNK_WIDTH as i32);
            chunk.fill(IVec3::new(0, y, 0), size, block);
            y += height as i32;
        }
        chunk
    }

    fn spawn_point(&self) -> IVec3 {
        IVec3::new(0, self.surface(), 0)
    }

}


#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn flat_layers() {
        let generator = FlatGenerator::default();
        assert_eq!(generator.surface(), 4);
        let chunk = generator.generate(-3, 7);
        assert_eq!(chunk.get_block(IVec3::new(5, 0, 5)), Block::of(block::BEDROCK));
        assert_eq!(chunk.get_block(IVec3::new(5, 2, 5)), Block::of(block::DIRT));
        assert_eq!(chunk.get_block(IVec3::new(15, 3, 0)), Block::of(block::GRASS));
        assert!(chunk.get_block(IVec3::new(5, 4, 5)).is_air());
    }

}
