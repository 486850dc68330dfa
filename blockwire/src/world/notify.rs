//! Propagation of block changes to block behaviors.

use glam::IVec3;

use crate::face::Face;
use crate::chunk;

use super::{World, WorldError};


impl World {

    /// Notify the block at `pos` then its six neighbors that the block at `pos` 
    /// changed. Only the vertical neighbors are checked against the world's height,
    /// horizontal ones are resolved like any block, possibly loading or generating 
    /// the adjacent chunk.
    pub(super) fn propagate_block_change(&self, pos: IVec3) -> Result<(), WorldError> {
        self.notify_block(pos, pos)?;
        for face in Face::ALL {
            let neighbor = pos + face.delta();
            if face.is_y() && !chunk::is_valid_y(neighbor.y) {
                continue;
            }
            self.notify_block(neighbor, pos)?;
        }
        Ok(())
    }

    /// Notify the block at `pos` that the block at `origin` changed, nothing happens 
    /// if the block type has no behavior.
    pub fn notify_block(&self, pos: IVec3, origin: IVec3) -> Result<(), WorldError> {
        let block = self.get_block(pos)?;
        if let Some(behavior) = self.behaviors.get(block.id) {
            behavior.neighbor_changed(self, pos, origin)?;
        }
        Ok(())
    }

}
