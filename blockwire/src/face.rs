//! Axis-aligned cube faces, used for neighbor propagation and protocol directions.

use glam::IVec3;


/// Represent a cube facing, the numeric value is the one used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Face {
    NegY = 0,
    PosY = 1,
    NegZ = 2,
    PosZ = 3,
    NegX = 4,
    PosX = 5,
}

impl Face {

    /// Array containing all 6 faces, vertical ones first.
    pub const ALL: [Self; 6] = [Self::PosY, Self::NegY, Self::NegX, Self::PosX, Self::NegZ, Self::PosZ];
    /// Array containing all 4 horizontal faces.
    pub const HORIZONTAL: [Self; 4] = [Self::NegX, Self::PosX, Self::NegZ, Self::PosZ];

    /// Get the face from its wire value, if valid.
    pub fn from_id(id: u8) -> Option<Self> {
        Some(match id {
            0 => Self::NegY,
            1 => Self::PosY,
            2 => Self::NegZ,
            3 => Self::PosZ,
            4 => Self::NegX,
            5 => Self::PosX,
            _ => return None,
        })
    }

    /// Get the wire value of this face.
    #[inline]
    pub fn id(self) -> u8 {
        self as u8
    }

    #[inline]
    pub fn is_y(self) -> bool {
        matches!(self, Face::NegY | Face::PosY)
    }

    /// Get the opposite face.
    #[inline]
    pub fn opposite(self) -> Self {
        match self {
            Face::NegY => Face::PosY,
            Face::PosY => Face::NegY,
            Face::NegZ => Face::PosZ,
            Face::PosZ => Face::NegZ,
            Face::NegX => Face::PosX,
            Face::PosX => Face::NegX,
        }
    }

    /// Get the unit delta vector pointing out of this face.
    #[inline]
    pub fn delta(self) -> IVec3 {
        match self {
            Face::NegY => IVec3::NEG_Y,
            Face::PosY => IVec3::Y,
            Face::NegZ => IVec3::NEG_Z,
            Face::PosZ => IVec3::Z,
            Face::NegX => IVec3::NEG_X,
            Face::PosX => IVec3::X,
        }
    }

}


#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn wire_ids() {
        for face in Face::ALL {
            assert_eq!(Face::from_id(face.id()), Some(face));
            assert_eq!(face.delta() + face.opposite().delta(), IVec3::ZERO);
        }
        assert_eq!(Face::from_id(6), None);
        assert_eq!(Face::from_id(255), None);
    }

}
