use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Raw tile payload bytes.
pub type TileData = Vec<u8>;

/// Web-mercator tile address.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileId {
    pub z: u8,
    pub x: u32,
    pub y: u32,
}

impl TileId {
    /// Deepest zoom level a tile address may use.
    pub const MAX_ZOOM: u8 = 30;

    #[must_use]
    pub fn new(z: u8, x: u32, y: u32) -> Self {
        Self { z, x, y }
    }

    /// A tile id is valid when its x/y fit the tile grid at its zoom level.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.z <= Self::MAX_ZOOM
            && u64::from(self.x) < (1_u64 << self.z)
            && u64::from(self.y) < (1_u64 << self.z)
    }

    /// True when `other` lies strictly below `self` in the tile pyramid.
    #[must_use]
    pub fn is_ancestor_of(&self, other: &TileId) -> bool {
        if other.z <= self.z {
            return false;
        }
        let dz = other.z - self.z;
        other.x >> dz == self.x && other.y >> dz == self.y
    }
}

impl Display for TileId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.z, self.x, self.y)
    }
}

/// Metatile dimensions in tiles.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metatile {
    pub width: u32,
    pub height: u32,
}

impl Metatile {
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    #[must_use]
    pub const fn square(size: u32) -> Self {
        Self::new(size, size)
    }
}

impl Default for Metatile {
    fn default() -> Self {
        Self::square(1)
    }
}

/// A vector tile blob together with the address it was produced for.
#[derive(Debug, Clone)]
pub struct MvtTile {
    pub id: TileId,
    pub data: TileData,
}
