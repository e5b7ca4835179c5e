//! Tile addressing: keys, tile-grid ranges and the wrap/clamp rules of the
//! slippy-map address space.

use crate::core::{constants::MAX_ZOOM_LEVEL, geo::Point, viewport::ViewportState};
use crate::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifies a tile by (zoom, column, row).
///
/// Field order matters: the derived `Ord` compares as the tuple `(z, x, y)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TileKey {
    pub z: u8,
    pub x: u32,
    pub y: u32,
}

impl TileKey {
    pub fn new(z: u8, x: u32, y: u32) -> Self {
        Self { z, x, y }
    }

    /// Number of columns (and rows) at zoom `z`
    pub fn world_size(z: u8) -> i64 {
        1i64 << z
    }

    /// Center of this tile in tile-grid coordinates at `zoom`
    pub fn center_at_zoom(&self, zoom: u8) -> Point {
        let factor = 2_f64.powi(zoom as i32 - self.z as i32);
        Point::new(
            (self.x as f64 + 0.5) * factor,
            (self.y as f64 + 0.5) * factor,
        )
    }

    pub fn parent(&self) -> Option<TileKey> {
        if self.z == 0 {
            None
        } else {
            Some(TileKey::new(self.z - 1, self.x / 2, self.y / 2))
        }
    }

    pub fn children(&self) -> [TileKey; 4] {
        let (x, y, z) = (self.x * 2, self.y * 2, self.z + 1);
        [
            TileKey::new(z, x, y),
            TileKey::new(z, x + 1, y),
            TileKey::new(z, x, y + 1),
            TileKey::new(z, x + 1, y + 1),
        ]
    }

    pub fn is_valid(&self) -> bool {
        if self.z > MAX_ZOOM_LEVEL {
            return false;
        }
        let size = Self::world_size(self.z);
        (self.x as i64) < size && (self.y as i64) < size
    }
}

impl fmt::Display for TileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.z, self.x, self.y)
    }
}

impl FromStr for TileKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('/');
        let mut next = |name: &str| -> Result<u32, Error> {
            parts
                .next()
                .ok_or_else(|| Error::ParseError(format!("tile key {s:?} is missing {name}")))?
                .parse::<u32>()
                .map_err(|e| Error::ParseError(format!("tile key {s:?}: bad {name}: {e}")))
        };
        let z = next("zoom")?;
        let x = next("column")?;
        let y = next("row")?;
        if parts.next().is_some() {
            return Err(Error::ParseError(format!("tile key {s:?} has trailing parts")));
        }
        let z = u8::try_from(z)
            .ok()
            .filter(|z| *z <= MAX_ZOOM_LEVEL)
            .ok_or_else(|| Error::ParseError(format!("tile key {s:?}: zoom out of range")))?;
        let key = TileKey::new(z, x, y);
        if !key.is_valid() {
            return Err(Error::ParseError(format!("tile key {s:?} is outside the grid")));
        }
        Ok(key)
    }
}

/// Inclusive rectangle of grid positions at one zoom. Columns are unwrapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRange {
    pub zoom: u8,
    pub min_x: i64,
    pub max_x: i64,
    pub min_y: i64,
    pub max_y: i64,
}

impl TileRange {
    /// Grid positions covered by the viewport's canvas
    pub fn from_viewport(viewport: &ViewportState, tile_size: u32) -> Self {
        let (min, max) = viewport.tile_bounds(tile_size);
        let min_x = min.x.floor() as i64;
        let min_y = min.y.floor() as i64;
        Self {
            zoom: viewport.zoom,
            min_x,
            max_x: (max.x.ceil() as i64 - 1).max(min_x),
            min_y,
            max_y: (max.y.ceil() as i64 - 1).max(min_y),
        }
    }

    /// Expand by `buffer` tiles on every side (Leaflet's keepBuffer)
    pub fn expand(&self, buffer: u32) -> Self {
        let b = buffer as i64;
        Self {
            zoom: self.zoom,
            min_x: self.min_x - b,
            max_x: self.max_x + b,
            min_y: self.min_y - b,
            max_y: self.max_y + b,
        }
    }

    pub fn contains(&self, x: i64, y: i64) -> bool {
        x >= self.min_x && x <= self.max_x && y >= self.min_y && y <= self.max_y
    }

    pub fn positions(&self) -> impl Iterator<Item = (i64, i64)> + '_ {
        (self.min_y..=self.max_y).flat_map(move |y| (self.min_x..=self.max_x).map(move |x| (x, y)))
    }
}

/// A resolved tile plus the unwrapped grid position it is drawn at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridTile {
    pub key: TileKey,
    pub grid_x: i64,
    pub grid_y: i64,
}

/// Wrap/clamp rules of the tile grid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressSpace {
    pub wrap_x: bool,
    pub min_zoom: u8,
    pub max_zoom: u8,
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self {
            wrap_x: true,
            min_zoom: 0,
            max_zoom: 18,
        }
    }
}

impl AddressSpace {
    pub fn new(wrap_x: bool, min_zoom: u8, max_zoom: u8) -> Self {
        Self {
            wrap_x,
            min_zoom,
            max_zoom: max_zoom.min(MAX_ZOOM_LEVEL),
        }
    }

    pub fn clamp_zoom(&self, zoom: u8) -> u8 {
        zoom.clamp(self.min_zoom, self.max_zoom)
    }

    pub fn contains_zoom(&self, zoom: u8) -> bool {
        zoom >= self.min_zoom && zoom <= self.max_zoom
    }

    /// Normalize an arbitrary grid position into a key: the column wraps
    /// modulo the world width (or clamps when wrapping is off), the row clamps.
    pub fn normalize(&self, z: u8, x: i64, y: i64) -> TileKey {
        let size = TileKey::world_size(z);
        let x = if self.wrap_x {
            x.rem_euclid(size)
        } else {
            x.clamp(0, size - 1)
        };
        TileKey::new(z, x as u32, y.clamp(0, size - 1) as u32)
    }

    /// The key drawn at grid position `(x, y)`, or `None` if nothing is there
    /// (row off the grid, or column off the grid with wrapping disabled).
    pub fn resolve(&self, z: u8, x: i64, y: i64) -> Option<TileKey> {
        let size = TileKey::world_size(z);
        if y < 0 || y >= size || !self.contains_zoom(z) {
            return None;
        }
        if !self.wrap_x && (x < 0 || x >= size) {
            return None;
        }
        Some(TileKey::new(z, x.rem_euclid(size) as u32, y as u32))
    }

    /// All drawable tiles in `range`, row-major
    pub fn enumerate(&self, range: &TileRange) -> Vec<GridTile> {
        range
            .positions()
            .filter_map(|(x, y)| {
                self.resolve(range.zoom, x, y).map(|key| GridTile {
                    key,
                    grid_x: x,
                    grid_y: y,
                })
            })
            .collect()
    }
}
