use crate::core::{
    constants::TILE_SIZE,
    geo::{lat_lng_to_tile, tile_to_lat_lng, LatLng, Point},
};
use serde::{Deserialize, Serialize};

/// Snapshot of the viewport the tile layer renders into.
///
/// The viewport owner rebuilds this every frame; the tile engine never
/// mutates it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ViewportState {
    /// Viewport center in fractional tile-grid coordinates at `zoom`
    pub center_tile: Point,
    /// Integer tile zoom
    pub zoom: u8,
    /// `2^(map_zoom - zoom)`: how much one tile is scaled on screen
    pub fractional_scale: f64,
    /// Canvas size in CSS pixels
    pub canvas_size: Point,
    /// Device pixel ratio
    pub dpr: f64,
    /// Coarse "the user is flinging the map" signal
    pub panning_fast: bool,
}

impl ViewportState {
    pub fn new(center_tile: Point, zoom: u8, canvas_size: Point) -> Self {
        Self {
            center_tile,
            zoom,
            fractional_scale: 1.0,
            canvas_size,
            dpr: 1.0,
            panning_fast: false,
        }
    }

    /// Builds the state from a geographic center and a (possibly fractional) map zoom
    pub fn from_lat_lng(center: LatLng, map_zoom: f64, canvas_size: Point) -> Self {
        let zoom = map_zoom.floor().max(0.0) as u8;
        Self {
            center_tile: lat_lng_to_tile(&center, zoom as f64),
            zoom,
            fractional_scale: 2_f64.powf(map_zoom - zoom as f64),
            canvas_size,
            dpr: 1.0,
            panning_fast: false,
        }
    }

    pub fn with_dpr(mut self, dpr: f64) -> Self {
        self.dpr = dpr;
        self
    }

    pub fn with_panning_fast(mut self, panning_fast: bool) -> Self {
        self.panning_fast = panning_fast;
        self
    }

    pub fn center(&self) -> LatLng {
        tile_to_lat_lng(self.center_tile.x, self.center_tile.y, self.zoom as f64)
    }

    /// The same view expressed at another integer zoom
    pub fn at_zoom(&self, zoom: u8) -> ViewportState {
        let factor = 2_f64.powi(zoom as i32 - self.zoom as i32);
        ViewportState {
            center_tile: self.center_tile.multiply(factor),
            zoom,
            fractional_scale: self.fractional_scale / factor,
            ..*self
        }
    }

    /// Tile-grid bounds `(min, max)` covered by the canvas, unclamped and unwrapped
    pub fn tile_bounds(&self, tile_size: u32) -> (Point, Point) {
        let tile_px = tile_size as f64 * self.fractional_scale;
        let half = Point::new(
            self.canvas_size.x / (2.0 * tile_px),
            self.canvas_size.y / (2.0 * tile_px),
        );
        (self.center_tile.subtract(&half), self.center_tile.add(&half))
    }

    /// Screen rectangle of the tile at grid position `(x, y)` (unwrapped column)
    pub fn tile_screen_bounds(&self, x: i64, y: i64, tile_size: u32) -> (Point, Point) {
        let tile_px = tile_size as f64 * self.fractional_scale;
        let origin = Point::new(
            (x as f64 - self.center_tile.x) * tile_px + self.canvas_size.x / 2.0,
            (y as f64 - self.center_tile.y) * tile_px + self.canvas_size.y / 2.0,
        );
        (origin, Point::new(origin.x + tile_px, origin.y + tile_px))
    }
}

impl Default for ViewportState {
    fn default() -> Self {
        Self::new(
            Point::new(0.5, 0.5),
            0,
            Point::new(TILE_SIZE as f64, TILE_SIZE as f64),
        )
    }
}
