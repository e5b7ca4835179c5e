//! Prefetch around the view: the buffer ring at the current zoom and the
//! footprint at the zoom levels just above and below.

use super::{
    key::{AddressSpace, GridTile, TileKey, TileRange},
    queue::TilePriority,
};
use crate::core::{clock::Timestamp, config::CacheConfig, geo::Point, viewport::ViewportState};
use crate::prelude::HashSet;

/// A tile worth loading ahead of need
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrefetchTarget {
    pub key: TileKey,
    pub priority: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct PendingPrefetch {
    viewport: ViewportState,
    due_at: Timestamp,
}

#[derive(Debug, Clone)]
pub struct Prefetcher {
    max_tiles: usize,
    adjacent_zooms: bool,
    pending: Option<PendingPrefetch>,
}

impl Prefetcher {
    pub fn new(max_tiles: usize, adjacent_zooms: bool) -> Self {
        Self {
            max_tiles,
            adjacent_zooms,
            pending: None,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.max_prefetch_tiles, config.prefetch_adjacent_zooms)
    }

    /// Defer a prefetch for `viewport` by `delay_ms`; replaces any pending one
    pub fn schedule(&mut self, viewport: ViewportState, delay_ms: u64, now: Timestamp) {
        self.pending = Some(PendingPrefetch {
            viewport,
            due_at: now.saturating_add(delay_ms),
        });
    }

    /// The scheduled viewport once its delay has passed
    pub fn take_due(&mut self, now: Timestamp) -> Option<ViewportState> {
        match self.pending {
            Some(pending) if now >= pending.due_at => {
                self.pending = None;
                Some(pending.viewport)
            }
            _ => None,
        }
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn cancel_pending(&mut self) {
        self.pending = None;
    }

    /// Prefetch targets around `viewport`, best first, capped at the configured
    /// maximum. Keys for which `skip` holds (cached, queued) don't count
    /// against the cap.
    pub fn plan<F>(
        &self,
        space: &AddressSpace,
        viewport: &ViewportState,
        tile_size: u32,
        buffer: u32,
        skip: F,
    ) -> Vec<PrefetchTarget>
    where
        F: Fn(&TileKey) -> bool,
    {
        self.collect(space, viewport, tile_size, buffer, false, skip)
    }

    /// Like [`Prefetcher::plan`] but for a view that is not shown yet (the end
    /// of a fly-to): its own footprint is fetched too, ahead of the ring.
    pub fn plan_destination<F>(
        &self,
        space: &AddressSpace,
        viewport: &ViewportState,
        tile_size: u32,
        buffer: u32,
        skip: F,
    ) -> Vec<PrefetchTarget>
    where
        F: Fn(&TileKey) -> bool,
    {
        self.collect(space, viewport, tile_size, buffer, true, skip)
    }

    fn collect<F>(
        &self,
        space: &AddressSpace,
        viewport: &ViewportState,
        tile_size: u32,
        buffer: u32,
        include_footprint: bool,
        skip: F,
    ) -> Vec<PrefetchTarget>
    where
        F: Fn(&TileKey) -> bool,
    {
        let mut targets = Vec::new();

        let footprint = TileRange::from_viewport(viewport, tile_size);
        for tile in space.enumerate(&footprint.expand(buffer)) {
            if !footprint.contains(tile.grid_x, tile.grid_y) {
                targets.push(target(&tile, viewport, TilePriority::Adjacent));
            } else if include_footprint {
                // footprint tiles rank above the ring but stay in its band
                let mut inner = target(&tile, viewport, TilePriority::Adjacent);
                inner.priority += TilePriority::BAND_SPAN / 2.0;
                targets.push(inner);
            }
        }

        if self.adjacent_zooms {
            let neighbours = [viewport.zoom.checked_sub(1), viewport.zoom.checked_add(1)];
            for zoom in neighbours.into_iter().flatten() {
                if !space.contains_zoom(zoom) {
                    continue;
                }
                let scaled = viewport.at_zoom(zoom);
                let range = TileRange::from_viewport(&scaled, tile_size);
                for tile in space.enumerate(&range) {
                    targets.push(target(&tile, &scaled, TilePriority::Prefetch));
                }
            }
        }

        targets.sort_by(|a, b| b.priority.total_cmp(&a.priority));

        let mut seen = HashSet::default();
        targets
            .into_iter()
            .filter(|t| !skip(&t.key) && seen.insert(t.key))
            .take(self.max_tiles)
            .collect()
    }
}

/// Priority of a grid tile by its distance (in tiles) from the view center
pub fn target(tile: &GridTile, viewport: &ViewportState, band: TilePriority) -> PrefetchTarget {
    let center = Point::new(tile.grid_x as f64 + 0.5, tile.grid_y as f64 + 0.5);
    PrefetchTarget {
        key: tile.key,
        priority: band.at_distance(center.distance_to(&viewport.center_tile)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn viewport() -> ViewportState {
        // single-tile footprint: (4, 4) at zoom 4
        ViewportState::new(Point::new(4.5, 4.5), 4, Point::new(256.0, 256.0))
    }

    #[test]
    fn test_ring_and_adjacent_zooms() {
        let prefetcher = Prefetcher::new(100, true);
        let targets = prefetcher.plan(&AddressSpace::default(), &viewport(), 256, 1, |_| false);

        let ring: Vec<_> = targets.iter().filter(|t| t.key.z == 4).collect();
        assert_eq!(ring.len(), 8);
        assert!(ring.iter().all(|t| t.key != TileKey::new(4, 4, 4)));

        assert!(targets.iter().any(|t| t.key == TileKey::new(3, 2, 2)));
        assert!(targets.iter().any(|t| t.key.z == 5));

        // ring entries outrank every other-zoom entry
        let first_other_zoom = targets.iter().position(|t| t.key.z != 4).unwrap();
        assert!(targets[..first_other_zoom].iter().all(|t| t.key.z == 4));
        assert_eq!(first_other_zoom, 8);
    }

    #[test]
    fn test_cap_and_skip() {
        let prefetcher = Prefetcher::new(3, true);
        let skipped = TileKey::new(4, 4, 3);
        let targets = prefetcher.plan(&AddressSpace::default(), &viewport(), 256, 1, |k| *k == skipped);

        assert_eq!(targets.len(), 3);
        assert!(targets.iter().all(|t| t.key != skipped));
    }

    #[test]
    fn test_adjacent_zooms_respect_zoom_range() {
        let prefetcher = Prefetcher::new(100, true);
        let space = AddressSpace::new(true, 4, 4);
        let targets = prefetcher.plan(&space, &viewport(), 256, 1, |_| false);
        assert!(targets.iter().all(|t| t.key.z == 4));

        let no_zooms = Prefetcher::new(100, false);
        let targets = no_zooms.plan(&AddressSpace::default(), &viewport(), 256, 1, |_| false);
        assert_eq!(targets.len(), 8);
    }

    #[test]
    fn test_destination_includes_footprint_first() {
        let prefetcher = Prefetcher::new(100, false);
        let targets =
            prefetcher.plan_destination(&AddressSpace::default(), &viewport(), 256, 1, |_| false);
        assert_eq!(targets.len(), 9);
        assert_eq!(targets[0].key, TileKey::new(4, 4, 4));
    }

    #[test]
    fn test_schedule_replaces_and_waits() {
        let mut prefetcher = Prefetcher::new(10, true);
        prefetcher.schedule(viewport(), 200, 1000);
        let later = viewport().at_zoom(6);
        prefetcher.schedule(later, 100, 1050);

        assert!(prefetcher.take_due(1100).is_none());
        assert_eq!(prefetcher.take_due(1150), Some(later));
        assert!(!prefetcher.has_pending());
        assert!(prefetcher.take_due(5000).is_none());
    }
}
