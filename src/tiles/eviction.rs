//! Viewport-aware cache eviction
//!
//! Eviction is scored rather than pure LRU: a tile that was used long ago, sits
//! at another zoom level, or lies far from the view center goes first. Scores
//! are computed against the viewport at eviction time, so the heap is built per
//! pass instead of being maintained on every access.

use super::{
    cache::BoundedCache,
    key::{AddressSpace, TileKey, TileRange},
};
use crate::core::{
    config::{CacheConfig, DeviceCapabilityClass},
    constants::{MAX_BUFFER_TILES, MIN_BUFFER_TILES},
    viewport::ViewportState,
};
use crate::prelude::{BinaryHeap, HashSet, Ordering};

/// Keep-buffer around the viewport, in tiles.
///
/// Deeper zooms get a wider ring since each tile covers less ground; low-end
/// devices keep one ring less and fast panning one ring more.
pub fn buffer_tiles(zoom: u8, device_class: DeviceCapabilityClass, panning_fast: bool) -> u32 {
    let base: i32 = match zoom {
        0..=4 => 1,
        5..=10 => 2,
        11..=15 => 3,
        _ => 4,
    };
    let device = match device_class {
        DeviceCapabilityClass::Low => -1,
        _ => 0,
    };
    let panning = i32::from(panning_fast);

    (base + device + panning).clamp(MIN_BUFFER_TILES as i32, MAX_BUFFER_TILES as i32) as u32
}

/// Keys the viewport needs (footprint plus `buffer` rings) at its own zoom
pub fn protected_set(
    space: &AddressSpace,
    viewport: &ViewportState,
    tile_size: u32,
    buffer: u32,
) -> HashSet<TileKey> {
    let range = TileRange::from_viewport(viewport, tile_size).expand(buffer);
    space.enumerate(&range).into_iter().map(|tile| tile.key).collect()
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    key: TileKey,
    score: f64,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    // Reversed so the max-heap pops the lowest score; key order keeps ties stable
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .score
            .total_cmp(&self.score)
            .then_with(|| other.key.cmp(&self.key))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvictionPlanner {
    pub zoom_weight: f64,
    pub spatial_weight: f64,
}

impl Default for EvictionPlanner {
    fn default() -> Self {
        Self {
            zoom_weight: 1000.0,
            spatial_weight: 100.0,
        }
    }
}

impl EvictionPlanner {
    pub fn new(zoom_weight: f64, spatial_weight: f64) -> Self {
        Self {
            zoom_weight,
            spatial_weight,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.zoom_weight, config.spatial_weight)
    }

    /// Higher is more worth keeping. When `space` wraps, columns are compared
    /// the short way round the world.
    pub fn score(
        &self,
        space: &AddressSpace,
        key: &TileKey,
        last_used: u64,
        viewport: &ViewportState,
    ) -> f64 {
        let zoom_distance = (key.z as f64 - viewport.zoom as f64).abs();
        let spatial_distance = column_aware_distance(space, key, viewport);

        last_used as f64 - zoom_distance * self.zoom_weight - spatial_distance * self.spatial_weight
    }

    /// Keys to drop, lowest score first, to bring the cache down to
    /// `max_entries`. Protected keys are never picked, so the plan may fall
    /// short when the protected set alone exceeds the budget.
    pub fn plan(
        &self,
        space: &AddressSpace,
        cache: &BoundedCache,
        max_entries: usize,
        protected: &HashSet<TileKey>,
        viewport: &ViewportState,
    ) -> Vec<TileKey> {
        let excess = cache.len().saturating_sub(max_entries);
        if excess == 0 {
            return Vec::new();
        }

        let mut heap: BinaryHeap<Candidate> = cache
            .iter()
            .filter(|(key, _)| !protected.contains(*key))
            .map(|(key, entry)| Candidate {
                key: *key,
                score: self.score(space, key, entry.last_used, viewport),
            })
            .collect();

        let mut victims = Vec::with_capacity(excess.min(heap.len()));
        while victims.len() < excess {
            match heap.pop() {
                Some(candidate) => victims.push(candidate.key),
                None => break,
            }
        }
        victims
    }

    /// Carry out [`EvictionPlanner::plan`]; in-flight loads of evicted entries
    /// are cancelled before the entry goes. Returns the evicted keys.
    pub fn evict(
        &self,
        space: &AddressSpace,
        cache: &mut BoundedCache,
        max_entries: usize,
        protected: &HashSet<TileKey>,
        viewport: &ViewportState,
    ) -> Vec<TileKey> {
        let victims = self.plan(space, cache, max_entries, protected, viewport);
        for key in &victims {
            if let Some(entry) = cache.remove(key) {
                entry.cancel_loads();
            }
        }

        if cache.len() > max_entries {
            log::debug!(
                "protected tiles keep the cache at {} entries (budget {})",
                cache.len(),
                max_entries
            );
        }
        victims
    }
}

/// Distance in tiles from the view center to the center of `key`, rescaled
/// to the view's zoom. The view center may carry an unwrapped column.
fn column_aware_distance(space: &AddressSpace, key: &TileKey, viewport: &ViewportState) -> f64 {
    let center = key.center_at_zoom(viewport.zoom);
    let mut dx = (center.x - viewport.center_tile.x).abs();
    if space.wrap_x {
        let world = TileKey::world_size(viewport.zoom) as f64;
        dx = dx.rem_euclid(world);
        dx = dx.min(world - dx);
    }
    let dy = center.y - viewport.center_tile.y;
    dx.hypot(dy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::geo::Point;
    use crate::tiles::{
        cache::{TileEntry, TileResource},
        cancel::CancelToken,
    };

    fn resource() -> TileResource {
        TileResource::new(1, 1, vec![0; 4])
    }

    fn loaded_at(last_used: u64) -> TileEntry {
        let mut entry = TileEntry::loaded("", resource(), 0);
        entry.last_used = last_used;
        entry
    }

    fn viewport() -> ViewportState {
        ViewportState::new(Point::new(8.5, 8.5), 5, Point::new(256.0, 256.0))
    }

    #[test]
    fn test_buffer_by_zoom() {
        use DeviceCapabilityClass::*;
        assert_eq!(buffer_tiles(3, Medium, false), 1);
        assert_eq!(buffer_tiles(4, Medium, false), 1);
        assert_eq!(buffer_tiles(5, Medium, false), 2);
        assert_eq!(buffer_tiles(10, Medium, false), 2);
        assert_eq!(buffer_tiles(15, High, false), 3);
        assert_eq!(buffer_tiles(16, High, false), 4);
    }

    #[test]
    fn test_buffer_adjustments_stay_in_bounds() {
        use DeviceCapabilityClass::*;
        assert_eq!(buffer_tiles(2, Low, false), MIN_BUFFER_TILES);
        assert_eq!(buffer_tiles(8, Low, false), 1);
        assert_eq!(buffer_tiles(8, Medium, true), 3);
        assert_eq!(buffer_tiles(18, High, true), MAX_BUFFER_TILES);
        for zoom in 0..=30 {
            for class in [Low, Medium, High] {
                for fast in [false, true] {
                    let buffer = buffer_tiles(zoom, class, fast);
                    assert!((MIN_BUFFER_TILES..=MAX_BUFFER_TILES).contains(&buffer));
                }
            }
        }
    }

    #[test]
    fn test_least_valuable_unprotected_goes_first() {
        // cap 3: A(10) and B(20) unprotected, C(5) protected, D just inserted
        let planner = EvictionPlanner::default();
        let vp = viewport();
        let space = AddressSpace::default();
        // all one tile from the center, so only recency separates them
        let (a, b, c, d) = (
            TileKey::new(5, 7, 8),
            TileKey::new(5, 9, 8),
            TileKey::new(5, 8, 7),
            TileKey::new(5, 8, 9),
        );
        assert_eq!(planner.score(&space, &a, 0, &vp), planner.score(&space, &b, 0, &vp));

        let mut cache = BoundedCache::new();
        cache.put(a, loaded_at(10));
        cache.put(b, loaded_at(20));
        cache.put(c, loaded_at(5));
        let protected: HashSet<TileKey> = [c, d].into_iter().collect();
        assert!(planner.plan(&space, &cache, 3, &protected, &vp).is_empty());

        cache.put(d, loaded_at(30));
        let evicted = planner.evict(&space, &mut cache, 3, &protected, &vp);
        assert_eq!(evicted, vec![a]);
        assert!(cache.contains(&b));
        assert!(cache.contains(&c));
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_zoom_and_distance_weigh_in() {
        let planner = EvictionPlanner::default();
        let vp = viewport();
        let space = AddressSpace::default();
        let near = TileKey::new(5, 8, 8);
        let far = TileKey::new(5, 20, 8);
        let other_zoom = TileKey::new(7, 34, 34);

        let score = |key: &TileKey, last_used| planner.score(&space, key, last_used, &vp);

        assert!(score(&near, 100) > score(&far, 100));
        assert!(score(&near, 100) > score(&other_zoom, 100));
        // recency still dominates when it outweighs the spatial penalty
        assert!(score(&far, 5000) > score(&near, 100));
    }

    #[test]
    fn test_tiles_across_the_antimeridian_count_as_near() {
        let planner = EvictionPlanner::default();
        let space = AddressSpace::default();
        // view on the last column at zoom 4
        let vp = ViewportState::new(Point::new(15.5, 8.5), 4, Point::new(256.0, 256.0));
        let across = TileKey::new(4, 1, 8);
        let inland = TileKey::new(4, 10, 8);

        let mut cache = BoundedCache::new();
        cache.put(across, loaded_at(100));
        cache.put(inland, loaded_at(100));
        let evicted = planner.evict(&space, &mut cache, 1, &HashSet::default(), &vp);
        assert_eq!(evicted, vec![inland]);

        // the same view one world further east
        let unwrapped = ViewportState::new(Point::new(31.5, 8.5), 4, Point::new(256.0, 256.0));
        assert_eq!(
            planner.score(&space, &across, 100, &unwrapped),
            planner.score(&space, &across, 100, &vp)
        );

        // without wrapping the seam is a real edge
        let flat = AddressSpace::new(false, 0, 18);
        assert!(planner.score(&flat, &across, 100, &vp) < planner.score(&flat, &inland, 100, &vp));
    }

    #[test]
    fn test_capacity_bound_after_eviction() {
        let planner = EvictionPlanner::default();
        let vp = viewport();
        let space = AddressSpace::default();
        let mut cache = BoundedCache::new();
        for x in 0..32 {
            cache.put(TileKey::new(5, x, 0), loaded_at(x as u64));
        }

        let evicted = planner.evict(&space, &mut cache, 10, &HashSet::default(), &vp);
        assert_eq!(evicted.len(), 22);
        assert_eq!(cache.len(), 10);
    }

    #[test]
    fn test_protected_overflow_is_kept() {
        let planner = EvictionPlanner::default();
        let vp = viewport();
        let space = AddressSpace::default();
        let mut cache = BoundedCache::new();
        let mut protected = HashSet::default();
        for x in 0..6 {
            let key = TileKey::new(5, x, 8);
            cache.put(key, loaded_at(0));
            protected.insert(key);
        }
        cache.put(TileKey::new(5, 30, 30), loaded_at(999));

        let evicted = planner.evict(&space, &mut cache, 4, &protected, &vp);
        assert_eq!(evicted, vec![TileKey::new(5, 30, 30)]);
        assert_eq!(cache.len(), 6);
    }

    #[test]
    fn test_evicting_pending_entry_cancels_its_load() {
        let planner = EvictionPlanner::default();
        let vp = viewport();
        let space = AddressSpace::default();
        let token = CancelToken::new();
        let mut cache = BoundedCache::new();
        cache.put(TileKey::new(5, 0, 0), TileEntry::pending("", token.clone(), 0));
        cache.put(TileKey::new(5, 8, 8), loaded_at(100));

        let evicted = planner.evict(&space, &mut cache, 1, &HashSet::default(), &vp);
        assert_eq!(evicted, vec![TileKey::new(5, 0, 0)]);
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_protected_set_covers_buffered_footprint() {
        let vp = ViewportState::new(Point::new(4.5, 4.5), 4, Point::new(256.0, 256.0));
        let keys = protected_set(&AddressSpace::default(), &vp, 256, 1);
        assert_eq!(keys.len(), 9);
        assert!(keys.contains(&TileKey::new(4, 3, 3)));
        assert!(keys.contains(&TileKey::new(4, 5, 5)));
        assert!(!keys.contains(&TileKey::new(4, 6, 4)));
    }
}
