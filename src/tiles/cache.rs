use super::{cancel::CancelToken, key::TileKey};
use crate::core::clock::Timestamp;
use crate::prelude::{Arc, HashMap};
use std::fmt;

/// Decoded tile image (RGBA8), cheap to clone
#[derive(Clone, PartialEq, Eq)]
pub struct TileResource {
    pub width: u32,
    pub height: u32,
    pixels: Arc<Vec<u8>>,
}

impl TileResource {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Self {
        Self {
            width,
            height,
            pixels: Arc::new(pixels),
        }
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Whether both handles point at the same decoded image
    pub fn same_image(&self, other: &TileResource) -> bool {
        Arc::ptr_eq(&self.pixels, &other.pixels)
    }
}

impl fmt::Debug for TileResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TileResource")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.pixels.len())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileState {
    Pending,
    Loaded,
    Failed,
}

/// A cache slot. Owned exclusively by [`BoundedCache`].
#[derive(Debug, Clone)]
pub struct TileEntry {
    pub resource: Option<TileResource>,
    pub state: TileState,
    pub url: String,
    pub loaded_at: Timestamp,
    pub last_used: Timestamp,
    /// Token of the in-flight first load, shared with the load task
    pub cancel: Option<CancelToken>,
    /// Token of an in-flight TTL refresh
    pub refresh: Option<CancelToken>,
    pub refresh_attempted_at: Option<Timestamp>,
    pub retry_count: u32,
    pub failed_at: Option<Timestamp>,
}

impl TileEntry {
    /// Placeholder for a load that has just been admitted
    pub fn pending(url: impl Into<String>, cancel: CancelToken, now: Timestamp) -> Self {
        Self {
            resource: None,
            state: TileState::Pending,
            url: url.into(),
            loaded_at: 0,
            last_used: now,
            cancel: Some(cancel),
            refresh: None,
            refresh_attempted_at: None,
            retry_count: 0,
            failed_at: None,
        }
    }

    pub fn loaded(url: impl Into<String>, resource: TileResource, now: Timestamp) -> Self {
        Self {
            resource: Some(resource),
            state: TileState::Loaded,
            url: url.into(),
            loaded_at: now,
            last_used: now,
            cancel: None,
            refresh: None,
            refresh_attempted_at: None,
            retry_count: 0,
            failed_at: None,
        }
    }

    pub fn mark_loaded(&mut self, resource: TileResource, now: Timestamp) {
        self.resource = Some(resource);
        self.state = TileState::Loaded;
        self.loaded_at = now;
        self.cancel = None;
        self.retry_count = 0;
        self.failed_at = None;
    }

    pub fn mark_failed(&mut self, now: Timestamp) {
        self.resource = None;
        self.state = TileState::Failed;
        self.cancel = None;
        self.retry_count += 1;
        self.failed_at = Some(now);
    }

    /// Reuse a failed entry for a retry; the retry count carries over
    pub fn mark_pending(&mut self, url: impl Into<String>, cancel: CancelToken) {
        self.resource = None;
        self.state = TileState::Pending;
        self.url = url.into();
        self.cancel = Some(cancel);
    }

    /// Swap in a refreshed image; recency is left alone
    pub fn mark_refreshed(&mut self, resource: TileResource, now: Timestamp) {
        self.resource = Some(resource);
        self.loaded_at = now;
        self.refresh = None;
        self.refresh_attempted_at = None;
    }

    pub fn is_loading(&self) -> bool {
        self.state == TileState::Pending
    }

    pub fn is_stale(&self, now: Timestamp, ttl_ms: u64) -> bool {
        self.state == TileState::Loaded && now.saturating_sub(self.loaded_at) > ttl_ms
    }

    /// Exponential (or fixed) backoff gate for re-requesting a failed tile
    pub fn should_retry(
        &self,
        now: Timestamp,
        max_retries: u32,
        retry_delay_ms: u64,
        exponential_backoff: bool,
    ) -> bool {
        if self.state != TileState::Failed || self.retry_count > max_retries {
            return false;
        }

        match self.failed_at {
            Some(failed_at) => {
                let multiplier = if exponential_backoff {
                    2_u64.saturating_pow(self.retry_count.saturating_sub(1))
                } else {
                    1
                };
                now.saturating_sub(failed_at) >= retry_delay_ms.saturating_mul(multiplier)
            }
            None => true,
        }
    }

    /// Cancel any load this entry is waiting on
    pub fn cancel_loads(&self) {
        if let Some(token) = &self.cancel {
            token.cancel();
        }
        if let Some(token) = &self.refresh {
            token.cancel();
        }
    }
}

/// Read-only snapshot handed out by [`BoundedCache::get`]
#[derive(Debug, Clone)]
pub struct EntryView {
    pub state: TileState,
    pub resource: Option<TileResource>,
    pub loaded_at: Timestamp,
    pub last_used: Timestamp,
}

impl From<&TileEntry> for EntryView {
    fn from(entry: &TileEntry) -> Self {
        Self {
            state: entry.state,
            resource: entry.resource.clone(),
            loaded_at: entry.loaded_at,
            last_used: entry.last_used,
        }
    }
}

/// Tile key to entry map with recency tracking.
///
/// Inserting never evicts; capacity is enforced out-of-band by the
/// eviction planner so an insertion burst never stalls the render path.
#[derive(Debug, Default)]
pub struct BoundedCache {
    entries: HashMap<TileKey, TileEntry>,
}

impl BoundedCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity_and_hasher(capacity, Default::default()),
        }
    }

    /// Look up an entry and mark it used at `now`
    pub fn get(&mut self, key: &TileKey, now: Timestamp) -> Option<EntryView> {
        let entry = self.entries.get_mut(key)?;
        entry.last_used = now;
        Some(EntryView::from(&*entry))
    }

    /// Look up an entry without touching recency
    pub fn peek(&self, key: &TileKey) -> Option<&TileEntry> {
        self.entries.get(key)
    }

    /// Mutable access without touching recency
    pub fn get_mut(&mut self, key: &TileKey) -> Option<&mut TileEntry> {
        self.entries.get_mut(key)
    }

    /// Insert or replace, returning the previous entry
    pub fn put(&mut self, key: TileKey, entry: TileEntry) -> Option<TileEntry> {
        self.entries.insert(key, entry)
    }

    pub fn remove(&mut self, key: &TileKey) -> Option<TileEntry> {
        self.entries.remove(key)
    }

    pub fn touch(&mut self, key: &TileKey, now: Timestamp) -> bool {
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.last_used = now;
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, key: &TileKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Whether a new load for `key` would be redundant: the tile is either
    /// loaded or already has a placeholder waiting on a load. Failed entries
    /// do not block; their retry policy lives with the owner.
    pub fn blocks_request(&self, key: &TileKey) -> bool {
        self.entries
            .get(key)
            .is_some_and(|entry| entry.state != TileState::Failed)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_over(&self, max_entries: usize) -> bool {
        self.entries.len() > max_entries
    }

    pub fn keys(&self) -> impl Iterator<Item = &TileKey> {
        self.entries.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TileKey, &TileEntry)> {
        self.entries.iter()
    }

    pub fn count_in_state(&self, state: TileState) -> usize {
        self.entries.values().filter(|e| e.state == state).count()
    }

    /// Remove every entry, handing them back so the caller can cancel loads
    pub fn drain(&mut self) -> Vec<(TileKey, TileEntry)> {
        self.entries.drain().collect()
    }
}
