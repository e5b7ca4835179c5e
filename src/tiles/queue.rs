//! Priority queue of pending tile loads with a single dedup map
//!
//! A key is tracked from the moment it is enqueued until its load's
//! completion has been processed, so one key never has two loads in flight.
//! Priorities are snapshots computed at enqueue time against the viewport of
//! that moment; the queue is not re-sorted when the viewport moves.

use super::{cache::BoundedCache, concurrency::ConcurrencyController, key::TileKey};
use crate::core::clock::Timestamp;
use crate::prelude::{BinaryHeap, HashMap, Ordering};

/// Priority band of a load (higher number = higher priority)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TilePriority {
    /// Background/low priority
    Background = 1,
    /// Tiles at the adjacent zoom levels
    Prefetch = 10,
    /// Buffer ring around the visible area
    Adjacent = 50,
    /// Currently visible tiles (highest priority)
    Visible = 100,
}

impl TilePriority {
    /// Width of a band; distance penalties are clamped below it so a job
    /// never drops into the band beneath its own.
    pub const BAND_SPAN: f64 = 100.0;

    pub fn base_priority(self) -> f64 {
        self as u8 as f64 * Self::BAND_SPAN
    }

    /// `base_priority - distance`, with the distance kept inside the band
    pub fn at_distance(self, distance_in_tiles: f64) -> f64 {
        self.base_priority() - distance_in_tiles.clamp(0.0, Self::BAND_SPAN - 1.0)
    }
}

/// A tile load waiting for a concurrency slot
#[derive(Debug, Clone, PartialEq)]
pub struct LoadJob {
    pub key: TileKey,
    pub url: String,
    pub priority: f64,
    pub retina_scale: u8,
}

impl LoadJob {
    pub fn new(key: TileKey, url: impl Into<String>, priority: f64) -> Self {
        Self {
            key,
            url: url.into(),
            priority,
            retina_scale: 1,
        }
    }

    pub fn with_retina_scale(mut self, retina_scale: u8) -> Self {
        self.retina_scale = retina_scale;
        self
    }
}

#[derive(Debug)]
struct QueuedJob {
    job: LoadJob,
    /// Sequence number for tie-breaking (lower = earlier)
    sequence: u64,
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first, then earlier sequence number
        match self.job.priority.total_cmp(&other.job.priority) {
            Ordering::Equal => other.sequence.cmp(&self.sequence),
            other => other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tracked {
    Queued { sequence: u64 },
    InFlight,
}

#[derive(Debug, Default)]
pub struct LoadQueue {
    heap: BinaryHeap<QueuedJob>,
    tracked: HashMap<TileKey, Tracked>,
    next_sequence: u64,
    queued: usize,
}

impl LoadQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `job` unless its key is cached, queued or in flight.
    ///
    /// Returns whether the job was accepted.
    pub fn enqueue(&mut self, job: LoadJob, cache: &BoundedCache) -> bool {
        if self.tracked.contains_key(&job.key) || cache.blocks_request(&job.key) {
            return false;
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.tracked.insert(job.key, Tracked::Queued { sequence });
        self.heap.push(QueuedJob { job, sequence });
        self.queued += 1;
        true
    }

    /// Pop the highest-priority job if the controller grants a slot.
    ///
    /// The job's key moves to in-flight; call [`LoadQueue::complete`] once the
    /// load's completion has been handled.
    pub fn admit_next(
        &mut self,
        controller: &mut ConcurrencyController,
        now: Timestamp,
    ) -> Option<LoadJob> {
        self.discard_stale_head();
        if self.heap.is_empty() || !controller.try_admit(now) {
            return None;
        }

        let queued = self.heap.pop()?;
        self.queued -= 1;
        self.tracked.insert(queued.job.key, Tracked::InFlight);
        log::debug!(
            "admitting tile {} (priority {:.1}, {} queued)",
            queued.job.key,
            queued.job.priority,
            self.queued
        );
        Some(queued.job)
    }

    /// Forget an in-flight key after its completion was processed
    pub fn complete(&mut self, key: &TileKey) {
        if self.tracked.get(key) == Some(&Tracked::InFlight) {
            self.tracked.remove(key);
        }
    }

    /// Drop a queued (not yet admitted) job
    pub fn remove_queued(&mut self, key: &TileKey) -> bool {
        if let Some(Tracked::Queued { .. }) = self.tracked.get(key) {
            self.tracked.remove(key);
            self.queued -= 1;
            true
        } else {
            false
        }
    }

    /// Drop every queued job whose key fails `keep`; returns how many went
    pub fn retain_queued<F>(&mut self, mut keep: F) -> usize
    where
        F: FnMut(&TileKey) -> bool,
    {
        let doomed: Vec<TileKey> = self
            .tracked
            .iter()
            .filter(|(key, state)| matches!(state, Tracked::Queued { .. }) && !keep(*key))
            .map(|(key, _)| *key)
            .collect();
        for key in &doomed {
            self.remove_queued(key);
        }
        self.compact();
        doomed.len()
    }

    /// Drop all queued jobs; in-flight tracking is kept
    pub fn clear_queued(&mut self) {
        self.heap.clear();
        self.tracked.retain(|_, state| *state == Tracked::InFlight);
        self.queued = 0;
    }

    pub fn is_tracked(&self, key: &TileKey) -> bool {
        self.tracked.contains_key(key)
    }

    pub fn is_in_flight(&self, key: &TileKey) -> bool {
        self.tracked.get(key) == Some(&Tracked::InFlight)
    }

    pub fn queued_len(&self) -> usize {
        self.queued
    }

    pub fn in_flight_len(&self) -> usize {
        self.tracked.len() - self.queued
    }

    pub fn is_empty(&self) -> bool {
        self.queued == 0
    }

    /// Rebuild the heap once removed jobs outnumber live ones
    fn compact(&mut self) {
        if self.heap.len() <= 2 * self.queued {
            return;
        }
        let tracked = &self.tracked;
        self.heap.retain(|queued| {
            matches!(
                tracked.get(&queued.job.key),
                Some(Tracked::Queued { sequence }) if *sequence == queued.sequence
            )
        });
    }

    /// Pop heap entries that were removed or superseded since they were pushed
    fn discard_stale_head(&mut self) {
        while let Some(head) = self.heap.peek() {
            let live = matches!(
                self.tracked.get(&head.job.key),
                Some(Tracked::Queued { sequence }) if *sequence == head.sequence
            );
            if live {
                break;
            }
            self.heap.pop();
        }
    }
}
