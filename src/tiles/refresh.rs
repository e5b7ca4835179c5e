//! Background refresh of displayed tiles that outlived their TTL
//!
//! A stale tile keeps being drawn while its replacement loads. Refreshes run on
//! their own small concurrency budget so they never take a first-load slot.

use super::{
    cache::{BoundedCache, TileEntry, TileResource},
    cancel::CancelToken,
    concurrency::ConcurrencyController,
    key::TileKey,
    loader::LoadError,
};
use crate::core::{clock::Timestamp, config::CacheConfig};

/// A refresh admitted against the refresh budget, ready to be spawned
#[derive(Debug, Clone)]
pub struct RefreshJob {
    pub key: TileKey,
    pub url: String,
    pub token: CancelToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed,
    /// Reload failed; the stale image stays and the tile backs off for a TTL
    Kept,
    /// Entry gone, replaced, or refresh cancelled
    Discarded,
}

#[derive(Debug)]
pub struct TtlRefresher {
    ttl_ms: u64,
    controller: ConcurrencyController,
}

impl TtlRefresher {
    pub fn new(ttl_ms: u64, concurrency: usize) -> Self {
        Self {
            ttl_ms,
            controller: ConcurrencyController::new(concurrency),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.ttl_ms, config.refresh_concurrency)
    }

    pub fn ttl_ms(&self) -> u64 {
        self.ttl_ms
    }

    pub fn in_flight(&self) -> usize {
        self.controller.in_flight()
    }

    /// Stale, not already refreshing, and not failed a refresh within the last TTL
    pub fn is_due(&self, entry: &TileEntry, now: Timestamp) -> bool {
        entry.is_stale(now, self.ttl_ms)
            && entry.refresh.is_none()
            && entry
                .refresh_attempted_at
                .map_or(true, |at| now.saturating_sub(at) > self.ttl_ms)
    }

    /// Admit refreshes for the due tiles among `render_set`, as many as the
    /// budget allows. Each admitted entry records its refresh token.
    pub fn collect<'a, I>(&mut self, cache: &mut BoundedCache, render_set: I, now: Timestamp) -> Vec<RefreshJob>
    where
        I: IntoIterator<Item = &'a TileKey>,
    {
        let mut jobs = Vec::new();
        for key in render_set {
            let Some(entry) = cache.get_mut(key) else {
                continue;
            };
            if !self.is_due(entry, now) {
                continue;
            }
            if !self.controller.try_admit(now) {
                break;
            }

            let token = CancelToken::new();
            entry.refresh = Some(token.clone());
            log::debug!("refreshing stale tile {} (loaded at {})", key, entry.loaded_at);
            jobs.push(RefreshJob {
                key: *key,
                url: entry.url.clone(),
                token,
            });
        }
        jobs
    }

    /// Apply a finished refresh. The slot is released whatever the outcome;
    /// the entry changes only if it still waits on this very refresh.
    pub fn complete(
        &mut self,
        cache: &mut BoundedCache,
        key: &TileKey,
        token: &CancelToken,
        result: Result<TileResource, LoadError>,
        now: Timestamp,
    ) -> RefreshOutcome {
        self.controller.release();

        let Some(entry) = cache.get_mut(key) else {
            return RefreshOutcome::Discarded;
        };
        let current = entry.refresh.as_ref().is_some_and(|t| t.same_load(token));
        if !current {
            return RefreshOutcome::Discarded;
        }
        if token.is_cancelled() {
            entry.refresh = None;
            return RefreshOutcome::Discarded;
        }

        match result {
            Ok(resource) => {
                entry.mark_refreshed(resource, now);
                RefreshOutcome::Refreshed
            }
            Err(LoadError::Cancelled) => {
                entry.refresh = None;
                RefreshOutcome::Discarded
            }
            Err(error) => {
                log::warn!("refresh of tile {} failed, keeping stale image: {}", key, error);
                entry.refresh = None;
                entry.refresh_attempted_at = Some(now);
                RefreshOutcome::Kept
            }
        }
    }
}
