//! Core TileLayer implementation
//!
//! The layer owns the cache, the load queue and both concurrency budgets.
//! Loads run as spawned tasks and report back over a channel; every state
//! change happens on the owner's side, inside `request_tiles`, `poll` or
//! `idle_tick`.

use super::{
    cache::{BoundedCache, TileEntry, TileResource, TileState},
    cancel::CancelToken,
    concurrency::{ConcurrencyController, NetworkCondition},
    eviction::{buffer_tiles, protected_set, EvictionPlanner},
    events::{TileEvent, TileEventManager},
    key::{AddressSpace, GridTile, TileKey, TileRange},
    loader::{guarded_load, LoadError, TileLoader},
    prefetch::{self, Prefetcher},
    queue::{LoadJob, LoadQueue, TilePriority},
    refresh::{RefreshJob, RefreshOutcome, TtlRefresher},
    source::UrlTemplate,
};
use crate::core::{
    clock::{Clock, SystemClock, Timestamp},
    config::{CacheConfig, TileLayerOptions},
    geo::Point,
    viewport::ViewportState,
};
use crate::prelude::{Arc, Duration};
use crate::{runtime, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::Serialize;

/// Drawing surface handed to [`TileLayer::render`]
pub trait TileCanvas {
    /// Draw `resource` into the screen rectangle `bounds` (min, max corners)
    fn draw_tile(&mut self, key: TileKey, resource: &TileResource, bounds: (Point, Point), opacity: f32);
}

/// Snapshot of the layer's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LayerStats {
    pub cached: usize,
    pub loaded: usize,
    pub pending: usize,
    pub failed: usize,
    pub queued: usize,
    pub in_flight: usize,
    pub refreshing: usize,
    pub concurrency_cap: usize,
    pub loads_started: u64,
    pub loads_completed: u64,
    pub loads_failed: u64,
    pub loads_timed_out: u64,
    pub loads_cancelled: u64,
    pub refreshed: u64,
    pub evicted: u64,
}

enum Completion {
    Tile {
        key: TileKey,
        url: String,
        token: CancelToken,
        started_at: Timestamp,
        result: std::result::Result<TileResource, LoadError>,
    },
    Refresh {
        key: TileKey,
        token: CancelToken,
        result: std::result::Result<TileResource, LoadError>,
    },
    ErrorTile {
        result: std::result::Result<TileResource, LoadError>,
    },
}

#[derive(Debug, Clone)]
enum ErrorTile {
    Disabled,
    Idle(String),
    Loading,
    Ready(TileResource),
    Unavailable,
}

pub struct TileLayer {
    pub(crate) options: TileLayerOptions,
    pub(crate) template: UrlTemplate,
    pub(crate) space: AddressSpace,
    loader: Arc<dyn TileLoader>,
    clock: Arc<dyn Clock>,

    pub(crate) cache: BoundedCache,
    pub(crate) queue: LoadQueue,
    pub(crate) controller: ConcurrencyController,
    pub(crate) refresher: TtlRefresher,
    pub(crate) prefetcher: Prefetcher,
    pub(crate) planner: EvictionPlanner,
    events: TileEventManager,

    completions_tx: Sender<Completion>,
    completions_rx: Receiver<Completion>,

    /// Last viewport passed to `request_tiles`, after zoom clamping
    pub(crate) viewport: Option<ViewportState>,
    /// Grid tiles drawn by `render`, with unwrapped columns
    pub(crate) render_set: Vec<GridTile>,
    error_tile: ErrorTile,
    stats: LayerStats,
}

impl TileLayer {
    pub fn new(options: TileLayerOptions, loader: Arc<dyn TileLoader>) -> Result<Self> {
        Self::with_clock(options, loader, Arc::new(SystemClock::new()))
    }

    /// Tile layer fetching over HTTP with the default loader
    #[cfg(feature = "http")]
    pub fn http(options: TileLayerOptions) -> Result<Self> {
        Self::new(options, Arc::new(super::loader::HttpTileLoader::new()))
    }

    pub fn with_clock(
        options: TileLayerOptions,
        loader: Arc<dyn TileLoader>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        options.validate()?;
        let template = UrlTemplate::new(
            &options.url_template,
            options.subdomains.clone(),
            options.supports_retina,
        )?;
        let space = AddressSpace::new(!options.no_wrap, options.min_zoom, options.max_zoom);
        let config = &options.cache;
        let (completions_tx, completions_rx) = unbounded();
        let error_tile = match &options.error_tile_url {
            Some(url) => ErrorTile::Idle(url.clone()),
            None => ErrorTile::Disabled,
        };

        log::info!(
            "tile layer {} ({} entries, {} loads at a time)",
            template.as_str(),
            config.max_entries,
            config.max_concurrency()
        );

        Ok(Self {
            cache: BoundedCache::with_capacity(config.max_entries),
            queue: LoadQueue::new(),
            controller: ConcurrencyController::from_config(config),
            refresher: TtlRefresher::from_config(config),
            prefetcher: Prefetcher::from_config(config),
            planner: EvictionPlanner::from_config(config),
            events: TileEventManager::new(),
            completions_tx,
            completions_rx,
            viewport: None,
            render_set: Vec::new(),
            error_tile,
            stats: LayerStats::default(),
            template,
            space,
            loader,
            clock,
            options,
        })
    }

    pub fn options(&self) -> &TileLayerOptions {
        &self.options
    }

    fn config(&self) -> &CacheConfig {
        &self.options.cache
    }

    /// Bring the layer in line with `viewport`: commit finished loads, queue
    /// the missing tiles of the render set, start due refreshes and admit
    /// as many loads as the concurrency cap allows.
    pub fn request_tiles(&mut self, viewport: &ViewportState) {
        let now = self.clock.now();
        self.process_completions(now);

        let viewport = self.clamp_viewport(viewport);
        if let Some(previous) = self.viewport {
            if previous.zoom.abs_diff(viewport.zoom) > 1 {
                let zoom = viewport.zoom;
                let dropped = self.queue.retain_queued(|key| key.z.abs_diff(zoom) <= 1);
                if dropped > 0 {
                    log::debug!("zoom {} -> {}: dropped {} queued loads", previous.zoom, zoom, dropped);
                }
            }
        }
        self.viewport = Some(viewport);

        if viewport.panning_fast {
            let (cap, duration) = (self.config().panning_boost_cap, self.config().panning_boost_ms);
            self.controller.boost(cap, duration, now);
        }

        let range = TileRange::from_viewport(&viewport, self.options.tile_size);
        self.render_set = self.space.enumerate(&range);

        let mut jobs = Vec::new();
        for tile in &self.render_set {
            self.cache.touch(&tile.key, now);
            if needs_load(&self.cache, &self.queue, self.config(), &tile.key, now) {
                let target = prefetch::target(tile, &viewport, TilePriority::Visible);
                jobs.push(self.job(target.key, target.priority, viewport.dpr));
            }
        }
        for job in jobs {
            self.queue.enqueue(job, &self.cache);
        }

        let refreshes = self
            .refresher
            .collect(&mut self.cache, self.render_set.iter().map(|t| &t.key), now);
        for job in refreshes {
            self.spawn_refresh(job);
        }

        self.pump(now);
    }

    /// Draw every displayable tile of the render set. Failed tiles are drawn
    /// with the error tile once it has loaded. Returns the number drawn.
    pub fn render(&mut self, canvas: &mut dyn TileCanvas) -> usize {
        let Some(viewport) = self.viewport else {
            return 0;
        };
        let now = self.clock.now();
        let error_tile = match &self.error_tile {
            ErrorTile::Ready(resource) => Some(resource.clone()),
            _ => None,
        };

        let mut drawn = 0;
        for tile in &self.render_set {
            let Some(view) = self.cache.get(&tile.key, now) else {
                continue;
            };
            let resource = match view.state {
                TileState::Loaded => view.resource,
                TileState::Failed => error_tile.clone(),
                TileState::Pending => None,
            };
            if let Some(resource) = resource {
                let bounds = viewport.tile_screen_bounds(tile.grid_x, tile.grid_y, self.options.tile_size);
                canvas.draw_tile(tile.key, &resource, bounds, self.options.opacity);
                drawn += 1;
            }
        }
        drawn
    }

    /// Loads queued or running, for "loading" indicators
    pub fn loading_count(&self) -> usize {
        self.queue.queued_len() + self.queue.in_flight_len()
    }

    /// Drain finished loads and admit queued ones. Returns how many
    /// completions were handled.
    pub fn poll(&mut self) -> usize {
        let now = self.clock.now();
        let handled = self.process_completions(now);
        self.pump(now);
        handled
    }

    /// Low-priority upkeep for idle time: eviction, then prefetch (a
    /// scheduled one once due, otherwise around the current view). Prefetch
    /// only fills cache room that is free, so it never feeds the next eviction.
    pub fn idle_tick(&mut self) {
        let now = self.clock.now();
        self.process_completions(now);
        self.evict_if_needed();

        if let Some(destination) = self.prefetcher.take_due(now) {
            self.prefetch(&destination, true, now);
        } else if !self.prefetcher.has_pending() {
            if let Some(viewport) = self.viewport {
                self.prefetch(&viewport, false, now);
            }
        }

        self.pump(now);
    }

    /// Evict down to `max_entries`, sparing the current view and its buffer.
    /// Returns the number of evicted entries.
    pub fn evict_if_needed(&mut self) -> usize {
        let max_entries = self.config().max_entries;
        if !self.cache.is_over(max_entries) {
            return 0;
        }
        let Some(viewport) = self.viewport else {
            return 0;
        };

        let buffer = buffer_tiles(viewport.zoom, self.config().device_class, viewport.panning_fast);
        let protected = protected_set(&self.space, &viewport, self.options.tile_size, buffer);
        let evicted = self
            .planner
            .evict(&self.space, &mut self.cache, max_entries, &protected, &viewport);

        if !evicted.is_empty() {
            log::debug!("evicted {} tiles, {} cached", evicted.len(), self.cache.len());
        }
        self.stats.evicted += evicted.len() as u64;
        evicted.len()
    }

    /// Prefetch around `viewport` after `delay_ms` (run from `idle_tick`).
    /// A later call replaces a pending one.
    pub fn schedule_prefetch(&mut self, viewport: &ViewportState, delay_ms: u64) {
        let now = self.clock.now();
        let viewport = self.clamp_viewport(viewport);
        self.prefetcher.schedule(viewport, delay_ms, now);
    }

    /// Temporarily raise the concurrency cap
    pub fn boost(&mut self, cap: usize, duration_ms: u64) {
        let now = self.clock.now();
        self.controller.boost(cap, duration_ms, now);
        self.pump(now);
    }

    /// Drop every tile and queued load; in-flight loads are cancelled
    pub fn clear(&mut self) {
        let entries = self.cache.drain();
        for (_, entry) in &entries {
            entry.cancel_loads();
        }
        self.queue.clear_queued();
        self.prefetcher.cancel_pending();
        self.render_set.clear();
        log::info!("tile layer cleared ({} tiles dropped)", entries.len());
    }

    /// Listen to every tile event
    pub fn subscribe<F>(&mut self, listener: F)
    where
        F: Fn(&TileEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(listener);
    }

    /// Listen to `"tileload"` or `"tileerror"`
    pub fn on<F>(&mut self, event_type: &str, listener: F)
    where
        F: Fn(&TileEvent) + Send + Sync + 'static,
    {
        self.events.on(event_type, listener);
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub fn cache(&self) -> &BoundedCache {
        &self.cache
    }

    pub fn render_set(&self) -> &[GridTile] {
        &self.render_set
    }

    pub fn network_condition(&self) -> Option<NetworkCondition> {
        self.controller.network_condition()
    }

    pub fn stats(&self) -> LayerStats {
        LayerStats {
            cached: self.cache.len(),
            loaded: self.cache.count_in_state(TileState::Loaded),
            pending: self.cache.count_in_state(TileState::Pending),
            failed: self.cache.count_in_state(TileState::Failed),
            queued: self.queue.queued_len(),
            in_flight: self.controller.in_flight(),
            refreshing: self.refresher.in_flight(),
            concurrency_cap: self.controller.effective_cap(self.clock.now()),
            ..self.stats
        }
    }

    fn clamp_viewport(&self, viewport: &ViewportState) -> ViewportState {
        let zoom = self.space.clamp_zoom(viewport.zoom);
        if zoom == viewport.zoom {
            *viewport
        } else {
            viewport.at_zoom(zoom)
        }
    }

    fn job(&self, key: TileKey, priority: f64, dpr: f64) -> LoadJob {
        let (url, retina_scale) = self.template.url(&key, dpr);
        LoadJob::new(key, url, priority).with_retina_scale(retina_scale)
    }

    /// Cache slots left for prefetching: queued jobs count as occupied since
    /// each becomes an entry once admitted
    fn prefetch_room(&self) -> usize {
        self.config()
            .max_entries
            .saturating_sub(self.cache.len() + self.queue.queued_len())
    }

    fn prefetch(&mut self, viewport: &ViewportState, destination: bool, now: Timestamp) {
        let room = self.prefetch_room();
        if room == 0 {
            return;
        }
        let viewport = self.clamp_viewport(viewport);
        let buffer = buffer_tiles(viewport.zoom, self.config().device_class, viewport.panning_fast);
        let skip = |key: &TileKey| !needs_load(&self.cache, &self.queue, self.config(), key, now);

        let targets = if destination {
            self.prefetcher
                .plan_destination(&self.space, &viewport, self.options.tile_size, buffer, skip)
        } else {
            self.prefetcher
                .plan(&self.space, &viewport, self.options.tile_size, buffer, skip)
        };

        let jobs: Vec<LoadJob> = targets
            .iter()
            .take(room)
            .map(|t| self.job(t.key, t.priority, viewport.dpr))
            .collect();
        let mut accepted = 0;
        for job in jobs {
            if self.queue.enqueue(job, &self.cache) {
                accepted += 1;
            }
        }
        if accepted > 0 {
            log::debug!("prefetching {} tiles around zoom {}", accepted, viewport.zoom);
        }
    }

    /// Admit queued jobs while the controller has slots
    fn pump(&mut self, now: Timestamp) {
        while let Some(job) = self.queue.admit_next(&mut self.controller, now) {
            self.spawn_load(job, now);
        }
    }

    fn spawn_load(&mut self, job: LoadJob, now: Timestamp) {
        let token = CancelToken::new();
        let retrying = self
            .cache
            .peek(&job.key)
            .is_some_and(|entry| entry.state == TileState::Failed);
        if retrying {
            if let Some(entry) = self.cache.get_mut(&job.key) {
                entry.mark_pending(job.url.clone(), token.clone());
            }
        } else {
            self.cache
                .put(job.key, TileEntry::pending(job.url.clone(), token.clone(), now));
        }
        self.stats.loads_started += 1;

        let loader = self.loader.clone();
        let tx = self.completions_tx.clone();
        let timeout = Duration::from_millis(self.config().load_timeout_ms);
        let LoadJob { key, url, .. } = job;

        runtime::spawn(async move {
            let result = guarded_load(loader.as_ref(), &url, key, &token, timeout).await;
            let _ = tx.send(Completion::Tile {
                key,
                url,
                token,
                started_at: now,
                result,
            });
        });
    }

    fn spawn_refresh(&mut self, job: RefreshJob) {
        let loader = self.loader.clone();
        let tx = self.completions_tx.clone();
        let timeout = Duration::from_millis(self.config().load_timeout_ms);
        let RefreshJob { key, url, token } = job;

        runtime::spawn(async move {
            let result = guarded_load(loader.as_ref(), &url, key, &token, timeout).await;
            let _ = tx.send(Completion::Refresh { key, token, result });
        });
    }

    fn ensure_error_tile(&mut self, key: TileKey) {
        let ErrorTile::Idle(url) = &self.error_tile else {
            return;
        };
        let url = url.clone();
        self.error_tile = ErrorTile::Loading;

        let loader = self.loader.clone();
        let tx = self.completions_tx.clone();
        let timeout = Duration::from_millis(self.config().load_timeout_ms);
        runtime::spawn(async move {
            let token = CancelToken::new();
            let result = guarded_load(loader.as_ref(), &url, key, &token, timeout).await;
            let _ = tx.send(Completion::ErrorTile { result });
        });
    }

    fn process_completions(&mut self, now: Timestamp) -> usize {
        let mut handled = 0;
        while let Ok(completion) = self.completions_rx.try_recv() {
            handled += 1;
            match completion {
                Completion::Tile {
                    key,
                    url,
                    token,
                    started_at,
                    result,
                } => self.commit_load(key, url, token, started_at, result, now),
                Completion::Refresh { key, token, result } => {
                    let outcome = self.refresher.complete(&mut self.cache, &key, &token, result, now);
                    if outcome == RefreshOutcome::Refreshed {
                        self.stats.refreshed += 1;
                    }
                }
                Completion::ErrorTile { result } => {
                    self.error_tile = match result {
                        Ok(resource) => ErrorTile::Ready(resource),
                        Err(error) => {
                            log::warn!("error tile unavailable: {}", error);
                            ErrorTile::Unavailable
                        }
                    };
                }
            }
        }

        if handled > 0 {
            self.events.process_events();
        }
        handled
    }

    fn commit_load(
        &mut self,
        key: TileKey,
        url: String,
        token: CancelToken,
        started_at: Timestamp,
        result: std::result::Result<TileResource, LoadError>,
        now: Timestamp,
    ) {
        self.controller.release();
        self.queue.complete(&key);

        let owns_entry = self
            .cache
            .peek(&key)
            .and_then(|entry| entry.cancel.as_ref())
            .is_some_and(|current| current.same_load(&token));
        if !owns_entry || token.is_cancelled() {
            log::debug!("discarding superseded load of tile {}", key);
            self.stats.loads_cancelled += 1;
            if owns_entry {
                self.cache.remove(&key);
            }
            return;
        }

        match result {
            Ok(resource) => {
                if let Some(entry) = self.cache.get_mut(&key) {
                    entry.mark_loaded(resource, now);
                }
                self.controller.record_success(now.saturating_sub(started_at), now);
                self.stats.loads_completed += 1;
                self.events.emit(TileEvent::Load { key, url });
            }
            Err(LoadError::Cancelled) => {
                self.cache.remove(&key);
                self.stats.loads_cancelled += 1;
            }
            Err(LoadError::Timeout) => {
                log::warn!("tile {} timed out", key);
                // a timed-out retry stays failed so its backoff keeps counting
                let retrying = self.cache.peek(&key).is_some_and(|entry| entry.retry_count > 0);
                if retrying {
                    if let Some(entry) = self.cache.get_mut(&key) {
                        entry.mark_failed(now);
                    }
                } else {
                    self.cache.remove(&key);
                }
                self.controller.record_failure(now);
                self.stats.loads_timed_out += 1;
            }
            Err(error) => {
                log::warn!("tile {} failed: {}", key, error);
                self.controller.record_failure(now);
                self.stats.loads_failed += 1;

                if matches!(self.error_tile, ErrorTile::Disabled) {
                    self.cache.remove(&key);
                } else {
                    if let Some(entry) = self.cache.get_mut(&key) {
                        entry.mark_failed(now);
                    }
                    self.ensure_error_tile(key);
                }
                self.events.emit(TileEvent::Error { key, url, error });
            }
        }
    }
}

/// Whether `key` should get a new load: not cached, not queued or running,
/// and (if it failed before) past its retry backoff
fn needs_load(
    cache: &BoundedCache,
    queue: &LoadQueue,
    config: &CacheConfig,
    key: &TileKey,
    now: Timestamp,
) -> bool {
    if queue.is_tracked(key) {
        return false;
    }
    match cache.peek(key) {
        None => true,
        Some(entry) if entry.state == TileState::Failed => entry.should_retry(
            now,
            config.max_retries,
            config.retry_delay_ms,
            config.exponential_backoff,
        ),
        Some(_) => false,
    }
}

impl Drop for TileLayer {
    fn drop(&mut self) {
        for (_, entry) in self.cache.iter() {
            entry.cancel_loads();
        }
    }
}

impl std::fmt::Debug for TileLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileLayer")
            .field("template", &self.template.as_str())
            .field("cached", &self.cache.len())
            .field("queued", &self.queue.queued_len())
            .field("in_flight", &self.queue.in_flight_len())
            .finish()
    }
}
