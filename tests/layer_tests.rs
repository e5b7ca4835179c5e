use async_trait::async_trait;
use maplet_tiles::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

/// Integration tests driving a whole tile layer on tokio with a scripted loader
#[cfg(test)]
mod layer_tests {
    use super::*;

    #[derive(Default)]
    struct MockLoader {
        delay_ms: u64,
        hang: bool,
        /// Loads whose URL contains this fail with a transport error
        fail_matching: Option<&'static str>,
        calls: AtomicUsize,
        active: AtomicUsize,
        max_active: AtomicUsize,
        tokens: Mutex<Vec<CancelToken>>,
    }

    struct ActiveGuard<'a>(&'a AtomicUsize);

    impl Drop for ActiveGuard<'_> {
        fn drop(&mut self) {
            self.0.fetch_sub(1, AtomicOrdering::SeqCst);
        }
    }

    #[async_trait]
    impl TileLoader for MockLoader {
        async fn load(
            &self,
            url: &str,
            _key: TileKey,
            cancel: &CancelToken,
        ) -> std::result::Result<TileResource, LoadError> {
            let call = self.calls.fetch_add(1, AtomicOrdering::SeqCst) + 1;
            self.tokens.lock().unwrap().push(cancel.clone());
            let active = self.active.fetch_add(1, AtomicOrdering::SeqCst) + 1;
            self.max_active.fetch_max(active, AtomicOrdering::SeqCst);
            let _guard = ActiveGuard(&self.active);

            if self.hang {
                futures::future::pending::<()>().await;
            }
            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            if self.fail_matching.is_some_and(|pattern| url.contains(pattern)) {
                return Err(LoadError::Transport("HTTP 503".into()));
            }
            Ok(TileResource::new(1, 1, vec![call as u8; 4]))
        }
    }

    fn options() -> TileLayerOptions {
        let mut options = TileLayerOptions {
            url_template: "https://t/{z}/{x}/{y}.png".into(),
            ..Default::default()
        };
        options.cache.network_adaptive = false;
        options.cache.max_prefetch_tiles = 0;
        options
    }

    /// 2x2 tiles at zoom 4
    fn viewport() -> ViewportState {
        ViewportState::new(Point::new(8.0, 8.0), 4, Point::new(512.0, 512.0))
    }

    /// Poll until `done` holds, giving the spawned loads time to run
    async fn settle<F>(layer: &mut TileLayer, done: F) -> bool
    where
        F: Fn(&TileLayer) -> bool,
    {
        for _ in 0..400 {
            layer.poll();
            if done(layer) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    struct CountingCanvas(usize);

    impl TileCanvas for CountingCanvas {
        fn draw_tile(&mut self, _: TileKey, _: &TileResource, _: (Point, Point), _: f32) {
            self.0 += 1;
        }
    }

    #[tokio::test]
    async fn test_tiles_load_render_and_notify() {
        let loader = Arc::new(MockLoader::default());
        let mut layer = TileLayer::new(options(), loader.clone()).unwrap();
        let loads = Arc::new(Mutex::new(Vec::new()));
        let loads_clone = loads.clone();
        layer.on("tileload", move |event| loads_clone.lock().unwrap().push(event.key()));

        layer.request_tiles(&viewport());
        assert!(settle(&mut layer, |l| l.stats().loaded == 4).await);

        let mut canvas = CountingCanvas(0);
        assert_eq!(layer.render(&mut canvas), 4);
        assert_eq!(canvas.0, 4);
        assert_eq!(loads.lock().unwrap().len(), 4);
        assert_eq!(layer.loading_count(), 0);
    }

    #[tokio::test]
    async fn test_repeated_requests_load_each_tile_once() {
        let loader = Arc::new(MockLoader {
            delay_ms: 20,
            ..Default::default()
        });
        let mut layer = TileLayer::new(options(), loader.clone()).unwrap();

        for _ in 0..10 {
            layer.request_tiles(&viewport());
        }
        assert!(settle(&mut layer, |l| l.stats().loaded == 4).await);
        for _ in 0..10 {
            layer.request_tiles(&viewport());
        }
        assert_eq!(loader.calls.load(AtomicOrdering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_concurrency_cap_holds_under_load() {
        let mut options = options();
        options.cache.max_concurrency.medium = 2;
        let loader = Arc::new(MockLoader {
            delay_ms: 15,
            ..Default::default()
        });
        let mut layer = TileLayer::new(options, loader.clone()).unwrap();

        // 4x4 tiles
        let big = ViewportState::new(Point::new(8.0, 8.0), 4, Point::new(1024.0, 1024.0));
        layer.request_tiles(&big);
        assert!(settle(&mut layer, |l| l.stats().loaded == 16).await);
        assert!(loader.max_active.load(AtomicOrdering::SeqCst) <= 2);
        assert_eq!(loader.calls.load(AtomicOrdering::SeqCst), 16);
    }

    #[tokio::test]
    async fn test_hanging_loads_time_out() {
        let mut options = options();
        options.cache.load_timeout_ms = 30;
        let loader = Arc::new(MockLoader {
            hang: true,
            ..Default::default()
        });
        let mut layer = TileLayer::new(options, loader.clone()).unwrap();

        layer.request_tiles(&viewport());
        assert!(settle(&mut layer, |l| l.stats().loads_timed_out == 4).await);
        assert_eq!(layer.cache_len(), 0);
        assert_eq!(layer.stats().in_flight, 0);

        // timed-out tiles are requested again on the next pass
        layer.request_tiles(&viewport());
        assert!(settle(&mut layer, |_| loader.calls.load(AtomicOrdering::SeqCst) == 8).await);
    }

    #[tokio::test]
    async fn test_eviction_cancels_pending_loads() {
        let mut options = options();
        options.cache.max_entries = 4;
        let loader = Arc::new(MockLoader {
            hang: true,
            ..Default::default()
        });
        let mut layer = TileLayer::new(options, loader.clone()).unwrap();

        layer.request_tiles(&viewport());
        assert!(settle(&mut layer, |_| loader.calls.load(AtomicOrdering::SeqCst) == 4).await);
        let old_keys: Vec<TileKey> = layer.render_set().iter().map(|t| t.key).collect();
        let elsewhere = ViewportState::new(Point::new(2.0, 2.0), 4, Point::new(512.0, 512.0));
        layer.request_tiles(&elsewhere);
        assert!(settle(&mut layer, |_| loader.calls.load(AtomicOrdering::SeqCst) == 8).await);
        assert_eq!(layer.cache_len(), 8);

        layer.idle_tick();
        assert_eq!(layer.cache_len(), 4);
        assert!(old_keys.iter().all(|key| !layer.cache().contains(key)));

        assert!(settle(&mut layer, |l| l.stats().loads_cancelled == 4).await);
        let cancelled = loader
            .tokens
            .lock()
            .unwrap()
            .iter()
            .filter(|token| token.is_cancelled())
            .count();
        assert_eq!(cancelled, 4);
        // the cancelled loads never came back into the cache
        assert!(old_keys.iter().all(|key| !layer.cache().contains(key)));
        assert_eq!(layer.stats().in_flight, 4);
    }

    #[tokio::test]
    async fn test_stale_tiles_refresh_in_place() {
        let mut options = options();
        options.cache.ttl_ms = 1000;
        let clock = ManualClock::new(0);
        let loader = Arc::new(MockLoader::default());
        let mut layer =
            TileLayer::with_clock(options, loader.clone(), Arc::new(clock.clone())).unwrap();

        layer.request_tiles(&viewport());
        assert!(settle(&mut layer, |l| l.stats().loaded == 4).await);

        clock.set(999);
        layer.request_tiles(&viewport());
        assert_eq!(layer.stats().refreshing, 0);

        clock.set(1001);
        layer.request_tiles(&viewport());
        // refreshes have their own budget of two
        assert_eq!(layer.stats().refreshing, 2);
        assert_eq!(layer.stats().in_flight, 0);
        assert!(settle(&mut layer, |l| l.stats().refreshed == 2).await);

        layer.request_tiles(&viewport());
        assert!(settle(&mut layer, |l| l.stats().refreshed == 4).await);
        for tile in layer.render_set() {
            let entry = layer.cache().peek(&tile.key).unwrap();
            assert_eq!(entry.loaded_at, 1001);
            assert_eq!(entry.state, TileState::Loaded);
        }
        assert_eq!(loader.calls.load(AtomicOrdering::SeqCst), 8);
    }

    #[tokio::test]
    async fn test_failed_tiles_show_error_tile() {
        let mut options = options();
        options.error_tile_url = Some("https://t/error.png".into());
        let loader = Arc::new(MockLoader {
            fail_matching: Some("/4/"),
            ..Default::default()
        });
        let mut layer = TileLayer::new(options, loader.clone()).unwrap();
        let errors = Arc::new(AtomicUsize::new(0));
        let errors_clone = errors.clone();
        layer.on("tileerror", move |_| {
            errors_clone.fetch_add(1, AtomicOrdering::SeqCst);
        });

        layer.request_tiles(&viewport());
        assert!(settle(&mut layer, |l| l.stats().failed == 4).await);
        assert_eq!(errors.load(AtomicOrdering::SeqCst), 4);

        let mut drawn = 0;
        for _ in 0..400 {
            layer.poll();
            drawn = layer.render(&mut CountingCanvas(0));
            if drawn == 4 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(drawn, 4);
    }

    #[tokio::test]
    async fn test_scheduled_prefetch_waits_for_its_delay() {
        let mut options = options();
        options.cache.max_prefetch_tiles = 64;
        let loader = Arc::new(MockLoader::default());
        let mut layer = TileLayer::new(options, loader.clone()).unwrap();

        let destination = ViewportState::new(Point::new(32.0, 32.0), 6, Point::new(512.0, 512.0));
        layer.schedule_prefetch(&destination, 50);
        layer.idle_tick();
        assert_eq!(layer.cache_len(), 0);

        tokio::time::sleep(Duration::from_millis(60)).await;
        layer.idle_tick();
        assert!(layer.loading_count() > 0);

        let target = TileKey::new(6, 31, 31);
        assert!(
            settle(&mut layer, |l| {
                l.cache().peek(&target).map(|e| e.state) == Some(TileState::Loaded)
            })
            .await
        );
    }

    #[tokio::test]
    async fn test_idle_view_settles_without_reloading() {
        let mut options = options();
        options.cache.max_entries = 20;
        options.cache.max_prefetch_tiles = 64;
        let loader = Arc::new(MockLoader::default());
        let mut layer = TileLayer::new(options, loader.clone()).unwrap();

        layer.request_tiles(&viewport());
        assert!(settle(&mut layer, |l| l.stats().loaded == 4).await);

        let mut loads_per_tick = Vec::new();
        for _ in 0..6 {
            let before = loader.calls.load(AtomicOrdering::SeqCst);
            layer.idle_tick();
            assert!(settle(&mut layer, |l| l.loading_count() == 0).await);
            loads_per_tick.push(loader.calls.load(AtomicOrdering::SeqCst) - before);
        }

        assert_eq!(loads_per_tick[0], 16);
        assert!(loads_per_tick[1..].iter().all(|&loads| loads == 0));
        assert_eq!(layer.cache_len(), 20);
        assert_eq!(layer.stats().evicted, 0);
    }

    #[tokio::test]
    async fn test_clear_drops_everything() {
        let loader = Arc::new(MockLoader {
            hang: true,
            ..Default::default()
        });
        let mut layer = TileLayer::new(options(), loader.clone()).unwrap();
        layer.request_tiles(&viewport());
        layer.clear();

        assert_eq!(layer.cache_len(), 0);
        assert!(settle(&mut layer, |l| l.stats().in_flight == 0).await);
        assert_eq!(layer.loading_count(), 0);
    }
}
