//! Configuration for the tile cache and load scheduler
//!
//! Configuration is split the same way the engine is: `CacheConfig` holds the
//! scheduling and memory policy, `TileLayerOptions` describes the tile source.
//! Both deserialize from JSON and `CacheProfile` provides presets.

use crate::{core::constants, Error, Result};
use serde::{Deserialize, Serialize};

/// Coarse device capability signal, injected at construction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DeviceCapabilityClass {
    Low,
    #[default]
    Medium,
    High,
}

/// Concurrency cap for each device class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyCaps {
    pub low: usize,
    pub medium: usize,
    pub high: usize,
}

impl ConcurrencyCaps {
    pub fn for_class(&self, class: DeviceCapabilityClass) -> usize {
        match class {
            DeviceCapabilityClass::Low => self.low,
            DeviceCapabilityClass::Medium => self.medium,
            DeviceCapabilityClass::High => self.high,
        }
    }
}

impl Default for ConcurrencyCaps {
    fn default() -> Self {
        Self {
            low: 4,
            medium: 8,
            high: 12,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Eviction trigger point
    pub max_entries: usize,
    /// Staleness window for displayed tiles
    pub ttl_ms: u64,
    /// Per-load deadline
    pub load_timeout_ms: u64,
    pub device_class: DeviceCapabilityClass,
    pub max_concurrency: ConcurrencyCaps,
    /// Cap used while the viewport reports fast panning
    pub panning_boost_cap: usize,
    pub panning_boost_ms: u64,
    /// Separate budget for TTL refreshes
    pub refresh_concurrency: usize,
    /// Eviction score weights
    pub zoom_weight: f64,
    pub spatial_weight: f64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub exponential_backoff: bool,
    pub max_prefetch_tiles: usize,
    pub prefetch_adjacent_zooms: bool,
    /// Adapt the base cap to observed network condition
    pub network_adaptive: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheProfile::Balanced.resolve()
    }
}

impl CacheConfig {
    /// Base concurrency cap for the configured device class
    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency.for_class(self.device_class)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_entries == 0 {
            return Err(Error::InvalidConfig("max_entries must be non-zero".into()));
        }
        if self.load_timeout_ms == 0 {
            return Err(Error::InvalidConfig("load_timeout_ms must be non-zero".into()));
        }
        if self.max_concurrency() == 0 {
            return Err(Error::InvalidConfig(format!(
                "concurrency cap for {:?} devices must be non-zero",
                self.device_class
            )));
        }
        if self.zoom_weight < 0.0 || self.spatial_weight < 0.0 {
            return Err(Error::InvalidConfig("eviction weights must be non-negative".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CacheProfile {
    Balanced,
    LowMemory,
    HighPerformance,
    Custom(CacheConfig),
}

impl CacheProfile {
    pub fn resolve(&self) -> CacheConfig {
        match self {
            Self::Balanced => CacheConfig {
                max_entries: 512,
                ttl_ms: 5 * 60 * 1000,
                load_timeout_ms: 10_000,
                device_class: DeviceCapabilityClass::Medium,
                max_concurrency: ConcurrencyCaps::default(),
                panning_boost_cap: 16,
                panning_boost_ms: 500,
                refresh_concurrency: 2,
                zoom_weight: 1000.0,
                spatial_weight: 100.0,
                max_retries: 3,
                retry_delay_ms: 500,
                exponential_backoff: true,
                max_prefetch_tiles: 128,
                prefetch_adjacent_zooms: true,
                network_adaptive: true,
            },
            Self::LowMemory => CacheConfig {
                max_entries: 128,
                ttl_ms: 10 * 60 * 1000,
                load_timeout_ms: 15_000,
                device_class: DeviceCapabilityClass::Low,
                max_concurrency: ConcurrencyCaps::default(),
                panning_boost_cap: 6,
                panning_boost_ms: 300,
                refresh_concurrency: 1,
                zoom_weight: 1000.0,
                spatial_weight: 100.0,
                max_retries: 2,
                retry_delay_ms: 250,
                exponential_backoff: false,
                max_prefetch_tiles: 32,
                prefetch_adjacent_zooms: false,
                network_adaptive: true,
            },
            Self::HighPerformance => CacheConfig {
                max_entries: 2048,
                ttl_ms: 2 * 60 * 1000,
                load_timeout_ms: 8_000,
                device_class: DeviceCapabilityClass::High,
                max_concurrency: ConcurrencyCaps::default(),
                panning_boost_cap: 24,
                panning_boost_ms: 750,
                refresh_concurrency: 4,
                zoom_weight: 1000.0,
                spatial_weight: 100.0,
                max_retries: 5,
                retry_delay_ms: 1000,
                exponential_backoff: true,
                max_prefetch_tiles: 512,
                prefetch_adjacent_zooms: true,
                network_adaptive: true,
            },
            Self::Custom(config) => config.clone(),
        }
    }
}

impl Default for CacheProfile {
    fn default() -> Self {
        Self::Balanced
    }
}

/// Tile source description plus the cache policy it runs under
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TileLayerOptions {
    pub url_template: String,
    pub subdomains: Vec<String>,
    pub tile_size: u32,
    pub min_zoom: u8,
    pub max_zoom: u8,
    /// Disable column wrap-around (tiles outside the world are skipped)
    pub no_wrap: bool,
    /// Gates `{r}`/`{scale}` substitution
    pub supports_retina: bool,
    /// Fallback tile shown on terminal failure
    pub error_tile_url: Option<String>,
    pub opacity: f32,
    pub cache: CacheConfig,
}

impl Default for TileLayerOptions {
    fn default() -> Self {
        Self {
            url_template: constants::DEFAULT_URL_TEMPLATE.to_string(),
            subdomains: vec!["a".to_string(), "b".to_string(), "c".to_string()],
            tile_size: constants::TILE_SIZE,
            min_zoom: 0,
            max_zoom: 18,
            no_wrap: false,
            supports_retina: false,
            error_tile_url: None,
            opacity: 1.0,
            cache: CacheConfig::default(),
        }
    }
}

impl TileLayerOptions {
    pub fn from_json(json: &str) -> Result<Self> {
        let options: Self = serde_json::from_str(json)?;
        options.validate()?;
        Ok(options)
    }

    pub fn with_profile(mut self, profile: CacheProfile) -> Self {
        self.cache = profile.resolve();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.tile_size == 0 {
            return Err(Error::InvalidConfig("tile_size must be non-zero".into()));
        }
        if self.min_zoom > self.max_zoom || self.max_zoom > constants::MAX_ZOOM_LEVEL {
            return Err(Error::InvalidConfig(format!(
                "invalid zoom range {}..={}",
                self.min_zoom, self.max_zoom
            )));
        }
        self.cache.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_presets() {
        let balanced = CacheProfile::Balanced.resolve();
        let low = CacheProfile::LowMemory.resolve();
        let high = CacheProfile::HighPerformance.resolve();

        assert_eq!(balanced.max_concurrency(), 8);
        assert_eq!(low.max_concurrency(), 4);
        assert_eq!(high.max_concurrency(), 12);

        assert!(low.max_entries < balanced.max_entries);
        assert!(high.max_entries > balanced.max_entries);
        assert_eq!(balanced.zoom_weight, 1000.0);
        assert_eq!(balanced.spatial_weight, 100.0);
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let config = CacheConfig {
            max_entries: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_options_from_json_fills_defaults() {
        let options = TileLayerOptions::from_json(
            r#"{
                "url_template": "https://tiles.example.com/{z}/{x}/{y}{r}.png",
                "supports_retina": true,
                "cache": { "max_entries": 64, "ttl_ms": 1000, "device_class": "High" }
            }"#,
        )
        .unwrap();

        assert!(options.supports_retina);
        assert_eq!(options.tile_size, 256);
        assert_eq!(options.cache.max_entries, 64);
        assert_eq!(options.cache.ttl_ms, 1000);
        assert_eq!(options.cache.max_concurrency(), 12);
        assert_eq!(options.cache.load_timeout_ms, 10_000);
    }

    #[test]
    fn test_options_from_json_rejects_bad_zoom_range() {
        let result = TileLayerOptions::from_json(r#"{ "min_zoom": 10, "max_zoom": 3 }"#);
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }
}
