//! # maplet-tiles
//!
//! Tile cache and load scheduler for raster map layers.
//!
//! The engine keeps a bounded cache of image tiles keyed by zoom/column/row,
//! deduplicates and prioritizes their loads, adapts load concurrency to the
//! device and the network, evicts tiles the viewport no longer needs, refreshes
//! stale tiles in the background and prefetches around the view. Drawing and
//! projection stay outside: the viewport owner hands in a [`ViewportState`]
//! every frame and a [`TileCanvas`] to draw into.

pub mod core;
pub mod prelude;
pub mod runtime;
pub mod tiles;
pub use crate::core::constants;

// Re-export public API
pub use crate::core::{
    clock::{Clock, ManualClock, SystemClock, Timestamp},
    config::{CacheConfig, CacheProfile, DeviceCapabilityClass, TileLayerOptions},
    geo::{lat_lng_to_tile, tile_to_lat_lng, LatLng, Point},
    viewport::ViewportState,
};

pub use tiles::{
    cache::{BoundedCache, TileEntry, TileResource, TileState},
    cancel::CancelToken,
    events::TileEvent,
    key::TileKey,
    layer::{LayerStats, TileCanvas, TileLayer},
    loader::{LoadError, TileLoader},
};

#[cfg(feature = "http")]
pub use tiles::loader::HttpTileLoader;

/// Result type used throughout the library
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid URL template: {0}")]
    InvalidTemplate(String),

    #[error("Parse error: {0}")]
    ParseError(String),
}

/// Install `env_logger` as the `log` backend (honours `RUST_LOG`).
#[cfg(feature = "debug")]
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .is_test(cfg!(test))
        .try_init();
}
