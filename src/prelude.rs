//! Prelude module for common maplet-tiles types and traits
//!
//! This module re-exports the most commonly used types, traits, and functions
//! for easy importing with `use maplet_tiles::prelude::*;`

pub use crate::core::{
    clock::{Clock, ManualClock, SystemClock, Timestamp},
    config::{CacheConfig, CacheProfile, DeviceCapabilityClass, TileLayerOptions},
    geo::{LatLng, Point},
    viewport::ViewportState,
};

pub use crate::tiles::{
    cache::{BoundedCache, EntryView, TileEntry, TileResource, TileState},
    cancel::CancelToken,
    concurrency::ConcurrencyController,
    events::TileEvent,
    key::{AddressSpace, TileKey},
    layer::{TileCanvas, TileLayer},
    loader::{LoadError, TileLoader},
    queue::{LoadJob, LoadQueue, TilePriority},
    source::UrlTemplate,
};

pub use crate::runtime::{runtime, spawn, AsyncHandle, AsyncSpawner};

pub use crate::{Error as TileCacheError, Result};

pub use std::{
    cmp::Ordering,
    collections::BinaryHeap,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex},
    time::Duration,
};

pub use fxhash::{FxHashMap as HashMap, FxHashSet as HashSet};
