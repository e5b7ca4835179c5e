pub mod cache;
pub mod cancel;
pub mod concurrency;
pub mod eviction;
pub mod events;
pub mod key;
pub mod layer;
pub mod loader;
pub mod prefetch;
pub mod queue;
pub mod refresh;
pub mod source;

// Re-exports for convenience
pub use layer::{LayerStats, TileCanvas, TileLayer};
pub use loader::{LoadError, TileLoader};
