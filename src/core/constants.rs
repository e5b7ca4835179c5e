//! Core constants derived from Leaflet defaults and common web-map conventions.
//! Keeping them in a single place makes it easier to tweak engine-wide magic numbers.

/// Default square tile size in pixels.
pub const TILE_SIZE: u32 = 256;

/// Highest zoom level a tile key can address (2^30 columns still fit in u32).
pub const MAX_ZOOM_LEVEL: u8 = 30;

/// Default tile template (OpenStreetMap).
pub const DEFAULT_URL_TEMPLATE: &str = "https://{s}.tile.openstreetmap.org/{z}/{x}/{y}.png";

/// Token substituted for `{r}` on HiDPI displays.
pub const RETINA_SUFFIX: &str = "@2x";

/// Lower/upper bound of the adaptive keep buffer, in tiles.
pub const MIN_BUFFER_TILES: u32 = 1;
pub const MAX_BUFFER_TILES: u32 = 5;

/// Sliding window used for network condition tracking.
pub const NETWORK_WINDOW_MS: u64 = 30_000;
