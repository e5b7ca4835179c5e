//! Pluggable async tile fetch and the guard every load runs under

use super::{cache::TileResource, cancel::CancelToken, key::TileKey};
use crate::prelude::Duration;
use crate::runtime::async_utils::async_delay;
use async_trait::async_trait;
use futures::FutureExt;

#[cfg(feature = "http")]
use once_cell::sync::Lazy;

/// Why a load produced no tile
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoadError {
    #[error("tile load timed out")]
    Timeout,

    #[error("tile transport error: {0}")]
    Transport(String),

    #[error("tile load cancelled")]
    Cancelled,
}

/// Fetches and decodes one tile.
///
/// Implementations should return `Cancelled` early when they notice the token,
/// but they don't have to: loads always run through [`guarded_load`], which
/// enforces cancellation and the timeout. Loaders never touch the cache.
#[async_trait]
pub trait TileLoader: Send + Sync {
    async fn load(
        &self,
        url: &str,
        key: TileKey,
        cancel: &CancelToken,
    ) -> Result<TileResource, LoadError>;
}

/// Run `loader` racing the cancel token and a `timeout` deadline.
///
/// Cancellation wins over a result that is ready in the same poll.
pub async fn guarded_load(
    loader: &dyn TileLoader,
    url: &str,
    key: TileKey,
    cancel: &CancelToken,
    timeout: Duration,
) -> Result<TileResource, LoadError> {
    if cancel.is_cancelled() {
        return Err(LoadError::Cancelled);
    }

    let load = loader.load(url, key, cancel).fuse();
    let cancelled = cancel.cancelled().fuse();
    let deadline = async_delay(timeout).fuse();
    futures::pin_mut!(load, cancelled, deadline);

    let result = futures::select_biased! {
        _ = cancelled => Err(LoadError::Cancelled),
        result = load => result,
        _ = deadline => {
            log::debug!("tile {} timed out after {:?}", key, timeout);
            Err(LoadError::Timeout)
        }
    };

    if cancel.is_cancelled() {
        return Err(LoadError::Cancelled);
    }
    result
}

/// Shared async HTTP client for tile fetching
#[cfg(feature = "http")]
pub(crate) static HTTP_CLIENT: Lazy<Option<reqwest::Client>> = Lazy::new(|| {
    reqwest::Client::builder()
        .user_agent("maplet/0.1.0")
        .tcp_keepalive(std::time::Duration::from_secs(30))
        .pool_idle_timeout(std::time::Duration::from_secs(90))
        .pool_max_idle_per_host(16)
        .build()
        .map_err(|e| log::error!("failed to build HTTP client: {}", e))
        .ok()
});

/// Default loader: HTTP GET plus image decode into RGBA8.
///
/// Needs a tokio runtime, so layers using it should be driven from one.
#[cfg(feature = "http")]
#[derive(Debug, Clone, Default)]
pub struct HttpTileLoader;

#[cfg(feature = "http")]
impl HttpTileLoader {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(feature = "http")]
#[async_trait]
impl TileLoader for HttpTileLoader {
    async fn load(
        &self,
        url: &str,
        key: TileKey,
        cancel: &CancelToken,
    ) -> Result<TileResource, LoadError> {
        let client = HTTP_CLIENT
            .as_ref()
            .ok_or_else(|| LoadError::Transport("HTTP client unavailable".into()))?;

        log::debug!("fetching tile {} from {}", key, url);
        let response = client
            .get(url)
            .send()
            .await
            .map_err(|e| LoadError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(LoadError::Transport(format!("HTTP {}", response.status())));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| LoadError::Transport(e.to_string()))?;

        if cancel.is_cancelled() {
            return Err(LoadError::Cancelled);
        }
        decode_tile(&bytes)
    }
}

/// Decode PNG/JPEG bytes into an RGBA8 tile
#[cfg(feature = "http")]
pub fn decode_tile(bytes: &[u8]) -> Result<TileResource, LoadError> {
    let image = image::load_from_memory(bytes)
        .map_err(|e| LoadError::Transport(format!("tile decode failed: {e}")))?;
    let rgba = image.to_rgba8();
    let (width, height) = rgba.dimensions();
    Ok(TileResource::new(width, height, rgba.into_raw()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;

    struct Immediate;

    #[async_trait]
    impl TileLoader for Immediate {
        async fn load(
            &self,
            _url: &str,
            _key: TileKey,
            _cancel: &CancelToken,
        ) -> Result<TileResource, LoadError> {
            Ok(TileResource::new(1, 1, vec![1, 2, 3, 4]))
        }
    }

    /// Never resolves and never looks at its token
    struct Hanging;

    #[async_trait]
    impl TileLoader for Hanging {
        async fn load(
            &self,
            _url: &str,
            _key: TileKey,
            _cancel: &CancelToken,
        ) -> Result<TileResource, LoadError> {
            futures::future::pending().await
        }
    }

    struct Refusing;

    #[async_trait]
    impl TileLoader for Refusing {
        async fn load(
            &self,
            url: &str,
            _key: TileKey,
            _cancel: &CancelToken,
        ) -> Result<TileResource, LoadError> {
            Err(LoadError::Transport(format!("404 for {url}")))
        }
    }

    const KEY: TileKey = TileKey { z: 1, x: 0, y: 1 };

    #[test]
    fn test_guard_passes_result_through() {
        let token = CancelToken::new();
        let result = block_on(guarded_load(&Immediate, "u", KEY, &token, Duration::from_secs(5)));
        assert_eq!(result.unwrap().pixels(), &[1, 2, 3, 4]);

        let result = block_on(guarded_load(&Refusing, "u", KEY, &token, Duration::from_secs(5)));
        assert_eq!(result, Err(LoadError::Transport("404 for u".into())));
    }

    #[test]
    fn test_guard_times_out_hanging_loader() {
        let token = CancelToken::new();
        let result = block_on(guarded_load(&Hanging, "u", KEY, &token, Duration::from_millis(20)));
        assert_eq!(result, Err(LoadError::Timeout));
    }

    #[test]
    fn test_guard_cancels_loader_that_ignores_token() {
        let token = CancelToken::new();
        let remote = token.clone();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(10));
            remote.cancel();
        });

        let result = block_on(guarded_load(&Hanging, "u", KEY, &token, Duration::from_secs(30)));
        assert_eq!(result, Err(LoadError::Cancelled));
        canceller.join().unwrap();
    }

    #[test]
    fn test_guard_short_circuits_cancelled_token() {
        let token = CancelToken::new();
        token.cancel();
        let result = block_on(guarded_load(&Immediate, "u", KEY, &token, Duration::from_secs(5)));
        assert_eq!(result, Err(LoadError::Cancelled));
    }

    #[cfg(feature = "tokio-runtime")]
    #[tokio::test]
    async fn test_guard_under_tokio() {
        let token = CancelToken::new();
        let result = guarded_load(&Hanging, "u", KEY, &token, Duration::from_millis(10)).await;
        assert_eq!(result, Err(LoadError::Timeout));
    }

    #[cfg(feature = "http")]
    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode_tile(b"not an image"), Err(LoadError::Transport(_))));
    }
}
