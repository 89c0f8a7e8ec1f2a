//! Server configuration
//!
//! Configuration is loaded from environment variables. See `.env.example` for documentation.

use std::env;
use std::time::Duration;

use crate::tile::downloader::simple::{DEFAULT_NUM_WORKERS, DEFAULT_TIMEOUT_SEC as SIMPLE_DEFAULT_TIMEOUT_SEC};
use crate::tile::downloader::wms::{
    DEFAULT_CONCURRENT_LARGE_TILE_DOWNLOADS, DEFAULT_DOWNLOAD_TIMEOUT_SEC,
};

/// Main server configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Server bind address
    pub host: String,
    /// Server port
    pub port: u16,
    /// Whether server is behind a reverse proxy
    pub behind_proxy: bool,

    /// Tile cache configuration
    pub cache: CacheConfig,

    /// Simple (per-layer HTTP fetch) downloader configuration
    pub simple_downloader: SimpleDownloaderConfig,

    /// Geonorge WMS block-coalescing downloader configuration
    pub wms_downloader: WmsDownloaderConfig,
}

/// Tile cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Root directory for cached layer/composite tiles
    pub base_dir: String,
}

/// `SimpleDownloader` tuning
#[derive(Debug, Clone)]
pub struct SimpleDownloaderConfig {
    /// Bounded worker pool size for concurrent layer fetches
    pub num_workers: usize,
    /// Per-request timeout
    pub request_timeout: Duration,
}

/// `WmsCoalescingDownloader` tuning
#[derive(Debug, Clone)]
pub struct WmsDownloaderConfig {
    /// Per-request timeout for WMS block fetches
    pub request_timeout: Duration,
    /// Maximum number of concurrent large-tile (block) downloads admitted
    /// at once, restoring the original's `CONCURRENT_GEONORGE_LARGE_TILE_DOWNLOADS`.
    pub concurrent_large_tile_downloads: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            behind_proxy: false,
            cache: CacheConfig::default(),
            simple_downloader: SimpleDownloaderConfig::default(),
            wms_downloader: WmsDownloaderConfig::default(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            base_dir: default_cache_dir(),
        }
    }
}

/// `<homeDir>/.cache/slippy-tile-proxy`, falling back to a relative path
/// when the home directory cannot be resolved (e.g. a stripped-down
/// container user).
fn default_cache_dir() -> String {
    dirs::cache_dir()
        .map(|dir| dir.join("slippy-tile-proxy"))
        .unwrap_or_else(|| std::path::PathBuf::from(".cache/slippy-tile-proxy"))
        .to_string_lossy()
        .into_owned()
}

impl Default for SimpleDownloaderConfig {
    fn default() -> Self {
        Self {
            num_workers: DEFAULT_NUM_WORKERS,
            request_timeout: Duration::from_secs(SIMPLE_DEFAULT_TIMEOUT_SEC),
        }
    }
}

impl Default for WmsDownloaderConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(DEFAULT_DOWNLOAD_TIMEOUT_SEC),
            concurrent_large_tile_downloads: DEFAULT_CONCURRENT_LARGE_TILE_DOWNLOADS,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        // Server config
        if let Ok(host) = env::var("BIND_ADDR") {
            config.host = host;
        }
        if let Ok(port) = env::var("BIND_PORT")
            && let Ok(p) = port.parse()
        {
            config.port = p;
        }
        if let Ok(val) = env::var("BEHIND_PROXY") {
            config.behind_proxy = val.to_lowercase() == "true" || val == "1";
        }

        // Cache config
        if let Ok(path) = env::var("TILE_CACHE_DIR") {
            config.cache.base_dir = path;
        }

        // Simple downloader config
        if let Ok(val) = env::var("SIMPLE_DOWNLOADER_NUM_WORKERS")
            && let Ok(v) = val.parse()
        {
            config.simple_downloader.num_workers = v;
        }
        if let Ok(val) = env::var("SIMPLE_DOWNLOADER_TIMEOUT_SECS")
            && let Ok(secs) = val.parse::<u64>()
        {
            config.simple_downloader.request_timeout = Duration::from_secs(secs);
        }

        // Geonorge WMS downloader config
        if let Ok(val) = env::var("CONCURRENT_GEONORGE_LARGE_TILE_DOWNLOADS")
            && let Ok(v) = val.parse()
        {
            config.wms_downloader.concurrent_large_tile_downloads = v;
        }
        if let Ok(val) = env::var("GEONORGE_DOWNLOAD_TIMEOUT_SECS")
            && let Ok(secs) = val.parse::<u64>()
        {
            config.wms_downloader.request_timeout = Duration::from_secs(secs);
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8080);
        assert_eq!(config.wms_downloader.concurrent_large_tile_downloads, 1);
    }

    #[test]
    fn test_config_from_env() {
        // This test doesn't set env vars, so it should return defaults
        let config = Config::from_env();
        assert_eq!(config.host, "0.0.0.0");
    }
}
