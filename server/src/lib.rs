//! Tile Proxy Server Library
//!
//! Exports the tile proxy components for use in integration tests and
//! external tooling.

pub mod config;
pub mod tile;

pub use config::Config;
pub use tile::{
    tile_routes, DownloadError, Downloader, FileLock, MainConfig, NamespaceLock, RouterError,
    SimpleDownloader, TileAppState, TileCoord, TileCoordError, TileSetConfig, TileStore,
    WmsCoalescingDownloader,
};
