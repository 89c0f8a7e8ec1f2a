//! Slippy-map tile proxy: request coalescing, two-level disk caching,
//! and per-layer composition over arbitrary upstream tile/WMS servers.

pub mod compositor;
pub mod downloader;
pub mod filelock;
pub mod geo;
pub mod mapconfig;
pub mod nslock;
pub mod routes;
pub mod store;
pub mod types;

pub use downloader::wms::WmsCoalescingDownloader;
pub use downloader::{simple::SimpleDownloader, DownloadError, Downloader};
pub use filelock::FileLock;
pub use mapconfig::sample_config;
pub use nslock::NamespaceLock;
pub use routes::{tile_routes, RouterError, TileAppState};
pub use store::TileStore;
pub use types::{MainConfig, TileCoord, TileCoordError, TileSetConfig};
