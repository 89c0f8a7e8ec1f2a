//! Downloader abstractions: the per-layer HTTP tile fetcher
//! (`SimpleDownloader`) and the block-coalescing WMS fetcher
//! (`WMSCoalescingDownloader`), both implementing `Downloader`.

pub mod simple;
pub mod url_strategy;
pub mod wms;

use async_trait::async_trait;
use thiserror::Error;

use super::types::TileCoord;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("unknown map id: {0}")]
    UnknownMap(String),
    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),
    #[error("upstream returned status {0}")]
    UpstreamStatus(reqwest::StatusCode),
    #[error("failed to decode downloaded image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("cache error: {0}")]
    Cache(#[from] super::store::TileStoreError),
    #[error("composite error: {0}")]
    Compose(#[from] super::compositor::CompositorError),
    #[error("layer {name} has mismatched dpi/size ({dpi}/{size_px}) from prior layers ({expected_dpi}/{expected_size_px})")]
    InconsistentWmsLayerConfig {
        name: String,
        dpi: u32,
        size_px: u32,
        expected_dpi: u32,
        expected_size_px: u32,
    },
    #[error("exhausted {max_retries} retries fetching a layer")]
    FatalRetryExhaustion { max_retries: u32 },
    #[error("tile set has no configured layers")]
    NoLayers,
    #[error("worker pool semaphore closed while fetching a layer")]
    WorkerPoolClosed,
    #[error("layer {index} was neither loaded from cache nor fetched")]
    MissingLayer { index: usize },
}

/// A downloader resolves one tile request into a finished, encoded
/// image. `SimpleDownloader` and `WMSCoalescingDownloader` are the two
/// implementations the router dispatches to per `TileSetConfig::downloader`.
#[async_trait]
pub trait Downloader: Send + Sync {
    async fn download_tile(
        &self,
        coord: TileCoord,
        map_id: &str,
        tile_set: &super::types::TileSetConfig,
    ) -> Result<image::DynamicImage, DownloadError>;
}
