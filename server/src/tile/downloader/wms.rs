//! Block-coalescing WMS downloader for Geonorge's throttled endpoints.
//!
//! Geonorge's WMS server throttles aggressively, so instead of fetching
//! one tile per layer per request, this downloader fetches an `N x N`
//! block of tiles per layer in a single WMS `GetMap` call, composites
//! the layers, crops the block into individual tiles, and caches every
//! tile in the block — not just the one that was requested. A namespace
//! lock keyed to the block ensures concurrent requests for tiles in the
//! same block share a single download instead of each fetching the
//! whole block themselves.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use encoding_rs::ISO_8859_1;
use image::DynamicImage;
use metrics::counter;
use reqwest::Client;
use tokio::time::sleep;
use tracing::{info, warn};

use super::{DownloadError, Downloader};
use crate::tile::compositor;
use crate::tile::geo::block_bounds_web_mercator;
use crate::tile::nslock::NamespaceLock;
use crate::tile::store::TileStore;
use crate::tile::types::{GeonorgeCustomConfig, GeonorgeDataset, TileCoord, TileSetConfig};

const MAX_OVERUSE_RETRIES: u32 = 10;
const OVERUSE_MARKER: &str = "Overforbruk";

pub const DEFAULT_DOWNLOAD_TIMEOUT_SEC: u64 = 20;
pub const DEFAULT_CONCURRENT_LARGE_TILE_DOWNLOADS: usize = 1;

const LARGE_LOCK_SUFFIX: &str = ".largeLock";

pub struct WmsCoalescingDownloader {
    client: Client,
    store: Arc<TileStore>,
    nslock: Arc<NamespaceLock>,
    timeout: Duration,
    concurrent_large_tile_downloads: usize,
    /// Overrides `GeonorgeDataset::base_url()` when set. Production code
    /// never sets this; tests point it at a local mock WMS server instead
    /// of the real, aggressively-throttled Geonorge endpoint.
    base_url_override: Option<String>,
}

impl WmsCoalescingDownloader {
    pub fn new(store: Arc<TileStore>, nslock: Arc<NamespaceLock>) -> Self {
        Self::with_config(
            store,
            nslock,
            Duration::from_secs(DEFAULT_DOWNLOAD_TIMEOUT_SEC),
            DEFAULT_CONCURRENT_LARGE_TILE_DOWNLOADS,
        )
    }

    pub fn with_config(
        store: Arc<TileStore>,
        nslock: Arc<NamespaceLock>,
        timeout: Duration,
        concurrent_large_tile_downloads: usize,
    ) -> Self {
        Self {
            client: Client::new(),
            store,
            nslock,
            timeout,
            concurrent_large_tile_downloads,
            base_url_override: None,
        }
    }

    /// Overrides the dataset base URL this downloader fetches from.
    /// Exposed for tests that point at a local mock WMS server instead of
    /// the real Geonorge endpoint.
    pub fn with_base_url_override(mut self, base_url: impl Into<String>) -> Self {
        self.base_url_override = Some(base_url.into());
        self
    }

    fn wms_base_url(&self, dataset: GeonorgeDataset) -> String {
        self.base_url_override.clone().unwrap_or_else(|| dataset.base_url().to_string())
    }

    fn custom_config<'a>(tile_set: &'a TileSetConfig, idx: usize) -> Result<&'a GeonorgeCustomConfig, DownloadError> {
        tile_set.tile_servers[idx]
            .custom_config
            .as_ref()
            .ok_or(DownloadError::NoLayers)
    }

    /// Block origin, grid size and pixel dimensions of the `N x N` WMS
    /// request that covers `coord`, at `size_px` per tile.
    fn block_geometry(coord: TileCoord, size_px: u32) -> (u32, u32, u32, u32, u32) {
        let n = coord.block_size();
        let (x_block, y_block) = coord.block_origin();
        let side = n * size_px;
        (x_block, y_block, n, side, side)
    }

    fn composite_cache_path(&self, map_id: &str, tile_set: &TileSetConfig, coord: TileCoord) -> std::path::PathBuf {
        let layer_names: Vec<&str> = tile_set
            .tile_servers
            .iter()
            .filter_map(|s| s.custom_config.as_ref().map(|c| c.layer.as_str()))
            .collect();
        let joined = layer_names.join("/");
        self.store.composite_path(map_id, &joined, coord.z, coord.x, coord.y)
    }

    fn min_cache_timeout(tile_set: &TileSetConfig) -> Duration {
        tile_set
            .tile_servers
            .iter()
            .filter(|s| s.enable_tile_cache)
            .map(|s| s.tile_cache_timeout)
            .min()
            .unwrap_or(Duration::from_secs(crate::tile::types::DEFAULT_TILE_CACHE_TIMEOUT_SEC))
    }

    async fn try_composite_cache(
        &self,
        map_id: &str,
        tile_set: &TileSetConfig,
        coord: TileCoord,
    ) -> Option<DynamicImage> {
        let path = self.composite_cache_path(map_id, tile_set, coord);
        let timeout = Self::min_cache_timeout(tile_set);
        self.store.get(&path, timeout).await
    }

    /// Namespace key shared by every tile in the same block, so
    /// concurrent requests for different tiles of one block coalesce
    /// onto a single download.
    fn block_namespace(&self, layer0_path: &std::path::Path) -> String {
        let tail: Vec<String> = layer0_path
            .components()
            .rev()
            .take(3)
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        format!("{}{LARGE_LOCK_SUFFIX}", tail.join("_"))
    }

    async fn admission_gate(&self, ns: &str) {
        loop {
            let large_locks: Vec<String> = self
                .nslock
                .list(true)
                .into_iter()
                .filter(|(k, _)| k.ends_with(LARGE_LOCK_SUFFIX))
                .map(|(k, _)| k)
                .collect();

            if large_locks.len() <= self.concurrent_large_tile_downloads {
                return;
            }
            let top = &large_locks[..self.concurrent_large_tile_downloads];
            if top.iter().any(|k| k == ns) {
                info!(namespace = ns, "admitted into large-tile download slot");
                return;
            }
            sleep(Duration::from_millis(100)).await;
        }
    }

    /// Fetch one layer's `N x N` block, retrying on Geonorge's
    /// "Overforbruk" (overuse) throttling response. A 200 response whose
    /// body is not a decodable image but also doesn't carry the overuse
    /// marker is a fatal, non-retryable failure.
    async fn fetch_layer_block(&self, url: &str) -> Result<(DynamicImage, Vec<u8>), DownloadError> {
        let mut retries = 0;
        loop {
            if retries >= MAX_OVERUSE_RETRIES {
                return Err(DownloadError::FatalRetryExhaustion {
                    max_retries: MAX_OVERUSE_RETRIES,
                });
            }
            retries += 1;

            let resp = self.client.get(url).timeout(self.timeout).send().await?;
            let status = resp.status();
            if !status.is_success() {
                return Err(DownloadError::UpstreamStatus(status));
            }
            let bytes = resp.bytes().await?;

            match image::load_from_memory(&bytes) {
                Ok(img) => return Ok((img, bytes.to_vec())),
                Err(decode_err) => {
                    let (text, _, _) = ISO_8859_1.decode(&bytes);
                    if text.contains(OVERUSE_MARKER) {
                        warn!(%url, attempt = retries, "Geonorge overuse response, retrying in 1s");
                        counter!("tileproxy_overuse_retries_total").increment(1);
                        sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                    return Err(DownloadError::Decode(decode_err));
                }
            }
        }
    }

    async fn fetch_layer_with_cache(
        &self,
        z: u32,
        x_block: u32,
        y_block: u32,
        n: u32,
        width: u32,
        height: u32,
        custom: &GeonorgeCustomConfig,
        enable_cache: bool,
        cache_timeout: Duration,
    ) -> Result<DynamicImage, DownloadError> {
        let path = self.store.wms_block_path(
            custom.dataset.name(),
            &custom.layer,
            z,
            x_block,
            y_block,
            n,
            custom.size_px,
            custom.dpi,
            width,
            height,
        );

        if enable_cache {
            if let Some(img) = self.store.get(&path, cache_timeout).await {
                info!(path = %path.display(), "loaded WMS layer block from cache");
                return Ok(img);
            }
        }

        let (south, west, north, east) = block_bounds_web_mercator(z, x_block, y_block, n);
        let url = format!(
            "{}SERVICE=WMS&VERSION=1.3.0&REQUEST=GetMap&BBOX={south},{west},{north},{east}&CRS=EPSG:3857&WIDTH={width}&HEIGHT={height}&LAYERS={}&FORMAT=image/png&DPI={}&MAP_RESOLUTION={}&STYLE=default&TRANSPARENT=true",
            self.wms_base_url(custom.dataset),
            custom.layer,
            custom.dpi,
            custom.dpi,
        );

        counter!("tileproxy_wms_block_requests_total").increment(1);
        let (img, bytes) = self.fetch_layer_block(&url).await?;

        if enable_cache {
            self.store.put_bytes(&bytes, &path).await?;
        }

        Ok(img)
    }

    /// Crop `composite` into its `n x n` grid of tiles, caching every
    /// one, and return the tile matching `requested`.
    async fn crop_and_cache_grid(
        &self,
        composite: &DynamicImage,
        size_px: u32,
        n: u32,
        x_block: u32,
        y_block: u32,
        requested: TileCoord,
        map_id: &str,
        tile_set: &TileSetConfig,
    ) -> Result<DynamicImage, DownloadError> {
        let mut requested_tile = None;

        for yi in 0..n {
            for xi in 0..n {
                let x = x_block + xi;
                let y = y_block + yi;
                let crop = composite.crop_imm(xi * size_px, yi * size_px, size_px, size_px);

                let coord = TileCoord {
                    z: requested.z,
                    x,
                    y,
                };
                let path = self.composite_cache_path(map_id, tile_set, coord);
                self.store.put(&crop, &path).await?;

                if x == requested.x && y == requested.y {
                    requested_tile = Some(crop);
                }
            }
        }

        requested_tile.ok_or(DownloadError::NoLayers)
    }
}

#[async_trait]
impl Downloader for WmsCoalescingDownloader {
    async fn download_tile(
        &self,
        coord: TileCoord,
        map_id: &str,
        tile_set: &TileSetConfig,
    ) -> Result<DynamicImage, DownloadError> {
        if tile_set.tile_servers.is_empty() {
            return Err(DownloadError::NoLayers);
        }

        if let Some(tile) = self.try_composite_cache(map_id, tile_set, coord).await {
            counter!("tileproxy_cache_hits_total").increment(1);
            return Ok(tile);
        }

        let first_custom = Self::custom_config(tile_set, 0)?;
        let (x_block, y_block, n, width, height) = Self::block_geometry(coord, first_custom.size_px);

        let layer0_path = self.store.wms_block_path(
            first_custom.dataset.name(),
            &first_custom.layer,
            coord.z,
            x_block,
            y_block,
            n,
            first_custom.size_px,
            first_custom.dpi,
            width,
            height,
        );
        let ns = self.block_namespace(&layer0_path);

        let _guard = self.nslock.acquire(&ns).await;
        info!(namespace = %ns, %map_id, "namespace lock acquired for block download");

        // Recheck the cache now that we hold the lock: most requests
        // sharing this namespace will hit here.
        if let Some(tile) = self.try_composite_cache(map_id, tile_set, coord).await {
            counter!("tileproxy_cache_hits_total").increment(1);
            return Ok(tile);
        }

        self.admission_gate(&ns).await;
        counter!("tileproxy_block_downloads_total").increment(1);

        let mut dpi = 0u32;
        let mut size_px = 0u32;
        for (idx, server) in tile_set.tile_servers.iter().enumerate() {
            let custom = Self::custom_config(tile_set, idx)?;
            if idx == 0 {
                dpi = custom.dpi;
                size_px = custom.size_px;
            } else if custom.dpi != dpi || custom.size_px != size_px {
                return Err(DownloadError::InconsistentWmsLayerConfig {
                    name: custom.layer.clone(),
                    dpi: custom.dpi,
                    size_px: custom.size_px,
                    expected_dpi: dpi,
                    expected_size_px: size_px,
                });
            }
            let _ = server;
        }

        let mut layers = Vec::with_capacity(tile_set.tile_servers.len());
        for (idx, server) in tile_set.tile_servers.iter().enumerate() {
            let custom = Self::custom_config(tile_set, idx)?;
            let img = self
                .fetch_layer_with_cache(
                    coord.z,
                    x_block,
                    y_block,
                    n,
                    width,
                    height,
                    custom,
                    server.enable_tile_cache,
                    server.tile_cache_timeout,
                )
                .await?;
            layers.push(img);
        }

        let composite = compositor::compose(layers)?;
        let tile = self
            .crop_and_cache_grid(&composite, size_px, n, x_block, y_block, coord, map_id, tile_set)
            .await?;

        Ok(tile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tile::types::{DownloaderKind, GeonorgeDataset, ImageFileType, TileServerConfig};
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn png_block(side: u32) -> Vec<u8> {
        let img = DynamicImage::ImageRgba8(image::RgbaImage::new(side, side));
        let mut buf = std::io::Cursor::new(Vec::new());
        img.write_to(&mut buf, image::ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    fn layer_config(dpi: u32, size_px: u32, enable_cache: bool) -> TileServerConfig {
        TileServerConfig {
            enable_tile_cache: enable_cache,
            custom_config: Some(GeonorgeCustomConfig {
                dataset: GeonorgeDataset::WmsKartdata,
                layer: "topo".to_string(),
                dpi,
                size_px,
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn single_layer_block_downloads_and_crops_requested_tile() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(png_block(16)))
            .mount(&mock_server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let nslock = Arc::new(NamespaceLock::new());
        let store = Arc::new(TileStore::new(dir.path(), Arc::clone(&nslock)));
        let downloader = WmsCoalescingDownloader::with_config(
            store,
            nslock,
            Duration::from_secs(5),
            DEFAULT_CONCURRENT_LARGE_TILE_DOWNLOADS,
        )
        .with_base_url_override(format!("{}/?", mock_server.uri()));

        let tile_set = TileSetConfig {
            tile_servers: vec![layer_config(192, 8, true)],
            filetype: ImageFileType::Png,
            downloader: DownloaderKind::WmsCoalescing,
        };

        let coord = TileCoord::new(1, 0, 0).unwrap();
        let tile = downloader.download_tile(coord, "geonorge_map", &tile_set).await.unwrap();
        assert_eq!(tile.width(), 8);
        assert_eq!(tile.height(), 8);
    }

    #[tokio::test]
    async fn inconsistent_layer_dpi_is_rejected() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(png_block(16)))
            .mount(&mock_server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let nslock = Arc::new(NamespaceLock::new());
        let store = Arc::new(TileStore::new(dir.path(), Arc::clone(&nslock)));
        let downloader = WmsCoalescingDownloader::new(store, nslock).with_base_url_override(format!("{}/?", mock_server.uri()));

        let tile_set = TileSetConfig {
            tile_servers: vec![layer_config(192, 8, true), layer_config(96, 8, true)],
            filetype: ImageFileType::Png,
            downloader: DownloaderKind::WmsCoalescing,
        };

        let coord = TileCoord::new(1, 0, 0).unwrap();
        let result = downloader.download_tile(coord, "geonorge_map", &tile_set).await;
        assert!(matches!(result, Err(DownloadError::InconsistentWmsLayerConfig { .. })));
    }

    #[tokio::test]
    async fn overuse_response_retries_then_succeeds() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("Overforbruk - wait a little"))
            .up_to_n_times(1)
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(png_block(16)))
            .mount(&mock_server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let nslock = Arc::new(NamespaceLock::new());
        let store = Arc::new(TileStore::new(dir.path(), Arc::clone(&nslock)));
        let downloader = WmsCoalescingDownloader::new(store, nslock).with_base_url_override(format!("{}/?", mock_server.uri()));

        let tile_set = TileSetConfig {
            tile_servers: vec![layer_config(192, 8, true)],
            filetype: ImageFileType::Png,
            downloader: DownloaderKind::WmsCoalescing,
        };

        let coord = TileCoord::new(1, 0, 0).unwrap();
        let tile = downloader.download_tile(coord, "geonorge_map", &tile_set).await.unwrap();
        assert_eq!(tile.width(), 8);
    }

    #[tokio::test]
    async fn second_request_in_same_block_hits_cache() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(png_block(16)))
            .up_to_n_times(1)
            .mount(&mock_server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let nslock = Arc::new(NamespaceLock::new());
        let store = Arc::new(TileStore::new(dir.path(), Arc::clone(&nslock)));
        let downloader = WmsCoalescingDownloader::new(store, nslock).with_base_url_override(format!("{}/?", mock_server.uri()));

        let tile_set = TileSetConfig {
            tile_servers: vec![layer_config(192, 8, true)],
            filetype: ImageFileType::Png,
            downloader: DownloaderKind::WmsCoalescing,
        };

        let coord_a = TileCoord::new(1, 0, 0).unwrap();
        let coord_b = TileCoord::new(1, 1, 0).unwrap();

        let tile_a = downloader.download_tile(coord_a, "geonorge_map", &tile_set).await.unwrap();
        let tile_b = downloader.download_tile(coord_b, "geonorge_map", &tile_set).await.unwrap();

        assert_eq!(tile_a.width(), 8);
        assert_eq!(tile_b.width(), 8);
    }
}
