//! Generic multi-layer tile downloader: fetches each layer of a
//! `TileSetConfig` from cache or from a remote tile server, and
//! composes them into one tile.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use metrics::counter;
use reqwest::Client;
use tracing::{debug, error};

use super::url_strategy::build_url;
use super::{DownloadError, Downloader};
use crate::tile::compositor;
use crate::tile::store::TileStore;
use crate::tile::types::{TileCoord, TileServerConfig, TileSetConfig};

/// Default size of the per-request worker pool (bounded via a semaphore,
/// since `reqwest::Client` already multiplexes connections — the cap
/// exists to bound concurrent in-flight decodes/memory, matching the
/// original's `ThreadPoolExecutor(max_workers=16)`).
pub const DEFAULT_NUM_WORKERS: usize = 16;
pub const DEFAULT_TIMEOUT_SEC: u64 = 3;

pub struct SimpleDownloader {
    client: Client,
    store: Arc<TileStore>,
    num_workers: usize,
    timeout: Duration,
}

impl SimpleDownloader {
    pub fn new(store: Arc<TileStore>) -> Self {
        Self::with_config(store, DEFAULT_NUM_WORKERS, Duration::from_secs(DEFAULT_TIMEOUT_SEC))
    }

    pub fn with_config(store: Arc<TileStore>, num_workers: usize, timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            store,
            num_workers,
            timeout,
        }
    }

    fn layer_identity(conf: &TileServerConfig) -> String {
        let first_server = conf.servers.first().cloned().unwrap_or_default();
        format!("{first_server}{}", conf.url_fmt)
    }

    async fn fetch_layer(&self, url: &str, conf: &TileServerConfig) -> Result<image::DynamicImage, DownloadError> {
        let mut req = self.client.get(url).timeout(self.timeout);
        if let Some(headers) = &conf.headers {
            for (k, v) in headers {
                req = req.header(k, v);
            }
        }
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(DownloadError::UpstreamStatus(status));
        }
        let bytes = resp.bytes().await?;
        let image = image::load_from_memory(&bytes)?;
        Ok(image)
    }
}

#[async_trait]
impl Downloader for SimpleDownloader {
    async fn download_tile(
        &self,
        coord: TileCoord,
        map_id: &str,
        tile_set: &TileSetConfig,
    ) -> Result<image::DynamicImage, DownloadError> {
        if tile_set.tile_servers.is_empty() {
            return Err(DownloadError::NoLayers);
        }

        let mut layers: Vec<Option<image::DynamicImage>> = vec![None; tile_set.tile_servers.len()];

        // 1. Consult the per-tile cache for every layer first.
        for (idx, conf) in tile_set.tile_servers.iter().enumerate() {
            if !conf.enable_tile_cache {
                continue;
            }
            let path = self
                .store
                .simple_layer_path(map_id, &Self::layer_identity(conf), coord.z, coord.x, coord.y);
            if let Some(img) = self.store.get(&path, conf.tile_cache_timeout).await {
                debug!(%map_id, layer = idx, "loaded tile layer from cache");
                layers[idx] = Some(img);
            }
        }

        // 2. Build URLs for the layers that missed cache.
        let missing: Vec<usize> = layers
            .iter()
            .enumerate()
            .filter(|(_, img)| img.is_none())
            .map(|(idx, _)| idx)
            .collect();

        // 3. Fetch all missing layers concurrently, bounded by a
        //    semaphore sized to `num_workers`.
        let semaphore = Arc::new(tokio::sync::Semaphore::new(self.num_workers.max(1)));
        let fetches = missing.iter().map(|&idx| {
            let conf = &tile_set.tile_servers[idx];
            let url = build_url(conf, coord.z, coord.x, coord.y);
            let semaphore = Arc::clone(&semaphore);
            async move {
                let result = match semaphore.acquire().await {
                    Ok(_permit) => {
                        counter!("tileproxy_tile_requests_total").increment(1);
                        self.fetch_layer(&url, conf).await
                    }
                    Err(_) => Err(DownloadError::WorkerPoolClosed),
                };
                (idx, url, result)
            }
        });

        let results = join_all(fetches).await;

        // A single per-layer fetch failure fails the whole tile.
        for (idx, url, result) in results {
            match result {
                Ok(img) => {
                    debug!(%map_id, %url, layer = idx, "downloaded tile layer");
                    let conf = &tile_set.tile_servers[idx];
                    if conf.enable_tile_cache {
                        let path = self.store.simple_layer_path(
                            map_id,
                            &Self::layer_identity(conf),
                            coord.z,
                            coord.x,
                            coord.y,
                        );
                        self.store.put(&img, &path).await?;
                    }
                    layers[idx] = Some(img);
                }
                Err(e) => {
                    error!(%map_id, %url, layer = idx, error = %e, "tile layer download failed");
                    counter!("tileproxy_tile_errors_total").increment(1);
                    return Err(e);
                }
            }
        }

        let mut ordered = Vec::with_capacity(layers.len());
        for (index, layer) in layers.into_iter().enumerate() {
            ordered.push(layer.ok_or(DownloadError::MissingLayer { index })?);
        }
        Ok(compositor::compose(ordered)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tile::nslock::NamespaceLock;
    use crate::tile::types::{DownloaderKind, ImageFileType, Protocol};
    use wiremock::matchers::{method, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn png_bytes() -> Vec<u8> {
        let img = image::DynamicImage::ImageRgba8(image::RgbaImage::new(4, 4));
        let mut buf = std::io::Cursor::new(Vec::new());
        img.write_to(&mut buf, image::ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    fn make_store(dir: &tempfile::TempDir) -> Arc<TileStore> {
        Arc::new(TileStore::new(dir.path(), Arc::new(NamespaceLock::new())))
    }

    #[tokio::test]
    async fn downloads_single_layer_and_caches_it() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/tiles/\d+/\d+/\d+\.png$"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(png_bytes()))
            .mount(&mock_server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = make_store(&dir);
        let downloader = SimpleDownloader::new(Arc::clone(&store));

        let host = mock_server.address().to_string();
        let tile_set = TileSetConfig {
            tile_servers: vec![TileServerConfig {
                servers: vec![host],
                url_fmt: "tiles/{z}/{x}/{y}.png".to_string(),
                protocol: Protocol::Http,
                ..Default::default()
            }],
            filetype: ImageFileType::Auto,
            downloader: DownloaderKind::Simple,
        };

        let coord = TileCoord::new(3, 1, 1).unwrap();
        let img = downloader.download_tile(coord, "testmap", &tile_set).await.unwrap();
        assert_eq!(img.width(), 4);

        // Cached path now exists on disk.
        let path = store.simple_layer_path("testmap", &format!("{}{}", tile_set.tile_servers[0].servers[0], tile_set.tile_servers[0].url_fmt), 3, 1, 1);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn composes_base_and_overlay_layers() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(png_bytes()))
            .mount(&mock_server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = make_store(&dir);
        let downloader = SimpleDownloader::new(store);

        let host = mock_server.address().to_string();
        let tile_set = TileSetConfig {
            tile_servers: vec![
                TileServerConfig {
                    servers: vec![host.clone()],
                    url_fmt: "base/{z}/{x}/{y}.png".to_string(),
                    protocol: Protocol::Http,
                    ..Default::default()
                },
                TileServerConfig {
                    servers: vec![host],
                    url_fmt: "overlay/{z}/{x}/{y}.png".to_string(),
                    protocol: Protocol::Http,
                    ..Default::default()
                },
            ],
            filetype: ImageFileType::Auto,
            downloader: DownloaderKind::Simple,
        };

        let coord = TileCoord::new(4, 2, 2).unwrap();
        let img = downloader.download_tile(coord, "overlaymap", &tile_set).await.unwrap();
        assert_eq!(img.width(), 4);
    }

    #[tokio::test]
    async fn upstream_failure_fails_whole_tile() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&mock_server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = make_store(&dir);
        let downloader = SimpleDownloader::new(store);

        let host = mock_server.address().to_string();
        let tile_set = TileSetConfig {
            tile_servers: vec![TileServerConfig {
                servers: vec![host],
                url_fmt: "{z}/{x}/{y}.png".to_string(),
                protocol: Protocol::Http,
                ..Default::default()
            }],
            filetype: ImageFileType::Auto,
            downloader: DownloaderKind::Simple,
        };

        let coord = TileCoord::new(1, 0, 0).unwrap();
        let result = downloader.download_tile(coord, "failmap", &tile_set).await;
        assert!(result.is_err());
    }
}
