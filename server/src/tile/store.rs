//! Per-tile disk cache: path derivation, expiry check, corruption guard.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use blake2::digest::consts::U8;
use blake2::{Blake2b, Digest};
use metrics::counter;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};

use super::nslock::NamespaceLock;

type Blake2b64 = Blake2b<U8>;

#[derive(Debug, Error)]
pub enum TileStoreError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to decode cached image at {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

/// 64-bit BLAKE2b hex digest of `input`, used to build cache directory
/// names from a layer's identity (`firstServer+urlFmt` or joined layer
/// names), per §3.
pub fn hash_identity(input: &str) -> String {
    let mut hasher = Blake2b64::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Reads/writes cache entries rooted at `base_dir`, guarding each path
/// with a `NamespaceLock` so a concurrent writer can never be observed
/// mid-write in-process. Cross-process exclusion, when needed, is the
/// caller's responsibility via `FileLock` on the same path.
pub struct TileStore {
    base_dir: PathBuf,
    nslock: Arc<NamespaceLock>,
}

impl TileStore {
    pub fn new(base_dir: impl Into<PathBuf>, nslock: Arc<NamespaceLock>) -> Self {
        Self {
            base_dir: base_dir.into(),
            nslock,
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// `<base>/<mapId>/<h(firstServer+urlFmt)>/<z>/<x>/<y>`
    pub fn simple_layer_path(&self, map_id: &str, layer_identity: &str, z: u32, x: u32, y: u32) -> PathBuf {
        self.base_dir
            .join(map_id)
            .join(hash_identity(layer_identity))
            .join(z.to_string())
            .join(x.to_string())
            .join(y.to_string())
    }

    /// `<base>/<mapId>/<h(joinedLayerNames)>/<z>/<x>/<y>`
    pub fn composite_path(&self, map_id: &str, layer_names_joined: &str, z: u32, x: u32, y: u32) -> PathBuf {
        self.simple_layer_path(map_id, layer_names_joined, z, x, y)
    }

    /// `<base>/<dataset>/<layer>/<z>/<xBlock>/<yBlock>_<N>x<N>_<sizePx>px_base_<dpi>dpi_<W>x<H>px.png`
    #[allow(clippy::too_many_arguments)]
    pub fn wms_block_path(
        &self,
        dataset: &str,
        layer: &str,
        z: u32,
        x_block: u32,
        y_block: u32,
        n: u32,
        size_px: u32,
        dpi: u32,
        width: u32,
        height: u32,
    ) -> PathBuf {
        self.base_dir
            .join(dataset)
            .join(layer)
            .join(z.to_string())
            .join(x_block.to_string())
            .join(format!(
                "{y_block}_{n}x{n}_{size_px}px_base_{dpi}dpi_{width}x{height}px.png"
            ))
    }

    /// Read a cache entry if present, fresh, and non-corrupt. Returns
    /// `None` on any miss condition: missing file, expired mtime,
    /// zero-byte file, or undecodable bytes.
    pub async fn get(&self, path: &Path, timeout: Duration) -> Option<image::DynamicImage> {
        let _guard = self.nslock.acquire(&path.to_string_lossy()).await;

        let meta = match fs::metadata(path).await {
            Ok(m) => m,
            Err(_) => return None,
        };

        if meta.len() == 0 {
            warn!(path = %path.display(), "zero-byte cache entry treated as corrupt");
            return None;
        }

        let modified = meta.modified().ok()?;
        let age = SystemTime::now().duration_since(modified).ok()?;
        if age > timeout {
            debug!(path = %path.display(), age_secs = age.as_secs(), "cache entry expired");
            return None;
        }

        let bytes = match fs::read(path).await {
            Ok(b) => b,
            Err(_) => return None,
        };

        match image::load_from_memory(&bytes) {
            Ok(img) => {
                counter!("tileproxy_cache_hits_total").increment(1);
                Some(img)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "undecodable cache entry treated as miss");
                counter!("tileproxy_cache_misses_total").increment(1);
                None
            }
        }
    }

    /// Serialise `image` to `path` under the path's namespace lock,
    /// creating parent directories first. Written through a temp file
    /// and renamed into place so a concurrent reader never observes a
    /// partial write.
    pub async fn put(&self, image: &image::DynamicImage, path: &Path) -> Result<(), TileStoreError> {
        let _guard = self.nslock.acquire(&path.to_string_lossy()).await;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| TileStoreError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let mut buf = std::io::Cursor::new(Vec::new());
        let format = guess_format_from_extension(path);
        image
            .write_to(&mut buf, format)
            .map_err(|source| TileStoreError::Decode {
                path: path.to_path_buf(),
                source,
            })?;

        let tmp_path = path.with_extension("tmp-write");
        fs::write(&tmp_path, buf.into_inner())
            .await
            .map_err(|source| TileStoreError::Io {
                path: tmp_path.clone(),
                source,
            })?;
        fs::rename(&tmp_path, path)
            .await
            .map_err(|source| TileStoreError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        debug!(path = %path.display(), "wrote cache entry");
        Ok(())
    }

    /// Write already-encoded bytes directly (used for WMS raw block
    /// fetches, which are fetched as encoded PNG bytes over HTTP).
    pub async fn put_bytes(&self, bytes: &[u8], path: &Path) -> Result<(), TileStoreError> {
        let _guard = self.nslock.acquire(&path.to_string_lossy()).await;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| TileStoreError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let tmp_path = path.with_extension("tmp-write");
        fs::write(&tmp_path, bytes)
            .await
            .map_err(|source| TileStoreError::Io {
                path: tmp_path.clone(),
                source,
            })?;
        fs::rename(&tmp_path, path)
            .await
            .map_err(|source| TileStoreError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(())
    }
}

fn guess_format_from_extension(path: &Path) -> image::ImageFormat {
    match path.extension().and_then(|e| e.to_str()) {
        Some("jpg") | Some("jpeg") => image::ImageFormat::Jpeg,
        _ => image::ImageFormat::Png,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, RgbaImage};

    fn test_image() -> DynamicImage {
        DynamicImage::ImageRgba8(RgbaImage::new(4, 4))
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = TileStore::new(dir.path(), Arc::new(NamespaceLock::new()));
        let path = dir.path().join("a/b/c.png");

        let img = test_image();
        store.put(&img, &path).await.unwrap();

        let got = store.get(&path, Duration::from_secs(60)).await;
        assert!(got.is_some());
    }

    #[tokio::test]
    async fn get_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = TileStore::new(dir.path(), Arc::new(NamespaceLock::new()));
        let path = dir.path().join("missing.png");

        assert!(store.get(&path, Duration::from_secs(60)).await.is_none());
    }

    #[tokio::test]
    async fn zero_byte_file_is_treated_as_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = TileStore::new(dir.path(), Arc::new(NamespaceLock::new()));
        let path = dir.path().join("empty.png");
        tokio::fs::write(&path, b"").await.unwrap();

        assert!(store.get(&path, Duration::from_secs(60)).await.is_none());
    }

    #[tokio::test]
    async fn expired_entry_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = TileStore::new(dir.path(), Arc::new(NamespaceLock::new()));
        let path = dir.path().join("old.png");

        let img = test_image();
        store.put(&img, &path).await.unwrap();

        assert!(store.get(&path, Duration::from_secs(0)).await.is_none());
    }

    #[test]
    fn hash_identity_is_stable_and_distinguishes_inputs() {
        let a = hash_identity("server1{z}/{x}/{y}");
        let b = hash_identity("server1{z}/{x}/{y}");
        let c = hash_identity("server2{z}/{x}/{y}");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16); // 8 bytes hex-encoded
    }

    #[test]
    fn simple_layer_path_matches_schema() {
        let dir = tempfile::tempdir().unwrap();
        let store = TileStore::new(dir.path(), Arc::new(NamespaceLock::new()));
        let path = store.simple_layer_path("opentopomap", "a.tile.opentopomap.org{z}/{x}/{y}.png", 5, 10, 12);
        assert_eq!(path.file_name().unwrap(), "12");
        assert!(path.starts_with(dir.path().join("opentopomap")));
    }
}
