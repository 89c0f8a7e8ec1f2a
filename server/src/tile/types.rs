//! Core data model: tile coordinates, per-layer server config, and the
//! static map configuration the router dispatches against.

use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;

/// Highest zoom level the proxy will resolve a path against.
pub const MAX_ZOOM: u32 = 30;

/// Default timeout before a cached tile is considered stale (48h).
pub const DEFAULT_TILE_CACHE_TIMEOUT_SEC: u64 = 172_800;

/// A single slippy-map tile address, valid for `z <= MAX_ZOOM` and
/// `0 <= x,y < 2^z`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileCoord {
    pub z: u32,
    pub x: u32,
    pub y: u32,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TileCoordError {
    #[error("zoom level {0} exceeds maximum of {MAX_ZOOM}")]
    ZoomTooLarge(u32),
    #[error("tile ({x},{y}) out of range for zoom {z}")]
    OutOfRange { z: u32, x: u32, y: u32 },
}

impl TileCoord {
    pub fn new(z: u32, x: u32, y: u32) -> Result<Self, TileCoordError> {
        if z > MAX_ZOOM {
            return Err(TileCoordError::ZoomTooLarge(z));
        }
        let bound = 1u64 << z;
        if u64::from(x) >= bound || u64::from(y) >= bound {
            return Err(TileCoordError::OutOfRange { z, x, y });
        }
        Ok(Self { z, x, y })
    }

    /// Side length of the block this tile belongs to: `min(8, 2^z)`.
    pub fn block_size(&self) -> u32 {
        let max = 1u64 << self.z;
        max.min(8) as u32
    }

    /// Origin `(xB, yB)` of the block containing this tile.
    pub fn block_origin(&self) -> (u32, u32) {
        let n = self.block_size();
        (self.x - self.x % n, self.y - self.y % n)
    }
}

/// `http` or `https`, used to prefix a slippy tile server URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http,
    Https,
}

impl Default for Protocol {
    fn default() -> Self {
        Protocol::Https
    }
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
        }
    }
}

/// Geonorge WMS dataset identifiers (statkart's throttled WMS endpoints).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeonorgeDataset {
    WmsKartdata,
    WmsKartdataGray,
    WmsFjellskygge,
}

impl GeonorgeDataset {
    pub fn base_url(self) -> &'static str {
        match self {
            GeonorgeDataset::WmsKartdata => "https://wms.geonorge.no/skwms1/wms.kartdata?",
            GeonorgeDataset::WmsKartdataGray => {
                "https://wms.geonorge.no/skwms1/wms.kartdata3graatone?"
            }
            GeonorgeDataset::WmsFjellskygge => "https://wms.geonorge.no/skwms1/wms.fjellskygge?",
        }
    }

    /// Name used in cache directories; stable across WMS endpoint changes.
    pub fn name(self) -> &'static str {
        match self {
            GeonorgeDataset::WmsKartdata => "WMS_KARTDATA",
            GeonorgeDataset::WmsKartdataGray => "WMS_KARTDATA_GRAY",
            GeonorgeDataset::WmsFjellskygge => "WMS_FJELLSKYGGE",
        }
    }
}

/// Closed, typed replacement for the original's embedded `dynGetTileUrl`
/// scripts (see design note in SPEC_FULL.md). `Slippy` is the ordinary
/// `servers[rand]/urlFmt` path; the other variants compute a URL from
/// `(z, x, y)` without evaluating any caller-supplied code.
#[derive(Debug, Clone, PartialEq)]
pub enum UrlStrategy {
    /// `protocol://servers[rand]/urlFmt.format(z,x,y)`.
    Slippy,
    /// ArcGIS `MapServer/export` REST call, bbox derived from the tile.
    ArcgisExport { layer_show: String, size_px: u32 },
    /// Geonorge-style single-tile WMS `GetMap` call (distinct from the
    /// block-level WMS fetch `WMSCoalescingDownloader` performs itself).
    GeonorgeWms {
        dataset: GeonorgeDataset,
        layer: String,
        dpi: u32,
        size_px: u32,
    },
}

impl Default for UrlStrategy {
    fn default() -> Self {
        UrlStrategy::Slippy
    }
}

/// Per-layer WMS parameters used by `WMSCoalescingDownloader`. Kept
/// distinct from `UrlStrategy::GeonorgeWms` because the WMS downloader
/// operates on whole blocks, not on a strategy invoked per tile.
#[derive(Debug, Clone, PartialEq)]
pub struct GeonorgeCustomConfig {
    pub dataset: GeonorgeDataset,
    pub layer: String,
    pub dpi: u32,
    pub size_px: u32,
}

/// Configuration for one layer within a `TileSetConfig`.
#[derive(Debug, Clone)]
pub struct TileServerConfig {
    /// Host candidates, rotated per request; empty when `url_strategy`
    /// computes its own endpoint (e.g. a fixed WMS base URL).
    pub servers: Vec<String>,
    /// Template with `{z}`, `{x}`, `{y}` placeholders.
    pub url_fmt: String,
    pub protocol: Protocol,
    pub enable_tile_cache: bool,
    pub tile_cache_timeout: Duration,
    pub headers: Option<HashMap<String, String>>,
    /// `None` selects the plain slippy path; `Some` overrides URL
    /// construction with one of the closed strategies.
    pub url_strategy: Option<UrlStrategy>,
    /// WMS-specific payload consumed by `WMSCoalescingDownloader`.
    pub custom_config: Option<GeonorgeCustomConfig>,
}

impl Default for TileServerConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            url_fmt: "{z}/{x}/{y}".to_string(),
            protocol: Protocol::default(),
            enable_tile_cache: true,
            tile_cache_timeout: Duration::from_secs(DEFAULT_TILE_CACHE_TIMEOUT_SEC),
            headers: None,
            url_strategy: None,
            custom_config: None,
        }
    }
}

/// Output image format; `Auto` preserves whatever the composed image's
/// own format already is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFileType {
    Png,
    Jpeg,
    Auto,
}

/// Which downloader serves this map: generic per-tile fetch, or the
/// block-coalescing WMS path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloaderKind {
    Simple,
    WmsCoalescing,
}

/// Ordered layer list plus output format and downloader choice for one
/// map identifier. Layer order is semantically significant: index 0 is
/// the base, higher indices overlay.
#[derive(Debug, Clone)]
pub struct TileSetConfig {
    pub tile_servers: Vec<TileServerConfig>,
    pub filetype: ImageFileType,
    pub downloader: DownloaderKind,
}

/// mapId -> TileSetConfig, immutable after load.
pub type MainConfig = HashMap<String, TileSetConfig>;
