//! Sample `MainConfig`: the mapId -> layer-stack definitions the router
//! dispatches against. Mirrors the map definitions that used to live
//! inline in the proxy's entry point, now data instead of code.

use std::time::Duration;

use super::types::{
    DownloaderKind, GeonorgeCustomConfig, GeonorgeDataset, ImageFileType, MainConfig, Protocol,
    TileServerConfig, TileSetConfig, UrlStrategy,
};

/// Built-in sample map set: a plain slippy base map, a base+overlay
/// combination, an ArcGIS `export`-backed map (`UrlStrategy::ArcgisExport`),
/// and a Geonorge WMS map exercising `WMSCoalescingDownloader`.
pub fn sample_config() -> MainConfig {
    let mut config = MainConfig::new();

    config.insert(
        "opentopomap".to_string(),
        TileSetConfig {
            tile_servers: vec![TileServerConfig {
                servers: vec![
                    "a.tile.opentopomap.org".to_string(),
                    "b.tile.opentopomap.org".to_string(),
                    "c.tile.opentopomap.org".to_string(),
                ],
                url_fmt: "{z}/{x}/{y}.png".to_string(),
                ..Default::default()
            }],
            filetype: ImageFileType::Auto,
            downloader: DownloaderKind::Simple,
        },
    );

    config.insert(
        "openflightmaps".to_string(),
        TileSetConfig {
            tile_servers: vec![
                TileServerConfig {
                    servers: vec!["nwy-tiles-api.prod.newaydata.com".to_string()],
                    url_fmt: "tiles/{z}/{x}/{y}.jpg?path=latest/base/latest".to_string(),
                    ..Default::default()
                },
                TileServerConfig {
                    servers: vec!["nwy-tiles-api.prod.newaydata.com".to_string()],
                    url_fmt: "tiles/{z}/{x}/{y}.png?path=latest/aero/latest".to_string(),
                    ..Default::default()
                },
            ],
            filetype: ImageFileType::Auto,
            downloader: DownloaderKind::Simple,
        },
    );

    config.insert(
        "openflighttopo".to_string(),
        TileSetConfig {
            tile_servers: vec![
                TileServerConfig {
                    servers: vec![
                        "a.tile.opentopomap.org".to_string(),
                        "b.tile.opentopomap.org".to_string(),
                        "c.tile.opentopomap.org".to_string(),
                    ],
                    url_fmt: "{z}/{x}/{y}.png".to_string(),
                    ..Default::default()
                },
                TileServerConfig {
                    servers: vec!["nwy-tiles-api.prod.newaydata.com".to_string()],
                    url_fmt: "tiles/{z}/{x}/{y}.png?path=latest/aero/latest".to_string(),
                    ..Default::default()
                },
            ],
            filetype: ImageFileType::Auto,
            downloader: DownloaderKind::Simple,
        },
    );

    config.insert(
        "norway_vfr".to_string(),
        TileSetConfig {
            tile_servers: vec![TileServerConfig {
                servers: vec!["https://avigis.avinor.no/agsmap/rest/services/ICAO_500000/MapServer/export".to_string()],
                protocol: Protocol::Https,
                url_strategy: Some(UrlStrategy::ArcgisExport {
                    layer_show: "3".to_string(),
                    size_px: 256,
                }),
                ..Default::default()
            }],
            filetype: ImageFileType::Png,
            downloader: DownloaderKind::Simple,
        },
    );

    config.insert(
        "norway_base_throttled".to_string(),
        TileSetConfig {
            tile_servers: vec![TileServerConfig {
                custom_config: Some(GeonorgeCustomConfig {
                    dataset: GeonorgeDataset::WmsKartdata,
                    layer: "topo4".to_string(),
                    dpi: 192,
                    size_px: 512,
                }),
                tile_cache_timeout: Duration::from_secs(super::types::DEFAULT_TILE_CACHE_TIMEOUT_SEC),
                ..Default::default()
            }],
            filetype: ImageFileType::Png,
            downloader: DownloaderKind::WmsCoalescing,
        },
    );

    config.insert(
        "norway_overlay_throttled".to_string(),
        TileSetConfig {
            tile_servers: vec![
                TileServerConfig {
                    custom_config: Some(GeonorgeCustomConfig {
                        dataset: GeonorgeDataset::WmsKartdataGray,
                        layer: "topo4graatone".to_string(),
                        dpi: 192,
                        size_px: 512,
                    }),
                    ..Default::default()
                },
                TileServerConfig {
                    custom_config: Some(GeonorgeCustomConfig {
                        dataset: GeonorgeDataset::WmsFjellskygge,
                        layer: "fjellskygge".to_string(),
                        dpi: 192,
                        size_px: 512,
                    }),
                    ..Default::default()
                },
            ],
            filetype: ImageFileType::Png,
            downloader: DownloaderKind::WmsCoalescing,
        },
    );

    config
}
