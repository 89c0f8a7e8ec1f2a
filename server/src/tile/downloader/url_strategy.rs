//! Builds a download URL for a tile from a `TileServerConfig`'s
//! `url_strategy`, replacing the original's `dynGetTileUrl` scripts with
//! a closed, typed variant set. Adding a new upstream API means adding a
//! variant here, never evaluating caller-supplied code.

use rand::Rng;

use crate::tile::geo::tile_bounds;
use crate::tile::types::{GeonorgeDataset, TileServerConfig, UrlStrategy};

/// Build the URL to fetch `(z, x, y)` for one layer.
pub fn build_url(conf: &TileServerConfig, z: u32, x: u32, y: u32) -> String {
    match conf.url_strategy.as_ref().unwrap_or(&UrlStrategy::Slippy) {
        UrlStrategy::Slippy => build_slippy_url(conf, z, x, y),
        UrlStrategy::ArcgisExport { layer_show, size_px } => {
            build_arcgis_export_url(conf, layer_show, *size_px, z, x, y)
        }
        UrlStrategy::GeonorgeWms {
            dataset,
            layer,
            dpi,
            size_px,
        } => build_geonorge_single_tile_url(*dataset, layer, *dpi, *size_px, z, x, y),
    }
}

fn pick_server(servers: &[String]) -> &str {
    if servers.len() == 1 {
        return &servers[0];
    }
    let idx = rand::rng().random_range(0..servers.len());
    &servers[idx]
}

fn build_slippy_url(conf: &TileServerConfig, z: u32, x: u32, y: u32) -> String {
    let server = pick_server(&conf.servers);
    let path = conf
        .url_fmt
        .replace("{z}", &z.to_string())
        .replace("{x}", &x.to_string())
        .replace("{y}", &y.to_string());
    format!("{}://{}/{}", conf.protocol.as_str(), server, path)
}

fn build_arcgis_export_url(conf: &TileServerConfig, layer_show: &str, size_px: u32, z: u32, x: u32, y: u32) -> String {
    let base = pick_server(&conf.servers);
    let bounds = tile_bounds(z, x, y);
    format!(
        "{base}?f=image&format=png32&transparent=true&layers=show:{layer_show}&bbox={},{},{},{}&bboxSR=4326&imageSR=3857&size={size_px},{size_px}",
        bounds.west, bounds.south, bounds.east, bounds.north
    )
}

fn build_geonorge_single_tile_url(
    dataset: GeonorgeDataset,
    layer: &str,
    dpi: u32,
    size_px: u32,
    z: u32,
    x: u32,
    y: u32,
) -> String {
    let bounds = tile_bounds(z, x, y);
    format!(
        "{}SERVICE=WMS&VERSION=1.3.0&REQUEST=GetMap&BBOX={},{},{},{}&CRS=EPSG:3857&WIDTH={size_px}&HEIGHT={size_px}&LAYERS={layer}&FORMAT=image/png&DPI={dpi}&MAP_RESOLUTION={dpi}&STYLE=default&TRANSPARENT=true",
        dataset.base_url(),
        bounds.south, bounds.west, bounds.north, bounds.east,
    )
}
