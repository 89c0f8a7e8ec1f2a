//! Integration tests exercising the full HTTP surface end to end against
//! a mocked upstream tile/WMS server.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::util::ServiceExt;
use tower::Layer;
use tower_http::normalize_path::NormalizePathLayer;
use tileproxy_server::tile::downloader::simple::SimpleDownloader;
use tileproxy_server::tile::downloader::wms::WmsCoalescingDownloader;
use tileproxy_server::tile::types::{
    DownloaderKind, GeonorgeCustomConfig, GeonorgeDataset, ImageFileType, MainConfig, Protocol,
    TileServerConfig, TileSetConfig,
};
use tileproxy_server::{tile_routes, NamespaceLock, TileAppState, TileStore};
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

fn png_bytes(side: u32) -> Vec<u8> {
    let img = image::DynamicImage::ImageRgba8(image::RgbaImage::new(side, side));
    let mut buf = std::io::Cursor::new(Vec::new());
    img.write_to(&mut buf, image::ImageFormat::Png).unwrap();
    buf.into_inner()
}

async fn build_app(mock_host: String, mock_host_wms: String) -> axum::Router {
    let dir = tempfile::tempdir().unwrap();
    let nslock = Arc::new(NamespaceLock::new());
    let store = Arc::new(TileStore::new(dir.path(), Arc::clone(&nslock)));

    let mut config = MainConfig::new();
    config.insert(
        "slippy_map".to_string(),
        TileSetConfig {
            tile_servers: vec![TileServerConfig {
                servers: vec![mock_host],
                url_fmt: "{z}/{x}/{y}.png".to_string(),
                protocol: Protocol::Http,
                ..Default::default()
            }],
            filetype: ImageFileType::Png,
            downloader: DownloaderKind::Simple,
        },
    );
    config.insert(
        "geonorge_map".to_string(),
        TileSetConfig {
            tile_servers: vec![TileServerConfig {
                custom_config: Some(GeonorgeCustomConfig {
                    dataset: GeonorgeDataset::WmsKartdata,
                    layer: "topo4".to_string(),
                    dpi: 192,
                    size_px: 4,
                }),
                ..Default::default()
            }],
            filetype: ImageFileType::Png,
            downloader: DownloaderKind::WmsCoalescing,
        },
    );
    let simple_downloader = Arc::new(SimpleDownloader::new(Arc::clone(&store)));
    let wms_downloader = WmsCoalescingDownloader::with_config(store, nslock.clone(), Duration::from_secs(5), 1)
        .with_base_url_override(format!("http://{mock_host_wms}/?"));

    let state = TileAppState {
        config: Arc::new(config),
        nslock: Arc::clone(&nslock),
        simple_downloader,
        wms_downloader: Arc::new(wms_downloader),
        concurrent_large_tile_downloads: 1,
    };

    tile_routes(state)
}

#[tokio::test]
async fn world_tile_at_zoom_zero_is_served() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(png_bytes(4)))
        .mount(&mock_server)
        .await;

    let app = build_app(mock_server.address().to_string(), String::new()).await;

    let response = app
        .oneshot(Request::builder().uri("/slippy_map/0/0/0").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn adjacent_tiles_sharing_a_geonorge_block_coalesce_to_one_download() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        // At z=3, block size is min(8, 2^3)=8, so the whole zoom level is one
        // block: any request at z=3 triggers exactly one upstream fetch.
        .respond_with(ResponseTemplate::new(200).set_body_bytes(png_bytes(32)))
        .expect(1)
        .mount(&mock_server)
        .await;

    let app = build_app(String::new(), mock_server.address().to_string()).await;

    let first = app
        .clone()
        .oneshot(Request::builder().uri("/geonorge_map/3/1/1").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = app
        .clone()
        .oneshot(Request::builder().uri("/geonorge_map/3/2/2").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::OK);

    mock_server.verify().await;
}

#[tokio::test]
async fn trailing_slash_on_tile_path_is_tolerated() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(png_bytes(4)))
        .mount(&mock_server)
        .await;

    let app = build_app(mock_server.address().to_string(), String::new()).await;
    let app = NormalizePathLayer::trim_trailing_slash().layer(app);

    let response = app
        .oneshot(Request::builder().uri("/slippy_map/0/0/0/").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn unknown_map_id_returns_request_timeout() {
    let app = build_app("127.0.0.1:1".to_string(), String::new()).await;

    let response = app
        .oneshot(Request::builder().uri("/does_not_exist/3/1/1").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
}

#[tokio::test]
async fn locks_listing_is_empty_when_no_requests_in_flight() {
    let app = build_app("127.0.0.1:1".to_string(), String::new()).await;

    let response = app
        .oneshot(Request::builder().uri("/locks-sorted").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert!(body.is_empty());
}
