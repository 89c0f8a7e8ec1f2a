mod config;
mod tile;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::http::Request;
use axum::routing::get;
use axum::Router;
use config::Config;
use metrics_exporter_prometheus::PrometheusBuilder;
use tower::{Layer, ServiceExt};
use tower_http::cors::{Any, CorsLayer};
use tower_http::normalize_path::NormalizePathLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tile::downloader::simple::SimpleDownloader;
use tile::downloader::wms::WmsCoalescingDownloader;
use tile::{sample_config, tile_routes, NamespaceLock, TileAppState, TileStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tileproxy=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();

    // Every `counter!`/`histogram!`/`gauge!` call site needs a recorder
    // installed or it's a silent no-op; this is the one the handlers hit.
    let prometheus_handle = PrometheusBuilder::new().install_recorder()?;

    let nslock = Arc::new(NamespaceLock::new());
    let store = Arc::new(TileStore::new(&config.cache.base_dir, Arc::clone(&nslock)));

    let simple_downloader = Arc::new(SimpleDownloader::with_config(
        Arc::clone(&store),
        config.simple_downloader.num_workers,
        config.simple_downloader.request_timeout,
    ));
    let wms_downloader = Arc::new(WmsCoalescingDownloader::with_config(
        Arc::clone(&store),
        Arc::clone(&nslock),
        config.wms_downloader.request_timeout,
        config.wms_downloader.concurrent_large_tile_downloads,
    ));

    // Create shared application state
    let app_state = TileAppState {
        config: Arc::new(sample_config()),
        nslock,
        simple_downloader,
        wms_downloader,
        concurrent_large_tile_downloads: config.wms_downloader.concurrent_large_tile_downloads,
    };

    // Build CORS layer
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let metrics_route = Router::new().route(
        "/metrics",
        get(move || {
            let handle = prometheus_handle.clone();
            async move { handle.render() }
        }),
    );

    // Build the router. Trailing slashes are tolerated on the tile path
    // (e.g. `/mapid/3/1/1/`), so trim them before route matching.
    let app = tile_routes(app_state)
        .merge(metrics_route)
        .layer(TraceLayer::new_for_http())
        .layer(cors);
    let app = NormalizePathLayer::trim_trailing_slash().layer(app);

    // Start the server
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!("tile proxy server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, ServiceExt::<Request<Body>>::into_make_service(app)).await?;

    Ok(())
}
