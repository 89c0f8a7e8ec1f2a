//! HTTP route handlers for the tile proxy API.

use std::sync::Arc;

use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use metrics::histogram;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info_span, Instrument};

use super::compositor;
use super::downloader::{DownloadError, Downloader};
use super::nslock::NamespaceLock;
use super::types::{MainConfig, TileCoord, TileCoordError};

#[derive(Clone)]
pub struct TileAppState {
    pub config: Arc<MainConfig>,
    pub nslock: Arc<NamespaceLock>,
    pub simple_downloader: Arc<dyn Downloader>,
    pub wms_downloader: Arc<dyn Downloader>,
    pub concurrent_large_tile_downloads: usize,
}

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("invalid tile path: {0}")]
    BadPath(#[from] TileCoordError),
    #[error("unknown map id: {0}")]
    UnknownMap(String),
    #[error(transparent)]
    Download(#[from] DownloadError),
    #[error(transparent)]
    Compose(#[from] compositor::CompositorError),
}

/// Every failure mode collapses to 408 on the wire, matching the
/// original slippy-tile-proxy-server's behavior of letting the client's
/// tile loader simply retry or skip a tile it couldn't get in time.
impl IntoResponse for RouterError {
    fn into_response(self) -> Response {
        (StatusCode::REQUEST_TIMEOUT, self.to_string()).into_response()
    }
}

pub async fn get_tile(
    State(state): State<TileAppState>,
    Path((map_id, z, x, y)): Path<(String, u32, u32, u32)>,
) -> Result<Response, RouterError> {
    let started = Instant::now();
    async move {
        let coord = TileCoord::new(z, x, y)?;

        let tile_set = state
            .config
            .get(&map_id)
            .ok_or_else(|| RouterError::UnknownMap(map_id.clone()))?;

        let downloader: &Arc<dyn Downloader> = match tile_set.downloader {
            super::types::DownloaderKind::Simple => &state.simple_downloader,
            super::types::DownloaderKind::WmsCoalescing => &state.wms_downloader,
        };

        let image = downloader.download_tile(coord, &map_id, tile_set).await?;
        let (bytes, content_type) = compositor::encode(&image, tile_set.filetype)?;

        Ok((StatusCode::OK, [(header::CONTENT_TYPE, format!("image/{content_type}"))], bytes).into_response())
    }
    .instrument(info_span!("tile_request", %map_id, z, x, y))
    .await
    .inspect(|_| histogram!("tileproxy_tile_duration_seconds").record(started.elapsed().as_secs_f64()))
    .map_err(|e: RouterError| {
        error!(%map_id, z, x, y, error = %e, "tile request failed");
        e
    })
}

pub async fn favicon() -> impl IntoResponse {
    (StatusCode::OK, Vec::<u8>::new())
}

pub async fn locks(State(state): State<TileAppState>) -> impl IntoResponse {
    render_locks(&state, false)
}

pub async fn locks_sorted(State(state): State<TileAppState>) -> impl IntoResponse {
    render_locks(&state, true)
}

fn render_locks(state: &TileAppState, sorted_by_refcount: bool) -> (StatusCode, [(header::HeaderName, &'static str); 1], String) {
    let lines: Vec<String> = state
        .nslock
        .list(sorted_by_refcount)
        .into_iter()
        .map(|(key, refcount)| format!("{key} (refcount {refcount})"))
        .collect();
    (StatusCode::OK, [(header::CONTENT_TYPE, "text/plain")], lines.join("\n"))
}

pub async fn settings(State(state): State<TileAppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain")],
        format!("CONCURRENT_GEONORGE_LARGE_TILE_DOWNLOADS={}", state.concurrent_large_tile_downloads),
    )
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub fn tile_routes(state: TileAppState) -> Router {
    Router::new()
        .route("/favicon.ico", get(favicon))
        .route("/locks", get(locks))
        .route("/locks-sorted", get(locks_sorted))
        .route("/settings", get(settings))
        .route("/health", get(health))
        .route("/:map_id/:z/:x/:y", get(get_tile))
        .with_state(state)
}
