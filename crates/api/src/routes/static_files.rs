use axum::{
    body::Body,
    http::{header, StatusCode, Uri},
    response::{IntoResponse, Response},
    Router,
};
use rust_embed::RustEmbed;

use crate::AppState;

/// Embeds the scan dashboard's compiled assets at compile time. The
/// dashboard is a small read-only view over `/api/*` (pairs, candles,
/// signals, strategy state) rather than a full app shell, so this serves
/// whatever static bundle lands under `dashboard/dist/` — swap the folder
/// path for that directory once a real build exists.
#[derive(RustEmbed)]
#[folder = "../../dashboard/dist-placeholder/"]
struct DashboardAssets;

pub fn static_router() -> Router<AppState> {
    Router::new().fallback(serve_dashboard_asset)
}

async fn serve_dashboard_asset(uri: Uri) -> Response {
    let path = uri.path().trim_start_matches('/');
    let path = if path.is_empty() { "index.html" } else { path };

    match DashboardAssets::get(path) {
        Some(content) => {
            let mime = mime_guess::from_path(path)
                .first_or_octet_stream()
                .to_string();
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, mime)
                .body(Body::from(content.data.into_owned()))
                .unwrap()
        }
        None => {
            // SPA fallback: serve index.html for all unmatched paths
            match DashboardAssets::get("index.html") {
                Some(index) => Response::builder()
                    .status(StatusCode::OK)
                    .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
                    .body(Body::from(index.data.into_owned()))
                    .unwrap(),
                None => (StatusCode::NOT_FOUND, "dashboard not built").into_response(),
            }
        }
    }
}
