use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::Response,
    routing::get,
    Router,
};
use serde::Deserialize;
use tracing::warn;

use common::Timeframe;

use crate::{AppState, CandleUpdate};

pub fn ws_router() -> Router<AppState> {
    Router::new().route("/ws/markets/:symbol", get(ws_markets_handler))
}

#[derive(Deserialize)]
struct WsQuery {
    tf: Option<String>,
    token: Option<String>,
}

/// Streams the latest candle for `(symbol, tf)` to one connected client,
/// pushed whenever the ingestor loop broadcasts an update (~1/s per
/// spec.md). Auth via query-param token since the browser WebSocket API
/// can't set custom headers, mirroring the teacher's `/ws/logs` handler.
async fn ws_markets_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(symbol): Path<String>,
    Query(q): Query<WsQuery>,
) -> Response {
    let authed = q.token.as_deref().map(|t| t == state.dashboard_token).unwrap_or(false);
    if !authed {
        return axum::response::IntoResponse::into_response((
            axum::http::StatusCode::UNAUTHORIZED,
            "unauthorized",
        ));
    }

    let tf = q.tf.as_deref().and_then(Timeframe::parse).unwrap_or(Timeframe::M15);
    let rx = state.candle_tx.subscribe();
    ws.on_upgrade(move |socket| handle_ws(socket, rx, symbol, tf))
}

async fn handle_ws(
    mut socket: WebSocket,
    mut rx: tokio::sync::broadcast::Receiver<CandleUpdate>,
    symbol: String,
    tf: Timeframe,
) {
    loop {
        match rx.recv().await {
            Ok(update) => {
                if update.symbol != symbol || update.tf != tf {
                    continue;
                }
                let Ok(text) = serde_json::to_string(&update) else { continue };
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                warn!(dropped = n, symbol = %symbol, "market WebSocket client lagged");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}
