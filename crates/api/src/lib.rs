mod auth;
pub mod routes;

use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use axum::Router;
use serde::Serialize;
use tokio::sync::{broadcast, RwLock};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use common::{Candle, Config, Timeframe};
use queue::EventQueue;
use scan::Scheduler;
use signals::SignalsStore;
use strategy::{DetectorRegistry, StrategyLoadReport};

/// One candle broadcast to `/ws/markets/{symbol}?tf` subscribers. The
/// ingestor loop in `bin/scanner` publishes to this channel roughly once
/// per second per `(symbol, tf)`; handlers filter by subject.
#[derive(Debug, Clone, Serialize)]
pub struct CandleUpdate {
    pub symbol: String,
    pub tf: Timeframe,
    pub candle: Candle,
}

/// Shared application state injected into every route handler. Mirrors the
/// teacher's `AppState` shape (one `Clone`-able struct of `Arc`s and a
/// broadcast sender for push updates) generalized from a trading engine's
/// portfolio/trade state to a scanner's cache/strategy/signal state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub cache: Arc<market_data::MarketDataCache>,
    pub registry: &'static DetectorRegistry,
    pub strategies: Arc<RwLock<StrategyLoadReport>>,
    pub scheduler: Arc<Scheduler>,
    /// Toggled by `POST /api/scan/{start|stop}`. The scan loop in
    /// `bin/scanner` checks this before running a cycle; `Scheduler` itself
    /// has no pause concept, only cadence.
    pub scan_enabled: Arc<AtomicBool>,
    pub signals: Arc<SignalsStore>,
    pub queue: Arc<EventQueue>,
    pub dashboard_token: String,
    pub candle_tx: broadcast::Sender<CandleUpdate>,
    pub health_clock: Arc<telemetry::ProcessClock>,
    /// Updated by the scan loop after each cycle; `None` until the first
    /// scan completes.
    pub last_scan: Arc<RwLock<Option<(f64, String)>>>,
    pub metrics_events_path: String,
    pub patch_audit_path: String,
}

/// Build and run the Axum API server.
pub async fn serve(state: AppState, port: u16) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_headers(Any)
        .allow_methods(Any);

    let app = Router::new()
        .merge(routes::api_router(state.clone()))
        .merge(routes::ws_router())
        .merge(routes::health_router())
        .merge(routes::static_router())
        .with_state(state)
        .layer(cors);

    info!(%addr, "API listening");
    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}
