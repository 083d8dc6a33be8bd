use std::sync::atomic::Ordering;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use common::Timeframe;
use strategy::StrategyPackLoader;

use crate::{auth::require_auth, AppState};

pub fn api_router(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/health", get(get_health))
        .route("/api/pairs", get(get_pairs))
        .route("/api/candles", get(get_candles))
        .route("/api/markets/:symbol/candles", get(get_market_candles))
        .route("/api/signals", get(get_signals))
        .route("/api/signals/:id", get(get_signal_by_id))
        .route("/api/detectors", get(get_detectors))
        .route("/api/strategies", get(get_strategies).put(put_strategies))
        .route("/api/scan/start", post(post_scan_start))
        .route("/api/scan/stop", post(post_scan_stop))
        .route("/api/scan/manual", post(post_scan_manual))
        .route_layer(middleware::from_fn_with_state(state, require_auth))
}

// ─── Health ───────────────────────────────────────────────────────────────────

async fn get_health(State(state): State<AppState>) -> Json<Value> {
    let report = state.strategies.read().await;
    let (last_scan_ts, last_scan_id) = match &*state.last_scan.read().await {
        Some((ts, id)) => (Some(*ts), Some(id.clone())),
        None => (None, None),
    };

    let snapshot = telemetry::build_health_snapshot(
        &state.config.app_version,
        &state.config.git_sha,
        &state.health_clock,
        &report,
        last_scan_ts,
        last_scan_id,
        &state.metrics_events_path,
        &state.patch_audit_path,
    );
    Json(serde_json::to_value(snapshot).unwrap_or(json!({"status": "ok"})))
}

// ─── Markets ──────────────────────────────────────────────────────────────────

async fn get_pairs(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "pairs": state.cache.get_all_symbols() }))
}

#[derive(Deserialize)]
struct CandlesQuery {
    symbol: String,
    tf: Option<String>,
    limit: Option<usize>,
}

async fn get_candles(State(state): State<AppState>, Query(q): Query<CandlesQuery>) -> Json<Value> {
    let tf = q.tf.as_deref().and_then(Timeframe::parse).unwrap_or(Timeframe::M15);
    let limit = q.limit.unwrap_or(200).min(2000);
    let candles = state.cache.get_resampled(&q.symbol, tf);
    let tail: Vec<_> = candles.iter().rev().take(limit).rev().cloned().collect();
    Json(json!({ "symbol": q.symbol, "tf": tf.as_str(), "candles": tail }))
}

#[derive(Deserialize)]
struct MarketCandlesQuery {
    tf: Option<String>,
    limit: Option<usize>,
}

async fn get_market_candles(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
    Query(q): Query<MarketCandlesQuery>,
) -> Json<Value> {
    let tf = q.tf.as_deref().and_then(Timeframe::parse).unwrap_or(Timeframe::M15);
    let limit = q.limit.unwrap_or(200).min(2000);
    let candles = state.cache.get_resampled(&symbol, tf);
    let tail: Vec<_> = candles.iter().rev().take(limit).rev().cloned().collect();
    Json(json!({ "symbol": symbol, "tf": tf.as_str(), "candles": tail }))
}

// ─── Signals ──────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct SignalsQuery {
    limit: Option<usize>,
    symbol: Option<String>,
}

async fn get_signals(State(state): State<AppState>, Query(q): Query<SignalsQuery>) -> Json<Value> {
    let limit = q.limit.unwrap_or(50).min(500);
    // The dashboard is authenticated by one shared bearer token with no
    // per-request user identity, so it reads across all users (admin mode)
    // the same way the single dashboard operator sees every scan.
    let records = state.signals.list(None, q.symbol.as_deref(), limit);
    Json(json!({ "signals": records }))
}

async fn get_signal_by_id(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> (StatusCode, Json<Value>) {
    match state.signals.get_by_id(&id) {
        Some(record) => (StatusCode::OK, Json(serde_json::to_value(record).unwrap_or(Value::Null))),
        None => (StatusCode::NOT_FOUND, Json(json!({"error": "not_found"}))),
    }
}

// ─── Detectors & strategies ───────────────────────────────────────────────────

#[derive(Deserialize)]
struct DetectorsQuery {
    #[serde(default)]
    include_docs: bool,
}

async fn get_detectors(State(state): State<AppState>, Query(q): Query<DetectorsQuery>) -> Json<Value> {
    let names = state.registry.names();
    if q.include_docs {
        // Detectors are pure evaluate-only trait objects with no attached
        // doc/params_schema/examples metadata in this registry — surface
        // the name so callers can still enumerate, without fabricating
        // documentation the registry doesn't carry.
        let entries: Vec<Value> = names
            .into_iter()
            .map(|n| json!({ "name": n, "doc": Value::Null, "params_schema": Value::Null, "examples": Value::Null }))
            .collect();
        Json(json!({ "detectors": entries }))
    } else {
        Json(json!({ "detectors": names }))
    }
}

async fn get_strategies(State(state): State<AppState>) -> Json<Value> {
    let report = state.strategies.read().await;
    Json(json!({
        "strategies": report.strategies,
        "invalid": report.invalid_enabled,
        "warnings": report.warnings,
    }))
}

async fn put_strategies(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let text = match serde_json::to_string(&body) {
        Ok(t) => t,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, Json(json!({"error": format!("invalid body: {e}")})));
        }
    };

    let loader = StrategyPackLoader::new(state.registry)
        .with_autofix_threshold(state.config.unknown_detector_autofix_threshold)
        .with_strict_unknown_detectors(state.config.strict_strategy_detectors);
    let report = loader.load_str(&text);

    if !report.ok() {
        warn!(errors = ?report.errors, "PUT /api/strategies rejected: no valid strategies loaded");
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({"errors": report.errors, "invalid": report.invalid_enabled})),
        );
    }

    let response = json!({
        "accepted": report.strategies.len(),
        "invalid": report.invalid_enabled,
        "warnings": report.warnings,
    });
    *state.strategies.write().await = report;
    (StatusCode::OK, Json(response))
}

// ─── Scan control ─────────────────────────────────────────────────────────────

async fn post_scan_start(State(state): State<AppState>) -> Json<Value> {
    state.scan_enabled.store(true, Ordering::SeqCst);
    Json(json!({ "scan_enabled": true }))
}

async fn post_scan_stop(State(state): State<AppState>) -> Json<Value> {
    state.scan_enabled.store(false, Ordering::SeqCst);
    Json(json!({ "scan_enabled": false }))
}

async fn post_scan_manual(State(state): State<AppState>) -> Json<Value> {
    state.scheduler.trigger_manual();
    Json(json!({ "triggered": true }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    use common::{Candle, Config, NotifyMode};
    use queue::EventQueue;
    use signals::SignalsStore;
    use strategy::global_registry;
    use tokio::sync::RwLock;

    fn test_config() -> Config {
        Config {
            app_version: "test".to_string(),
            git_sha: "deadbeef".to_string(),
            telegram_token: String::new(),
            telegram_allowed_user_ids: vec![],
            dashboard_token: "secret".to_string(),
            dashboard_port: 8080,
            database_url: "sqlite::memory:".to_string(),
            auto_scan_interval_min: 5,
            scheduler_misfire_grace_sec: 30,
            market_data_provider: "mock".to_string(),
            market_cache_path: "/tmp/unused_cache.json".to_string(),
            state_dir: "/tmp".to_string(),
            user_strategies_dir: "/tmp".to_string(),
            detector_aliases_path: None,
            strict_strategy_detectors: false,
            strict_startup: false,
            strategy_failover_on_block: true,
            daily_limit_per_symbol: 10,
            signal_cooldown_minutes: 30,
            notify_mode: NotifyMode::Off,
            detector_warn_ms: 50.0,
            feature_warn_ms: 50.0,
            pair_warn_ms: 200.0,
            scan_cycle_warn_ms: 2000.0,
            patch_suggestions_path: "/tmp/patch_suggestions.jsonl".to_string(),
            unknown_detector_autofix_threshold: 0.85,
            shadow_all_detectors: false,
        }
    }

    async fn test_state() -> AppState {
        let cache = market_data::MarketDataCache::new();
        cache.upsert(
            "EURUSD",
            &[Candle {
                time: chrono::Utc::now(),
                open: 1.1,
                high: 1.11,
                low: 1.09,
                close: 1.105,
                volume: Some(100.0),
            }],
        );

        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        let queue = EventQueue::new(pool);
        queue.migrate().await.unwrap();
        let (tx, _rx) = tokio::sync::broadcast::channel(16);

        AppState {
            config: std::sync::Arc::new(test_config()),
            cache: std::sync::Arc::new(cache),
            registry: global_registry(),
            strategies: std::sync::Arc::new(RwLock::new(Default::default())),
            scheduler: std::sync::Arc::new(scan::Scheduler::new(Duration::from_secs(300), Duration::from_secs(30))),
            scan_enabled: std::sync::Arc::new(AtomicBool::new(true)),
            signals: std::sync::Arc::new(SignalsStore::new(
                std::env::temp_dir().join(format!("signalscan_api_test_legacy_{}.jsonl", std::process::id())),
                std::env::temp_dir().join(format!("signalscan_api_test_public_{}.jsonl", std::process::id())),
            )),
            queue: std::sync::Arc::new(queue),
            dashboard_token: "secret".to_string(),
            candle_tx: tx,
            health_clock: std::sync::Arc::new(telemetry::ProcessClock::start()),
            last_scan: std::sync::Arc::new(RwLock::new(None)),
            metrics_events_path: "/tmp/metrics_events.jsonl".to_string(),
            patch_audit_path: "/tmp/patch_audit.jsonl".to_string(),
        }
    }

    #[tokio::test]
    async fn get_pairs_returns_cache_symbols() {
        let state = test_state().await;
        let Json(body) = get_pairs(State(state)).await;
        assert_eq!(body["pairs"], json!(["EURUSD"]));
    }

    #[tokio::test]
    async fn get_candles_resamples_and_truncates() {
        let state = test_state().await;
        let Json(body) = get_candles(
            State(state),
            Query(CandlesQuery { symbol: "EURUSD".to_string(), tf: Some("M15".to_string()), limit: Some(1) }),
        )
        .await;
        assert_eq!(body["tf"], "M15");
        assert_eq!(body["candles"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn get_signals_empty_store_returns_empty_list() {
        let state = test_state().await;
        let Json(body) = get_signals(State(state), Query(SignalsQuery { limit: None, symbol: None })).await;
        assert_eq!(body["signals"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn get_signal_by_id_missing_is_404() {
        let state = test_state().await;
        let (status, _) = get_signal_by_id(State(state), Path("nope".to_string())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn get_detectors_lists_registered_names() {
        let state = test_state().await;
        let Json(body) = get_detectors(State(state), Query(DetectorsQuery { include_docs: false })).await;
        let names: Vec<String> = serde_json::from_value(body["detectors"].clone()).unwrap();
        assert!(names.contains(&"rsi_reversal".to_string()));
    }

    #[tokio::test]
    async fn put_strategies_with_valid_pack_replaces_report() {
        let state = test_state().await;
        let pack = json!({
            "schema_version": 1,
            "strategies": [{
                "strategy_id": "momentum_1",
                "trend_tf": "H1",
                "entry_tf": "M15",
                "min_rr": 1.5,
                "min_score": 1.0,
                "allowed_regimes": ["TREND_BULL", "TREND_BEAR"],
                "detectors": ["rsi_reversal"],
            }],
        });

        let (status, Json(body)) = put_strategies(State(state.clone()), Json(pack)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["accepted"], 1);

        let report = state.strategies.read().await;
        assert_eq!(report.strategies.len(), 1);
        assert_eq!(report.strategies[0].strategy_id, "momentum_1");
    }

    #[tokio::test]
    async fn put_strategies_with_no_valid_entries_is_rejected() {
        let state = test_state().await;
        let pack = json!({ "schema_version": 1, "strategies": [] });
        let (status, _) = put_strategies(State(state), Json(pack)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn scan_start_stop_toggles_flag() {
        let state = test_state().await;
        let _ = post_scan_stop(State(state.clone())).await;
        assert!(!state.scan_enabled.load(Ordering::SeqCst));
        let _ = post_scan_start(State(state.clone())).await;
        assert!(state.scan_enabled.load(Ordering::SeqCst));
    }
}
