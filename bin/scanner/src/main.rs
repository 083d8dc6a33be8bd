use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use api::{AppState, CandleUpdate};
use common::{Candle, Config, Notifier, Provider, Result as CommonResult, ScanResult, ScanStatus, Timeframe};
use governance::{select, Candidate as GovCandidate, SignalStateStore};
use market_data::{DataIngestor, IngestorConfig, MarketDataCache};
use notify::NotificationWorker;
use queue::EventQueue;
use scan::{to_candidate, ScanEngine, ScanEngineConfig, Scheduler};
use signals::{PublicSignalRecord, SignalsStore};
use strategy::{merge_reports, global_registry, DetectorRegistry, StrategyLoadReport, StrategyPackLoader};
use telemetry::{log_startup_banner, MetricsEmitter, MetricsEvent, ProcessClock};

/// Static watch universe, grounded on `original_source/config.py`'s
/// `WATCH_PAIRS` — the corpus never grew a per-user watchlist store, so this
/// stands in for "the union of all users' active symbols" spec.md §4.3
/// describes. A future watchlist crate would replace this constant with a
/// live union computed from each user's strategy assignments.
const WATCH_SYMBOLS: &[&str] = &["XAUUSD", "EURUSD", "GBPUSD", "USDJPY", "AUDUSD", "USDCAD", "EURJPY"];

/// Stand-in `Provider` that always returns no candles. Concrete market-data
/// integrations (a broker feed, an exchange REST/WS client) are an explicit
/// Non-goal here — see DESIGN.md — so this exists only to give
/// `DataIngestor` something to poll at boot. A real deployment swaps it for
/// a `Provider` impl selected by `MARKET_DATA_PROVIDER`.
struct NullProvider;

#[async_trait]
impl Provider for NullProvider {
    async fn get_candles(
        &self,
        _symbol: &str,
        _timeframe: Timeframe,
        _limit: usize,
        _since_ts: Option<chrono::DateTime<Utc>>,
    ) -> CommonResult<Vec<Candle>> {
        Ok(vec![])
    }

    fn name(&self) -> &str {
        "null"
    }
}

/// Telegram `Notifier`, grounded on `notify::commands::start_bot`'s bot
/// instance and the reference `notify/telegram.py` send helper — the
/// notification bot itself is in-scope (unlike market-data providers), so
/// this is a real integration rather than a stub.
struct TelegramNotifier {
    bot: teloxide::Bot,
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send_message(&self, chat_id: i64, text: &str) -> bool {
        use teloxide::prelude::*;
        use teloxide::types::ParseMode;
        self.bot
            .send_message(ChatId(chat_id), text)
            .parse_mode(ParseMode::Html)
            .await
            .map(|_| true)
            .unwrap_or_else(|e| {
                warn!(chat_id, error = %e, "telegram send_message failed");
                false
            })
    }

    async fn send_photo(&self, chat_id: i64, caption: &str, bytes: Vec<u8>) -> bool {
        use teloxide::prelude::*;
        use teloxide::types::InputFile;
        self.bot
            .send_photo(ChatId(chat_id), InputFile::memory(bytes))
            .caption(caption)
            .await
            .map(|_| true)
            .unwrap_or_else(|e| {
                warn!(chat_id, error = %e, "telegram send_photo failed");
                false
            })
    }
}

fn notify_mode_str(mode: common::NotifyMode) -> &'static str {
    match mode {
        common::NotifyMode::Off => "off",
        common::NotifyMode::All => "all",
        common::NotifyMode::AdminOnly => "admin_only",
    }
}

fn discover_strategy_files(dir: &str) -> Vec<std::path::PathBuf> {
    let mut files: Vec<std::path::PathBuf> = match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|ext| ext == "json").unwrap_or(false))
            .collect(),
        Err(_) => Vec::new(),
    };
    files.sort();
    files
}

fn load_detector_aliases(path: Option<&str>) -> HashMap<String, String> {
    let Some(path) = path else { return HashMap::new() };
    let Ok(text) = std::fs::read_to_string(path) else { return HashMap::new() };
    serde_json::from_str(&text).unwrap_or_default()
}

fn load_strategies(cfg: &Config, registry: &DetectorRegistry) -> StrategyLoadReport {
    let aliases = load_detector_aliases(cfg.detector_aliases_path.as_deref());
    let today = Utc::now().format("%Y-%m-%d").to_string();
    let loader = StrategyPackLoader::new(registry)
        .with_aliases(aliases)
        .with_autofix_threshold(cfg.unknown_detector_autofix_threshold)
        .with_today(today)
        .with_strict_unknown_detectors(cfg.strict_strategy_detectors);

    let files = discover_strategy_files(&cfg.user_strategies_dir);
    if files.is_empty() {
        warn!(dir = %cfg.user_strategies_dir, "no strategy pack files found");
    }

    let reports: Vec<StrategyLoadReport> = files.iter().map(|f| loader.load_file(f)).collect();
    merge_reports(reports)
}

fn now_unix_f64() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// One scan pass over every watched symbol, grounded on spec.md §4.5/§4.6's
/// per-(symbol) pipeline: evaluate every loaded strategy, arbitrate the
/// resulting candidates through governance, and persist/notify the winner.
/// Never panics: a per-strategy failure can only produce a `ScanResult`,
/// never an unwind.
#[allow(clippy::too_many_arguments)]
async fn run_scan_cycle(
    cache: Arc<MarketDataCache>,
    registry: &'static DetectorRegistry,
    strategies: Arc<RwLock<StrategyLoadReport>>,
    state_store: Arc<SignalStateStore>,
    queue: Arc<EventQueue>,
    signals: Arc<SignalsStore>,
    metrics: Arc<MetricsEmitter>,
    engine_config: ScanEngineConfig,
    failover_on_block: bool,
    last_scan: Arc<RwLock<Option<(f64, String)>>>,
) {
    let scan_id = uuid::Uuid::new_v4().to_string();
    let report = strategies.read().await.clone();
    if report.strategies.is_empty() {
        return;
    }

    let engine = ScanEngine::new(cache.as_ref(), registry, engine_config);
    let now = now_unix_f64();
    let today = chrono::DateTime::<Utc>::from_timestamp(now as i64, 0)
        .unwrap_or_else(Utc::now)
        .format("%Y-%m-%d")
        .to_string();

    for symbol in WATCH_SYMBOLS {
        let mut candidates: Vec<(GovCandidate, common::StrategySpec, ScanResult)> = Vec::new();

        for strategy in &report.strategies {
            let result = engine.scan_strategy(symbol, strategy, &scan_id);
            emit_metrics(&metrics, symbol, &scan_id, strategy, &result);

            if let Some(candidate) = to_candidate(&result, strategy) {
                candidates.push((candidate, strategy.clone(), result));
            }
        }

        if candidates.is_empty() {
            continue;
        }

        let gov_candidates: Vec<GovCandidate> = candidates.iter().map(|(c, _, _)| c.clone()).collect();
        let selection = select(gov_candidates, &state_store, now, &today, failover_on_block);

        let Some(accepted) = selection.accepted else {
            continue;
        };

        let Some((_, strategy, result)) =
            candidates.into_iter().find(|(c, _, _)| c.strategy_id == accepted.strategy_id)
        else {
            continue;
        };

        let ScanResult::Ok { setup, score, strategy_id, debug } = &result else {
            continue;
        };

        let governance_evidence = serde_json::json!({
            "used_failover": selection.used_failover,
            "blocked_winner_strategy_id": selection.blocked_winner_strategy_id,
            "blocked_reason": selection.blocked_reason,
        });

        let explain = telemetry::build_pair_ok_explain(
            symbol,
            strategy.entry_tf,
            &scan_id,
            &strategy,
            setup,
            *score,
            debug,
            Some(governance_evidence),
        );

        let signal_id = uuid::Uuid::new_v4().to_string();
        let created_at = Utc::now();

        let legacy = common::Signal {
            signal_id: signal_id.clone(),
            created_at,
            user_id: "system".to_string(),
            symbol: symbol.to_string(),
            tf: strategy.entry_tf,
            direction: setup.direction,
            entry: setup.entry,
            sl: setup.sl,
            tp: setup.tp,
            rr: setup.rr,
            score: *score,
            strategy_id: strategy_id.clone(),
            scan_id: scan_id.clone(),
            reasons: vec![explain.reason.clone()],
            explain: serde_json::to_value(&explain).unwrap_or(serde_json::Value::Null),
            annotations: serde_json::Value::Null,
            drawings: vec![],
        };

        let public = PublicSignalRecord {
            user_id: "system".to_string(),
            signal: common::PublicSignal {
                signal_id: signal_id.clone(),
                created_at,
                symbol: symbol.to_string(),
                tf: strategy.entry_tf,
                status: ScanStatus::Ok,
                direction: Some(setup.direction),
                strategy_id: strategy_id.clone(),
                score: Some(*score),
                evidence: common::PublicEvidence {
                    entry: Some(setup.entry),
                    sl: Some(setup.sl),
                    tp: Some(setup.tp),
                    rr: Some(setup.rr),
                    entry_zone: None,
                },
                chart_drawings: vec![],
            },
        };

        if let Err(e) = signals.append(&legacy, &public) {
            warn!(error = %e, signal_id = %signal_id, "signal persistence failed");
        }

        let setup_key = governance::make_key(symbol, strategy.entry_tf, strategy_id, setup.direction);
        let setup_type = match setup.direction {
            common::Side::Buy => "BUY_SETUP",
            common::Side::Sell => "SELL_SETUP",
        };
        let payload = serde_json::to_value(&explain).unwrap_or(serde_json::Value::Null);
        if let Err(e) = queue
            .enqueue(symbol, strategy.entry_tf.as_str(), setup_type, &setup_key, &payload)
            .await
        {
            warn!(error = %e, signal_id = %signal_id, "signal enqueue failed");
        }

        *last_scan.write().await = Some((now, scan_id.clone()));
    }

    if let Err(e) = state_store.save_atomic() {
        warn!(error = %e, "signal state persistence failed");
    }
}

fn emit_metrics(
    metrics: &MetricsEmitter,
    symbol: &str,
    scan_id: &str,
    strategy: &common::StrategySpec,
    result: &ScanResult,
) {
    let event = match result {
        ScanResult::Ok { setup, score, strategy_id, debug } => MetricsEvent {
            ts: now_unix_f64(),
            scan_id: scan_id.to_string(),
            symbol: symbol.to_string(),
            tf: strategy.entry_tf.as_str().to_string(),
            strategy_id: strategy_id.clone(),
            status: "OK".to_string(),
            reason: "OK".to_string(),
            score: Some(*score),
            rr: Some(setup.rr),
            regime: debug
                .regime_evidence
                .get("regime")
                .and_then(|v| v.as_str())
                .unwrap_or("NA")
                .to_string(),
            candidates: None,
            failover_used: None,
            params_digest: debug.params_digest.clone(),
            top_hits: debug.hits.iter().map(|h| h.name.clone()).collect(),
            hit_count: debug.hits.len(),
            shadow_hits: shadow_hits_field(debug),
            shadow_hit_count: shadow_hit_count_field(debug),
            shadow_detectors_total: shadow_detectors_total_field(debug),
        },
        ScanResult::None { reason, strategy_id, debug } => MetricsEvent {
            ts: now_unix_f64(),
            scan_id: scan_id.to_string(),
            symbol: symbol.to_string(),
            tf: strategy.entry_tf.as_str().to_string(),
            strategy_id: strategy_id.clone().unwrap_or_else(|| "NA".to_string()),
            status: "NONE".to_string(),
            reason: reason.clone(),
            score: None,
            rr: None,
            regime: debug
                .regime_evidence
                .get("regime")
                .and_then(|v| v.as_str())
                .unwrap_or("NA")
                .to_string(),
            candidates: None,
            failover_used: None,
            params_digest: debug.params_digest.clone(),
            top_hits: debug.hits.iter().map(|h| h.name.clone()).collect(),
            hit_count: debug.hits.len(),
            shadow_hits: shadow_hits_field(debug),
            shadow_hit_count: shadow_hit_count_field(debug),
            shadow_detectors_total: shadow_detectors_total_field(debug),
        },
    };
    metrics.emit(&event);
}

/// `ScanDebug::shadow_detectors_total == 0` means `SHADOW_ALL_DETECTORS` was
/// off for this scan (or the registry was empty) — in either case the
/// metrics event omits the shadow fields entirely rather than emitting
/// zeros, matching the reference emitter's optional-field behavior.
fn shadow_hits_field(debug: &common::ScanDebug) -> Option<Vec<String>> {
    (debug.shadow_detectors_total > 0).then(|| debug.shadow_hits.clone())
}

fn shadow_hit_count_field(debug: &common::ScanDebug) -> Option<usize> {
    (debug.shadow_detectors_total > 0).then_some(debug.shadow_hit_count)
}

fn shadow_detectors_total_field(debug: &common::ScanDebug) -> Option<usize> {
    (debug.shadow_detectors_total > 0).then_some(debug.shadow_detectors_total)
}

/// Pushes the latest candle per `(symbol, tf)` to `/ws/markets` subscribers
/// roughly once a second, per spec.md §6's WS push cadence. Independent of
/// `DataIngestor`, which only owns the cache — this loop just reads it.
async fn run_candle_pusher(cache: Arc<MarketDataCache>, tx: broadcast::Sender<CandleUpdate>) {
    let timeframes = [Timeframe::M5, Timeframe::M15, Timeframe::H1, Timeframe::H4, Timeframe::D1];
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    loop {
        tick.tick().await;
        for symbol in cache.get_all_symbols() {
            for tf in timeframes {
                if let Some(candle) = cache.get_resampled(&symbol, tf).last().copied() {
                    let _ = tx.send(CandleUpdate { symbol: symbol.clone(), tf, candle });
                }
            }
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    let cfg = Config::from_env();
    let registry = global_registry();

    let report = load_strategies(&cfg, registry);
    if cfg.strict_startup && report.strategies.is_empty() {
        panic!("NO_DETECTORS_LOADED: strict startup requires at least one valid strategy");
    }

    log_startup_banner(
        &cfg.app_version,
        &cfg.git_sha,
        registry.names().len(),
        &cfg.user_strategies_dir,
        notify_mode_str(cfg.notify_mode),
        &cfg.market_data_provider,
    );

    let db = SqlitePool::connect(&cfg.database_url)
        .await
        .unwrap_or_else(|e| panic!("failed to connect to database: {e}"));
    let queue = Arc::new(EventQueue::new(db));
    queue.migrate().await.unwrap_or_else(|e| panic!("queue migration failed: {e}"));

    let cache = Arc::new(MarketDataCache::new());
    let state_store = Arc::new(SignalStateStore::new(format!("{}/signal_state.json", cfg.state_dir)));
    state_store.load();

    let signals_store = Arc::new(SignalsStore::new(
        format!("{}/signals.jsonl", cfg.state_dir),
        format!("{}/signals_public.jsonl", cfg.state_dir),
    ));

    let metrics = Arc::new(MetricsEmitter::new(format!("{}/metrics_events.jsonl", cfg.state_dir)));
    let health_clock = Arc::new(ProcessClock::start());

    let strategies = Arc::new(RwLock::new(report));
    let scan_enabled = Arc::new(AtomicBool::new(true));
    let last_scan: Arc<RwLock<Option<(f64, String)>>> = Arc::new(RwLock::new(None));

    let (candle_tx, _) = broadcast::channel::<CandleUpdate>(256);

    let primary_provider: Arc<dyn Provider> = Arc::new(NullProvider);
    let ingestor = DataIngestor::new(
        cache.clone(),
        primary_provider,
        None,
        WATCH_SYMBOLS.iter().map(|s| s.to_string()).collect(),
        IngestorConfig {
            persist_path: cfg.market_cache_path.clone(),
            ..IngestorConfig::default()
        },
    );

    let scheduler = Arc::new(Scheduler::new(
        Duration::from_secs(cfg.auto_scan_interval_min * 60),
        Duration::from_secs(cfg.scheduler_misfire_grace_sec),
    ));

    let engine_config = ScanEngineConfig {
        detector_warn_ms: cfg.detector_warn_ms as u64,
        shadow_all_detectors: cfg.shadow_all_detectors,
        ..ScanEngineConfig::default()
    };

    let app_state = AppState {
        config: Arc::new(cfg.clone()),
        cache: cache.clone(),
        registry,
        strategies: strategies.clone(),
        scheduler: scheduler.clone(),
        scan_enabled: scan_enabled.clone(),
        signals: signals_store.clone(),
        queue: queue.clone(),
        dashboard_token: cfg.dashboard_token.clone(),
        candle_tx: candle_tx.clone(),
        health_clock: health_clock.clone(),
        last_scan: last_scan.clone(),
        metrics_events_path: metrics.path().to_string_lossy().to_string(),
        patch_audit_path: std::env::var("PATCH_AUDIT_PATH").unwrap_or_else(|_| "state/patch_audit.jsonl".to_string()),
    };

    let (scheduler_shutdown_tx, scheduler_shutdown_rx) = tokio::sync::oneshot::channel();
    let (notify_shutdown_tx, notify_shutdown_rx) = tokio::sync::oneshot::channel();

    tokio::spawn(ingestor.run());
    tokio::spawn(run_candle_pusher(cache.clone(), candle_tx.clone()));

    {
        let cache = cache.clone();
        let strategies = strategies.clone();
        let state_store = state_store.clone();
        let queue = queue.clone();
        let signals_store = signals_store.clone();
        let metrics = metrics.clone();
        let engine_config = engine_config.clone();
        let failover_on_block = cfg.strategy_failover_on_block;
        let scan_enabled = scan_enabled.clone();
        let last_scan = last_scan.clone();
        let scheduler_run = scheduler.clone();
        tokio::spawn(async move {
            scheduler_run
                .run(
                    move || {
                        let cache = cache.clone();
                        let strategies = strategies.clone();
                        let state_store = state_store.clone();
                        let queue = queue.clone();
                        let signals_store = signals_store.clone();
                        let metrics = metrics.clone();
                        let engine_config = engine_config.clone();
                        let scan_enabled = scan_enabled.clone();
                        let last_scan = last_scan.clone();
                        async move {
                            if !scan_enabled.load(Ordering::SeqCst) {
                                return;
                            }
                            run_scan_cycle(
                                cache,
                                registry,
                                strategies,
                                state_store,
                                queue,
                                signals_store,
                                metrics,
                                engine_config,
                                failover_on_block,
                                last_scan,
                            )
                            .await;
                        }
                    },
                    scheduler_shutdown_rx,
                )
                .await;
        });
    }

    if cfg.notify_mode != common::NotifyMode::Off {
        let notifier = TelegramNotifier { bot: teloxide::Bot::new(cfg.telegram_token.clone()) };
        let worker = NotificationWorker::new(queue.clone(), notifier, cfg.notify_mode, cfg.signal_cooldown_minutes * 60);
        tokio::spawn(async move {
            worker.run(Duration::from_secs(10), notify_shutdown_rx).await;
        });
    }

    tokio::spawn(api::serve(app_state, cfg.dashboard_port));

    info!("signalscan started");

    tokio::signal::ctrl_c().await.unwrap();
    info!("shutdown signal received");
    let _ = scheduler_shutdown_tx.send(());
    let _ = notify_shutdown_tx.send(());
}
