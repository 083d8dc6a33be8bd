use std::time::Instant;

use common::{Candle, DetectorHit, ScanContext, ScanDebug, ScanResult, Setup, Side, StrategySpec};
use governance::Candidate;
use market_data::MarketDataCache;
use strategy::DetectorRegistry;

use crate::params::params_digest;
use crate::regime::classify;

/// Projects an OK `ScanResult` into the `Candidate` shape `GovernanceSelector`
/// ranks and arbitrates over. Returns `None` for a `ScanResult::None` — those
/// never reach governance.
pub fn to_candidate(result: &ScanResult, strategy: &StrategySpec) -> Option<Candidate> {
    match result {
        ScanResult::Ok { setup, score, strategy_id, .. } => Some(Candidate {
            strategy_id: strategy_id.clone(),
            symbol: setup.symbol.clone(),
            tf: strategy.entry_tf,
            setup: setup.clone(),
            score: *score,
            cooldown_minutes: strategy.cooldown_minutes,
            daily_limit: strategy.daily_limit,
            conflict_policy: strategy.conflict_policy,
        }),
        ScanResult::None { .. } => None,
    }
}

/// Tunables for a `ScanEngine` instance, sourced from env (`DETECTOR_WARN_MS`
/// etc.) at composition-root startup.
#[derive(Debug, Clone)]
pub struct ScanEngineConfig {
    pub min_trend_bars: usize,
    pub min_entry_bars: usize,
    pub detector_warn_ms: u64,
    pub swing_lookback: usize,
    /// Mirrors `SHADOW_ALL_DETECTORS`: when set, every registered detector
    /// is evaluated for coverage telemetry alongside the strategy's
    /// configured list, without affecting scoring or the governed decision.
    pub shadow_all_detectors: bool,
}

impl Default for ScanEngineConfig {
    fn default() -> Self {
        ScanEngineConfig {
            min_trend_bars: 50,
            min_entry_bars: 50,
            detector_warn_ms: 50,
            swing_lookback: 14,
            shadow_all_detectors: false,
        }
    }
}

/// Evaluates one `StrategySpec` against one symbol's cached market data and
/// produces a `ScanResult`. Stateless aside from the config; all mutable
/// state (cooldowns, daily counts) lives in `governance::SignalStateStore`,
/// which this crate never touches directly.
pub struct ScanEngine<'a> {
    cache: &'a MarketDataCache,
    registry: &'a DetectorRegistry,
    config: ScanEngineConfig,
}

impl<'a> ScanEngine<'a> {
    pub fn new(cache: &'a MarketDataCache, registry: &'a DetectorRegistry, config: ScanEngineConfig) -> Self {
        ScanEngine { cache, registry, config }
    }

    /// Runs the full pipeline in spec order: data readiness, context build,
    /// regime classification, strategy filter, detector execution, scoring,
    /// setup build. Never panics — every failure path returns
    /// `ScanResult::None` with a stable reason code.
    pub fn scan_strategy(&self, symbol: &str, strategy: &StrategySpec, scan_id: &str) -> ScanResult {
        let mut debug = ScanDebug {
            params_digest: params_digest(strategy),
            ..Default::default()
        };

        let trend_candles = self.cache.get_resampled(symbol, strategy.trend_tf);
        let entry_candles = self.cache.get_resampled(symbol, strategy.entry_tf);

        if trend_candles.len() < self.config.min_trend_bars || entry_candles.len() < self.config.min_entry_bars {
            return ScanResult::None {
                reason: "DATA_GAP".to_string(),
                strategy_id: Some(strategy.strategy_id.clone()),
                debug,
            };
        }

        let (regime, regime_evidence) = classify(&trend_candles);
        debug.regime_evidence = regime_evidence;

        if !strategy.allowed_regimes.contains(&regime) {
            return ScanResult::None {
                reason: "REGIME_BLOCKED".to_string(),
                strategy_id: Some(strategy.strategy_id.clone()),
                debug,
            };
        }

        let ctx = ScanContext {
            symbol: symbol.to_string(),
            entry_tf_candles: entry_candles.clone(),
            trend_tf_candles: trend_candles,
            feature_bundle: Default::default(),
            regime,
            strategy: strategy.clone(),
            scan_id: scan_id.to_string(),
        };

        let hits = self.run_detectors(&ctx, &mut debug);

        if self.config.shadow_all_detectors {
            self.run_shadow_detectors(&ctx, &mut debug);
        }

        let (score_buy, score_sell) = score_hits(strategy, &hits);
        debug.score_buy = score_buy;
        debug.score_sell = score_sell;
        debug.hits = hits.clone();

        let best_side = if score_buy >= score_sell { Side::Buy } else { Side::Sell };
        let best_score = score_buy.max(score_sell);

        if hits.is_empty() {
            return ScanResult::None {
                reason: "NO_HITS".to_string(),
                strategy_id: Some(strategy.strategy_id.clone()),
                debug,
            };
        }
        if (score_buy - score_sell).abs() < strategy.epsilon {
            return ScanResult::None {
                reason: "CONFLICT_SCORE".to_string(),
                strategy_id: Some(strategy.strategy_id.clone()),
                debug,
            };
        }
        if best_score < strategy.min_score {
            return ScanResult::None {
                reason: "SCORE_BELOW_MIN".to_string(),
                strategy_id: Some(strategy.strategy_id.clone()),
                debug,
            };
        }

        let side_hits: Vec<&DetectorHit> = hits.iter().filter(|h| h.side == best_side).collect();
        let built = build_setup(&ctx.entry_tf_candles, best_side, &side_hits, self.config.swing_lookback);

        if built.rr < strategy.min_rr {
            debug.regime_evidence = serde_json::json!({
                "regime": debug.regime_evidence,
                "setup_fail": {
                    "entry_zone": built.entry_zone,
                    "entry_zone_width_pct": built.entry_zone_width_pct,
                    "sl_dist": built.sl_dist,
                    "tp_dist": built.tp_dist,
                },
            });
            return ScanResult::None {
                reason: "RR_BELOW_MIN".to_string(),
                strategy_id: Some(strategy.strategy_id.clone()),
                debug,
            };
        }

        let setup = Setup {
            symbol: symbol.to_string(),
            direction: best_side,
            entry: built.entry,
            sl: built.sl,
            tp: built.tp,
            rr: built.rr,
            evidence: serde_json::json!({
                "entry_zone": built.entry_zone,
                "hits": hits.len(),
            }),
        };

        ScanResult::Ok {
            setup,
            score: best_score,
            strategy_id: strategy.strategy_id.clone(),
            debug,
        }
    }

    fn run_detectors(&self, ctx: &ScanContext, debug: &mut ScanDebug) -> Vec<DetectorHit> {
        let mut hits = Vec::new();
        for name in &ctx.strategy.detectors {
            let Some(detector) = self.registry.build(name) else {
                continue;
            };

            let started = Instant::now();
            let hit = detector.evaluate(ctx);
            let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
            debug.detector_timings_ms.insert(name.clone(), elapsed_ms);

            if elapsed_ms > self.config.detector_warn_ms as f64 {
                tracing::warn!(detector = %name, elapsed_ms, "PERF_WARN");
            }

            if let Some(hit) = hit {
                hits.push(hit);
            }
        }
        hits
    }

    /// Runs every registered detector against `ctx`, regardless of the
    /// strategy's configured `detectors` list, purely for coverage
    /// telemetry (`ScanDebug::shadow_hits`/`shadow_hit_count`/
    /// `shadow_detectors_total`). Never influences scoring or the governed
    /// decision — callers read these fields off `debug` after the real
    /// `hits` have already been scored.
    fn run_shadow_detectors(&self, ctx: &ScanContext, debug: &mut ScanDebug) {
        let names = self.registry.names();
        let mut shadow_hits = Vec::new();
        for name in &names {
            let Some(detector) = self.registry.build(name) else {
                continue;
            };
            if detector.evaluate(ctx).is_some() {
                shadow_hits.push(name.clone());
            }
        }
        debug.shadow_detectors_total = names.len();
        debug.shadow_hit_count = shadow_hits.len();
        debug.shadow_hits = shadow_hits;
    }
}

/// `score_side = Σ (detector_weight × strength)` over hits matching that
/// side, plus `family_bonus × distinct_families_with_hits`. A detector's
/// weight is `detector_weight_overrides[name]` if present, else
/// `weights[name]`, else `1.0`. "Family" is the detector name's prefix up
/// to the first underscore — e.g. `rsi_reversal` and `rsi_divergence` both
/// belong to family `rsi`.
pub fn detector_weight(strategy: &StrategySpec, name: &str) -> f64 {
    strategy
        .detector_weight_overrides
        .get(name)
        .or_else(|| strategy.weights.get(name))
        .copied()
        .unwrap_or(1.0)
}

fn score_hits(strategy: &StrategySpec, hits: &[DetectorHit]) -> (f64, f64) {
    let mut score_buy = 0.0;
    let mut score_sell = 0.0;
    let mut families_buy = std::collections::HashSet::new();
    let mut families_sell = std::collections::HashSet::new();

    for hit in hits {
        let weight = detector_weight(strategy, &hit.name);
        let contribution = weight * hit.strength;
        let family = hit.name.split('_').next().unwrap_or(&hit.name).to_string();
        match hit.side {
            Side::Buy => {
                score_buy += contribution;
                families_buy.insert(family);
            }
            Side::Sell => {
                score_sell += contribution;
                families_sell.insert(family);
            }
        }
    }

    if families_buy.len() > 1 {
        score_buy += strategy.family_bonus * families_buy.len() as f64;
    }
    if families_sell.len() > 1 {
        score_sell += strategy.family_bonus * families_sell.len() as f64;
    }

    (score_buy, score_sell)
}

struct BuiltSetup {
    entry: f64,
    sl: f64,
    tp: f64,
    rr: f64,
    entry_zone: [f64; 2],
    entry_zone_width_pct: f64,
    sl_dist: f64,
    tp_dist: f64,
}

/// Derives entry/sl/tp from recent price action. The entry zone is the
/// average of any `entry_zone` evidence field the winning side's hits
/// carry; absent that, it falls back to the last candle's high/low.
/// Stop and target are a swing-range projection over the last
/// `swing_lookback` candles — deterministic and independent of the
/// strategy's `min_rr`, so the RR gate downstream is a real filter rather
/// than a tautology.
fn build_setup(candles: &[Candle], side: Side, side_hits: &[&DetectorHit], swing_lookback: usize) -> BuiltSetup {
    let last = candles.last();
    let (zone_lo, zone_hi) = entry_zone_from_hits(side_hits).unwrap_or_else(|| {
        last.map(|c| (c.low, c.high)).unwrap_or((0.0, 0.0))
    });
    let entry = (zone_lo + zone_hi) / 2.0;

    let window_start = candles.len().saturating_sub(swing_lookback);
    let window = &candles[window_start..];
    let swing_low = window.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);
    let swing_high = window.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max);
    let range = if swing_high > swing_low {
        swing_high - swing_low
    } else {
        (entry.abs() * 0.001).max(1e-6)
    };

    let (sl, tp) = match side {
        Side::Buy => (swing_low - range * 0.1, entry + range),
        Side::Sell => (swing_high + range * 0.1, entry - range),
    };

    let rr = Setup::compute_rr(entry, sl, tp);
    let entry_zone_width_pct = if entry.abs() > 0.0 {
        (zone_hi - zone_lo).abs() / entry.abs() * 100.0
    } else {
        0.0
    };

    BuiltSetup {
        entry,
        sl,
        tp,
        rr,
        entry_zone: [zone_lo, zone_hi],
        entry_zone_width_pct,
        sl_dist: (entry - sl).abs(),
        tp_dist: (tp - entry).abs(),
    }
}

fn entry_zone_from_hits(hits: &[&DetectorHit]) -> Option<(f64, f64)> {
    let mut los = Vec::new();
    let mut his = Vec::new();
    for hit in hits {
        if let Some(zone) = hit.evidence.get("entry_zone").and_then(|v| v.as_array()) {
            if zone.len() == 2 {
                if let (Some(lo), Some(hi)) = (zone[0].as_f64(), zone[1].as_f64()) {
                    los.push(lo);
                    his.push(hi);
                }
            }
        }
    }
    if los.is_empty() {
        return None;
    }
    let lo = los.iter().sum::<f64>() / los.len() as f64;
    let hi = his.iter().sum::<f64>() / his.len() as f64;
    Some((lo, hi))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use common::{Regime as R, Timeframe};
    use market_data::MarketDataCache;
    use strategy::DetectorRegistry;

    fn candle(i: i64, price: f64) -> Candle {
        Candle {
            time: Utc.timestamp_opt(1_700_000_000 + i * 300, 0).unwrap(),
            open: price,
            high: price + 0.5,
            low: price - 0.5,
            close: price,
            volume: Some(1.0),
        }
    }

    fn strategy_fixture() -> StrategySpec {
        let mut s = StrategySpec::default();
        s.strategy_id = "s1".to_string();
        s.trend_tf = Timeframe::H4;
        s.entry_tf = Timeframe::M15;
        s.min_rr = 0.1;
        s.min_score = 0.1;
        s.allowed_regimes = vec![R::Range, R::Chop, R::TrendBull, R::TrendBear];
        s.detectors = vec!["rsi_reversal".to_string()];
        s
    }

    #[test]
    fn data_gap_when_insufficient_bars() {
        let cache = MarketDataCache::new();
        cache.upsert("EURUSD", &[candle(0, 100.0)]);
        let registry = DetectorRegistry::new();
        let engine = ScanEngine::new(&cache, &registry, ScanEngineConfig::default());
        let strategy = strategy_fixture();
        match engine.scan_strategy("EURUSD", &strategy, "scan1") {
            ScanResult::None { reason, .. } => assert_eq!(reason, "DATA_GAP"),
            ScanResult::Ok { .. } => panic!("expected None"),
        }
    }

    #[test]
    fn regime_blocked_short_circuits() {
        let cache = MarketDataCache::new();
        let candles: Vec<Candle> = (0..400).map(|i| candle(i, 100.0 + i as f64)).collect();
        cache.upsert("EURUSD", &candles);
        let registry = strategy::global_registry();
        let mut strategy = strategy_fixture();
        strategy.allowed_regimes = vec![R::Range];
        let engine = ScanEngine::new(&cache, registry, ScanEngineConfig::default());
        match engine.scan_strategy("EURUSD", &strategy, "scan1") {
            ScanResult::None { reason, .. } => assert_eq!(reason, "REGIME_BLOCKED"),
            ScanResult::Ok { .. } => panic!("expected None"),
        }
    }

    #[test]
    fn empty_detector_set_yields_no_hits_not_conflict_score() {
        let cache = MarketDataCache::new();
        let candles: Vec<Candle> = (0..400).map(|i| candle(i, 100.0 + i as f64)).collect();
        cache.upsert("EURUSD", &candles);
        let registry = DetectorRegistry::new();
        let mut strategy = strategy_fixture();
        strategy.detectors = Vec::new();
        let engine = ScanEngine::new(&cache, &registry, ScanEngineConfig::default());
        match engine.scan_strategy("EURUSD", &strategy, "scan1") {
            ScanResult::None { reason, .. } => assert_eq!(reason, "NO_HITS"),
            ScanResult::Ok { .. } => panic!("expected None"),
        }
    }

    #[test]
    fn score_hits_applies_family_bonus_for_distinct_families() {
        let strategy = strategy_fixture();
        let hits = vec![
            DetectorHit { name: "rsi_reversal".to_string(), side: Side::Buy, strength: 0.5, evidence: serde_json::json!({}) },
            DetectorHit { name: "macd_cross".to_string(), side: Side::Buy, strength: 0.5, evidence: serde_json::json!({}) },
        ];
        let (buy, sell) = score_hits(&strategy, &hits);
        assert!(buy > 1.0);
        assert_eq!(sell, 0.0);
    }

    #[test]
    fn detector_weight_prefers_override_then_weight_then_default() {
        let mut strategy = strategy_fixture();
        strategy.weights.insert("rsi_reversal".to_string(), 2.0);
        assert_eq!(detector_weight(&strategy, "rsi_reversal"), 2.0);
        assert_eq!(detector_weight(&strategy, "macd_cross"), 1.0);

        strategy.detector_weight_overrides.insert("rsi_reversal".to_string(), 3.0);
        assert_eq!(detector_weight(&strategy, "rsi_reversal"), 3.0);
    }

    #[test]
    fn build_setup_respects_side_direction() {
        let candles: Vec<Candle> = (0..20).map(|i| candle(i, 100.0 + i as f64 * 0.1)).collect();
        let built = build_setup(&candles, Side::Buy, &[], 14);
        assert!(built.sl < built.entry);
        assert!(built.tp > built.entry);
        assert!(built.rr > 0.0);
    }

    #[test]
    fn to_candidate_carries_governance_fields_from_strategy() {
        let strategy = strategy_fixture();
        let result = ScanResult::Ok {
            setup: Setup {
                symbol: "EURUSD".to_string(),
                direction: Side::Buy,
                entry: 1.1,
                sl: 1.09,
                tp: 1.12,
                rr: 2.0,
                evidence: serde_json::json!({}),
            },
            score: 1.5,
            strategy_id: strategy.strategy_id.clone(),
            debug: ScanDebug::default(),
        };
        let candidate = to_candidate(&result, &strategy).unwrap();
        assert_eq!(candidate.tf, strategy.entry_tf);
        assert_eq!(candidate.cooldown_minutes, strategy.cooldown_minutes);

        let none_result = ScanResult::None {
            reason: "DATA_GAP".to_string(),
            strategy_id: None,
            debug: ScanDebug::default(),
        };
        assert!(to_candidate(&none_result, &strategy).is_none());
    }
}
