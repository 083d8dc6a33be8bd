use std::collections::HashSet;

use common::{DetectorHit, ScanDebug, ScanStatus, Setup, Side, StrategySpec, Timeframe};

const SCHEMA_VERSION: u32 = 1;

/// Stable reason codes the rest of the system (notify, API, metrics) keys
/// off of. `_stable_reason` in the original collapses free-form or
/// suffixed reason strings down to this closed set.
const KNOWN_REASONS: &[&str] = &[
    "NO_HITS",
    "RR_BELOW_MIN",
    "COOLDOWN_ACTIVE",
    "DAILY_LIMIT_REACHED",
    "REGIME_BLOCKED",
    "NO_DETECTORS_FOR_REGIME",
    "SETUP_BUILD_FAILED",
    "PRIMITIVE_ERROR",
    "DATA_GAP",
];

fn stable_reason(reason: &str) -> String {
    let s = reason.trim();
    if s.is_empty() {
        return "UNKNOWN".to_string();
    }
    if s.starts_with("SCORE_BELOW_MIN") {
        return "SCORE_BELOW_MIN".to_string();
    }
    if s.starts_with("CONFLICT_SCORE") {
        return "CONFLICT_SCORE".to_string();
    }
    for known in KNOWN_REASONS {
        if s.starts_with(known) {
            return (*known).to_string();
        }
    }
    s.split('|').next().unwrap_or(s).to_string()
}

fn side_str(side: Side) -> &'static str {
    match side {
        Side::Buy => "BUY",
        Side::Sell => "SELL",
    }
}

/// One `(detector, weighted_contribution)` pair, ordered by the engine's
/// own hit order (not re-sorted — the engine's order already reflects
/// `StrategySpec.detectors` declaration order).
struct Contrib {
    detector: String,
    weighted: f64,
}

fn contribs_for_side(strategy: &StrategySpec, hits: &[DetectorHit], side: Side) -> Vec<Contrib> {
    hits.iter()
        .filter(|h| h.side == side)
        .map(|h| Contrib {
            detector: h.name.clone(),
            weighted: scan::detector_weight(strategy, &h.name) * h.strength,
        })
        .collect()
}

/// Formats up to 3 top contributors as `"name(weighted)"`. Falls back to
/// names-only (and reports `inconsistent = true`) when the shown
/// contributions don't sum to `score_raw` within tolerance — guards
/// against displaying stale or mismatched numbers to a reader.
fn top_contribs_for_ok(contribs: &[Contrib], score_raw: f64, tolerance: f64) -> (String, bool) {
    if contribs.is_empty() {
        return ("NA".to_string(), false);
    }

    let sum_top: f64 = contribs.iter().map(|c| c.weighted).sum();
    let consistent = (sum_top - score_raw).abs() <= tolerance;

    let names_only = || {
        contribs.iter().take(3).map(|c| c.detector.clone()).collect::<Vec<_>>().join(", ")
    };

    if !consistent {
        return (names_only(), true);
    }

    let shown: Vec<String> = contribs.iter().take(3).map(|c| format!("{}({:.2})", c.detector, c.weighted)).collect();
    (shown.join(", "), false)
}

fn top_contribs_names(hits: &[DetectorHit]) -> String {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for h in hits.iter().take(10) {
        if seen.insert(h.name.clone()) {
            out.push(h.name.clone());
        }
    }
    if out.is_empty() {
        "NA".to_string()
    } else {
        out.join(", ")
    }
}

fn summary_ok(side: Side, score: f64, score_raw: f64, bonus: f64, rr: f64, regime: &str, top: &str) -> String {
    format!(
        "{} signal: score={:.2} (raw {:.2} + bonus {:.2}), RR={:.2}, regime={}. Top: {}.",
        side_str(side),
        score,
        score_raw,
        bonus,
        rr,
        regime,
        top
    )
}

fn summary_none(reason: &str, regime: &str, buy_score: f64, sell_score: f64, min_score: f64, rr: Option<f64>, min_rr: Option<f64>) -> String {
    match reason {
        "NO_HITS" => format!("No matching detector hits for this strategy (regime={regime})."),
        "SCORE_BELOW_MIN" => {
            format!("Score below threshold: buy={buy_score:.2}, sell={sell_score:.2}, min={min_score:.2}.")
        }
        "RR_BELOW_MIN" => format!(
            "RR too low: rr={} < min_rr={}.",
            rr.map(|v| format!("{v:.2}")).unwrap_or_else(|| "NA".to_string()),
            min_rr.map(|v| format!("{v:.2}")).unwrap_or_else(|| "NA".to_string()),
        ),
        "CONFLICT_SCORE" => "BUY/SELL scores tied; treated as a conflict.".to_string(),
        other => format!("No signal: reason={other} (regime={regime})."),
    }
}

/// Builds the explain payload for a successful scan. `governance`, when
/// `Some`, is attached verbatim under `evidence.governance` (populated by
/// the composition root after `GovernanceSelector::select` runs).
#[allow(clippy::too_many_arguments)]
pub fn build_pair_ok_explain(
    symbol: &str,
    tf: Timeframe,
    scan_id: &str,
    strategy: &StrategySpec,
    setup: &Setup,
    score: f64,
    debug: &ScanDebug,
    governance: Option<serde_json::Value>,
) -> common::Explain {
    let side = setup.direction;
    let contribs = contribs_for_side(strategy, &debug.hits, side);
    let score_raw: f64 = contribs.iter().map(|c| c.weighted).sum();
    let bonus = score - score_raw;
    let (top_contribs, inconsistent) = top_contribs_for_ok(&contribs, score_raw, 0.02);
    let regime = regime_from_evidence(&debug.regime_evidence);

    let top_hits: Vec<String> = debug.hits.iter().filter(|h| h.side == side).map(|h| h.name.clone()).collect();

    let mut details = serde_json::json!({
        "direction": side_str(side),
        "score": score,
        "score_raw": score_raw,
        "bonus": bonus,
        "rr": setup.rr,
        "regime": regime,
        "top_hits": top_hits,
        "top_contribs": top_contribs,
        "top_contribs_inconsistent": inconsistent,
        "params_digest": debug.params_digest,
    });
    attach_shadow_coverage(&mut details, debug);

    let evidence = serde_json::json!({
        "governance": governance.unwrap_or(serde_json::Value::Null),
        "score_breakdown": {"buy": debug.score_buy, "sell": debug.score_sell},
        "regime_evidence": debug.regime_evidence,
    });

    let summary = summary_ok(side, score, score_raw, bonus, setup.rr, regime, &top_contribs);

    common::Explain {
        schema_version: SCHEMA_VERSION,
        symbol: symbol.to_string(),
        tf,
        scan_id: scan_id.to_string(),
        strategy_id: strategy.strategy_id.clone(),
        status: ScanStatus::Ok,
        reason: "OK".to_string(),
        summary,
        details,
        evidence,
    }
}

/// Builds the explain payload for a scan outcome with no setup. `rr`/
/// `min_rr` are read out of `debug.regime_evidence.setup_fail` when
/// `ScanEngine` stashed them there (the `RR_BELOW_MIN` path).
pub fn build_pair_none_explain(
    symbol: &str,
    tf: Timeframe,
    scan_id: &str,
    strategy_id: Option<&str>,
    reason: &str,
    strategy: Option<&StrategySpec>,
    debug: &ScanDebug,
    governance: Option<serde_json::Value>,
) -> common::Explain {
    let stable = stable_reason(reason);
    let regime = regime_from_evidence(&debug.regime_evidence);

    let setup_fail = debug.regime_evidence.get("setup_fail").cloned();
    let rr = setup_fail.as_ref().and_then(|v| v.get("rr")).and_then(|v| v.as_f64());
    let min_rr = strategy.map(|s| s.min_rr);

    let top_contribs = if debug.hits.is_empty() { "NA".to_string() } else { top_contribs_names(&debug.hits) };

    let mut details = serde_json::json!({
        "reason": stable,
        "regime": regime,
        "buy_score": debug.score_buy,
        "sell_score": debug.score_sell,
        "min_score": strategy.map(|s| s.min_score),
        "top_contribs": top_contribs,
        "rr": rr,
        "min_rr": min_rr,
    });

    if stable == "RR_BELOW_MIN" {
        if let Some(sf) = &setup_fail {
            if let serde_json::Value::Object(map) = &mut details {
                for key in ["entry_zone", "entry_zone_width_pct", "sl_dist", "tp_dist"] {
                    if let Some(v) = sf.get(key) {
                        map.insert(key.to_string(), v.clone());
                    }
                }
            }
        }
    }
    attach_shadow_coverage(&mut details, debug);

    let evidence = serde_json::json!({
        "setup_fail": setup_fail.unwrap_or(serde_json::Value::Null),
        "governance": governance.unwrap_or(serde_json::Value::Null),
        "score_breakdown": {"buy": debug.score_buy, "sell": debug.score_sell},
        "regime_evidence": debug.regime_evidence,
    });

    let summary = summary_none(&stable, regime, debug.score_buy, debug.score_sell, strategy.map(|s| s.min_score).unwrap_or(0.0), rr, min_rr);

    common::Explain {
        schema_version: SCHEMA_VERSION,
        symbol: symbol.to_string(),
        tf,
        scan_id: scan_id.to_string(),
        strategy_id: strategy_id.unwrap_or("NA").to_string(),
        status: ScanStatus::None,
        reason: stable,
        summary,
        details,
        evidence,
    }
}

/// Inserts `shadow_hits`/`shadow_hit_count`/`shadow_detectors_total` into
/// `details` only when `SHADOW_ALL_DETECTORS` actually ran for this scan —
/// mirrors the reference explain builder's `_na(dbg.get("shadow_..."))`
/// pattern of only surfacing these keys when the coverage data exists.
fn attach_shadow_coverage(details: &mut serde_json::Value, debug: &ScanDebug) {
    if debug.shadow_detectors_total == 0 {
        return;
    }
    if let serde_json::Value::Object(map) = details {
        map.insert("shadow_hits".to_string(), serde_json::json!(debug.shadow_hits));
        map.insert("shadow_hit_count".to_string(), serde_json::json!(debug.shadow_hit_count));
        map.insert("shadow_detectors_total".to_string(), serde_json::json!(debug.shadow_detectors_total));
    }
}

fn regime_from_evidence(regime_evidence: &serde_json::Value) -> &'static str {
    match regime_evidence.get("regime").and_then(|v| v.as_str()) {
        Some("RANGE") => "RANGE",
        Some("CHOP") => "CHOP",
        Some("TREND_BULL") => "TREND_BULL",
        Some("TREND_BEAR") => "TREND_BEAR",
        _ => "NA",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{DetectorHit, ScanDebug};

    fn strategy() -> StrategySpec {
        let mut s = StrategySpec::default();
        s.strategy_id = "s1".to_string();
        s.entry_tf = Timeframe::M15;
        s.min_rr = 1.5;
        s.min_score = 1.0;
        s
    }

    #[test]
    fn ok_explain_has_consistent_top_contribs() {
        let strategy = strategy();
        let hits = vec![
            DetectorHit { name: "rsi_reversal".to_string(), side: Side::Buy, strength: 1.0, evidence: serde_json::json!({}) },
        ];
        let debug = ScanDebug {
            hits: hits.clone(),
            score_buy: 1.0,
            score_sell: 0.0,
            regime_evidence: serde_json::json!({"regime": "TREND_BULL"}),
            params_digest: "abc".to_string(),
            ..Default::default()
        };
        let setup = Setup { symbol: "EURUSD".to_string(), direction: Side::Buy, entry: 1.1, sl: 1.09, tp: 1.13, rr: 4.0, evidence: serde_json::json!({}) };

        let explain = build_pair_ok_explain("EURUSD", Timeframe::M15, "scan1", &strategy, &setup, 1.0, &debug, None);
        assert_eq!(explain.status, ScanStatus::Ok);
        assert_eq!(explain.reason, "OK");
        assert!(explain.details["top_contribs"].as_str().unwrap().contains("rsi_reversal"));
        assert_eq!(explain.details["top_contribs_inconsistent"], false);
    }

    #[test]
    fn none_explain_collapses_suffixed_reason() {
        let strategy = strategy();
        let debug = ScanDebug { regime_evidence: serde_json::json!({"regime": "RANGE"}), ..Default::default() };
        let explain = build_pair_none_explain(
            "EURUSD",
            Timeframe::M15,
            "scan1",
            Some("s1"),
            "SCORE_BELOW_MIN|buy=0.4",
            Some(&strategy),
            &debug,
            None,
        );
        assert_eq!(explain.reason, "SCORE_BELOW_MIN");
        assert_eq!(explain.status, ScanStatus::None);
    }

    #[test]
    fn shadow_coverage_surfaces_only_when_populated() {
        let strategy = strategy();
        let debug_no_shadow = ScanDebug { regime_evidence: serde_json::json!({"regime": "RANGE"}), ..Default::default() };
        let explain = build_pair_none_explain(
            "EURUSD", Timeframe::M15, "scan1", Some("s1"), "NO_HITS", Some(&strategy), &debug_no_shadow, None,
        );
        assert!(explain.details.get("shadow_hits").is_none());

        let debug_shadow = ScanDebug {
            regime_evidence: serde_json::json!({"regime": "RANGE"}),
            shadow_hits: vec!["macd_cross".to_string()],
            shadow_hit_count: 1,
            shadow_detectors_total: 2,
            ..Default::default()
        };
        let explain = build_pair_none_explain(
            "EURUSD", Timeframe::M15, "scan1", Some("s1"), "NO_HITS", Some(&strategy), &debug_shadow, None,
        );
        assert_eq!(explain.details["shadow_hit_count"], 1);
        assert_eq!(explain.details["shadow_detectors_total"], 2);
    }

    #[test]
    fn unknown_reason_falls_back_to_pipe_prefix() {
        let debug = ScanDebug::default();
        let explain =
            build_pair_none_explain("EURUSD", Timeframe::M15, "scan1", None, "WEIRD_CODE|extra", None, &debug, None);
        assert_eq!(explain.reason, "WEIRD_CODE");
        assert_eq!(explain.strategy_id, "NA");
    }
}
