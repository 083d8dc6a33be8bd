use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Timeframe a series of candles is bucketed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(type_name = "TEXT", rename_all = "UPPERCASE")]
pub enum Timeframe {
    M5,
    M15,
    M30,
    H1,
    H4,
    D1,
}

impl Timeframe {
    /// Bucket width in minutes.
    pub fn minutes(self) -> i64 {
        match self {
            Timeframe::M5 => 5,
            Timeframe::M15 => 15,
            Timeframe::M30 => 30,
            Timeframe::H1 => 60,
            Timeframe::H4 => 240,
            Timeframe::D1 => 1440,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Timeframe::M5 => "M5",
            Timeframe::M15 => "M15",
            Timeframe::M30 => "M30",
            Timeframe::H1 => "H1",
            Timeframe::H4 => "H4",
            Timeframe::D1 => "D1",
        }
    }

    pub fn parse(s: &str) -> Option<Timeframe> {
        match s.to_ascii_uppercase().as_str() {
            "M5" => Some(Timeframe::M5),
            "M15" => Some(Timeframe::M15),
            "M30" => Some(Timeframe::M30),
            "H1" => Some(Timeframe::H1),
            "H4" => Some(Timeframe::H4),
            "D1" => Some(Timeframe::D1),
            _ => None,
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Immutable OHLC bar. `low <= min(open, close) <= max(open, close) <= high`
/// is enforced by `Candle::is_valid`, never by the constructor — callers
/// decide whether to skip invalid rows.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: Option<f64>,
}

impl Candle {
    pub fn is_valid(&self) -> bool {
        if !(self.open.is_finite()
            && self.high.is_finite()
            && self.low.is_finite()
            && self.close.is_finite())
        {
            return false;
        }
        let body_lo = self.open.min(self.close);
        let body_hi = self.open.max(self.close);
        self.low <= body_lo && body_hi <= self.high
    }
}

/// Coarse market structure classification on the trend timeframe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Regime {
    Range,
    Chop,
    TrendBull,
    TrendBear,
}

impl Regime {
    pub fn as_str(self) -> &'static str {
        match self {
            Regime::Range => "RANGE",
            Regime::Chop => "CHOP",
            Regime::TrendBull => "TREND_BULL",
            Regime::TrendBear => "TREND_BEAR",
        }
    }
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Side a detector hit or a setup is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Whether a strategy allows fail-over to the next candidate when the top
/// one is governance-blocked (`allow`), or a blocked top candidate should
/// simply suppress the whole cycle for that symbol (`skip`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    Skip,
    Allow,
}

/// Normalized, versioned strategy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategySpec {
    pub strategy_id: String,
    pub enabled: bool,
    pub engine_version: u32,
    pub trend_tf: Timeframe,
    pub entry_tf: Timeframe,
    pub min_rr: f64,
    pub min_score: f64,
    pub allowed_regimes: Vec<Regime>,
    pub detectors: Vec<String>,
    pub detector_params: HashMap<String, HashMap<String, toml::Value>>,
    pub family_params: HashMap<String, HashMap<String, toml::Value>>,
    pub epsilon: f64,
    pub family_bonus: f64,
    pub weights: HashMap<String, f64>,
    pub detector_weight_overrides: HashMap<String, f64>,
    pub cooldown_minutes: i64,
    pub daily_limit: i64,
    pub conflict_policy: ConflictPolicy,
}

impl Default for StrategySpec {
    fn default() -> Self {
        StrategySpec {
            strategy_id: String::new(),
            enabled: true,
            engine_version: 1,
            trend_tf: Timeframe::H4,
            entry_tf: Timeframe::M15,
            min_rr: 1.5,
            min_score: 0.5,
            allowed_regimes: vec![
                Regime::Range,
                Regime::Chop,
                Regime::TrendBull,
                Regime::TrendBear,
            ],
            detectors: Vec::new(),
            detector_params: HashMap::new(),
            family_params: HashMap::new(),
            epsilon: 0.05,
            family_bonus: 0.1,
            weights: HashMap::new(),
            detector_weight_overrides: HashMap::new(),
            cooldown_minutes: 60,
            daily_limit: 3,
            conflict_policy: ConflictPolicy::Skip,
        }
    }
}

/// A strategy that failed normalization/validation. Carried alongside valid
/// specs so the loader can report `invalid_enabled` without losing context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidStrategy {
    pub strategy_id: Option<String>,
    pub errors: Vec<String>,
}

/// Parsed and validated strategy pack file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyPack {
    pub schema_version: u32,
    pub include_presets: Vec<String>,
    pub strategies: Vec<StrategySpec>,
}

/// A detector's positive finding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorHit {
    pub name: String,
    pub side: Side,
    pub strength: f64,
    pub evidence: serde_json::Value,
}

/// Everything a detector needs; detectors are pure functions of this value.
#[derive(Debug, Clone)]
pub struct ScanContext {
    pub symbol: String,
    pub entry_tf_candles: Vec<Candle>,
    pub trend_tf_candles: Vec<Candle>,
    pub feature_bundle: HashMap<String, f64>,
    pub regime: Regime,
    pub strategy: StrategySpec,
    pub scan_id: String,
}

/// A candidate trade built from a scan outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Setup {
    pub symbol: String,
    pub direction: Side,
    pub entry: f64,
    pub sl: f64,
    pub tp: f64,
    pub rr: f64,
    pub evidence: serde_json::Value,
}

impl Setup {
    pub fn compute_rr(entry: f64, sl: f64, tp: f64) -> f64 {
        let risk = (entry - sl).abs();
        if risk <= 0.0 {
            return 0.0;
        }
        (tp - entry).abs() / risk
    }
}

/// Persisted, immutable legacy/v1 signal record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub signal_id: String,
    pub created_at: DateTime<Utc>,
    pub user_id: String,
    pub symbol: String,
    pub tf: Timeframe,
    pub direction: Side,
    pub entry: f64,
    pub sl: f64,
    pub tp: f64,
    pub rr: f64,
    pub score: f64,
    pub strategy_id: String,
    pub scan_id: String,
    pub reasons: Vec<String>,
    pub explain: serde_json::Value,
    pub annotations: serde_json::Value,
    pub drawings: Vec<serde_json::Value>,
}

/// UI-facing projection of a Signal. Stable contract: fields are never
/// removed, only added.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicSignal {
    pub signal_id: String,
    pub created_at: DateTime<Utc>,
    pub symbol: String,
    pub tf: Timeframe,
    pub status: ScanStatus,
    pub direction: Option<Side>,
    pub strategy_id: String,
    pub score: Option<f64>,
    pub evidence: PublicEvidence,
    pub chart_drawings: Vec<ChartDrawing>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ScanStatus {
    Ok,
    None,
}

/// NA-safe evidence block: every key is always present, values are `null`
/// when not applicable rather than the key being omitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicEvidence {
    pub entry: Option<f64>,
    pub sl: Option<f64>,
    pub tp: Option<f64>,
    pub rr: Option<f64>,
    pub entry_zone: Option<[f64; 2]>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChartDrawing {
    pub object_id: String,
    pub kind: String,
    pub payload: serde_json::Value,
}

/// Deterministic, versioned rationale for a scan outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Explain {
    pub schema_version: u32,
    pub symbol: String,
    pub tf: Timeframe,
    pub scan_id: String,
    pub strategy_id: String,
    pub status: ScanStatus,
    pub reason: String,
    pub summary: String,
    pub details: serde_json::Value,
    pub evidence: serde_json::Value,
}

/// One sent-signal record inside `SignalStateStore`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentRecord {
    pub ts: f64,
    pub symbol: String,
    pub direction: Side,
    pub timeframe: Timeframe,
    pub strategy_id: String,
}

/// A durable queue row awaiting delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEvent {
    pub id: String,
    pub created_ts: f64,
    pub symbol: String,
    pub tf: String,
    pub setup_type: String,
    pub setup_key: String,
    pub payload: serde_json::Value,
    pub status: QueueStatus,
    pub attempts: i64,
    pub next_attempt_ts: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(type_name = "TEXT", rename_all = "UPPERCASE")]
pub enum QueueStatus {
    New,
    Processing,
    Done,
    Failed,
}

/// A recorded Telegram delivery, used for per-(user, setup_key) cooldowns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub id: i64,
    pub user_id: String,
    pub setup_key: String,
    pub sent_ts: f64,
    pub cooldown_until_ts: f64,
}

/// Outcome of one `(user, symbol)` scan: either a setup with score/debug
/// payload, or a typed reason the scan produced nothing.
#[derive(Debug, Clone)]
pub enum ScanResult {
    Ok {
        setup: Setup,
        score: f64,
        strategy_id: String,
        debug: ScanDebug,
    },
    None {
        reason: String,
        strategy_id: Option<String>,
        debug: ScanDebug,
    },
}

/// Per-detector timings, score breakdown, hits, regime evidence, and a
/// deterministic params digest — carried through to the Explain/metrics
/// layer without re-deriving anything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanDebug {
    pub detector_timings_ms: HashMap<String, f64>,
    pub hits: Vec<DetectorHit>,
    pub score_buy: f64,
    pub score_sell: f64,
    pub regime_evidence: serde_json::Value,
    pub params_digest: String,
    pub candidates_considered: usize,
    /// Populated only when `SHADOW_ALL_DETECTORS` is set: names of every
    /// registered detector (not just the strategy's configured list) that
    /// hit against this scan's context.
    pub shadow_hits: Vec<String>,
    pub shadow_hit_count: usize,
    pub shadow_detectors_total: usize,
}
