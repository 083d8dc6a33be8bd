use std::collections::HashMap;
use std::path::Path;

use common::{ConflictPolicy, InvalidStrategy, Regime, StrategyPack, StrategySpec, Timeframe};
use sha1::{Digest, Sha1};

use crate::registry::DetectorRegistry;
use crate::resolver::resolve_detector_names;

/// Everything the loader learned while turning a raw pack file into a set
/// of validated, detector-resolved `StrategySpec`s. Mirrors the reference
/// loader's result object field-for-field so the API/telemetry layers can
/// surface the same diagnostics.
#[derive(Debug, Clone, Default)]
pub struct StrategyLoadReport {
    pub schema_version: u32,
    pub strategies: Vec<StrategySpec>,
    pub invalid_enabled: Vec<InvalidStrategy>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub strategy_warnings: HashMap<String, Vec<String>>,
    pub unknown_detectors_by_strategy: HashMap<String, Vec<String>>,
    pub unknown_detector_suggestions_by_strategy: HashMap<String, HashMap<String, Vec<String>>>,
    pub disabled_unknown_detectors: HashMap<String, Vec<String>>,
    pub patch_suggestions: Vec<PatchSuggestion>,
}

impl StrategyLoadReport {
    pub fn ok(&self) -> bool {
        !self.strategies.is_empty()
    }
}

/// Merges reports loaded from multiple pack files under `USER_STRATEGIES_DIR`
/// into one. `schema_version` is taken from the first non-empty report;
/// every other field concatenates. Strategies keep whichever file they came
/// from — cross-file `strategy_id` collisions aren't deduplicated here, the
/// same as loading one pack with duplicate ids side by side.
pub fn merge_reports(reports: Vec<StrategyLoadReport>) -> StrategyLoadReport {
    let mut merged = StrategyLoadReport::default();
    for report in reports {
        if merged.schema_version == 0 {
            merged.schema_version = report.schema_version;
        }
        merged.strategies.extend(report.strategies);
        merged.invalid_enabled.extend(report.invalid_enabled);
        merged.errors.extend(report.errors);
        merged.warnings.extend(report.warnings);
        for (k, v) in report.strategy_warnings {
            merged.strategy_warnings.entry(k).or_default().extend(v);
        }
        merged.unknown_detectors_by_strategy.extend(report.unknown_detectors_by_strategy);
        merged
            .unknown_detector_suggestions_by_strategy
            .extend(report.unknown_detector_suggestions_by_strategy);
        merged.disabled_unknown_detectors.extend(report.disabled_unknown_detectors);
        merged.patch_suggestions.extend(report.patch_suggestions);
    }
    merged
}

/// A dry-run auto-fix suggestion for a strategy referencing unknown
/// detectors that closely matched a known one. Never applied automatically
/// — `bin/scanner`'s `apply_strategy_patch` tool consumes these.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PatchSuggestion {
    pub patch_id: String,
    pub strategy_id: String,
    pub patch_type: String,
    pub replacements: HashMap<String, String>,
    pub before_detectors: Vec<String>,
    pub after_detectors: Vec<String>,
}

/// SHA1-based stable id for a patch suggestion, truncated to 12 hex chars,
/// so re-running the loader against unchanged input yields the same id and
/// `apply_strategy_patch` can dedupe against a persisted list.
fn stable_patch_id(patch_type: &str, date: &str, strategy_id: &str, replacements: &HashMap<String, String>) -> String {
    let mut sorted: Vec<(&String, &String)> = replacements.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    let payload = serde_json::json!({
        "patch_type": patch_type,
        "date": date,
        "strategy_id": strategy_id,
        "replacements": sorted.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect::<HashMap<_, _>>(),
    });
    let raw = serde_json::to_vec(&payload).unwrap_or_default();
    let mut hasher = Sha1::new();
    hasher.update(&raw);
    let digest = hasher.finalize();
    hex::encode(digest)[..12].to_string()
}

fn dedupe_preserve_order(items: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for item in items {
        let trimmed = item.trim().to_string();
        if trimmed.is_empty() || seen.contains(&trimmed) {
            continue;
        }
        seen.insert(trimmed.clone());
        out.push(trimmed);
    }
    out
}

/// Raw, untyped strategy config as it appears in the pack JSON. Close to
/// the Python loader's dict-of-dicts shape on purpose — normalization and
/// validation happen in two explicit passes, same as the reference loader,
/// rather than fusing parse+validate into one `serde` derive that would
/// reject a whole pack on one bad field.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct RawStrategy {
    pub strategy_id: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub trend_tf: Option<String>,
    #[serde(default)]
    pub entry_tf: Option<String>,
    #[serde(default)]
    pub min_rr: Option<f64>,
    #[serde(default)]
    pub min_score: Option<f64>,
    #[serde(default)]
    pub allowed_regimes: Option<Vec<String>>,
    #[serde(default)]
    pub detectors: Vec<String>,
    #[serde(default)]
    pub detector_params: HashMap<String, HashMap<String, toml::Value>>,
    #[serde(default)]
    pub family_params: HashMap<String, HashMap<String, toml::Value>>,
    #[serde(default)]
    pub epsilon: Option<f64>,
    #[serde(default)]
    pub family_bonus: Option<f64>,
    #[serde(default)]
    pub weights: HashMap<String, f64>,
    #[serde(default)]
    pub detector_weight_overrides: HashMap<String, f64>,
    #[serde(default)]
    pub cooldown_minutes: Option<i64>,
    #[serde(default)]
    pub daily_limit: Option<i64>,
    #[serde(default)]
    pub conflict_policy: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, serde::Deserialize)]
struct RawPack {
    schema_version: Option<u32>,
    #[serde(default)]
    include_presets: Vec<String>,
    #[serde(default)]
    strategies: Vec<RawStrategy>,
}

/// Parses, validates, normalizes, and detector-resolves a strategy pack
/// file. Never panics on malformed input — bad strategies are collected
/// into `invalid_enabled`/`errors` rather than aborting the whole load.
pub struct StrategyPackLoader<'a> {
    registry: &'a DetectorRegistry,
    aliases: HashMap<String, String>,
    autofix_threshold: f64,
    today: String,
    strict_unknown_detectors: bool,
}

impl<'a> StrategyPackLoader<'a> {
    pub fn new(registry: &'a DetectorRegistry) -> Self {
        StrategyPackLoader {
            registry,
            aliases: HashMap::new(),
            autofix_threshold: 0.85,
            today: String::new(),
            strict_unknown_detectors: false,
        }
    }

    /// Mirrors `STRICT_STRATEGY_DETECTORS`: when set, a strategy referencing
    /// any unresolved detector name is disabled in-memory instead of having
    /// its detector list auto-fixed or silently trimmed.
    pub fn with_strict_unknown_detectors(mut self, strict: bool) -> Self {
        self.strict_unknown_detectors = strict;
        self
    }

    pub fn with_aliases(mut self, aliases: HashMap<String, String>) -> Self {
        self.aliases = aliases;
        self
    }

    pub fn with_autofix_threshold(mut self, threshold: f64) -> Self {
        self.autofix_threshold = threshold;
        self
    }

    /// `today` (UTC `YYYY-MM-DD`) is injected by the caller so patch ids
    /// stay deterministic under test rather than depending on a wall clock.
    pub fn with_today(mut self, today: impl Into<String>) -> Self {
        self.today = today.into();
        self
    }

    pub fn load_file(&self, path: impl AsRef<Path>) -> StrategyLoadReport {
        let path = path.as_ref();
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(_) => {
                return StrategyLoadReport {
                    schema_version: 1,
                    errors: vec!["FILE_NOT_FOUND".to_string()],
                    ..Default::default()
                }
            }
        };
        self.load_str(&text)
    }

    pub fn load_str(&self, text: &str) -> StrategyLoadReport {
        let raw: RawPack = match serde_json::from_str(text) {
            Ok(p) => p,
            Err(_) => {
                return StrategyLoadReport {
                    schema_version: 1,
                    errors: vec!["INVALID_JSON".to_string()],
                    ..Default::default()
                }
            }
        };

        let schema_version = raw.schema_version.unwrap_or(1);
        let mut report = StrategyLoadReport {
            schema_version,
            ..Default::default()
        };
        if schema_version != 1 {
            report.errors.push("UNSUPPORTED_SCHEMA_VERSION".to_string());
            return report;
        }

        // Merge precedence: strategies listed in the pack win over presets
        // with the same strategy_id. include_presets is accepted for
        // forward-compatibility with the pack format but this crate ships
        // no in-tree preset library, so an unresolvable preset id is a
        // warning, not a hard error.
        for preset in &raw.include_presets {
            report
                .warnings
                .push(format!("PRESET_NOT_BUNDLED:{preset}"));
        }

        let known: std::collections::HashSet<String> = self.registry.names().into_iter().collect();

        for (idx, item) in raw.strategies.into_iter().enumerate() {
            self.load_one(idx, item, &known, &mut report);
        }

        report
    }

    fn load_one(
        &self,
        idx: usize,
        raw: RawStrategy,
        known: &std::collections::HashSet<String>,
        report: &mut StrategyLoadReport,
    ) {
        let enabled = raw.enabled;
        let (spec, errors) = normalize_and_validate(idx, &raw);

        let spec = match spec {
            Some(s) if errors.is_empty() => s,
            _ => {
                if enabled {
                    report.invalid_enabled.push(InvalidStrategy {
                        strategy_id: raw.strategy_id.clone(),
                        errors,
                    });
                }
                return;
            }
        };

        if !spec.enabled {
            return;
        }

        let sid = spec.strategy_id.clone();
        let requested = spec.detectors.clone();
        let resolved = resolve_detector_names(
            &requested,
            &known.iter().cloned().collect::<Vec<_>>(),
            &self.aliases,
            3,
        );

        if !resolved.alias_applied.is_empty() {
            let entry = report.strategy_warnings.entry(sid.clone()).or_default();
            for (old, new) in &resolved.alias_applied {
                let msg = format!("DETECTOR_ALIAS_APPLIED:{old}->{new}");
                entry.push(msg.clone());
                report.warnings.push(format!("STRATEGY:{sid}:{msg}"));
            }
        }

        let mut spec = spec;
        if !resolved.unknown.is_empty() {
            report
                .unknown_detectors_by_strategy
                .insert(sid.clone(), resolved.unknown.clone());
            report.unknown_detector_suggestions_by_strategy.insert(
                sid.clone(),
                resolved
                    .suggestions
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            );

            if self.strict_unknown_detectors {
                report
                    .disabled_unknown_detectors
                    .insert(sid.clone(), resolved.unknown.clone());
                report.strategy_warnings.entry(sid.clone()).or_default().push(format!(
                    "STRATEGY_DISABLED_STRICT_UNKNOWN_DETECTORS:{}",
                    resolved.unknown.join("|")
                ));
                return;
            }

            let mut replacements: HashMap<String, String> = HashMap::new();
            for unk in &resolved.unknown {
                if let Some(top) = resolved.suggestions_scored.get(unk).and_then(|v| v.first()) {
                    if top.1 >= self.autofix_threshold {
                        replacements.insert(unk.clone(), top.0.clone());
                    }
                }
            }
            if !replacements.is_empty() {
                let before = requested.clone();
                let after: Vec<String> = dedupe_preserve_order(
                    before
                        .iter()
                        .map(|d| replacements.get(d).cloned().unwrap_or_else(|| d.clone()))
                        .collect(),
                );
                if !after.is_empty() && after != before {
                    let patch_id = stable_patch_id("FIX_UNKNOWN_DETECTORS", &self.today, &sid, &replacements);
                    report.patch_suggestions.push(PatchSuggestion {
                        patch_id,
                        strategy_id: sid.clone(),
                        patch_type: "FIX_UNKNOWN_DETECTORS".to_string(),
                        replacements,
                        before_detectors: before,
                        after_detectors: after,
                    });
                }
            }

            let entry = report.strategy_warnings.entry(sid.clone()).or_default();
            for name in &resolved.unknown {
                if let Some(sugg) = resolved.suggestions.get(name) {
                    let hint = sugg.iter().take(3).cloned().collect::<Vec<_>>().join("|");
                    entry.push(format!("UNKNOWN_DETECTOR:{name} SUGGEST:{hint}"));
                } else {
                    entry.push(format!("UNKNOWN_DETECTOR:{name}"));
                }
            }

            spec.detectors = resolved.resolved;
        } else {
            spec.detectors = resolved.resolved;
        }

        report.strategies.push(spec);
    }
}

/// Pure normalize+validate pass: fills defaults, coerces loosely-typed
/// fields, and returns either a usable spec or a list of error codes. Never
/// panics on out-of-range or missing input.
fn normalize_and_validate(idx: usize, raw: &RawStrategy) -> (Option<StrategySpec>, Vec<String>) {
    let mut errors = Vec::new();
    let mut spec = StrategySpec::default();

    let sid = raw
        .strategy_id
        .clone()
        .unwrap_or_default()
        .trim()
        .to_lowercase();
    spec.strategy_id = if sid.is_empty() {
        format!("strategy_{}", idx + 1)
    } else {
        slugify(&sid)
    };
    if spec.strategy_id.is_empty() {
        errors.push("MISSING_STRATEGY_ID".to_string());
    }

    spec.enabled = raw.enabled;

    if let Some(tf) = raw.trend_tf.as_deref().and_then(Timeframe::parse) {
        spec.trend_tf = tf;
    } else if raw.trend_tf.is_some() {
        errors.push("BAD_TREND_TF".to_string());
    }
    if let Some(tf) = raw.entry_tf.as_deref().and_then(Timeframe::parse) {
        spec.entry_tf = tf;
    } else if raw.entry_tf.is_some() {
        errors.push("BAD_ENTRY_TF".to_string());
    }

    if let Some(v) = raw.min_rr {
        if v.is_finite() {
            spec.min_rr = v;
        } else {
            errors.push("BAD_MIN_RR".to_string());
        }
    }
    if let Some(v) = raw.min_score {
        if v.is_finite() {
            spec.min_score = v;
        } else {
            errors.push("BAD_MIN_SCORE".to_string());
        }
    }
    if let Some(v) = raw.epsilon {
        if v.is_finite() {
            spec.epsilon = v;
        } else {
            errors.push("BAD_EPSILON".to_string());
        }
    }
    if let Some(v) = raw.family_bonus {
        if v.is_finite() {
            spec.family_bonus = v;
        } else {
            errors.push("BAD_FAMILY_BONUS".to_string());
        }
    }
    if let Some(v) = raw.cooldown_minutes {
        spec.cooldown_minutes = v.max(0);
    }
    if let Some(v) = raw.daily_limit {
        spec.daily_limit = v.max(0);
    }

    if let Some(regimes) = &raw.allowed_regimes {
        let mut parsed = Vec::new();
        let mut bad = false;
        for r in regimes {
            match parse_regime(r) {
                Some(regime) => parsed.push(regime),
                None => bad = true,
            }
        }
        if bad {
            errors.push("BAD_ALLOWED_REGIMES".to_string());
        } else if !parsed.is_empty() {
            spec.allowed_regimes = parsed;
        }
    }

    if let Some(policy) = &raw.conflict_policy {
        match policy.to_lowercase().as_str() {
            "skip" => spec.conflict_policy = ConflictPolicy::Skip,
            "allow" => spec.conflict_policy = ConflictPolicy::Allow,
            _ => errors.push("BAD_CONFLICT_POLICY".to_string()),
        }
    }

    spec.detectors = raw
        .detectors
        .iter()
        .map(|d| d.trim().to_string())
        .filter(|d| !d.is_empty())
        .collect();
    spec.detector_params = raw.detector_params.clone();
    spec.family_params = raw.family_params.clone();
    spec.weights = raw.weights.clone();
    spec.detector_weight_overrides = raw.detector_weight_overrides.clone();

    if errors.is_empty() {
        (Some(spec), errors)
    } else {
        (None, errors)
    }
}

fn parse_regime(s: &str) -> Option<Regime> {
    match s.trim().to_uppercase().as_str() {
        "RANGE" => Some(Regime::Range),
        "CHOP" => Some(Regime::Chop),
        "TREND_BULL" => Some(Regime::TrendBull),
        "TREND_BEAR" => Some(Regime::TrendBear),
        _ => None,
    }
}

fn slugify(value: &str) -> String {
    let mut out = String::new();
    let mut last_was_underscore = false;
    for ch in value.chars() {
        let c = if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' {
            ch
        } else if ch == ' ' {
            '_'
        } else {
            continue;
        };
        if c == '_' {
            if !last_was_underscore {
                out.push('_');
            }
            last_was_underscore = true;
        } else {
            out.push(c);
            last_was_underscore = false;
        }
    }
    out.trim_matches('_').to_string()
}

/// Wraps a loaded report's valid strategies into the public `StrategyPack`
/// contract.
pub fn into_strategy_pack(report: &StrategyLoadReport) -> StrategyPack {
    StrategyPack {
        schema_version: report.schema_version,
        include_presets: Vec::new(),
        strategies: report.strategies.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::DetectorRegistry;

    fn registry_with(names: &[&'static str]) -> DetectorRegistry {
        let mut reg = DetectorRegistry::new();
        for n in names {
            reg.register(n, || Box::new(crate::detectors::RsiReversalDetector));
        }
        reg
    }

    #[test]
    fn loads_minimal_valid_pack() {
        let reg = registry_with(&["rsi_reversal"]);
        let loader = StrategyPackLoader::new(&reg).with_today("2026-08-01");
        let report = loader.load_str(
            r#"{"schema_version":1,"strategies":[{"strategy_id":"s1","detectors":["rsi_reversal"]}]}"#,
        );
        assert!(report.ok());
        assert_eq!(report.strategies[0].strategy_id, "s1");
        assert!(report.errors.is_empty());
    }

    #[test]
    fn bad_json_reports_error_not_panic() {
        let reg = registry_with(&[]);
        let loader = StrategyPackLoader::new(&reg);
        let report = loader.load_str("{not json");
        assert!(!report.ok());
        assert_eq!(report.errors, vec!["INVALID_JSON".to_string()]);
    }

    #[test]
    fn unsupported_schema_version_short_circuits() {
        let reg = registry_with(&[]);
        let loader = StrategyPackLoader::new(&reg);
        let report = loader.load_str(r#"{"schema_version":2,"strategies":[]}"#);
        assert!(report.errors.contains(&"UNSUPPORTED_SCHEMA_VERSION".to_string()));
    }

    #[test]
    fn unknown_detector_is_dropped_and_suggested() {
        let reg = registry_with(&["rsi_reversal"]);
        let loader = StrategyPackLoader::new(&reg).with_today("2026-08-01");
        let report = loader.load_str(
            r#"{"schema_version":1,"strategies":[{"strategy_id":"s1","detectors":["rsi_reversel"]}]}"#,
        );
        assert!(report.ok());
        assert!(report.strategies[0].detectors.is_empty());
        assert!(report.unknown_detectors_by_strategy.contains_key("s1"));
    }

    #[test]
    fn disabled_strategy_enabled_false_is_skipped_not_invalid() {
        let reg = registry_with(&["rsi_reversal"]);
        let loader = StrategyPackLoader::new(&reg);
        let report = loader.load_str(
            r#"{"schema_version":1,"strategies":[{"strategy_id":"s1","enabled":false}]}"#,
        );
        assert!(!report.ok());
        assert!(report.invalid_enabled.is_empty());
    }

    #[test]
    fn bad_field_marks_enabled_strategy_invalid() {
        let reg = registry_with(&["rsi_reversal"]);
        let loader = StrategyPackLoader::new(&reg);
        let report = loader.load_str(
            r#"{"schema_version":1,"strategies":[{"strategy_id":"s1","trend_tf":"NOT_A_TF"}]}"#,
        );
        assert_eq!(report.invalid_enabled.len(), 1);
        assert_eq!(report.invalid_enabled[0].strategy_id.as_deref(), Some("s1"));
    }

    #[test]
    fn stable_patch_id_is_deterministic() {
        let mut r = HashMap::new();
        r.insert("a".to_string(), "b".to_string());
        let id1 = stable_patch_id("FIX_UNKNOWN_DETECTORS", "2026-08-01", "s1", &r);
        let id2 = stable_patch_id("FIX_UNKNOWN_DETECTORS", "2026-08-01", "s1", &r);
        assert_eq!(id1, id2);
        assert_eq!(id1.len(), 12);
    }

    #[test]
    fn merge_reports_concatenates_strategies_and_diagnostics() {
        let reg = registry_with(&["rsi_reversal"]);
        let loader = StrategyPackLoader::new(&reg);
        let report_a = loader.load_str(
            r#"{"schema_version":1,"strategies":[{"strategy_id":"s1","detectors":["rsi_reversal"]}]}"#,
        );
        let report_b = loader.load_str(
            r#"{"schema_version":1,"strategies":[{"strategy_id":"s2","detectors":["rsi_reversal"]}]}"#,
        );

        let merged = merge_reports(vec![report_a, report_b]);
        assert_eq!(merged.schema_version, 1);
        assert_eq!(merged.strategies.len(), 2);
        let ids: Vec<&str> = merged.strategies.iter().map(|s| s.strategy_id.as_str()).collect();
        assert!(ids.contains(&"s1") && ids.contains(&"s2"));
    }

    #[test]
    fn merge_reports_of_empty_list_is_empty_default() {
        let merged = merge_reports(vec![]);
        assert!(!merged.ok());
        assert_eq!(merged.schema_version, 0);
    }

    #[test]
    fn strict_mode_disables_strategy_with_unknown_detector_instead_of_autofixing() {
        let reg = registry_with(&["rsi_reversal"]);
        let loader = StrategyPackLoader::new(&reg)
            .with_today("2026-08-01")
            .with_strict_unknown_detectors(true);
        let report = loader.load_str(
            r#"{"schema_version":1,"strategies":[{"strategy_id":"s1","detectors":["rsi_reversel"]}]}"#,
        );
        assert!(!report.ok());
        assert!(report.strategies.is_empty());
        assert_eq!(
            report.disabled_unknown_detectors.get("s1").map(Vec::as_slice),
            Some(&["rsi_reversel".to_string()][..])
        );
        assert!(report.patch_suggestions.is_empty());
    }
}
