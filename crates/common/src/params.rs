use std::collections::HashMap;

use crate::types::StrategySpec;

/// The `enabled` key is reserved by the detector allow-list mechanism and is
/// never overridable via params.
const RESERVED_KEY: &str = "enabled";

/// A detector's family is the first `_`-delimited segment of its name
/// (`rsi_reversal` -> `rsi`, `macd_cross` -> `macd`). Mirrors the grouping
/// `score_hits` uses for the family-bonus calculation, so overrides keyed by
/// family line up with the same families the scorer groups hits into.
pub fn family_of(detector_name: &str) -> &str {
    detector_name.split('_').next().unwrap_or(detector_name)
}

/// Merge a detector's effective parameter map: the strategy's
/// `family_params[family]`, overlaid by `detector_params[detector_name]`.
/// Later layers win key-by-key; the reserved `enabled` key is stripped from
/// every layer before merging. Detectors call this with their own name and
/// `family_of(name)` to read overridable constants out of `ctx.strategy`.
pub fn merge_params(
    strategy: &StrategySpec,
    detector_name: &str,
    family: Option<&str>,
) -> HashMap<String, toml::Value> {
    let mut merged: HashMap<String, toml::Value> = HashMap::new();

    if let Some(family) = family {
        if let Some(family_map) = strategy.family_params.get(family) {
            for (k, v) in family_map {
                if k != RESERVED_KEY {
                    merged.insert(k.clone(), v.clone());
                }
            }
        }
    }

    if let Some(detector_map) = strategy.detector_params.get(detector_name) {
        for (k, v) in detector_map {
            if k != RESERVED_KEY {
                merged.insert(k.clone(), v.clone());
            }
        }
    }

    merged
}

/// Read an integer-valued override out of a merged param map, falling back
/// to `default` when the key is absent or not an integer.
pub fn param_usize(params: &HashMap<String, toml::Value>, key: &str, default: usize) -> usize {
    params
        .get(key)
        .and_then(|v| v.as_integer())
        .and_then(|i| usize::try_from(i).ok())
        .unwrap_or(default)
}

/// Read a float-valued override out of a merged param map, falling back to
/// `default` when the key is absent or not numeric.
pub fn param_f64(params: &HashMap<String, toml::Value>, key: &str, default: f64) -> f64 {
    params
        .get(key)
        .and_then(|v| v.as_float().or_else(|| v.as_integer().map(|i| i as f64)))
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detector_override_wins_over_family() {
        let mut strategy = StrategySpec::default();
        let mut family_map = HashMap::new();
        family_map.insert("period".to_string(), toml::Value::Integer(14));
        strategy.family_params.insert("rsi".to_string(), family_map);

        let mut detector_map = HashMap::new();
        detector_map.insert("period".to_string(), toml::Value::Integer(21));
        strategy.detector_params.insert("rsi_reversal".to_string(), detector_map);

        let merged = merge_params(&strategy, "rsi_reversal", Some("rsi"));
        assert_eq!(merged.get("period"), Some(&toml::Value::Integer(21)));
    }

    #[test]
    fn enabled_key_is_never_overridable() {
        let mut strategy = StrategySpec::default();
        let mut detector_map = HashMap::new();
        detector_map.insert("enabled".to_string(), toml::Value::Boolean(false));
        strategy.detector_params.insert("rsi_reversal".to_string(), detector_map);

        let merged = merge_params(&strategy, "rsi_reversal", None);
        assert!(!merged.contains_key("enabled"));
    }

    #[test]
    fn param_usize_falls_back_on_missing_key() {
        let params: HashMap<String, toml::Value> = HashMap::new();
        assert_eq!(param_usize(&params, "period", 14), 14);
    }

    #[test]
    fn family_of_splits_on_first_underscore() {
        assert_eq!(family_of("rsi_reversal"), "rsi");
        assert_eq!(family_of("macd_cross"), "macd");
    }
}
