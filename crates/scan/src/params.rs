use std::collections::HashMap;

use common::StrategySpec;

pub use common::merge_params;

/// Deterministic digest of a strategy's full effective parameter set,
/// carried through `ScanDebug::params_digest` so two cycles with identical
/// params produce the same digest regardless of `HashMap` iteration order.
pub fn params_digest(strategy: &StrategySpec) -> String {
    use sha1::{Digest, Sha1};

    let mut detector_keys: Vec<&String> = strategy.detector_params.keys().collect();
    detector_keys.sort();
    let mut family_keys: Vec<&String> = strategy.family_params.keys().collect();
    family_keys.sort();

    let mut payload = serde_json::Map::new();
    payload.insert(
        "detectors".to_string(),
        serde_json::Value::Array(strategy.detectors.iter().map(|d| serde_json::Value::String(d.clone())).collect()),
    );
    for k in detector_keys {
        let v = &strategy.detector_params[k];
        payload.insert(format!("detector:{k}"), toml_map_to_json(v));
    }
    for k in family_keys {
        let v = &strategy.family_params[k];
        payload.insert(format!("family:{k}"), toml_map_to_json(v));
    }
    payload.insert("epsilon".to_string(), serde_json::json!(strategy.epsilon));
    payload.insert("family_bonus".to_string(), serde_json::json!(strategy.family_bonus));
    payload.insert("min_rr".to_string(), serde_json::json!(strategy.min_rr));
    payload.insert("min_score".to_string(), serde_json::json!(strategy.min_score));

    let raw = serde_json::to_vec(&serde_json::Value::Object(payload)).unwrap_or_default();
    let mut hasher = Sha1::new();
    hasher.update(&raw);
    hex::encode(hasher.finalize())
}

fn toml_map_to_json(map: &HashMap<String, toml::Value>) -> serde_json::Value {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();
    let mut out = serde_json::Map::new();
    for k in keys {
        out.insert(k.clone(), toml_to_json(&map[k]));
    }
    serde_json::Value::Object(out)
}

fn toml_to_json(v: &toml::Value) -> serde_json::Value {
    match v {
        toml::Value::String(s) => serde_json::Value::String(s.clone()),
        toml::Value::Integer(i) => serde_json::json!(i),
        toml::Value::Float(f) => serde_json::json!(f),
        toml::Value::Boolean(b) => serde_json::json!(b),
        toml::Value::Datetime(d) => serde_json::Value::String(d.to_string()),
        toml::Value::Array(arr) => serde_json::Value::Array(arr.iter().map(toml_to_json).collect()),
        toml::Value::Table(t) => {
            let mut keys: Vec<&String> = t.keys().collect();
            keys.sort();
            let mut out = serde_json::Map::new();
            for k in keys {
                out.insert(k.clone(), toml_to_json(&t[k]));
            }
            serde_json::Value::Object(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_stable_across_hashmap_rebuilds() {
        let strategy = StrategySpec::default();
        let a = params_digest(&strategy);
        let b = params_digest(&strategy);
        assert_eq!(a, b);
    }
}
