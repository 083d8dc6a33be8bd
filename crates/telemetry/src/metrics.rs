use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Serialize;

/// Depth/length-limited JSON sanitizer so a pathological `candidates` value
/// can never blow up the metrics file or fail serialization. Mirrors
/// `_safe_jsonable` from the reference metrics emitter.
fn safe_jsonable(value: &serde_json::Value, depth: usize) -> serde_json::Value {
    const MAX_DEPTH: usize = 4;
    const MAX_LIST: usize = 50;

    if depth > MAX_DEPTH {
        return serde_json::Value::String("...".to_string());
    }

    match value {
        serde_json::Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map.iter().take(MAX_LIST) {
                out.insert(k.clone(), safe_jsonable(v, depth + 1));
            }
            serde_json::Value::Object(out)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().take(MAX_LIST).map(|v| safe_jsonable(v, depth + 1)).collect())
        }
        other => other.clone(),
    }
}

/// One scan outcome record, appended to `metrics_events.jsonl` regardless
/// of OK/NONE status. Field set and order are fixed per spec.md §4.12.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsEvent {
    pub ts: f64,
    pub scan_id: String,
    pub symbol: String,
    pub tf: String,
    pub strategy_id: String,
    pub status: String,
    pub reason: String,
    pub score: Option<f64>,
    pub rr: Option<f64>,
    pub regime: String,
    pub candidates: Option<serde_json::Value>,
    pub failover_used: Option<bool>,
    pub params_digest: String,
    pub top_hits: Vec<String>,
    pub hit_count: usize,
    /// Coverage telemetry populated only when `SHADOW_ALL_DETECTORS` is set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shadow_hits: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shadow_hit_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shadow_detectors_total: Option<usize>,
}

impl MetricsEvent {
    fn sanitized_json(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        if let Some(candidates) = value.get_mut("candidates") {
            *candidates = safe_jsonable(candidates, 0);
        }
        value
    }
}

/// Appends `MetricsEvent`s to a JSONL file. Emission is advisory: a write
/// failure is logged and swallowed, never propagated — a scan must never
/// fail because its own telemetry couldn't be written.
pub struct MetricsEmitter {
    path: PathBuf,
    lock: Mutex<()>,
}

impl MetricsEmitter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        MetricsEmitter { path: path.into(), lock: Mutex::new(()) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Never fails the caller. Logs a warning and returns on any IO error.
    pub fn emit(&self, event: &MetricsEvent) {
        let line = match serde_json::to_string(&event.sanitized_json()) {
            Ok(l) => l,
            Err(e) => {
                tracing::warn!(error = %e, "metrics event failed to serialize");
                return;
            }
        };

        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(e) = append_line(&self.path, &line) {
            tracing::warn!(error = %e, path = %self.path.display(), "metrics event append failed");
        }
    }
}

fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    use std::io::Write;
    let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")?;
    file.flush()?;
    file.sync_data()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("signalscan_metrics_test_{}_{name}", std::process::id()))
    }

    fn sample_event() -> MetricsEvent {
        MetricsEvent {
            ts: 1_700_000_000.0,
            scan_id: "scan1".to_string(),
            symbol: "EURUSD".to_string(),
            tf: "M15".to_string(),
            strategy_id: "s1".to_string(),
            status: "OK".to_string(),
            reason: "OK".to_string(),
            score: Some(2.4),
            rr: Some(2.1),
            regime: "TREND_BULL".to_string(),
            candidates: None,
            failover_used: Some(false),
            params_digest: "abc123".to_string(),
            top_hits: vec!["rsi_reversal".to_string()],
            hit_count: 1,
            shadow_hits: None,
            shadow_hit_count: None,
            shadow_detectors_total: None,
        }
    }

    #[test]
    fn emit_appends_one_line_per_call() {
        let path = scratch_path("append");
        let _ = fs::remove_file(&path);
        let emitter = MetricsEmitter::new(&path);

        emitter.emit(&sample_event());
        emitter.emit(&sample_event());

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn deeply_nested_candidates_are_truncated_not_fatal() {
        let mut deep = serde_json::json!("leaf");
        for _ in 0..10 {
            deep = serde_json::json!({"next": deep});
        }
        let mut event = sample_event();
        event.candidates = Some(deep);

        let path = scratch_path("deep");
        let _ = fs::remove_file(&path);
        let emitter = MetricsEmitter::new(&path);
        emitter.emit(&event);

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 1);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn sanitized_json_preserves_scalar_fields() {
        let event = sample_event();
        let json = event.sanitized_json();
        assert_eq!(json["symbol"], "EURUSD");
        assert_eq!(json["hit_count"], 1);
    }

    #[test]
    fn shadow_fields_omitted_when_absent() {
        let json = sample_event().sanitized_json();
        assert!(json.get("shadow_hits").is_none());
        assert!(json.get("shadow_hit_count").is_none());
    }

    #[test]
    fn shadow_fields_present_when_set() {
        let mut event = sample_event();
        event.shadow_hits = Some(vec!["rsi_reversal".to_string(), "macd_cross".to_string()]);
        event.shadow_hit_count = Some(1);
        event.shadow_detectors_total = Some(2);
        let json = event.sanitized_json();
        assert_eq!(json["shadow_hit_count"], 1);
        assert_eq!(json["shadow_detectors_total"], 2);
    }
}
