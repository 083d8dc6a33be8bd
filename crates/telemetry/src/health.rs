use std::time::Instant;

use serde::Serialize;
use strategy::StrategyLoadReport;

pub const STRATEGY_SCHEMA_VERSION: u32 = 1;
pub const EXPLAIN_SCHEMA_VERSION: u32 = 1;
pub const METRICS_EVENT_SCHEMA_VERSION: u32 = 1;

/// Marks when the process started, for `uptime_s`. Constructed once at
/// composition-root boot.
pub struct ProcessClock {
    started: Instant,
}

impl ProcessClock {
    pub fn start() -> Self {
        ProcessClock { started: Instant::now() }
    }

    pub fn uptime_s(&self) -> u64 {
        self.started.elapsed().as_secs()
    }
}

/// Emits the one-line boot banner via `tracing`, matching
/// `STARTUP_BANNER | app_version | git_sha | strategy_schema |
/// explain_schema | metrics_schema | detectors | presets_dir |
/// notify_mode | provider`.
pub fn log_startup_banner(
    app_version: &str,
    git_sha: &str,
    detectors_count: usize,
    presets_dir: &str,
    notify_mode: &str,
    provider: &str,
) {
    tracing::info!(
        app_version,
        git_sha,
        strategy_schema = STRATEGY_SCHEMA_VERSION,
        explain_schema = EXPLAIN_SCHEMA_VERSION,
        metrics_schema = METRICS_EVENT_SCHEMA_VERSION,
        detectors = detectors_count,
        presets_dir,
        notify_mode,
        provider,
        "STARTUP_BANNER"
    );
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: String,
    pub app_version: String,
    pub git_sha: String,
    pub uptime_s: u64,
    pub strategies_loaded_count: usize,
    pub invalid_strategies: Vec<String>,
    pub unknown_detectors_count: usize,
    pub last_scan_ts: Option<f64>,
    pub last_scan_id: Option<String>,
    pub metrics_events_file_size: Option<u64>,
    pub patch_audit_file_size: Option<u64>,
}

/// Builds a deterministic ops snapshot. `status` is `"degraded"` iff any
/// enabled strategy in `report` is invalid; otherwise `"ok"`.
pub fn build_health_snapshot(
    app_version: &str,
    git_sha: &str,
    clock: &ProcessClock,
    report: &StrategyLoadReport,
    last_scan_ts: Option<f64>,
    last_scan_id: Option<String>,
    metrics_events_path: &str,
    patch_audit_path: &str,
) -> HealthSnapshot {
    let invalid_strategies: Vec<String> = report
        .invalid_enabled
        .iter()
        .filter_map(|inv| inv.strategy_id.clone())
        .filter(|s| !s.is_empty())
        .collect();

    let mut unknown: std::collections::HashSet<String> = std::collections::HashSet::new();
    for names in report.unknown_detectors_by_strategy.values() {
        for n in names {
            if !n.trim().is_empty() {
                unknown.insert(n.clone());
            }
        }
    }

    let status = if invalid_strategies.is_empty() { "ok" } else { "degraded" };

    HealthSnapshot {
        status: status.to_string(),
        app_version: app_version.to_string(),
        git_sha: git_sha.to_string(),
        uptime_s: clock.uptime_s(),
        strategies_loaded_count: report.strategies.len(),
        invalid_strategies,
        unknown_detectors_count: unknown.len(),
        last_scan_ts,
        last_scan_id,
        metrics_events_file_size: file_size(metrics_events_path),
        patch_audit_file_size: file_size(patch_audit_path),
    }
}

fn file_size(path: &str) -> Option<u64> {
    if path.trim().is_empty() {
        return None;
    }
    std::fs::metadata(path).ok().map(|m| m.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_report() -> StrategyLoadReport {
        StrategyLoadReport {
            schema_version: 1,
            strategies: vec![],
            invalid_enabled: vec![],
            errors: vec![],
            warnings: vec![],
            strategy_warnings: Default::default(),
            unknown_detectors_by_strategy: Default::default(),
            unknown_detector_suggestions_by_strategy: Default::default(),
            disabled_unknown_detectors: Default::default(),
            patch_suggestions: vec![],
        }
    }

    #[test]
    fn ok_status_when_no_invalid_strategies() {
        let clock = ProcessClock::start();
        let snapshot = build_health_snapshot("0.1.0", "deadbeef", &clock, &empty_report(), None, None, "", "");
        assert_eq!(snapshot.status, "ok");
        assert_eq!(snapshot.strategies_loaded_count, 0);
    }

    #[test]
    fn degraded_status_when_invalid_strategy_present() {
        let mut report = empty_report();
        report.invalid_enabled.push(common::InvalidStrategy {
            strategy_id: Some("bad_one".to_string()),
            errors: vec!["BAD_TIMEFRAME".to_string()],
        });
        let clock = ProcessClock::start();
        let snapshot = build_health_snapshot("0.1.0", "deadbeef", &clock, &report, None, None, "", "");
        assert_eq!(snapshot.status, "degraded");
        assert_eq!(snapshot.invalid_strategies, vec!["bad_one".to_string()]);
    }

    #[test]
    fn missing_files_report_none_size() {
        let clock = ProcessClock::start();
        let snapshot = build_health_snapshot(
            "0.1.0",
            "deadbeef",
            &clock,
            &empty_report(),
            None,
            None,
            "/nonexistent/metrics.jsonl",
            "/nonexistent/audit.jsonl",
        );
        assert!(snapshot.metrics_events_file_size.is_none());
    }
}
