//! Print an ops health snapshot as JSON and exit 0 iff status == "ok".
//! Grounded on `scripts/health_report.py`.

use std::fs;

use clap::Parser;

use strategy::{merge_reports, StrategyLoadReport, StrategyPackLoader};
use telemetry::{build_health_snapshot, ProcessClock};

#[derive(Parser)]
#[command(author, version, about = "Print ops health snapshot JSON", long_about = None)]
struct Cli {
    #[arg(long, default_value = "config/strategies")]
    strategies_path: String,

    #[arg(long, default_value = "state/metrics_events.jsonl")]
    metrics_events_path: String,

    #[arg(long, default_value = "state/patch_audit.jsonl")]
    patch_audit_path: String,
}

fn discover_strategy_files(dir: &str) -> Vec<std::path::PathBuf> {
    if let Ok(meta) = fs::metadata(dir) {
        if meta.is_file() {
            return vec![std::path::PathBuf::from(dir)];
        }
    }
    let mut files: Vec<std::path::PathBuf> = match fs::read_dir(dir) {
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

fn load_report(strategies_path: &str) -> StrategyLoadReport {
    let registry = strategy::global_registry();
    let loader = StrategyPackLoader::new(registry);
    let files = discover_strategy_files(strategies_path);
    let reports: Vec<StrategyLoadReport> = files.iter().map(|f| loader.load_file(f)).collect();
    merge_reports(reports)
}

fn main() {
    let cli = Cli::parse();
    let report = load_report(&cli.strategies_path);
    let clock = ProcessClock::start();

    let snapshot = build_health_snapshot(
        env!("CARGO_PKG_VERSION"),
        option_env!("GIT_SHA").unwrap_or("unknown"),
        &clock,
        &report,
        None,
        None,
        &cli.metrics_events_path,
        &cli.patch_audit_path,
    );

    println!("{}", serde_json::to_string_pretty(&snapshot).unwrap_or_default());

    std::process::exit(if snapshot.status == "ok" { 0 } else { 1 });
}
