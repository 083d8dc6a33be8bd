//! Rollback a strategy patch using the `patch_audit.jsonl` trail written by
//! `apply_strategy_patch`. Grounded on `scripts/rollback_strategy_patch.py`.

use std::fs;
use std::path::Path;

use clap::Parser;
use serde_json::Value;

use strategy::StrategyPackLoader;

#[derive(Parser)]
#[command(author, version, about = "Rollback a strategy patch using patch_audit.jsonl", long_about = None)]
struct Cli {
    #[arg(long)]
    patch_id: String,

    #[arg(long, default_value = "state/patch_audit.jsonl")]
    audit_path: String,

    #[arg(long, default_value = "config/strategies.json")]
    strategies_path: String,

    #[arg(long, conflicts_with = "dry_run")]
    apply: bool,

    #[arg(long)]
    dry_run: bool,

    /// skip loader validation after restore
    #[arg(long)]
    no_validate: bool,
}

fn read_latest_audit_entry(audit_path: &str, patch_id: &str) -> Option<Value> {
    let text = fs::read_to_string(audit_path).ok()?;
    let mut latest = None;
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(obj) = serde_json::from_str::<Value>(line) else { continue };
        if obj.get("patch_id").and_then(|v| v.as_str()) == Some(patch_id) {
            latest = Some(obj);
        }
    }
    latest
}

fn atomic_write_bytes(path: &str, content: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let tmp = format!("{path}.tmp");
    fs::write(&tmp, content)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn validate_strategies(path: &str) -> bool {
    let Ok(text) = fs::read_to_string(path) else { return false };
    let registry = strategy::global_registry();
    let report = StrategyPackLoader::new(registry).load_str(&text);
    if !report.errors.is_empty() {
        return false;
    }
    !(report.strategies.is_empty() && !report.invalid_enabled.is_empty())
}

struct RollbackOutcome {
    backup_path: String,
    dry_run: bool,
}

fn rollback_patch(cli: &Cli) -> anyhow::Result<RollbackOutcome> {
    let dry_run = !cli.apply;
    let entry = read_latest_audit_entry(&cli.audit_path, &cli.patch_id)
        .ok_or_else(|| anyhow::anyhow!("patch_id_not_found_in_audit"))?;

    let backup_path = entry
        .get("backup_path")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .trim()
        .to_string();
    if backup_path.is_empty() {
        anyhow::bail!("audit_missing_backup_path");
    }
    if !Path::new(&backup_path).exists() {
        anyhow::bail!("backup_file_not_found: {backup_path}");
    }

    if dry_run {
        return Ok(RollbackOutcome { backup_path, dry_run: true });
    }

    let current_bytes = fs::read(&cli.strategies_path).unwrap_or_default();
    let backup_bytes = fs::read(&backup_path)?;

    atomic_write_bytes(&cli.strategies_path, &backup_bytes)?;

    if !cli.no_validate && !validate_strategies(&cli.strategies_path) {
        atomic_write_bytes(&cli.strategies_path, &current_bytes)?;
        anyhow::bail!("rollback_validation_failed");
    }

    Ok(RollbackOutcome { backup_path, dry_run: false })
}

fn main() {
    let cli = Cli::parse();
    let patch_id = cli.patch_id.trim().to_string();
    let entry = read_latest_audit_entry(&cli.audit_path, &patch_id);
    let backup = entry
        .as_ref()
        .and_then(|e| e.get("backup_path"))
        .and_then(|v| v.as_str())
        .unwrap_or("NA");
    println!("PATCH_ROLLBACK_START | patch_id={patch_id} | backup={backup} | dry_run={}", !cli.apply);

    match rollback_patch(&cli) {
        Ok(outcome) => {
            println!(
                "PATCH_ROLLBACK_OK | patch_id={patch_id} | restored={} | backup={} | dry_run={}",
                cli.strategies_path, outcome.backup_path, outcome.dry_run
            );
            std::process::exit(0);
        }
        Err(e) => {
            println!("PATCH_ROLLBACK_FAILED | patch_id={} | err={e}", if patch_id.is_empty() { "NA" } else { &patch_id });
            std::process::exit(2);
        }
    }
}
