//! Apply a recommended strategy patch safely (backup + validate + atomic write).
//! Grounded on `scripts/apply_strategy_patch.py` in the original implementation.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use clap::Parser;
use serde_json::{json, Value};
use sha1::{Digest, Sha1};

use strategy::StrategyPackLoader;

#[derive(Parser)]
#[command(author, version, about = "Apply a recommended strategy patch safely", long_about = None)]
struct Cli {
    /// strategy_id to patch
    #[arg(long, default_value = "")]
    strategy: String,

    /// patch_id from state/patch_suggestions.json
    #[arg(long, default_value = "")]
    patch_id: String,

    /// inline patch JSON (object of {field: {"to": value}})
    #[arg(long, default_value = "")]
    patch_json: String,

    /// path to strategies.json
    #[arg(long, default_value = "config/strategies.json")]
    strategies_path: String,

    /// path to patch suggestions registry
    #[arg(long, default_value = "state/patch_suggestions.json")]
    suggestions_path: String,

    /// actually write the file (default is dry-run)
    #[arg(long, conflicts_with = "dry_run")]
    apply: bool,

    /// dry-run only (default)
    #[arg(long)]
    dry_run: bool,
}

fn stable_patch_id(strategy_id: &str, changes: &HashMap<String, Value>) -> String {
    let mut sorted: Vec<(&String, &Value)> = changes.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    let payload = json!({
        "strategy_id": strategy_id,
        "changes": sorted.iter().map(|(k, v)| ((*k).clone(), (*v).clone())).collect::<HashMap<_, _>>(),
    });
    let raw = serde_json::to_vec(&payload).unwrap_or_default();
    let mut hasher = Sha1::new();
    hasher.update(&raw);
    hex::encode(hasher.finalize())[..12].to_string()
}

fn load_json_object(path: &str) -> anyhow::Result<Value> {
    let text = fs::read_to_string(path)?;
    let value: Value = serde_json::from_str(&text)?;
    if !value.is_object() {
        anyhow::bail!("JSON root must be an object");
    }
    Ok(value)
}

fn find_strategy_index(data: &Value, strategy_id: &str) -> Option<usize> {
    data.get("strategies")?.as_array()?.iter().position(|s| {
        s.get("strategy_id").and_then(|v| v.as_str()).unwrap_or("") == strategy_id
    })
}

fn apply_changes(strategy_obj: &mut Value, changes: &HashMap<String, Value>) -> (Value, Value) {
    let mut before = serde_json::Map::new();
    let mut after = serde_json::Map::new();
    let obj = strategy_obj.as_object_mut().expect("strategy entry must be an object");
    for (field, spec) in changes {
        let to_value = spec.get("to").cloned().unwrap_or(Value::Null);
        before.insert(field.clone(), obj.get(field).cloned().unwrap_or(Value::Null));
        obj.insert(field.clone(), to_value.clone());
        after.insert(field.clone(), to_value);
    }
    (Value::Object(before), Value::Object(after))
}

fn validate_strategy(strategy_obj: &Value) -> anyhow::Result<()> {
    let wrapped = json!({ "schema_version": 1, "strategies": [strategy_obj] });
    let registry = strategy::global_registry();
    let report = StrategyPackLoader::new(registry).load_str(&wrapped.to_string());
    if !report.errors.is_empty() {
        anyhow::bail!("from_dict_errors={:?}", report.errors);
    }
    if report.strategies.is_empty() {
        anyhow::bail!("validate_errors={:?}", report.invalid_enabled);
    }
    Ok(())
}

fn backup_file(path: &str) -> anyhow::Result<String> {
    let ts = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    let backup_path = format!("{path}.bak.{ts}");
    fs::copy(path, &backup_path)?;
    Ok(backup_path)
}

fn save_json_atomic(data: &Value, path: &str) -> anyhow::Result<()> {
    let text = serde_json::to_string_pretty(data)?;
    let tmp = format!("{path}.tmp");
    fs::write(&tmp, text)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn append_patch_audit(
    audit_path: &str,
    patch_id: &str,
    patch_type: &str,
    strategy_ids: &[String],
    file_path: &str,
    backup_path: &str,
    dry_run: bool,
    before: &Value,
    after: &Value,
) {
    let record = json!({
        "ts": chrono::Utc::now().timestamp(),
        "patch_id": patch_id,
        "patch_type": patch_type,
        "strategy_ids": strategy_ids,
        "file_path": file_path,
        "backup_path": backup_path,
        "dry_run": dry_run,
        "before": before,
        "after": after,
    });
    if let Some(parent) = Path::new(audit_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = fs::create_dir_all(parent);
        }
    }
    let mut line = record.to_string();
    line.push('\n');
    use std::io::Write;
    if let Ok(mut f) = fs::OpenOptions::new().create(true).append(true).open(audit_path) {
        let _ = f.write_all(line.as_bytes());
    }
}

fn find_patch_by_id(suggestions: &Value, patch_id: &str, strategy_id: Option<&str>) -> Option<Value> {
    let items = suggestions.get("items")?.as_array()?;
    items
        .iter()
        .find(|it| {
            it.get("patch_id").and_then(|v| v.as_str()) == Some(patch_id)
                && strategy_id
                    .map(|sid| it.get("strategy_id").and_then(|v| v.as_str()) == Some(sid))
                    .unwrap_or(true)
        })
        .cloned()
}

fn load_patch_suggestions(path: &str) -> Value {
    fs::read_to_string(path)
        .ok()
        .and_then(|text| serde_json::from_str(&text).ok())
        .unwrap_or_else(|| json!({ "schema": 1, "items": [] }))
}

fn run(cli: &Cli) -> anyhow::Result<(String, bool)> {
    let dry_run = !cli.apply;

    let mut strategy_id = cli.strategy.trim().to_string();
    let mut changes: HashMap<String, Value> = HashMap::new();
    let mut patch_type = "NA".to_string();
    let mut strategy_ids: Vec<String> = Vec::new();

    if !cli.patch_id.trim().is_empty() {
        let suggestions = load_patch_suggestions(&cli.suggestions_path);
        let patch = find_patch_by_id(
            &suggestions,
            cli.patch_id.trim(),
            if strategy_id.is_empty() { None } else { Some(strategy_id.as_str()) },
        )
        .ok_or_else(|| anyhow::anyhow!("patch_id_not_found"))?;

        if strategy_id.is_empty() {
            strategy_id = patch.get("strategy_id").and_then(|v| v.as_str()).unwrap_or("").to_string();
        }
        let changes_value = patch
            .get("changes")
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("patch_changes_bad_shape"))?;
        changes = serde_json::from_value(changes_value).map_err(|_| anyhow::anyhow!("patch_changes_bad_shape"))?;
        patch_type = patch
            .get("patch_type")
            .and_then(|v| v.as_str())
            .unwrap_or("NA")
            .to_string();
        if let Some(sids) = patch.get("strategy_ids").and_then(|v| v.as_array()) {
            strategy_ids = sids.iter().filter_map(|v| v.as_str().map(str::to_string)).collect();
        }
    } else if !cli.patch_json.trim().is_empty() {
        let obj: Value = serde_json::from_str(&cli.patch_json)?;
        changes = serde_json::from_value(obj).map_err(|_| anyhow::anyhow!("patch_json_root_must_be_object"))?;
    }

    if strategy_id.is_empty() {
        anyhow::bail!("strategy_id_required");
    }
    if strategy_ids.is_empty() {
        strategy_ids.push(strategy_id.clone());
    }

    let data = load_json_object(&cli.strategies_path)?;
    let idx = find_strategy_index(&data, &strategy_id).ok_or_else(|| anyhow::anyhow!("strategy_id_not_found: {strategy_id}"))?;

    let mut new_data = data.clone();
    let strategy_obj = new_data
        .get_mut("strategies")
        .and_then(|v| v.as_array_mut())
        .and_then(|arr| arr.get_mut(idx))
        .ok_or_else(|| anyhow::anyhow!("strategy_entry_not_a_dict"))?;

    let (before, after) = apply_changes(strategy_obj, &changes);
    validate_strategy(strategy_obj)?;

    let patch_id = stable_patch_id(&strategy_id, &changes);

    if dry_run {
        return Ok((patch_id, dry_run));
    }

    let backup_path = backup_file(&cli.strategies_path)?;
    save_json_atomic(&new_data, &cli.strategies_path)?;
    append_patch_audit(
        "state/patch_audit.jsonl",
        &patch_id,
        &patch_type,
        &strategy_ids,
        &cli.strategies_path,
        &backup_path,
        false,
        &before,
        &after,
    );

    Ok((patch_id, dry_run))
}

fn main() {
    let cli = Cli::parse();
    println!(
        "PATCH_APPLY_START | patch_id={} | strategy_id={} | dry_run={}",
        if cli.patch_id.trim().is_empty() { "NA" } else { cli.patch_id.trim() },
        if cli.strategy.trim().is_empty() { "NA" } else { cli.strategy.trim() },
        !cli.apply,
    );

    match run(&cli) {
        Ok((patch_id, dry_run)) => {
            println!(
                "PATCH_APPLY_OK | patch_id={patch_id} | strategy_id={} | dry_run={dry_run}",
                cli.strategy.trim(),
            );
            std::process::exit(0);
        }
        Err(e) => {
            println!("PATCH_APPLY_FAILED | patch_id={} | err={e}", if cli.patch_id.trim().is_empty() { "NA" } else { cli.patch_id.trim() });
            std::process::exit(2);
        }
    }
}
