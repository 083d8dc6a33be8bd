use common::NotifyMode;

const NA: &str = "NA";

fn na(v: Option<&serde_json::Value>) -> String {
    match v {
        None => NA.to_string(),
        Some(serde_json::Value::Null) => NA.to_string(),
        Some(serde_json::Value::String(s)) if s.trim().is_empty() => NA.to_string(),
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string().trim_matches('"').to_string(),
    }
}

fn is_na(v: Option<&serde_json::Value>) -> bool {
    matches!(na(Some(v.unwrap_or(&serde_json::Value::Null))).as_str(), "" | "NA")
}

fn format_dict_block(title: &str, obj: Option<&serde_json::Value>, max_items: usize) -> String {
    let Some(serde_json::Value::Object(map)) = obj else {
        return String::new();
    };
    if map.is_empty() {
        return String::new();
    }

    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();

    let items: Vec<String> = keys
        .into_iter()
        .take(max_items)
        .map(|k| format!("{k}={}", na(map.get(k))))
        .collect();

    if items.is_empty() {
        return String::new();
    }

    format!("<b>{title}:</b> {}", items.join(", "))
}

const SETUP_FAIL_REASONS: &[&str] = &[
    "RR_BELOW_MIN",
    "NO_ENTRY_TRIGGER",
    "NO_INVALIDATION_LEVEL",
    "NO_TARGETS_FOUND",
    "ENTRY_TOO_FAR",
    "ZONE_TOO_WIDE",
];
const GOV_REASONS: &[&str] = &["COOLDOWN_ACTIVE", "DAILY_LIMIT_REACHED"];
const SCORE_REASONS: &[&str] = &[
    "SCORE_BELOW_MIN",
    "CONFLICT_SCORE",
    "NO_HITS",
    "NO_DETECTORS_FOR_REGIME",
];

/// Formats a Telegram message body from an `Explain` payload (serialized
/// the same shape `ExplainBuilder` produces: top-level `symbol`, `tf`,
/// `strategy_id`, `status`, `reason`, `summary`, plus nested `details` and
/// `evidence` objects).
///
/// `NotifyMode::All` keeps the message to 1-2 lines; `AdminOnly` appends
/// diagnostic blocks gated by the failure reason category.
pub fn format_signal_message(explain: &serde_json::Value, mode: NotifyMode) -> String {
    let empty = serde_json::Value::Object(Default::default());
    let details = explain.get("details").unwrap_or(&empty);
    let evidence = explain.get("evidence").unwrap_or(&empty);

    let symbol = na(explain.get("symbol"));
    let tf = na(explain.get("tf"));
    let strategy_id = na(explain.get("strategy_id"));
    let status = na(explain.get("status")).to_uppercase();
    let reason = na(explain.get("reason")).to_uppercase();
    let summary = na(explain.get("summary"));

    let direction = na(details.get("direction"));
    let score = na(details.get("score"));
    let rr = na(details.get("rr"));
    let regime = na(details.get("regime"));

    let header = format!(
        "\u{26a1} <b>{symbol}</b> {tf} | strat={strategy_id} | {direction} score={score} RR={rr} regime={regime} | {status}"
    );

    if mode != NotifyMode::AdminOnly {
        return format!("{header}\n{summary}");
    }

    let top_contribs = details.get("top_contribs");
    let params_digest = details.get("params_digest");

    let mut lines = vec![header, summary];

    if status == "OK" {
        if !is_na(top_contribs) {
            lines.push(format!("<b>Top:</b> {}", na(top_contribs)));
        }
        if !is_na(params_digest) {
            lines.push(format!("<b>Params:</b> digest={}", na(params_digest)));
        }
        return lines.into_iter().filter(|l| !l.trim().is_empty()).collect::<Vec<_>>().join("\n");
    }

    if SCORE_REASONS.contains(&reason.as_str()) && !is_na(top_contribs) {
        lines.push(format!("<b>Top:</b> {}", na(top_contribs)));
    }

    if !is_na(params_digest) {
        lines.push(format!("<b>Params:</b> digest={}", na(params_digest)));
    }

    if SETUP_FAIL_REASONS.contains(&reason.as_str()) {
        let block = format_dict_block("SetupFail", evidence.get("setup_fail"), 12);
        if !block.is_empty() {
            lines.push(block);
        }
    }

    if GOV_REASONS.contains(&reason.as_str()) {
        let block = format_dict_block("Governance", evidence.get("governance"), 12);
        if !block.is_empty() {
            lines.push(block);
        }
    }

    lines.into_iter().filter(|l| !l.trim().is_empty()).collect::<Vec<_>>().join("\n")
}
