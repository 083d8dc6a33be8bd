use std::collections::HashMap;

/// Normalize a detector name: lowercase, dashes/spaces -> underscore,
/// collapse anything else non `[a-z0-9_]` to `_`, then collapse repeated
/// underscores and trim them from the ends.
pub fn normalize(name: &str) -> String {
    let mut s = name.trim().to_lowercase();
    s = s.replace('-', "_").replace(' ', "_");
    let mut collapsed = String::with_capacity(s.len());
    let mut last_was_underscore = false;
    for ch in s.chars() {
        let c = if ch.is_ascii_alphanumeric() || ch == '_' {
            ch
        } else {
            '_'
        };
        if c == '_' {
            if !last_was_underscore {
                collapsed.push('_');
            }
            last_was_underscore = true;
        } else {
            collapsed.push(c);
            last_was_underscore = false;
        }
    }
    s = collapsed.trim_matches('_').to_string();
    s
}

/// Similarity ratio in `[0, 1]` between two strings' normalized forms,
/// computed the way Python's `difflib.SequenceMatcher.ratio()` does:
/// `2 * M / T` where `M` is the total length of matching blocks found by
/// greedy longest-matching-subsequence recursion and `T` is the combined
/// length of both strings.
pub fn ratio(a: &str, b: &str) -> f64 {
    let na = normalize(a);
    let nb = normalize(b);
    if na.is_empty() || nb.is_empty() {
        return 0.0;
    }
    if na == nb {
        return 1.0;
    }
    let av: Vec<char> = na.chars().collect();
    let bv: Vec<char> = nb.chars().collect();
    let matches = matching_block_length(&av, &bv);
    (2.0 * matches as f64) / ((av.len() + bv.len()) as f64)
}

/// Total length of all matching blocks between `a` and `b`, found by
/// repeatedly extracting the longest common contiguous substring and
/// recursing on the left/right remainders — the same divide-and-conquer
/// difflib itself uses.
fn matching_block_length(a: &[char], b: &[char]) -> usize {
    if a.is_empty() || b.is_empty() {
        return 0;
    }
    let (len, ai, bi) = longest_common_substring(a, b);
    if len == 0 {
        return 0;
    }
    let left = matching_block_length(&a[..ai], &b[..bi]);
    let right = matching_block_length(&a[ai + len..], &b[bi + len..]);
    len + left + right
}

fn longest_common_substring(a: &[char], b: &[char]) -> (usize, usize, usize) {
    let mut best_len = 0;
    let mut best_ai = 0;
    let mut best_bi = 0;
    let mut prev = vec![0usize; b.len() + 1];
    for i in 0..a.len() {
        let mut cur = vec![0usize; b.len() + 1];
        for j in 0..b.len() {
            if a[i] == b[j] {
                cur[j + 1] = prev[j] + 1;
                if cur[j + 1] > best_len {
                    best_len = cur[j + 1];
                    best_ai = i + 1 - best_len;
                    best_bi = j + 1 - best_len;
                }
            }
        }
        prev = cur;
    }
    (best_len, best_ai, best_bi)
}

#[derive(Debug, Clone, Default)]
pub struct ResolveResult {
    pub resolved: Vec<String>,
    pub unknown: Vec<String>,
    pub suggestions: HashMap<String, Vec<String>>,
    pub suggestions_scored: HashMap<String, Vec<(String, f64)>>,
    pub alias_applied: HashMap<String, String>,
}

/// Deterministic detector-name resolution: exact match -> case-insensitive
/// -> normalized -> alias map (itself resolved through the same three
/// steps). Unknown names get up to `max_suggestions` candidates scored by
/// `ratio`, falling back to scoring the whole registry and then to a
/// case-insensitive prefix boost, exactly mirroring the reference
/// resolver's layered fallback.
pub fn resolve_detector_names(
    requested: &[String],
    registry_names: &[String],
    aliases: &HashMap<String, String>,
    max_suggestions: usize,
) -> ResolveResult {
    let reg: Vec<String> = registry_names
        .iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    let reg_set: std::collections::HashSet<&str> = reg.iter().map(|s| s.as_str()).collect();

    let mut lower_map: HashMap<String, String> = HashMap::new();
    let mut norm_map: HashMap<String, String> = HashMap::new();
    for r in &reg {
        lower_map.entry(r.to_lowercase()).or_insert_with(|| r.clone());
        norm_map.entry(normalize(r)).or_insert_with(|| r.clone());
    }

    let alias_map: HashMap<String, String> = aliases
        .iter()
        .filter(|(k, v)| !k.trim().is_empty() && !v.trim().is_empty())
        .map(|(k, v)| (k.trim().to_lowercase(), v.trim().to_string()))
        .collect();

    let mut result = ResolveResult::default();

    for name in requested {
        let name = name.trim();
        if name.is_empty() {
            continue;
        }

        if reg_set.contains(name) {
            result.resolved.push(name.to_string());
            continue;
        }
        let lc = name.to_lowercase();
        if let Some(r) = lower_map.get(&lc) {
            result.resolved.push(r.clone());
            continue;
        }
        let n = normalize(name);
        if !n.is_empty() {
            if let Some(r) = norm_map.get(&n) {
                result.resolved.push(r.clone());
                continue;
            }
        }
        if let Some(target) = alias_map.get(&lc) {
            if let Some(resolved) = resolve_single(target, &reg_set, &lower_map, &norm_map) {
                result.alias_applied.insert(name.to_string(), resolved.clone());
                result.resolved.push(resolved);
                continue;
            }
        }

        result.unknown.push(name.to_string());
        let (cand, cand_scored) = suggest(name, &n, &reg, &norm_map, max_suggestions);
        if !cand.is_empty() {
            result.suggestions.insert(name.to_string(), cand);
        }
        if !cand_scored.is_empty() {
            result.suggestions_scored.insert(name.to_string(), cand_scored);
        }
    }

    result
}

fn resolve_single(
    target: &str,
    reg_set: &std::collections::HashSet<&str>,
    lower_map: &HashMap<String, String>,
    norm_map: &HashMap<String, String>,
) -> Option<String> {
    if reg_set.contains(target) {
        return Some(target.to_string());
    }
    if let Some(r) = lower_map.get(&target.to_lowercase()) {
        return Some(r.clone());
    }
    let n = normalize(target);
    norm_map.get(&n).cloned()
}

fn suggest(
    name: &str,
    normalized_name: &str,
    reg: &[String],
    norm_map: &HashMap<String, String>,
    max_suggestions: usize,
) -> (Vec<String>, Vec<(String, f64)>) {
    let mut cand: Vec<String> = Vec::new();
    let mut cand_scored: Vec<(String, f64)> = Vec::new();

    if !normalized_name.is_empty() {
        let mut close: Vec<(&String, f64)> = norm_map
            .iter()
            .map(|(norm_key, reg_name)| (reg_name, ratio_normalized(normalized_name, norm_key)))
            .filter(|(_, score)| *score >= 0.6)
            .collect();
        close.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        for (reg_name, _) in close.into_iter().take(max_suggestions) {
            if !cand.contains(reg_name) {
                cand.push(reg_name.clone());
            }
        }
    }

    for r in &cand {
        cand_scored.push((r.clone(), ratio(name, r)));
    }

    if cand_scored.is_empty() && !reg.is_empty() {
        let mut scored_all: Vec<(String, f64)> =
            reg.iter().map(|r| (r.clone(), ratio(name, r))).collect();
        scored_all.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored_all.truncate(max_suggestions);
        cand = scored_all.iter().map(|(n, _)| n.clone()).collect();
        cand_scored = scored_all;
    }

    if cand.len() < max_suggestions {
        let lc = name.to_lowercase();
        let prefix_len = lc.len().clamp(1, 3);
        let prefix = &lc[..prefix_len.min(lc.len())];
        for r in reg {
            if cand.len() >= max_suggestions {
                break;
            }
            if r.to_lowercase().starts_with(prefix) && !cand.contains(r) {
                cand.push(r.clone());
                cand_scored.push((r.clone(), ratio(name, r)));
            }
        }
    }

    cand_scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    cand_scored.truncate(max_suggestions);
    cand.truncate(max_suggestions);

    (cand, cand_scored)
}

fn ratio_normalized(a_norm: &str, b_norm: &str) -> f64 {
    if a_norm == b_norm {
        return 1.0;
    }
    let av: Vec<char> = a_norm.chars().collect();
    let bv: Vec<char> = b_norm.chars().collect();
    let m = matching_block_length(&av, &bv);
    (2.0 * m as f64) / ((av.len() + bv.len()) as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_separators() {
        assert_eq!(normalize("RSI-Divergence  Bounce"), "rsi_divergence_bounce");
        assert_eq!(normalize("__weird__name__"), "weird_name");
    }

    #[test]
    fn exact_match_resolves() {
        let reg = vec!["trend_break".to_string()];
        let r = resolve_detector_names(&["trend_break".to_string()], &reg, &HashMap::new(), 3);
        assert_eq!(r.resolved, vec!["trend_break".to_string()]);
        assert!(r.unknown.is_empty());
    }

    #[test]
    fn case_insensitive_and_normalized_match() {
        let reg = vec!["trend_break".to_string()];
        let r = resolve_detector_names(&["Trend-Break".to_string()], &reg, &HashMap::new(), 3);
        assert_eq!(r.resolved, vec!["trend_break".to_string()]);
    }

    #[test]
    fn alias_resolves_through_same_steps() {
        let reg = vec!["trend_break".to_string()];
        let mut aliases = HashMap::new();
        aliases.insert("old_trend".to_string(), "Trend_Break".to_string());
        let r = resolve_detector_names(&["old_trend".to_string()], &reg, &aliases, 3);
        assert_eq!(r.resolved, vec!["trend_break".to_string()]);
        assert_eq!(r.alias_applied.get("old_trend").unwrap(), "trend_break");
    }

    #[test]
    fn unknown_name_gets_suggestions() {
        let reg = vec!["trend_break".to_string(), "bounce_zone".to_string()];
        let r = resolve_detector_names(&["trend_brek".to_string()], &reg, &HashMap::new(), 3);
        assert!(r.unknown.contains(&"trend_brek".to_string()));
        assert!(r.suggestions.get("trend_brek").unwrap().contains(&"trend_break".to_string()));
    }

    #[test]
    fn ratio_is_symmetric_and_bounded() {
        let r1 = ratio("trend_break", "trend_brek");
        let r2 = ratio("trend_brek", "trend_break");
        assert!((r1 - r2).abs() < 1e-9);
        assert!((0.0..=1.0).contains(&r1));
    }
}
