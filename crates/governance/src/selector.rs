use common::{ConflictPolicy, Setup, Side, Timeframe};

use crate::state_store::{make_daily_bucket, make_key, SignalStateStore};

/// One OK candidate ranked for governance consideration. Candidates are
/// ranked by `(score, rr)` descending before being handed to `select`; ties
/// break by `strategy_id` ascending.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub strategy_id: String,
    pub symbol: String,
    pub tf: Timeframe,
    pub setup: Setup,
    pub score: f64,
    pub cooldown_minutes: i64,
    pub daily_limit: i64,
    pub conflict_policy: ConflictPolicy,
}

/// Sort candidates by `(score desc, rr desc, strategy_id asc)` — the
/// deterministic ranking order the spec requires before governance runs.
pub fn rank(mut candidates: Vec<Candidate>) -> Vec<Candidate> {
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.setup.rr.partial_cmp(&a.setup.rr).unwrap_or(std::cmp::Ordering::Equal))
            .then_with(|| a.strategy_id.cmp(&b.strategy_id))
    });
    candidates
}

#[derive(Debug, Clone)]
pub struct SelectionResult {
    pub accepted: Option<Candidate>,
    pub used_failover: bool,
    pub blocked_winner_strategy_id: Option<String>,
    pub blocked_reason: Option<String>,
    pub none_reason: Option<String>,
}

/// Walk the ranked candidates in order, applying cooldown, daily-limit, and
/// conflict-suppression checks. On acceptance, records the sent key and
/// increments the daily counter. `today` is precomputed by the caller from
/// the user's `tz_offset_hours` (governance never reads a local clock
/// itself — see DESIGN NOTES on clock/timezone leakage).
pub fn select(
    candidates: Vec<Candidate>,
    store: &SignalStateStore,
    now: f64,
    today: &str,
    failover_on_block: bool,
) -> SelectionResult {
    let ranked = rank(candidates);
    if ranked.is_empty() {
        return SelectionResult {
            accepted: None,
            used_failover: false,
            blocked_winner_strategy_id: None,
            blocked_reason: None,
            none_reason: Some("NO_HITS".to_string()),
        };
    }

    let top_strategy_id = ranked[0].strategy_id.clone();
    let mut blocked_winner = None;
    let mut blocked_reason = None;

    for (idx, candidate) in ranked.iter().enumerate() {
        match check_one(candidate, store, now, today) {
            None => {
                store_sent(candidate, store, now, today);
                return SelectionResult {
                    accepted: Some(candidate.clone()),
                    used_failover: idx > 0,
                    blocked_winner_strategy_id: if idx > 0 {
                        Some(top_strategy_id.clone())
                    } else {
                        None
                    },
                    blocked_reason: if idx > 0 { blocked_reason.clone() } else { None },
                    none_reason: None,
                };
            }
            Some(reason) => {
                if idx == 0 {
                    blocked_winner = Some(candidate.strategy_id.clone());
                    blocked_reason = Some(reason.clone());
                }
                if !failover_on_block {
                    return SelectionResult {
                        accepted: None,
                        used_failover: false,
                        blocked_winner_strategy_id: blocked_winner,
                        blocked_reason: Some(reason.clone()),
                        none_reason: Some(reason),
                    };
                }
            }
        }
    }

    SelectionResult {
        accepted: None,
        used_failover: false,
        blocked_winner_strategy_id: blocked_winner,
        blocked_reason: blocked_reason.clone(),
        none_reason: blocked_reason.or(Some("GOVERNANCE_BLOCKED".to_string())),
    }
}

/// Returns `Some(reason)` if blocked, `None` if it passes.
fn check_one(
    candidate: &Candidate,
    store: &SignalStateStore,
    now: f64,
    today: &str,
) -> Option<String> {
    let key = make_key(&candidate.symbol, candidate.tf, &candidate.strategy_id, candidate.setup.direction);
    if !store.can_send(&key, now, candidate.cooldown_minutes) {
        return Some("COOLDOWN_ACTIVE".to_string());
    }

    let bucket = make_daily_bucket(&candidate.symbol, candidate.tf, &candidate.strategy_id);
    if candidate.daily_limit > 0 {
        let count = store.get_daily_count(&bucket, today);
        if count >= candidate.daily_limit {
            return Some("DAILY_LIMIT_REACHED".to_string());
        }
    }

    if candidate.conflict_policy == ConflictPolicy::Skip {
        let opposite_key = make_key(
            &candidate.symbol,
            candidate.tf,
            &candidate.strategy_id,
            candidate.setup.direction.opposite(),
        );
        if let Some(rec) = store.get_sent_record(&opposite_key) {
            if is_same_day(rec.ts, now) {
                return Some("CONFLICT_DIRECTION".to_string());
            }
        }
    }

    None
}

fn is_same_day(ts: f64, now: f64) -> bool {
    let a = chrono::DateTime::<chrono::Utc>::from_timestamp(ts as i64, 0);
    let b = chrono::DateTime::<chrono::Utc>::from_timestamp(now as i64, 0);
    match (a, b) {
        (Some(a), Some(b)) => a.date_naive() == b.date_naive(),
        _ => false,
    }
}

fn store_sent(candidate: &Candidate, store: &SignalStateStore, now: f64, today: &str) {
    let key = make_key(&candidate.symbol, candidate.tf, &candidate.strategy_id, candidate.setup.direction);
    store.record_sent(
        &key,
        now,
        &candidate.symbol,
        candidate.setup.direction,
        candidate.tf,
        &candidate.strategy_id,
    );
    let bucket = make_daily_bucket(&candidate.symbol, candidate.tf, &candidate.strategy_id);
    store.increment_daily(&bucket, today);
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::Side;

    fn candidate(strategy_id: &str, score: f64, rr: f64, direction: Side) -> Candidate {
        Candidate {
            strategy_id: strategy_id.to_string(),
            symbol: "EURUSD".to_string(),
            tf: Timeframe::M15,
            setup: Setup {
                symbol: "EURUSD".to_string(),
                direction,
                entry: 1.1,
                sl: 1.095,
                tp: 1.11,
                rr,
                evidence: serde_json::json!({}),
            },
            score,
            cooldown_minutes: 60,
            daily_limit: 3,
            conflict_policy: ConflictPolicy::Skip,
        }
    }

    #[test]
    fn accepts_top_candidate_when_unblocked() {
        let store = SignalStateStore::new("/tmp/unused_selector_test1.json");
        let result = select(vec![candidate("s1", 1.6, 2.0, Side::Buy)], &store, 1000.0, "2026-01-01", true);
        assert!(result.accepted.is_some());
        assert!(!result.used_failover);
    }

    #[test]
    fn cooldown_blocks_repeat_fire_same_cycle() {
        let store = SignalStateStore::new("/tmp/unused_selector_test2.json");
        let c = candidate("s1", 1.6, 2.0, Side::Buy);
        let first = select(vec![c.clone()], &store, 1000.0, "2026-01-01", true);
        assert!(first.accepted.is_some());

        let second = select(vec![c], &store, 1005.0, "2026-01-01", true);
        assert!(second.accepted.is_none());
        assert_eq!(second.none_reason.as_deref(), Some("COOLDOWN_ACTIVE"));
    }

    #[test]
    fn failover_to_second_candidate_when_top_blocked() {
        let store = SignalStateStore::new("/tmp/unused_selector_test3.json");
        let a = candidate("strategy_a", 2.0, 3.0, Side::Buy);
        select(vec![a.clone()], &store, 1000.0, "2026-01-01", true);

        let b = candidate("strategy_b", 1.0, 1.6, Side::Buy);
        let result = select(vec![a, b], &store, 1005.0, "2026-01-01", true);

        assert!(result.accepted.is_some());
        assert_eq!(result.accepted.unwrap().strategy_id, "strategy_b");
        assert!(result.used_failover);
        assert_eq!(result.blocked_winner_strategy_id.as_deref(), Some("strategy_a"));
        assert_eq!(result.blocked_reason.as_deref(), Some("COOLDOWN_ACTIVE"));
    }

    #[test]
    fn daily_limit_zero_means_unlimited() {
        let store = SignalStateStore::new("/tmp/unused_selector_test4.json");
        let mut c = candidate("s1", 1.0, 2.0, Side::Buy);
        c.daily_limit = 0;
        c.cooldown_minutes = 0;
        for i in 0..10 {
            let r = select(vec![c.clone()], &store, 1000.0 + i as f64, "2026-01-01", true);
            assert!(r.accepted.is_some());
        }
    }

    #[test]
    fn conflict_direction_blocks_opposite_same_day() {
        let store = SignalStateStore::new("/tmp/unused_selector_test5.json");
        let buy = candidate("s1", 1.0, 2.0, Side::Buy);
        select(vec![buy], &store, 1000.0, "2026-01-01", true);

        let sell = candidate("s1", 1.0, 2.0, Side::Sell);
        let result = select(vec![sell], &store, 1005.0, "2026-01-01", false);
        assert!(result.accepted.is_none());
        assert_eq!(result.blocked_reason.as_deref(), Some("CONFLICT_DIRECTION"));
    }
}
