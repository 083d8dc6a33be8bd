use common::{ConflictPolicy, Setup, Side, Timeframe};
use governance::{select, Candidate, SignalStateStore};
use proptest::prelude::*;

fn candidate(strategy_id: &str, score: f64, rr: f64, direction: Side, cooldown: i64, limit: i64) -> Candidate {
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
        cooldown_minutes: cooldown,
        daily_limit: limit,
        conflict_policy: ConflictPolicy::Skip,
    }
}

proptest! {
    /// Selection never panics on extreme score/rr/cooldown/limit inputs,
    /// and always returns either an acceptance or a typed block reason.
    #[test]
    fn selection_never_panics_on_extreme_inputs(
        score in -1000.0f64..1000.0f64,
        rr in 0.0f64..100.0f64,
        cooldown in 0i64..100_000,
        limit in 0i64..1000,
        now in 0.0f64..2_000_000_000.0f64,
    ) {
        let store = SignalStateStore::new("/tmp/unused_proptest_governance_state.json");
        let c = candidate("s1", score, rr, Side::Buy, cooldown, limit);
        let result = select(vec![c], &store, now, "2026-01-01", true);
        prop_assert!(result.accepted.is_some() || result.none_reason.is_some());
    }
}
