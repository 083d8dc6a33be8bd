use common::{Candle, Regime};

/// Minimum run of consecutive same-direction swing points needed to call a
/// trend rather than chop.
const TREND_RUN: usize = 3;

/// Classifies market structure on the trend timeframe from a sequence of
/// swing highs/lows: a run of higher-highs-and-higher-lows is `TREND_BULL`,
/// lower-highs-and-lower-lows is `TREND_BEAR`, a tight high/low range with
/// no directional run is `RANGE`, anything else is `CHOP`. Returns the
/// regime plus the evidence used to decide it.
pub fn classify(trend_tf_candles: &[Candle]) -> (Regime, serde_json::Value) {
    let swings = find_swings(trend_tf_candles);
    if swings.len() < TREND_RUN + 1 {
        return (
            Regime::Chop,
            serde_json::json!({ "reason": "INSUFFICIENT_SWINGS", "swing_count": swings.len() }),
        );
    }

    let highs: Vec<f64> = swings.iter().map(|s| s.high).collect();
    let lows: Vec<f64> = swings.iter().map(|s| s.low).collect();

    let bull_run = longest_run(&highs, &lows, true);
    let bear_run = longest_run(&highs, &lows, false);

    let (range_lo, range_hi) = range_bounds(trend_tf_candles);
    let range_width_pct = if range_hi > 0.0 {
        (range_hi - range_lo) / range_hi * 100.0
    } else {
        0.0
    };

    let evidence = serde_json::json!({
        "swing_count": swings.len(),
        "bull_run": bull_run,
        "bear_run": bear_run,
        "range_width_pct": range_width_pct,
    });

    if bull_run >= TREND_RUN && bull_run >= bear_run {
        (Regime::TrendBull, evidence)
    } else if bear_run >= TREND_RUN && bear_run > bull_run {
        (Regime::TrendBear, evidence)
    } else if range_width_pct <= 1.0 {
        (Regime::Range, evidence)
    } else {
        (Regime::Chop, evidence)
    }
}

struct Swing {
    high: f64,
    low: f64,
}

/// A coarse local-extrema swing detector: every candle whose high is a
/// local max (or low is a local min) over its immediate neighbors becomes a
/// swing point, in chronological order.
fn find_swings(candles: &[Candle]) -> Vec<Swing> {
    if candles.len() < 3 {
        return Vec::new();
    }
    let mut swings = Vec::new();
    for w in candles.windows(3) {
        let (a, b, c) = (w[0], w[1], w[2]);
        let is_swing_high = b.high >= a.high && b.high >= c.high;
        let is_swing_low = b.low <= a.low && b.low <= c.low;
        if is_swing_high || is_swing_low {
            swings.push(Swing { high: b.high, low: b.low });
        }
    }
    swings
}

/// Longest run of consecutive swings that are each strictly higher (both
/// high and low) than the previous when `bullish`, or strictly lower when
/// not, scanning from the most recent swing backward.
fn longest_run(highs: &[f64], lows: &[f64], bullish: bool) -> usize {
    let mut best = 0;
    let mut current = 0;
    for i in 1..highs.len() {
        let higher = highs[i] > highs[i - 1] && lows[i] > lows[i - 1];
        let lower = highs[i] < highs[i - 1] && lows[i] < lows[i - 1];
        let matches = if bullish { higher } else { lower };
        if matches {
            current += 1;
        } else {
            current = 0;
        }
        best = best.max(current);
    }
    best
}

fn range_bounds(candles: &[Candle]) -> (f64, f64) {
    let lo = candles.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);
    let hi = candles.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max);
    if lo.is_finite() && hi.is_finite() {
        (lo, hi)
    } else {
        (0.0, 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn candle(i: i64, high: f64, low: f64) -> Candle {
        Candle {
            time: Utc.timestamp_opt(1_700_000_000 + i * 3600, 0).unwrap(),
            open: (high + low) / 2.0,
            high,
            low,
            close: (high + low) / 2.0,
            volume: None,
        }
    }

    #[test]
    fn rising_highs_and_lows_classify_trend_bull() {
        let mut candles = Vec::new();
        for i in 0..12 {
            let base = 100.0 + i as f64 * 2.0;
            candles.push(candle(i, base + 1.0, base - 1.0));
        }
        let (regime, _) = classify(&candles);
        assert_eq!(regime, Regime::TrendBull);
    }

    #[test]
    fn falling_highs_and_lows_classify_trend_bear() {
        let mut candles = Vec::new();
        for i in 0..12 {
            let base = 200.0 - i as f64 * 2.0;
            candles.push(candle(i, base + 1.0, base - 1.0));
        }
        let (regime, _) = classify(&candles);
        assert_eq!(regime, Regime::TrendBear);
    }

    #[test]
    fn too_few_candles_is_chop() {
        let candles = vec![candle(0, 101.0, 99.0), candle(1, 101.5, 99.5)];
        let (regime, evidence) = classify(&candles);
        assert_eq!(regime, Regime::Chop);
        assert_eq!(evidence["reason"], "INSUFFICIENT_SWINGS");
    }
}
