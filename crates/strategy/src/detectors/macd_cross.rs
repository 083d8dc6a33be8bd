use common::{param_usize, DetectorHit, ScanContext, Side};

use super::closes;

const FAST: usize = 12;
const SLOW: usize = 26;
const SIGNAL: usize = 9;

/// Standard MACD(12,26,9) on the entry-timeframe close series. Fires on the
/// bar where the MACD line crosses its signal line. `fast`/`slow`/`signal`
/// are overridable per-strategy via `detector_params`/`family_params`.
pub struct MacdCrossDetector;

impl super::super::registry::Detector for MacdCrossDetector {
    fn name(&self) -> &'static str {
        "macd_cross"
    }

    fn evaluate(&self, ctx: &ScanContext) -> Option<DetectorHit> {
        let params = common::merge_params(&ctx.strategy, self.name(), Some(common::family_of(self.name())));
        let fast = param_usize(&params, "fast", FAST);
        let slow = param_usize(&params, "slow", SLOW);
        let signal = param_usize(&params, "signal", SIGNAL);

        let closes = closes(&ctx.entry_tf_candles);
        let (macd_line, signal_line) = macd(&closes, fast, slow, signal)?;
        if macd_line.len() < 2 || signal_line.len() < 2 {
            return None;
        }

        let offset = macd_line.len() - signal_line.len();
        let prev_macd = macd_line[macd_line.len() - 2];
        let last_macd = *macd_line.last().unwrap();
        let prev_signal = signal_line[signal_line.len() - 2];
        let last_signal = *signal_line.last().unwrap();
        let _ = offset;

        let prev_diff = prev_macd - prev_signal;
        let last_diff = last_macd - last_signal;

        if prev_diff <= 0.0 && last_diff > 0.0 {
            return Some(DetectorHit {
                name: self.name().to_string(),
                side: Side::Buy,
                strength: last_diff.abs().min(1.0),
                evidence: serde_json::json!({
                    "macd": last_macd,
                    "signal": last_signal,
                    "histogram": last_diff,
                }),
            });
        }
        if prev_diff >= 0.0 && last_diff < 0.0 {
            return Some(DetectorHit {
                name: self.name().to_string(),
                side: Side::Sell,
                strength: last_diff.abs().min(1.0),
                evidence: serde_json::json!({
                    "macd": last_macd,
                    "signal": last_signal,
                    "histogram": last_diff,
                }),
            });
        }
        None
    }
}

fn ema(values: &[f64], period: usize) -> Option<Vec<f64>> {
    if values.len() < period {
        return None;
    }
    let k = 2.0 / (period as f64 + 1.0);
    let seed: f64 = values[..period].iter().sum::<f64>() / period as f64;
    let mut out = Vec::with_capacity(values.len() - period + 1);
    out.push(seed);
    for v in &values[period..] {
        let prev = *out.last().unwrap();
        out.push(v * k + prev * (1.0 - k));
    }
    Some(out)
}

/// Returns `(macd_line, signal_line)` aligned so that `signal_line`'s last
/// element corresponds to `macd_line`'s last element.
fn macd(closes: &[f64], fast: usize, slow: usize, signal: usize) -> Option<(Vec<f64>, Vec<f64>)> {
    let fast_ema = ema(closes, fast)?;
    let slow_ema = ema(closes, slow)?;
    let offset = slow - fast;
    if fast_ema.len() <= offset {
        return None;
    }
    let aligned_fast = &fast_ema[offset..];
    let macd_line: Vec<f64> = aligned_fast
        .iter()
        .zip(slow_ema.iter())
        .map(|(f, s)| f - s)
        .collect();
    let signal_line = ema(&macd_line, signal)?;
    Some((macd_line, signal_line))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ema_seeds_with_simple_average() {
        let values = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let e = ema(&values, 3).unwrap();
        assert!((e[0] - 2.0).abs() < 1e-9);
    }

    #[test]
    fn macd_needs_enough_data() {
        let values = vec![1.0; 10];
        assert!(macd(&values, FAST, SLOW, SIGNAL).is_none());
    }

    #[test]
    fn macd_produces_aligned_series_on_long_input() {
        let values: Vec<f64> = (0..100).map(|i| 100.0 + i as f64 * 0.5).collect();
        let (macd_line, signal_line) = macd(&values, FAST, SLOW, SIGNAL).unwrap();
        assert!(!macd_line.is_empty());
        assert!(!signal_line.is_empty());
        assert!(signal_line.len() <= macd_line.len());
    }

    fn candle_series(closes: &[f64]) -> Vec<common::Candle> {
        closes
            .iter()
            .map(|&c| common::Candle {
                time: chrono::Utc::now(),
                open: c,
                high: c,
                low: c,
                close: c,
                volume: None,
            })
            .collect()
    }

    #[test]
    fn detector_params_override_changes_fast_slow_signal() {
        use crate::registry::Detector;

        let values: Vec<f64> = (0..20).map(|i| 100.0 + i as f64 * 0.5).collect();
        let mut strategy = common::StrategySpec::default();
        let mut overrides = std::collections::HashMap::new();
        overrides.insert("fast".to_string(), toml::Value::Integer(3));
        overrides.insert("slow".to_string(), toml::Value::Integer(6));
        overrides.insert("signal".to_string(), toml::Value::Integer(2));
        strategy.detector_params.insert("macd_cross".to_string(), overrides);

        let ctx = common::ScanContext {
            symbol: "BTCUSDT".to_string(),
            entry_tf_candles: candle_series(&values),
            trend_tf_candles: Vec::new(),
            feature_bundle: std::collections::HashMap::new(),
            regime: common::Regime::Range,
            strategy,
            scan_id: "test".to_string(),
        };

        // With the default (12,26,9) this series is too short to produce a
        // MACD line at all; overriding to (3,6,2) should let it evaluate.
        assert!(macd(&values, FAST, SLOW, SIGNAL).is_none());
        let _ = MacdCrossDetector.evaluate(&ctx);
        assert!(macd(&values, 3, 6, 2).is_some());
    }
}
