use common::{param_f64, param_usize, DetectorHit, ScanContext, Side};

use super::closes;

const PERIOD: usize = 14;
const OVERSOLD: f64 = 30.0;
const OVERBOUGHT: f64 = 70.0;

/// Wilder's RSI on the entry-timeframe close series. Fires a BUY hit when
/// RSI crosses up out of oversold on the latest bar, a SELL hit on the
/// symmetric cross down out of overbought. `period`/`oversold`/`overbought`
/// are overridable per-strategy via `detector_params`/`family_params`.
pub struct RsiReversalDetector;

impl super::super::registry::Detector for RsiReversalDetector {
    fn name(&self) -> &'static str {
        "rsi_reversal"
    }

    fn evaluate(&self, ctx: &ScanContext) -> Option<DetectorHit> {
        let params = common::merge_params(&ctx.strategy, self.name(), Some(common::family_of(self.name())));
        let period = param_usize(&params, "period", PERIOD);
        let oversold = param_f64(&params, "oversold", OVERSOLD);
        let overbought = param_f64(&params, "overbought", OVERBOUGHT);

        let closes = closes(&ctx.entry_tf_candles);
        let series = wilder_rsi(&closes, period)?;
        if series.len() < 2 {
            return None;
        }
        let prev = series[series.len() - 2];
        let last = *series.last().unwrap();

        if prev <= oversold && last > oversold {
            let strength = ((oversold - prev).max(0.0) / oversold).clamp(0.0, 1.0);
            return Some(DetectorHit {
                name: self.name().to_string(),
                side: Side::Buy,
                strength,
                evidence: serde_json::json!({ "rsi_prev": prev, "rsi_last": last }),
            });
        }
        if prev >= overbought && last < overbought {
            let strength = ((prev - overbought).max(0.0) / (100.0 - overbought)).clamp(0.0, 1.0);
            return Some(DetectorHit {
                name: self.name().to_string(),
                side: Side::Sell,
                strength,
                evidence: serde_json::json!({ "rsi_prev": prev, "rsi_last": last }),
            });
        }
        None
    }
}

/// Wilder-smoothed RSI series, one value per input close starting once the
/// seed average is available at index `period`. Returns `None` when there
/// aren't enough closes to seed the average.
fn wilder_rsi(closes: &[f64], period: usize) -> Option<Vec<f64>> {
    if closes.len() <= period {
        return None;
    }
    let mut gains = 0.0;
    let mut losses = 0.0;
    for i in 1..=period {
        let delta = closes[i] - closes[i - 1];
        if delta >= 0.0 {
            gains += delta;
        } else {
            losses -= delta;
        }
    }
    let mut avg_gain = gains / period as f64;
    let mut avg_loss = losses / period as f64;

    let mut out = Vec::with_capacity(closes.len() - period);
    out.push(rsi_from_averages(avg_gain, avg_loss));

    for i in (period + 1)..closes.len() {
        let delta = closes[i] - closes[i - 1];
        let gain = delta.max(0.0);
        let loss = (-delta).max(0.0);
        avg_gain = (avg_gain * (period - 1) as f64 + gain) / period as f64;
        avg_loss = (avg_loss * (period - 1) as f64 + loss) / period as f64;
        out.push(rsi_from_averages(avg_gain, avg_loss));
    }
    Some(out)
}

fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        return 100.0;
    }
    let rs = avg_gain / avg_loss;
    100.0 - (100.0 / (1.0 + rs))
}
