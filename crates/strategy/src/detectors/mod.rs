mod macd_cross;
mod rsi_reversal;

use crate::registry::DetectorRegistry;

pub use macd_cross::MacdCrossDetector;
pub use rsi_reversal::RsiReversalDetector;

/// Registers every built-in detector. New detectors are added here and
/// nowhere else.
pub fn register_all(registry: &mut DetectorRegistry) {
    registry.register("rsi_reversal", || Box::new(RsiReversalDetector));
    registry.register("macd_cross", || Box::new(MacdCrossDetector));
}

/// Close prices oldest-first from a candle slice.
pub(crate) fn closes(candles: &[common::Candle]) -> Vec<f64> {
    candles.iter().map(|c| c.close).collect()
}
