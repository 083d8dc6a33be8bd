use chrono::{DateTime, Duration, Timelike, Utc};
use common::{Candle, Timeframe};

/// Bucket 5-minute candles into a higher timeframe. M5 is the identity:
/// the source series is returned unchanged, never re-bucketed. The final
/// bucket is emitted even when incomplete — it represents the forming bar.
pub fn resample(candles_5m: &[Candle], tf: Timeframe) -> Vec<Candle> {
    if tf == Timeframe::M5 {
        return candles_5m.to_vec();
    }
    if candles_5m.is_empty() {
        return Vec::new();
    }

    let tf_minutes = tf.minutes();
    let mut out: Vec<Candle> = Vec::new();

    for c in candles_5m {
        let bucket_start = bucket_start(c.time, tf_minutes);
        match out.last_mut() {
            Some(last) if last.time == bucket_start => {
                last.high = last.high.max(c.high);
                last.low = last.low.min(c.low);
                last.close = c.close;
                last.volume = match (last.volume, c.volume) {
                    (Some(a), Some(b)) => Some(a + b),
                    (Some(a), None) => Some(a),
                    (None, Some(b)) => Some(b),
                    (None, None) => None,
                };
            }
            _ => {
                out.push(Candle {
                    time: bucket_start,
                    open: c.open,
                    high: c.high,
                    low: c.low,
                    close: c.close,
                    volume: c.volume,
                });
            }
        }
    }

    out
}

fn bucket_start(t: DateTime<Utc>, tf_minutes: i64) -> DateTime<Utc> {
    let total_min = t.hour() as i64 * 60 + t.minute() as i64;
    let offset_min = total_min % tf_minutes;
    let truncated = t
        .with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(t);
    truncated - Duration::minutes(offset_min)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn c(y: i32, mo: u32, d: u32, h: u32, mi: u32, o: f64, hi: f64, lo: f64, cl: f64) -> Candle {
        Candle {
            time: Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap(),
            open: o,
            high: hi,
            low: lo,
            close: cl,
            volume: Some(1.0),
        }
    }

    #[test]
    fn m5_is_identity() {
        let candles = vec![c(2024, 1, 1, 0, 0, 1.0, 1.1, 0.9, 1.05)];
        let out = resample(&candles, Timeframe::M5);
        assert_eq!(out, candles);
    }

    #[test]
    fn empty_series_resamples_to_empty() {
        assert!(resample(&[], Timeframe::H1).is_empty());
    }

    #[test]
    fn h1_buckets_twelve_5m_bars() {
        let mut candles = Vec::new();
        for i in 0..12 {
            candles.push(c(
                2024,
                1,
                1,
                0,
                (i * 5) as u32,
                1.0 + i as f64,
                1.5 + i as f64,
                0.5 + i as f64,
                1.2 + i as f64,
            ));
        }
        let out = resample(&candles, Timeframe::H1);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].open, candles[0].open);
        assert_eq!(out[0].close, candles[11].close);
        assert_eq!(out[0].high, candles.iter().map(|x| x.high).fold(f64::MIN, f64::max));
        assert_eq!(out[0].low, candles.iter().map(|x| x.low).fold(f64::MAX, f64::min));
    }

    #[test]
    fn incomplete_final_bucket_is_still_emitted() {
        let candles = vec![c(2024, 1, 1, 0, 0, 1.0, 1.1, 0.9, 1.0)];
        let out = resample(&candles, Timeframe::H1);
        assert_eq!(out.len(), 1);
    }

    proptest::proptest! {
        #[test]
        fn resample_never_increases_bar_count(n in 1usize..200) {
            let candles: Vec<Candle> = (0..n)
                .map(|i| c(2024, 1, 1, (i as u32 / 12) % 24, (i as u32 % 12) * 5, 1.0, 1.1, 0.9, 1.0))
                .collect();
            let out = resample(&candles, Timeframe::H1);
            prop_assert!(out.len() <= candles.len());
        }
    }
}
