use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use common::{Candle, Result, Timeframe};
use serde::{Deserialize, Serialize};

use crate::resample::resample;

const DEFAULT_MAX_LEN: usize = 5_000;

#[derive(Debug, Default, Clone)]
struct CacheStats {
    market_hit: u64,
    market_miss: u64,
    resample_hit: u64,
    resample_miss: u64,
}

#[derive(Debug, Clone)]
struct ResampleEntry {
    last_source_time: DateTime<Utc>,
    candles: Vec<Candle>,
}

#[derive(Default)]
struct Inner {
    series: HashMap<String, Vec<Candle>>,
    resampled: HashMap<(String, Timeframe), ResampleEntry>,
    stats: CacheStats,
}

/// Thread-safe, process-local store of per-symbol 5m candles plus a keyed
/// cache of resampled higher timeframes. A single mutex guards both maps so
/// an upsert and its resulting invalidation happen under one critical
/// section — readers never observe a partially-merged series or a stale
/// resample surviving past the upsert that should have invalidated it.
#[derive(Default)]
pub struct MarketDataCache {
    inner: Mutex<Inner>,
    max_len: usize,
}

impl MarketDataCache {
    pub fn new() -> Self {
        MarketDataCache {
            inner: Mutex::new(Inner::default()),
            max_len: DEFAULT_MAX_LEN,
        }
    }

    pub fn with_max_len(max_len: usize) -> Self {
        MarketDataCache {
            inner: Mutex::new(Inner::default()),
            max_len,
        }
    }

    /// Merge `candles` into `symbol`'s series by `time`, keep sorted,
    /// truncate to `max_len`. Invalidates all `(symbol, *)` resample
    /// entries if this upsert advances the last timestamp (including the
    /// "no previous series" case). Malformed candles are silently skipped.
    pub fn upsert(&self, symbol: &str, candles: &[Candle]) {
        if candles.is_empty() {
            return;
        }
        let mut guard = self.inner.lock().unwrap();

        let prev_last_ts = guard
            .series
            .get(symbol)
            .and_then(|s| s.last())
            .map(|c| c.time);

        let entry = guard.series.entry(symbol.to_string()).or_default();
        let mut by_time: HashMap<DateTime<Utc>, Candle> =
            entry.drain(..).map(|c| (c.time, c)).collect();

        for c in candles {
            if !c.is_valid() {
                continue;
            }
            by_time.insert(c.time, *c);
        }

        let mut merged: Vec<Candle> = by_time.into_values().collect();
        merged.sort_by_key(|c| c.time);
        if merged.len() > self.max_len {
            let drop = merged.len() - self.max_len;
            merged.drain(0..drop);
        }
        let new_last_ts = merged.last().map(|c| c.time);
        *entry = merged;

        let should_invalidate = match (prev_last_ts, new_last_ts) {
            (None, Some(_)) => true,
            (Some(prev), Some(new)) => new > prev,
            _ => false,
        };
        if should_invalidate {
            let keys: Vec<(String, Timeframe)> = guard
                .resampled
                .keys()
                .filter(|(s, _)| s == symbol)
                .cloned()
                .collect();
            for k in keys {
                guard.resampled.remove(&k);
            }
        }
    }

    pub fn get_candles(&self, symbol: &str) -> Vec<Candle> {
        let guard = self.inner.lock().unwrap();
        guard.series.get(symbol).cloned().unwrap_or_default()
    }

    pub fn get_candles_since(&self, symbol: &str, ts: DateTime<Utc>) -> Vec<Candle> {
        let guard = self.inner.lock().unwrap();
        guard
            .series
            .get(symbol)
            .map(|s| s.iter().filter(|c| c.time >= ts).copied().collect())
            .unwrap_or_default()
    }

    pub fn get_last_timestamp(&self, symbol: &str) -> Option<DateTime<Utc>> {
        let guard = self.inner.lock().unwrap();
        guard.series.get(symbol).and_then(|s| s.last()).map(|c| c.time)
    }

    pub fn get_all_symbols(&self) -> Vec<String> {
        let guard = self.inner.lock().unwrap();
        let mut symbols: Vec<String> = guard.series.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    /// Return the resampled series for `(symbol, tf)`. If the cached entry's
    /// `last_source_time` equals the current last 5m timestamp it is served
    /// without recomputation; otherwise it is rebuilt and replaces the
    /// cached entry.
    pub fn get_resampled(&self, symbol: &str, tf: Timeframe) -> Vec<Candle> {
        let mut guard = self.inner.lock().unwrap();
        let last_ts = guard.series.get(symbol).and_then(|s| s.last()).map(|c| c.time);

        if let Some(last_ts) = last_ts {
            let hit = guard
                .resampled
                .get(&(symbol.to_string(), tf))
                .filter(|entry| entry.last_source_time == last_ts)
                .map(|entry| entry.candles.clone());
            if let Some(candles) = hit {
                guard.stats.resample_hit += 1;
                guard.stats.market_hit += 1;
                return candles;
            }
        }

        guard.stats.resample_miss += 1;
        if last_ts.is_some() {
            guard.stats.market_hit += 1;
        } else {
            guard.stats.market_miss += 1;
        }

        let source = guard.series.get(symbol).cloned().unwrap_or_default();
        let computed = resample(&source, tf);

        if let Some(last_ts) = last_ts {
            guard.resampled.insert(
                (symbol.to_string(), tf),
                ResampleEntry {
                    last_source_time: last_ts,
                    candles: computed.clone(),
                },
            );
        }

        computed
    }

    pub fn stats(&self) -> (u64, u64, u64, u64) {
        let guard = self.inner.lock().unwrap();
        (
            guard.stats.market_hit,
            guard.stats.market_miss,
            guard.stats.resample_hit,
            guard.stats.resample_miss,
        )
    }

    /// Serialize the whole cache to `{version:1, symbols:{...}}` JSON and
    /// atomically replace `path` (write to a sibling temp file, then
    /// rename).
    pub fn save_snapshot(&self, path: &str) -> Result<()> {
        let snapshot = {
            let guard = self.inner.lock().unwrap();
            CacheSnapshot {
                version: 1,
                symbols: guard.series.clone(),
            }
        };
        let json = serde_json::to_string_pretty(&snapshot)?;

        if let Some(dir) = std::path::Path::new(path).parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let tmp_path = format!("{path}.tmp");
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }

    pub fn load_snapshot(&self, path: &str) -> Result<()> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let snapshot: CacheSnapshot = serde_json::from_str(&raw)?;
        let mut guard = self.inner.lock().unwrap();
        guard.series = snapshot.symbols;
        guard.resampled.clear();
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheSnapshot {
    version: u32,
    symbols: HashMap<String, Vec<Candle>>,
}
