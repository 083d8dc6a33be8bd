use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use common::{Result, SentRecord, Side, Timeframe};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

const SCHEMA: u32 = 2;

/// Compute `key = SHA1(symbol|tf|strategy_id|direction)`, all fields
/// upper-cased and pipe-joined, per the spec's explicit hashing invariant.
/// `strategy_id` defaults to `"legacy"` when blank.
pub fn make_key(symbol: &str, tf: Timeframe, strategy_id: &str, direction: Side) -> String {
    let sid = normalize_strategy_id(strategy_id);
    let raw = format!(
        "{}|{}|{}|{}",
        symbol.to_uppercase(),
        tf.as_str(),
        sid,
        direction.as_str()
    );
    let mut hasher = Sha1::new();
    hasher.update(raw.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn make_daily_bucket(symbol: &str, tf: Timeframe, strategy_id: &str) -> String {
    let sid = normalize_strategy_id(strategy_id);
    format!("{}|{}|{}", symbol.to_uppercase(), tf.as_str(), sid)
}

fn normalize_strategy_id(strategy_id: &str) -> String {
    let trimmed = strategy_id.trim();
    if trimmed.is_empty() {
        "legacy".to_string()
    } else {
        trimmed.to_string()
    }
}

#[derive(Debug, Default)]
struct Inner {
    sent: HashMap<String, SentRecord>,
    daily: HashMap<String, HashMap<String, i64>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OnDisk {
    schema: u32,
    sent: HashMap<String, SentRecordOnDisk>,
    daily: HashMap<String, HashMap<String, i64>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SentRecordOnDisk {
    ts: f64,
    symbol: String,
    direction: String,
    timeframe: String,
    strategy_id: String,
}

/// Durable cooldown + daily-count state. A single mutex guards both maps;
/// persistence is a separate atomic write (temp file + rename + fsync)
/// taken outside the lock once the in-memory state has been copied out.
pub struct SignalStateStore {
    inner: Mutex<Inner>,
    path: String,
}

impl SignalStateStore {
    pub fn new(path: impl Into<String>) -> Self {
        SignalStateStore {
            inner: Mutex::new(Inner::default()),
            path: path.into(),
        }
    }

    /// Load from disk. Missing file -> empty state. Malformed file -> empty
    /// state (never panics on a corrupt store).
    pub fn load(&self) {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(_) => return,
        };
        let parsed: OnDisk = match serde_json::from_str(&raw) {
            Ok(p) => p,
            Err(_) => return,
        };

        let mut sent = HashMap::new();
        for (k, v) in parsed.sent {
            let direction = match v.direction.to_uppercase().as_str() {
                "SELL" => Side::Sell,
                _ => Side::Buy,
            };
            let timeframe = Timeframe::parse(&v.timeframe).unwrap_or(Timeframe::M15);
            sent.insert(
                k,
                SentRecord {
                    ts: v.ts,
                    symbol: v.symbol.to_uppercase(),
                    direction,
                    timeframe,
                    strategy_id: normalize_strategy_id(&v.strategy_id),
                },
            );
        }

        let mut guard = self.inner.lock().unwrap();
        guard.sent = sent;
        guard.daily = parsed.daily;
    }

    pub fn record_sent(
        &self,
        key: &str,
        ts: f64,
        symbol: &str,
        direction: Side,
        timeframe: Timeframe,
        strategy_id: &str,
    ) {
        let mut guard = self.inner.lock().unwrap();
        guard.sent.insert(
            key.to_string(),
            SentRecord {
                ts,
                symbol: symbol.to_uppercase(),
                direction,
                timeframe,
                strategy_id: normalize_strategy_id(strategy_id),
            },
        );
    }

    /// `cooldown_minutes <= 0` disables cooldown (always sendable).
    pub fn can_send(&self, key: &str, now: f64, cooldown_minutes: i64) -> bool {
        if cooldown_minutes <= 0 {
            return true;
        }
        let guard = self.inner.lock().unwrap();
        match guard.sent.get(key) {
            None => true,
            Some(rec) => (now - rec.ts) >= (cooldown_minutes as f64) * 60.0,
        }
    }

    pub fn increment_daily(&self, bucket: &str, date: &str) -> i64 {
        let mut guard = self.inner.lock().unwrap();
        let by_date = guard.daily.entry(bucket.to_string()).or_default();
        let count = by_date.entry(date.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn get_daily_count(&self, bucket: &str, date: &str) -> i64 {
        let guard = self.inner.lock().unwrap();
        guard
            .daily
            .get(bucket)
            .and_then(|by_date| by_date.get(date))
            .copied()
            .unwrap_or(0)
    }

    /// Remove sent records older than `older_than_days` and daily date-keys
    /// older than the equivalent cutoff date. Returns `(pruned_sent,
    /// pruned_daily_entries)`.
    pub fn prune(&self, older_than_days: i64, now_ts: f64) -> (usize, usize) {
        if older_than_days <= 0 {
            return (0, 0);
        }
        let cutoff_ts = now_ts - (older_than_days as f64) * 86_400.0;
        let now_dt = DateTime::<Utc>::from_timestamp(now_ts as i64, 0).unwrap_or_else(Utc::now);
        let cutoff_date = now_dt.date_naive() - Duration::days(older_than_days);

        let mut guard = self.inner.lock().unwrap();

        let mut pruned_sent = 0;
        guard.sent.retain(|_, rec| {
            let keep = rec.ts >= cutoff_ts;
            if !keep {
                pruned_sent += 1;
            }
            keep
        });

        let mut pruned_daily = 0;
        guard.daily.retain(|_, by_date| {
            by_date.retain(|date_key, _| {
                let keep = match NaiveDate::parse_from_str(date_key, "%Y-%m-%d") {
                    Ok(d) => d >= cutoff_date,
                    Err(_) => true,
                };
                if !keep {
                    pruned_daily += 1;
                }
                keep
            });
            !by_date.is_empty()
        });

        (pruned_sent, pruned_daily)
    }

    pub fn snapshot_counts(&self) -> (usize, usize, usize) {
        let guard = self.inner.lock().unwrap();
        let daily_entries: usize = guard.daily.values().map(|v| v.len()).sum();
        (guard.sent.len(), guard.daily.len(), daily_entries)
    }

    pub fn get_sent_record(&self, key: &str) -> Option<SentRecord> {
        let guard = self.inner.lock().unwrap();
        guard.sent.get(key).cloned()
    }

    /// Atomic JSON save: write temp then rename, with an fsync of the temp
    /// file beforehand so a crash between write and rename never leaves a
    /// torn file visible at `path`.
    pub fn save_atomic(&self) -> Result<()> {
        let doc = {
            let guard = self.inner.lock().unwrap();
            OnDisk {
                schema: SCHEMA,
                sent: guard
                    .sent
                    .iter()
                    .map(|(k, v)| {
                        (
                            k.clone(),
                            SentRecordOnDisk {
                                ts: v.ts,
                                symbol: v.symbol.clone(),
                                direction: v.direction.as_str().to_string(),
                                timeframe: v.timeframe.as_str().to_string(),
                                strategy_id: v.strategy_id.clone(),
                            },
                        )
                    })
                    .collect(),
                daily: guard.daily.clone(),
            }
        };

        if let Some(dir) = std::path::Path::new(&self.path).parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }

        let json = serde_json::to_string_pretty(&doc)?;
        let tmp_path = format!("{}.tmp", self.path);
        {
            use std::io::Write;
            let mut f = std::fs::File::create(&tmp_path)?;
            f.write_all(json.as_bytes())?;
            f.flush()?;
            f.sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cooldown_blocks_resend_until_elapsed() {
        let store = SignalStateStore::new("/tmp/unused_state_store_test.json");
        let key = make_key("EURUSD", Timeframe::M15, "s1", Side::Buy);
        store.record_sent(key.as_str(), 1_000.0, "EURUSD", Side::Buy, Timeframe::M15, "s1");

        assert!(!store.can_send(&key, 1_000.0 + 59.0 * 60.0, 60));
        assert!(store.can_send(&key, 1_000.0 + 60.0 * 60.0, 60));
    }

    #[test]
    fn zero_cooldown_always_allows() {
        let store = SignalStateStore::new("/tmp/unused_state_store_test2.json");
        let key = make_key("EURUSD", Timeframe::M15, "s1", Side::Buy);
        store.record_sent(key.as_str(), 1_000.0, "EURUSD", Side::Buy, Timeframe::M15, "s1");
        assert!(store.can_send(&key, 1_000.1, 0));
    }

    #[test]
    fn daily_count_increments_exactly_k_times() {
        let store = SignalStateStore::new("/tmp/unused_state_store_test3.json");
        let bucket = make_daily_bucket("EURUSD", Timeframe::M15, "s1");
        for _ in 0..5 {
            store.increment_daily(&bucket, "2026-01-01");
        }
        assert_eq!(store.get_daily_count(&bucket, "2026-01-01"), 5);
    }

    #[test]
    fn prune_removes_only_old_entries() {
        let store = SignalStateStore::new("/tmp/unused_state_store_test4.json");
        let key_old = make_key("EURUSD", Timeframe::M15, "s1", Side::Buy);
        let key_new = make_key("XAUUSD", Timeframe::M15, "s1", Side::Buy);
        let now = 20_000_000.0;
        store.record_sent(&key_old, now - 20.0 * 86_400.0, "EURUSD", Side::Buy, Timeframe::M15, "s1");
        store.record_sent(&key_new, now - 1.0 * 86_400.0, "XAUUSD", Side::Buy, Timeframe::M15, "s1");

        let (pruned_sent, _) = store.prune(14, now);
        assert_eq!(pruned_sent, 1);
        assert!(store.get_sent_record(&key_old).is_none());
        assert!(store.get_sent_record(&key_new).is_some());
    }

    #[test]
    fn save_and_load_round_trips_snapshot_counts() {
        let path = std::env::temp_dir().join(format!(
            "signal_state_{}.json",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        let path_str = path.to_str().unwrap().to_string();

        let store = SignalStateStore::new(&path_str);
        let key = make_key("EURUSD", Timeframe::M15, "s1", Side::Buy);
        store.record_sent(&key, 1_000.0, "EURUSD", Side::Buy, Timeframe::M15, "s1");
        store.increment_daily("EURUSD|M15|s1", "2026-01-01");
        store.save_atomic().unwrap();

        let reloaded = SignalStateStore::new(&path_str);
        reloaded.load();
        assert_eq!(reloaded.snapshot_counts(), store.snapshot_counts());

        std::fs::remove_file(&path_str).ok();
    }
}
