use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use common::{Provider, Timeframe};
use tracing::{debug, warn};

use crate::cache::MarketDataCache;

/// Tunables for one ingestor instance.
#[derive(Debug, Clone)]
pub struct IngestorConfig {
    pub poll_interval_sec: u64,
    pub warmup_count: usize,
    pub incremental_limit: usize,
    pub persist_path: String,
    pub persist_every_cycles: u64,
    /// Consecutive per-symbol primary failures before the fallback provider
    /// (if any) is used for that symbol's next cycle. Not specified
    /// numerically in the distilled spec; see DESIGN.md.
    pub fallback_after_failures: u32,
}

impl Default for IngestorConfig {
    fn default() -> Self {
        IngestorConfig {
            poll_interval_sec: 60,
            warmup_count: 1_000,
            incremental_limit: 20,
            persist_path: "state/market_cache.json".to_string(),
            persist_every_cycles: 10,
            fallback_after_failures: 3,
        }
    }
}

/// Periodically pulls candles for the configured symbol universe from a
/// `Provider`, merges them into a `MarketDataCache`, and persists the cache
/// to disk every N cycles. No exception propagates out of the loop: every
/// provider failure is caught, logged, and the cycle continues to the next
/// symbol.
pub struct DataIngestor {
    cache: Arc<MarketDataCache>,
    primary: Arc<dyn Provider>,
    fallback: Option<Arc<dyn Provider>>,
    symbols: Vec<String>,
    config: IngestorConfig,
    failure_counts: HashMap<String, u32>,
}

impl DataIngestor {
    pub fn new(
        cache: Arc<MarketDataCache>,
        primary: Arc<dyn Provider>,
        fallback: Option<Arc<dyn Provider>>,
        symbols: Vec<String>,
        config: IngestorConfig,
    ) -> Self {
        DataIngestor {
            cache,
            primary,
            fallback,
            symbols,
            config,
            failure_counts: HashMap::new(),
        }
    }

    /// Run forever. Intended to be spawned as a long-lived task; the caller
    /// drops the `JoinHandle` / aborts it to stop.
    pub async fn run(mut self) {
        let _ = self.cache.load_snapshot(&self.config.persist_path);

        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.poll_interval_sec));
        let mut cycle: u64 = 0;
        loop {
            ticker.tick().await;
            self.run_cycle().await;
            cycle += 1;
            if cycle % self.config.persist_every_cycles.max(1) == 0 {
                if let Err(e) = self.cache.save_snapshot(&self.config.persist_path) {
                    warn!(error = %e, "market cache persist failed");
                }
            }
        }
    }

    async fn run_cycle(&mut self) {
        for symbol in self.symbols.clone() {
            self.ingest_symbol(&symbol).await;
        }
    }

    async fn ingest_symbol(&mut self, symbol: &str) {
        let last_ts = self.cache.get_last_timestamp(symbol);
        let (limit, since_ts) = match last_ts {
            None => (self.config.warmup_count, None),
            Some(ts) => (self.config.incremental_limit, Some(ts)),
        };

        let failures = *self.failure_counts.get(symbol).unwrap_or(&0);
        let use_fallback = failures >= self.config.fallback_after_failures && self.fallback.is_some();
        let provider: &Arc<dyn Provider> = if use_fallback {
            self.fallback.as_ref().unwrap()
        } else {
            &self.primary
        };

        match provider.get_candles(symbol, Timeframe::M5, limit, since_ts).await {
            Ok(candles) => {
                self.failure_counts.insert(symbol.to_string(), 0);
                if candles.is_empty() {
                    debug!(symbol, "provider returned no candles");
                    return;
                }
                self.cache.upsert(symbol, &candles);
            }
            Err(e) => {
                let count = self.failure_counts.entry(symbol.to_string()).or_insert(0);
                *count += 1;
                warn!(symbol, provider = provider.name(), error = %e, failures = *count, "ingest failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use common::{Candle, Result};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyProvider {
        calls: AtomicUsize,
        fail_first_n: usize,
    }

    #[async_trait]
    impl Provider for FlakyProvider {
        async fn get_candles(
            &self,
            _symbol: &str,
            _tf: Timeframe,
            _limit: usize,
            _since: Option<chrono::DateTime<Utc>>,
        ) -> Result<Vec<Candle>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first_n {
                return Err(common::Error::Provider("boom".into()));
            }
            Ok(vec![Candle {
                time: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
                open: 1.0,
                high: 1.1,
                low: 0.9,
                close: 1.0,
                volume: None,
            }])
        }

        fn name(&self) -> &str {
            "flaky"
        }
    }

    #[tokio::test]
    async fn failed_symbol_does_not_abort_cycle() {
        let cache = Arc::new(MarketDataCache::new());
        let provider = Arc::new(FlakyProvider {
            calls: AtomicUsize::new(0),
            fail_first_n: 100,
        });
        let mut ingestor = DataIngestor::new(
            cache.clone(),
            provider,
            None,
            vec!["EURUSD".to_string(), "XAUUSD".to_string()],
            IngestorConfig::default(),
        );
        ingestor.run_cycle().await;
        assert!(cache.get_candles("EURUSD").is_empty());
        assert!(cache.get_candles("XAUUSD").is_empty());
    }

    #[tokio::test]
    async fn recovers_and_upserts_once_provider_succeeds() {
        let cache = Arc::new(MarketDataCache::new());
        let provider = Arc::new(FlakyProvider {
            calls: AtomicUsize::new(0),
            fail_first_n: 0,
        });
        let mut ingestor = DataIngestor::new(
            cache.clone(),
            provider,
            None,
            vec!["EURUSD".to_string()],
            IngestorConfig::default(),
        );
        ingestor.run_cycle().await;
        assert_eq!(cache.get_candles("EURUSD").len(), 1);
    }
}
