use async_trait::async_trait;

use crate::{Candle, Result, Timeframe};

/// Market-data provider contract. Concrete integrations (Binance, a broker
/// feed, a CSV replay provider, …) are out of scope here — only the
/// contract matters to the core.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Fetch up to `limit` candles for `symbol` at `timeframe`. If
    /// `since_ts` is set, only candles at or after that time are requested.
    /// Idempotent: the same arguments return the same candles (modulo the
    /// forming bar). May return an error; callers retry per policy.
    async fn get_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
        since_ts: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<Vec<Candle>>;

    /// Human-readable identifier used in health snapshots and logs.
    fn name(&self) -> &str;
}

/// Notifier contract (consumed). Implementations must tolerate rate limits
/// and never panic on transient failures.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_message(&self, chat_id: i64, text: &str) -> bool;
    async fn send_photo(&self, chat_id: i64, caption: &str, bytes: Vec<u8>) -> bool;
}
