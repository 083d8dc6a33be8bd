use common::{QueueEvent, QueueStatus, Result};
use sqlx::{Row, SqlitePool};

/// Durable FIFO over SQLite/WAL backing three tables: `queue_events` (the
/// notification FIFO), `telegram_deliveries` (per-user dedupe/cooldown
/// ledger), `connect_tokens` (one-time Telegram account-linking tokens).
/// Grounded on `original_source/core/event_queue.py`'s schema and
/// operation set; uses runtime-checked `sqlx::query`/`query_as` rather than
/// the compile-time `query!`/`query_as!` macros since this workspace ships
/// no `.sqlx` query cache or migration history for the macro to check
/// against.
pub struct EventQueue {
    pool: SqlitePool,
}

impl EventQueue {
    pub fn new(pool: SqlitePool) -> Self {
        EventQueue { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::query("PRAGMA journal_mode=WAL").execute(&self.pool).await?;
        sqlx::query("PRAGMA busy_timeout=30000").execute(&self.pool).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS queue_events (
                id TEXT PRIMARY KEY,
                created_ts INTEGER NOT NULL,
                symbol TEXT NOT NULL,
                tf TEXT NOT NULL,
                setup_type TEXT NOT NULL,
                setup_key TEXT NOT NULL,
                payload_json TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'NEW',
                attempts INTEGER NOT NULL DEFAULT 0,
                next_attempt_ts INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS telegram_deliveries (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                setup_key TEXT NOT NULL,
                sent_ts INTEGER NOT NULL,
                cooldown_until_ts INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS connect_tokens (
                token TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                expires_ts INTEGER NOT NULL,
                used_ts INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Not named in the reference schema, but required to act on a
        // validated connect_tokens row: the chat_id a /connect command
        // arrived from has to live somewhere before NotificationWorker can
        // address that user on Telegram.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS telegram_links (
                user_id TEXT PRIMARY KEY,
                chat_id INTEGER NOT NULL,
                linked_ts INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        for idx in [
            "CREATE INDEX IF NOT EXISTS idx_queue_status_next ON queue_events(status, next_attempt_ts)",
            "CREATE INDEX IF NOT EXISTS idx_delivery_user_setup ON telegram_deliveries(user_id, setup_key)",
            "CREATE INDEX IF NOT EXISTS idx_delivery_cooldown ON telegram_deliveries(cooldown_until_ts)",
            "CREATE INDEX IF NOT EXISTS idx_connect_expires ON connect_tokens(expires_ts)",
        ] {
            sqlx::query(idx).execute(&self.pool).await?;
        }

        Ok(())
    }

    /// Enqueues a new NEW event. Secrets never reach storage: any payload
    /// key containing `token` or `secret` (case-insensitive) is stripped
    /// before serialization, matching the reference queue's sanitization.
    pub async fn enqueue(
        &self,
        symbol: &str,
        tf: &str,
        setup_type: &str,
        setup_key: &str,
        payload: &serde_json::Value,
    ) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = now_unix();
        let safe_payload = strip_secrets(payload);
        let payload_json = serde_json::to_string(&safe_payload)?;

        sqlx::query(
            r#"
            INSERT INTO queue_events (id, created_ts, symbol, tf, setup_type, setup_key, payload_json, status, attempts, next_attempt_ts)
            VALUES (?, ?, ?, ?, ?, ?, ?, 'NEW', 0, 0)
            "#,
        )
        .bind(&id)
        .bind(now)
        .bind(symbol.to_uppercase())
        .bind(tf.to_uppercase())
        .bind(setup_type)
        .bind(setup_key)
        .bind(payload_json)
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    /// Atomically claims up to `limit` NEW-or-ready-FAILED rows: select,
    /// then bulk-update in the same connection so two workers never claim
    /// the same row (SQLite serializes writers; WAL lets readers proceed
    /// concurrently).
    pub async fn claim(&self, limit: i64, lock_seconds: i64) -> Result<Vec<QueueEvent>> {
        let now = now_unix();
        let unlock_ts = now + lock_seconds;

        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(
            r#"
            SELECT id, created_ts, symbol, tf, setup_type, setup_key, payload_json, status, attempts, next_attempt_ts
            FROM queue_events
            WHERE (status = 'NEW' OR (status = 'FAILED' AND next_attempt_ts <= ?))
            ORDER BY created_ts ASC
            LIMIT ?
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        let mut events = Vec::with_capacity(rows.len());
        let mut ids = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: String = row.try_get("id")?;
            let payload_json: String = row.try_get("payload_json")?;
            let payload = serde_json::from_str(&payload_json).unwrap_or(serde_json::Value::Null);
            let status_str: String = row.try_get("status")?;
            events.push(QueueEvent {
                id: id.clone(),
                created_ts: row.try_get::<i64, _>("created_ts")? as f64,
                symbol: row.try_get("symbol")?,
                tf: row.try_get("tf")?,
                setup_type: row.try_get("setup_type")?,
                setup_key: row.try_get("setup_key")?,
                payload,
                status: parse_status(&status_str),
                attempts: row.try_get("attempts")?,
                next_attempt_ts: row.try_get::<i64, _>("next_attempt_ts")? as f64,
            });
            ids.push(id);
        }

        for id in &ids {
            sqlx::query(
                "UPDATE queue_events SET status='PROCESSING', attempts=attempts+1, next_attempt_ts=? WHERE id=?",
            )
            .bind(unlock_ts)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(events)
    }

    pub async fn mark_done(&self, event_id: &str) -> Result<()> {
        sqlx::query("UPDATE queue_events SET status='DONE' WHERE id=?")
            .bind(event_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_failed(&self, event_id: &str, retry_after_s: i64) -> Result<()> {
        let next_ts = now_unix() + retry_after_s;
        sqlx::query("UPDATE queue_events SET status='FAILED', next_attempt_ts=? WHERE id=?")
            .bind(next_ts)
            .bind(event_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn queue_stats(&self) -> Result<std::collections::HashMap<String, i64>> {
        let rows = sqlx::query("SELECT status, COUNT(*) as cnt FROM queue_events GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        let mut stats = std::collections::HashMap::new();
        for row in rows {
            let status: String = row.try_get("status")?;
            let cnt: i64 = row.try_get("cnt")?;
            stats.insert(status, cnt);
        }
        Ok(stats)
    }

    /// True if `(user_id, setup_key)` was delivered within its cooldown
    /// window as of `now`.
    pub async fn delivery_recent(&self, user_id: &str, setup_key: &str, now: i64) -> Result<bool> {
        let row = sqlx::query(
            "SELECT cooldown_until_ts FROM telegram_deliveries WHERE user_id=? AND setup_key=? ORDER BY sent_ts DESC LIMIT 1",
        )
        .bind(user_id)
        .bind(setup_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some(row) => {
                let cooldown_until: i64 = row.try_get("cooldown_until_ts")?;
                cooldown_until > now
            }
            None => false,
        })
    }

    pub async fn record_delivery(&self, user_id: &str, setup_key: &str, now: i64, cooldown_s: i64) -> Result<()> {
        let id = uuid::Uuid::new_v4().to_string();
        let cooldown_until = now + cooldown_s;
        sqlx::query(
            "INSERT INTO telegram_deliveries (id, user_id, setup_key, sent_ts, cooldown_until_ts) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(user_id)
        .bind(setup_key)
        .bind(now)
        .bind(cooldown_until)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn cleanup_old_deliveries(&self, older_than_days: i64, now: i64) -> Result<u64> {
        let cutoff = now - older_than_days * 86_400;
        let result = sqlx::query("DELETE FROM telegram_deliveries WHERE sent_ts < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Creates a one-time Telegram account-linking token. The token itself
    /// never appears in `queue_events` payloads (see `strip_secrets`) —
    /// this table is its only home.
    pub async fn create_connect_token(&self, user_id: &str, expires_in_s: i64, now: i64) -> Result<String> {
        let token = uuid::Uuid::new_v4().simple().to_string()[..24].to_string();
        let expires_ts = now + expires_in_s;
        sqlx::query("INSERT INTO connect_tokens (token, user_id, expires_ts, used_ts) VALUES (?, ?, ?, NULL)")
            .bind(&token)
            .bind(user_id)
            .bind(expires_ts)
            .execute(&self.pool)
            .await?;
        Ok(token)
    }

    /// Validates and single-use-consumes a connect token, returning the
    /// linked user id. A token already used or past `expires_ts` is
    /// rejected without mutation.
    pub async fn validate_connect_token(&self, token: &str, now: i64) -> Result<Option<String>> {
        let row = sqlx::query("SELECT user_id, expires_ts, used_ts FROM connect_tokens WHERE token=?")
            .bind(token)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else { return Ok(None) };
        let used_ts: Option<i64> = row.try_get("used_ts")?;
        if used_ts.is_some() {
            return Ok(None);
        }
        let expires_ts: i64 = row.try_get("expires_ts")?;
        if expires_ts < now {
            return Ok(None);
        }
        let user_id: String = row.try_get("user_id")?;

        sqlx::query("UPDATE connect_tokens SET used_ts=? WHERE token=?")
            .bind(now)
            .bind(token)
            .execute(&self.pool)
            .await?;

        Ok(Some(user_id))
    }

    pub async fn cleanup_old_tokens(&self, older_than_days: i64, now: i64) -> Result<u64> {
        let cutoff = now - older_than_days * 86_400;
        let result = sqlx::query("DELETE FROM connect_tokens WHERE expires_ts < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Records (or replaces) the Telegram chat a user is reachable at,
    /// called once a connect token resolves successfully.
    pub async fn link_telegram(&self, user_id: &str, chat_id: i64, now: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO telegram_links (user_id, chat_id, linked_ts) VALUES (?, ?, ?)
             ON CONFLICT(user_id) DO UPDATE SET chat_id=excluded.chat_id, linked_ts=excluded.linked_ts",
        )
        .bind(user_id)
        .bind(chat_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn telegram_chat_id(&self, user_id: &str) -> Result<Option<i64>> {
        let row = sqlx::query("SELECT chat_id FROM telegram_links WHERE user_id=?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(row) => Some(row.try_get("chat_id")?),
            None => None,
        })
    }

    /// All `(user_id, chat_id)` pairs with Telegram enabled, for
    /// NotificationWorker's per-event fan-out.
    pub async fn enabled_telegram_users(&self) -> Result<Vec<(String, i64)>> {
        let rows = sqlx::query("SELECT user_id, chat_id FROM telegram_links")
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push((row.try_get("user_id")?, row.try_get("chat_id")?));
        }
        Ok(out)
    }
}

fn parse_status(s: &str) -> QueueStatus {
    match s {
        "PROCESSING" => QueueStatus::Processing,
        "DONE" => QueueStatus::Done,
        "FAILED" => QueueStatus::Failed,
        _ => QueueStatus::New,
    }
}

fn strip_secrets(payload: &serde_json::Value) -> serde_json::Value {
    match payload {
        serde_json::Value::Object(map) => {
            let filtered: serde_json::Map<String, serde_json::Value> = map
                .iter()
                .filter(|(k, _)| {
                    let lower = k.to_lowercase();
                    !lower.contains("token") && !lower.contains("secret")
                })
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            serde_json::Value::Object(filtered)
        }
        other => other.clone(),
    }
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_queue() -> EventQueue {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let queue = EventQueue::new(pool);
        queue.migrate().await.unwrap();
        queue
    }

    #[tokio::test]
    async fn enqueue_then_claim_marks_processing() {
        let queue = test_queue().await;
        let id = queue
            .enqueue("EURUSD", "M15", "BUY_SETUP", "k1", &serde_json::json!({"rr": 2.0}))
            .await
            .unwrap();

        let claimed = queue.claim(10, 60).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, id);
        assert_eq!(claimed[0].attempts, 1);

        let again = queue.claim(10, 60).await.unwrap();
        assert!(again.is_empty(), "PROCESSING rows must not be re-claimed");
    }

    #[tokio::test]
    async fn secrets_are_stripped_from_payload() {
        let queue = test_queue().await;
        queue
            .enqueue(
                "EURUSD",
                "M15",
                "BUY_SETUP",
                "k1",
                &serde_json::json!({"rr": 2.0, "connect_token": "abc123", "api_secret": "xyz"}),
            )
            .await
            .unwrap();

        let claimed = queue.claim(10, 60).await.unwrap();
        let payload = &claimed[0].payload;
        assert!(payload.get("connect_token").is_none());
        assert!(payload.get("api_secret").is_none());
        assert!(payload.get("rr").is_some());
    }

    #[tokio::test]
    async fn mark_done_then_mark_failed_updates_status() {
        let queue = test_queue().await;
        let id = queue.enqueue("EURUSD", "M15", "BUY_SETUP", "k1", &serde_json::json!({})).await.unwrap();
        queue.claim(10, 60).await.unwrap();
        queue.mark_done(&id).await.unwrap();

        let stats = queue.queue_stats().await.unwrap();
        assert_eq!(stats.get("DONE"), Some(&1));
    }

    #[tokio::test]
    async fn failed_event_is_reclaimed_after_retry_window() {
        let queue = test_queue().await;
        let id = queue.enqueue("EURUSD", "M15", "BUY_SETUP", "k1", &serde_json::json!({})).await.unwrap();
        queue.claim(10, 60).await.unwrap();
        queue.mark_failed(&id, -1).await.unwrap(); // already past due

        let reclaimed = queue.claim(10, 60).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].attempts, 2);
    }

    #[tokio::test]
    async fn delivery_recent_respects_cooldown() {
        let queue = test_queue().await;
        let now = 1_000_000;
        queue.record_delivery("user1", "k1", now, 1800).await.unwrap();

        assert!(queue.delivery_recent("user1", "k1", now + 100).await.unwrap());
        assert!(!queue.delivery_recent("user1", "k1", now + 2000).await.unwrap());
    }

    #[tokio::test]
    async fn connect_token_is_single_use() {
        let queue = test_queue().await;
        let now = 1_000_000;
        let token = queue.create_connect_token("user1", 1800, now).await.unwrap();

        let resolved = queue.validate_connect_token(&token, now + 10).await.unwrap();
        assert_eq!(resolved.as_deref(), Some("user1"));

        let reused = queue.validate_connect_token(&token, now + 20).await.unwrap();
        assert!(reused.is_none());
    }

    #[tokio::test]
    async fn expired_connect_token_is_rejected() {
        let queue = test_queue().await;
        let now = 1_000_000;
        let token = queue.create_connect_token("user1", 10, now).await.unwrap();

        let resolved = queue.validate_connect_token(&token, now + 100).await.unwrap();
        assert!(resolved.is_none());
    }

    #[tokio::test]
    async fn link_telegram_is_upsert_and_enumerable() {
        let queue = test_queue().await;
        queue.link_telegram("user1", 111, 1_000_000).await.unwrap();
        queue.link_telegram("user1", 222, 1_000_100).await.unwrap();

        assert_eq!(queue.telegram_chat_id("user1").await.unwrap(), Some(222));

        let all = queue.enabled_telegram_users().await.unwrap();
        assert_eq!(all, vec![("user1".to_string(), 222)]);
    }
}
