use std::sync::Arc;
use std::time::Duration;

use common::{Notifier, NotifyMode, Result};
use queue::EventQueue;
use tracing::{info, warn};

use crate::formatter::format_signal_message;

/// Long-lived claim-format-dispatch loop, grounded on
/// `crates/telegram/src/commands.rs::send_alert`'s tolerant multi-chat-id
/// broadcast, generalized into a queue-backed worker per spec.md §4.10.
pub struct NotificationWorker<N: Notifier> {
    queue: Arc<EventQueue>,
    notifier: N,
    mode: NotifyMode,
    batch_size: i64,
    lock_seconds: i64,
    cooldown_s: i64,
}

/// `min(60 * 2^attempts, 3600)`, matching spec.md §4.10's retry policy.
pub fn backoff_seconds(attempts: i64) -> i64 {
    let attempts = attempts.max(0).min(10); // 2^10 already saturates past the 3600 cap
    let raw = 60i64.saturating_mul(1i64 << attempts);
    raw.min(3600)
}

impl<N: Notifier> NotificationWorker<N> {
    pub fn new(queue: Arc<EventQueue>, notifier: N, mode: NotifyMode, cooldown_s: i64) -> Self {
        NotificationWorker {
            queue,
            notifier,
            mode,
            batch_size: 50,
            lock_seconds: 60,
            cooldown_s,
        }
    }

    pub fn with_batch_size(mut self, n: i64) -> Self {
        self.batch_size = n;
        self
    }

    /// Runs the claim loop forever at `poll_interval`, stopping when
    /// `shutdown` resolves.
    pub async fn run(&self, poll_interval: Duration, mut shutdown: tokio::sync::oneshot::Receiver<()>) {
        let mut tick = tokio::time::interval(poll_interval);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = self.run_once().await {
                        warn!(error = %e, "notification worker cycle failed");
                    }
                }
                _ = &mut shutdown => {
                    info!("notification worker shutting down");
                    break;
                }
            }
        }
    }

    /// Claims one batch and dispatches every event to every Telegram-linked
    /// user, honoring per-(user, setup_key) cooldowns. Returns the number
    /// of events processed (not necessarily delivered — NONE-ish or
    /// cooldown-suppressed deliveries still count as processed).
    pub async fn run_once(&self) -> Result<usize> {
        if self.mode == NotifyMode::Off {
            return Ok(0);
        }

        let events = self.queue.claim(self.batch_size, self.lock_seconds).await?;
        if events.is_empty() {
            return Ok(0);
        }

        let users = self.queue.enabled_telegram_users().await?;
        let now = now_unix();

        for event in &events {
            let text = format_signal_message(&event.payload, self.mode);
            let mut any_failure = false;

            for (user_id, chat_id) in &users {
                if self.queue.delivery_recent(user_id, &event.setup_key, now).await? {
                    continue;
                }

                let sent = self.notifier.send_message(*chat_id, &text).await;
                if sent {
                    self.queue
                        .record_delivery(user_id, &event.setup_key, now, self.cooldown_s)
                        .await?;
                } else {
                    any_failure = true;
                    warn!(user_id = %user_id, event_id = %event.id, "telegram dispatch failed");
                }
            }

            if any_failure {
                let retry_after = backoff_seconds(event.attempts);
                self.queue.mark_failed(&event.id, retry_after).await?;
            } else {
                self.queue.mark_done(&event.id).await?;
            }
        }

        Ok(events.len())
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
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[test]
    fn backoff_grows_then_saturates() {
        assert_eq!(backoff_seconds(0), 60);
        assert_eq!(backoff_seconds(1), 120);
        assert_eq!(backoff_seconds(2), 240);
        assert_eq!(backoff_seconds(6), 3600);
        assert_eq!(backoff_seconds(20), 3600);
    }

    struct RecordingNotifier {
        sent: Mutex<Vec<(i64, String)>>,
        fail_next: AtomicUsize,
    }

    impl RecordingNotifier {
        fn new() -> Self {
            RecordingNotifier { sent: Mutex::new(Vec::new()), fail_next: AtomicUsize::new(0) }
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send_message(&self, chat_id: i64, text: &str) -> bool {
            if self.fail_next.load(Ordering::SeqCst) > 0 {
                self.fail_next.fetch_sub(1, Ordering::SeqCst);
                return false;
            }
            self.sent.lock().unwrap().push((chat_id, text.to_string()));
            true
        }

        async fn send_photo(&self, _chat_id: i64, _caption: &str, _bytes: Vec<u8>) -> bool {
            true
        }
    }

    async fn fresh_queue() -> Arc<EventQueue> {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        let q = EventQueue::new(pool);
        q.migrate().await.unwrap();
        Arc::new(q)
    }

    #[tokio::test]
    async fn delivers_to_all_linked_users_and_marks_done() {
        let queue = fresh_queue().await;
        queue.link_telegram("user1", 111, 0).await.unwrap();
        queue.link_telegram("user2", 222, 0).await.unwrap();
        queue
            .enqueue("EURUSD", "M15", "BUY_SETUP", "setup-1", &serde_json::json!({"status": "OK", "summary": "go"}))
            .await
            .unwrap();

        let notifier = RecordingNotifier::new();
        let worker = NotificationWorker::new(queue.clone(), notifier, NotifyMode::All, 1800);
        let processed = worker.run_once().await.unwrap();
        assert_eq!(processed, 1);
        assert_eq!(worker.notifier.sent.lock().unwrap().len(), 2);

        let stats = queue.queue_stats().await.unwrap();
        assert_eq!(stats.get("DONE"), Some(&1));
    }

    #[tokio::test]
    async fn off_mode_never_claims() {
        let queue = fresh_queue().await;
        queue.link_telegram("user1", 111, 0).await.unwrap();
        queue.enqueue("EURUSD", "M15", "BUY_SETUP", "setup-1", &serde_json::json!({})).await.unwrap();

        let worker = NotificationWorker::new(queue.clone(), RecordingNotifier::new(), NotifyMode::Off, 1800);
        let processed = worker.run_once().await.unwrap();
        assert_eq!(processed, 0);

        let stats = queue.queue_stats().await.unwrap();
        assert_eq!(stats.get("NEW"), Some(&1));
    }

    #[tokio::test]
    async fn send_failure_marks_event_failed_for_retry() {
        let queue = fresh_queue().await;
        queue.link_telegram("user1", 111, 0).await.unwrap();
        queue.enqueue("EURUSD", "M15", "BUY_SETUP", "setup-1", &serde_json::json!({})).await.unwrap();

        let notifier = RecordingNotifier::new();
        notifier.fail_next.store(1, Ordering::SeqCst);
        let worker = NotificationWorker::new(queue.clone(), notifier, NotifyMode::All, 1800);
        worker.run_once().await.unwrap();

        let stats = queue.queue_stats().await.unwrap();
        assert_eq!(stats.get("FAILED"), Some(&1));
    }
}
