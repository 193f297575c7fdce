//! Durable notification outbox.
//!
//! Registration and password-reset requests append a `queued` event to
//! `outbox.jsonl` and return once it is fsync'd. A background worker drains
//! due entries through the [`Notifier`], journaling `delivered`, `attempted`
//! (with the next retry time) or `abandoned` for each. Failed sends back off
//! exponentially with jitter until `max_attempts` is reached.
//!
//! Delivery is at-least-once: if the process dies between a successful send
//! and the `delivered` event reaching disk, the message is sent again after
//! restart.

use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{EmailMessage, Notifier};
use crate::journal::{Journal, JournalError};

/// Journals shorter than this are never compacted.
const COMPACT_MIN_ENTRIES: usize = 64;

#[derive(Clone, Copy, Debug)]
pub struct OutboxConfig {
    pub poll_interval: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub send_timeout: Duration,
}

impl Default for OutboxConfig {
    /// 5s poll, 5 attempts, 5s->5m backoff, 10s per send.
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            max_attempts: 5,
            backoff_base: Duration::from_secs(5),
            backoff_max: Duration::from_secs(300),
            send_timeout: Duration::from_secs(10),
        }
    }
}

impl OutboxConfig {
    #[must_use]
    pub fn normalize(self) -> Self {
        let non_zero = |d: Duration| {
            if d.is_zero() {
                Duration::from_secs(1)
            } else {
                d
            }
        };
        let backoff_base = non_zero(self.backoff_base);
        Self {
            poll_interval: non_zero(self.poll_interval),
            max_attempts: self.max_attempts.max(1),
            backoff_base,
            backoff_max: self.backoff_max.max(backoff_base),
            send_timeout: non_zero(self.send_timeout),
        }
    }
}

#[derive(Debug, Error)]
pub enum OutboxError {
    #[error(transparent)]
    Journal(#[from] JournalError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: Uuid,
    pub message: EmailMessage,
    pub attempts: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub next_attempt_at: OffsetDateTime,
    pub last_error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum OutboxEvent {
    Queued(OutboxEntry),
    Attempted {
        id: Uuid,
        attempts: u32,
        #[serde(with = "time::serde::rfc3339")]
        next_attempt_at: OffsetDateTime,
        last_error: String,
    },
    Delivered {
        id: Uuid,
    },
    Abandoned {
        id: Uuid,
        attempts: u32,
        last_error: String,
    },
}

struct OutboxState {
    pending: HashMap<Uuid, OutboxEntry>,
    journal: Journal,
}

impl OutboxState {
    fn apply(&mut self, event: OutboxEvent) {
        match event {
            OutboxEvent::Queued(entry) => {
                self.pending.insert(entry.id, entry);
            }
            OutboxEvent::Attempted {
                id,
                attempts,
                next_attempt_at,
                last_error,
            } => {
                if let Some(entry) = self.pending.get_mut(&id) {
                    entry.attempts = attempts;
                    entry.next_attempt_at = next_attempt_at;
                    entry.last_error = Some(last_error);
                }
            }
            OutboxEvent::Delivered { id } | OutboxEvent::Abandoned { id, .. } => {
                self.pending.remove(&id);
            }
        }
    }

    async fn record(&mut self, event: OutboxEvent) -> Result<(), OutboxError> {
        self.journal.append(&event).await?;
        self.apply(event);
        Ok(())
    }

    async fn maybe_compact(&mut self) -> Result<(), OutboxError> {
        let entries = self.journal.entries();
        if entries < COMPACT_MIN_ENTRIES || entries <= self.pending.len() * 2 {
            return Ok(());
        }
        let mut live: Vec<OutboxEntry> = self.pending.values().cloned().collect();
        live.sort_by_key(|e| e.created_at);
        let events: Vec<OutboxEvent> = live.into_iter().map(OutboxEvent::Queued).collect();
        self.journal.compact(&events).await?;
        Ok(())
    }
}

pub struct Outbox {
    state: Mutex<OutboxState>,
    wake: Notify,
    config: OutboxConfig,
}

impl Outbox {
    /// Replays the journal; entries that were pending at shutdown are pending again.
    pub async fn open(path: impl Into<PathBuf>, config: OutboxConfig) -> Result<Self, OutboxError> {
        let (journal, events) = Journal::open::<OutboxEvent>(path).await?;
        let mut state = OutboxState {
            pending: HashMap::new(),
            journal,
        };
        for event in events {
            state.apply(event);
        }
        state.maybe_compact().await?;
        info!(
            path = %state.journal.path().display(),
            pending = state.pending.len(),
            "outbox loaded"
        );

        Ok(Self {
            state: Mutex::new(state),
            wake: Notify::new(),
            config: config.normalize(),
        })
    }

    /// Durably records the intent to send `message` and wakes the worker.
    pub async fn enqueue(&self, message: EmailMessage) -> Result<Uuid, OutboxError> {
        let now = OffsetDateTime::now_utc();
        let entry = OutboxEntry {
            id: Uuid::new_v4(),
            message,
            attempts: 0,
            next_attempt_at: now,
            last_error: None,
            created_at: now,
        };
        let id = entry.id;

        self.state
            .lock()
            .await
            .record(OutboxEvent::Queued(entry))
            .await?;
        self.wake.notify_one();
        debug!(%id, "email queued");
        Ok(id)
    }

    pub async fn pending(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    #[cfg(test)]
    pub async fn pending_entries(&self) -> Vec<OutboxEntry> {
        let mut entries: Vec<OutboxEntry> =
            self.state.lock().await.pending.values().cloned().collect();
        entries.sort_by_key(|e| e.created_at);
        entries
    }

    /// Makes every later journal write fail.
    #[cfg(test)]
    pub async fn reopen_journal_read_only(&self) {
        self.state
            .lock()
            .await
            .journal
            .reopen_read_only()
            .await
            .unwrap();
    }

    /// Sends every entry due at `now`. Returns how many were delivered.
    pub async fn process_due(
        &self,
        notifier: &dyn Notifier,
        now: OffsetDateTime,
    ) -> Result<usize, OutboxError> {
        let mut due: Vec<OutboxEntry> = {
            let state = self.state.lock().await;
            state
                .pending
                .values()
                .filter(|e| e.next_attempt_at <= now)
                .cloned()
                .collect()
        };
        due.sort_by_key(|e| (e.next_attempt_at, e.created_at));

        let mut delivered = 0;
        for entry in due {
            // The lock is not held while talking to the relay.
            let outcome =
                match tokio::time::timeout(self.config.send_timeout, notifier.send(&entry.message))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(anyhow::anyhow!(
                        "send timed out after {:?}",
                        self.config.send_timeout
                    )),
                };

            let mut state = self.state.lock().await;
            match outcome {
                Ok(()) => {
                    state.record(OutboxEvent::Delivered { id: entry.id }).await?;
                    delivered += 1;
                    info!(id = %entry.id, to = %entry.message.to, "email delivered");
                }
                Err(err) => {
                    let attempts = entry.attempts.saturating_add(1);
                    let last_error = format!("{err:#}");
                    if attempts >= self.config.max_attempts {
                        error!(
                            id = %entry.id,
                            to = %entry.message.to,
                            attempts,
                            error = %last_error,
                            "email abandoned"
                        );
                        state
                            .record(OutboxEvent::Abandoned {
                                id: entry.id,
                                attempts,
                                last_error,
                            })
                            .await?;
                    } else {
                        let delay =
                            backoff_delay(attempts, self.config.backoff_base, self.config.backoff_max);
                        warn!(
                            id = %entry.id,
                            attempts,
                            retry_in_ms = delay.as_millis() as u64,
                            error = %last_error,
                            "email send failed; will retry"
                        );
                        state
                            .record(OutboxEvent::Attempted {
                                id: entry.id,
                                attempts,
                                next_attempt_at: now + delay,
                                last_error,
                            })
                            .await?;
                    }
                }
            }
        }

        self.state.lock().await.maybe_compact().await?;
        Ok(delivered)
    }

    /// Drains the outbox in the background until the runtime shuts down.
    pub fn spawn_worker(self: Arc<Self>, notifier: Arc<dyn Notifier>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if let Err(err) = self
                    .process_due(notifier.as_ref(), OffsetDateTime::now_utc())
                    .await
                {
                    error!("email outbox pass failed: {err}");
                }

                tokio::select! {
                    _ = self.wake.notified() => {}
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        })
    }
}

fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let shift = attempt.saturating_sub(1).min(31);
    let factor = 1u32 << shift;
    let delay = base.checked_mul(factor).unwrap_or(max);
    let capped = if delay > max { max } else { delay };
    jitter_delay(capped)
}

fn jitter_delay(delay: Duration) -> Duration {
    let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
    if delay_ms < 2 {
        return delay;
    }
    let half = delay_ms / 2;
    let jitter = rand::thread_rng().gen_range(0..=half);
    Duration::from_millis(half + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::testing::RecordingNotifier;

    fn config(max_attempts: u32) -> OutboxConfig {
        OutboxConfig {
            poll_interval: Duration::from_millis(10),
            max_attempts,
            backoff_base: Duration::from_secs(4),
            backoff_max: Duration::from_secs(60),
            send_timeout: Duration::from_millis(200),
        }
    }

    fn msg(to: &str) -> EmailMessage {
        EmailMessage::verification(to, "http://localhost/verify-email?token=t")
    }

    #[tokio::test]
    async fn queued_message_is_delivered() {
        let dir = tempfile::tempdir().unwrap();
        let outbox = Outbox::open(dir.path().join("outbox.jsonl"), config(3))
            .await
            .unwrap();
        let notifier = RecordingNotifier::default();

        outbox.enqueue(msg("a@b.com")).await.unwrap();
        assert_eq!(outbox.pending().await, 1);

        let sent = outbox
            .process_due(&notifier, OffsetDateTime::now_utc())
            .await
            .unwrap();
        assert_eq!(sent, 1);
        assert_eq!(outbox.pending().await, 0);
        assert_eq!(notifier.sent(), vec![msg("a@b.com")]);
    }

    #[tokio::test]
    async fn failed_send_is_retried_after_backoff() {
        let dir = tempfile::tempdir().unwrap();
        let outbox = Outbox::open(dir.path().join("outbox.jsonl"), config(5))
            .await
            .unwrap();
        let notifier = RecordingNotifier::failing(1);

        outbox.enqueue(msg("a@b.com")).await.unwrap();
        // Entries are due from their enqueue time, so the clock is read after it.
        let now = OffsetDateTime::now_utc();
        assert_eq!(outbox.process_due(&notifier, now).await.unwrap(), 0);

        let entries = outbox.pending_entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].attempts, 1);
        assert!(entries[0].next_attempt_at > now);
        assert!(entries[0].last_error.as_deref().unwrap().contains("relay unavailable"));

        // Not due yet.
        assert_eq!(outbox.process_due(&notifier, now).await.unwrap(), 0);
        assert!(notifier.sent().is_empty());

        let later = now + Duration::from_secs(61);
        assert_eq!(outbox.process_due(&notifier, later).await.unwrap(), 1);
        assert_eq!(outbox.pending().await, 0);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let outbox = Outbox::open(dir.path().join("outbox.jsonl"), config(2))
            .await
            .unwrap();
        let notifier = RecordingNotifier::failing(10);

        outbox.enqueue(msg("a@b.com")).await.unwrap();
        let mut now = OffsetDateTime::now_utc();
        outbox.process_due(&notifier, now).await.unwrap();
        assert_eq!(outbox.pending().await, 1);
        assert_eq!(outbox.pending_entries().await[0].attempts, 1);

        now += Duration::from_secs(120);
        outbox.process_due(&notifier, now).await.unwrap();
        assert_eq!(outbox.pending().await, 0);
        assert!(notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn slow_relay_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let outbox = Outbox::open(dir.path().join("outbox.jsonl"), config(3))
            .await
            .unwrap();
        let notifier = RecordingNotifier::slow(Duration::from_secs(2));

        outbox.enqueue(msg("a@b.com")).await.unwrap();
        let sent = outbox
            .process_due(&notifier, OffsetDateTime::now_utc())
            .await
            .unwrap();
        assert_eq!(sent, 0);
        let entries = outbox.pending_entries().await;
        assert!(entries[0].last_error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn pending_entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outbox.jsonl");

        let outbox = Outbox::open(&path, config(3)).await.unwrap();
        outbox.enqueue(msg("a@b.com")).await.unwrap();
        outbox.enqueue(msg("c@d.com")).await.unwrap();
        outbox
            .process_due(&RecordingNotifier::failing(1), OffsetDateTime::now_utc())
            .await
            .unwrap();
        drop(outbox);

        let outbox = Outbox::open(&path, config(3)).await.unwrap();
        let entries = outbox.pending_entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].attempts, 1);
    }

    #[tokio::test]
    async fn worker_delivers_on_wakeup() {
        let dir = tempfile::tempdir().unwrap();
        let outbox = Arc::new(
            Outbox::open(dir.path().join("outbox.jsonl"), config(3))
                .await
                .unwrap(),
        );
        let notifier = Arc::new(RecordingNotifier::default());
        let handle = outbox.clone().spawn_worker(notifier.clone());

        outbox.enqueue(msg("a@b.com")).await.unwrap();
        for _ in 0..100 {
            if !notifier.sent().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.abort();
        assert_eq!(notifier.sent().len(), 1);
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        let base = Duration::from_secs(4);
        let max = Duration::from_secs(60);

        let first = backoff_delay(1, base, max);
        assert!(first >= Duration::from_secs(2) && first <= base);

        let third = backoff_delay(3, base, max);
        assert!(third >= Duration::from_secs(8) && third <= Duration::from_secs(16));

        let late = backoff_delay(30, base, max);
        assert!(late >= Duration::from_secs(30) && late <= max);
    }

    #[test]
    fn normalize_fixes_degenerate_values() {
        let cfg = OutboxConfig {
            poll_interval: Duration::ZERO,
            max_attempts: 0,
            backoff_base: Duration::from_secs(10),
            backoff_max: Duration::from_secs(1),
            send_timeout: Duration::ZERO,
        }
        .normalize();
        assert_eq!(cfg.poll_interval, Duration::from_secs(1));
        assert_eq!(cfg.max_attempts, 1);
        assert_eq!(cfg.backoff_max, Duration::from_secs(10));
        assert_eq!(cfg.send_timeout, Duration::from_secs(1));
    }
}
