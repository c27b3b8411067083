//! Time-bounded record of recently seen envelopes.
//!
//! Flood propagation delivers the same message many times over different
//! paths. The history keeps every first-seen envelope for a fixed window after
//! its `received_at` so later copies can be recognised and dropped. A single
//! background task sweeps expired entries at a fixed cadence.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use weft_core::types::Hash256;

use crate::envelope::Envelope;

/// Deduplication cache keyed by envelope hash.
pub struct MessageHistory {
    window: Duration,
    entries: Mutex<HashMap<Hash256, Envelope>>,
}

impl MessageHistory {
    /// An empty history retaining entries for `window`.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn has_seen(&self, hash: &Hash256) -> bool {
        self.entries.lock().contains_key(hash)
    }

    /// Insert `envelope` if its hash is new.
    ///
    /// Returns `false` when the hash is already present, in which case the
    /// stored entry is left untouched.
    pub fn record(&self, envelope: &Envelope) -> bool {
        let mut entries = self.entries.lock();
        if entries.contains_key(&envelope.hash) {
            return false;
        }
        entries.insert(envelope.hash, envelope.clone());
        true
    }

    /// Remove every entry received at least `window` before `now`.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, env| now.saturating_duration_since(env.received_at) < self.window);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Run [`sweep`](Self::sweep) every `interval` until `shutdown` fires.
    ///
    /// One interval timer backs the task, so exactly one wake-up is pending at
    /// any time. Late ticks are delayed rather than bunched.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let history = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = history.sweep(Instant::now());
                        if removed > 0 {
                            debug!(removed, remaining = history.len(), "swept expired message history");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::types::MessageType;

    const WINDOW: Duration = Duration::from_secs(60);

    fn envelope(value: &[u8]) -> Envelope {
        Envelope::new(MessageType::Transaction, value.to_vec())
    }

    #[test]
    fn record_then_has_seen() {
        let history = MessageHistory::new(WINDOW);
        let env = envelope(b"a");
        assert!(!history.has_seen(&env.hash));
        assert!(history.record(&env));
        assert!(history.has_seen(&env.hash));
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn second_record_is_duplicate() {
        let history = MessageHistory::new(WINDOW);
        let env = envelope(b"a");
        assert!(history.record(&env));
        assert!(!history.record(&env));
        assert!(!history.record(&envelope(b"a")));
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn duplicate_keeps_original_timestamp() {
        let history = MessageHistory::new(WINDOW);
        let first = envelope(b"a");
        let mut later = envelope(b"a");
        later.received_at = first.received_at + Duration::from_secs(30);
        history.record(&first);
        history.record(&later);
        // Expiry follows the first receipt.
        assert_eq!(history.sweep(first.received_at + WINDOW), 1);
    }

    #[test]
    fn entry_present_throughout_window() {
        let history = MessageHistory::new(WINDOW);
        let env = envelope(b"a");
        let t = env.received_at;
        history.record(&env);

        for offset in [Duration::ZERO, Duration::from_secs(1), WINDOW - Duration::from_nanos(1)] {
            assert_eq!(history.sweep(t + offset), 0);
            assert!(history.has_seen(&env.hash));
        }
    }

    #[test]
    fn entry_absent_from_window_end() {
        let history = MessageHistory::new(WINDOW);
        let env = envelope(b"a");
        history.record(&env);
        assert_eq!(history.sweep(env.received_at + WINDOW), 1);
        assert!(!history.has_seen(&env.hash));
        assert!(history.is_empty());
    }

    #[test]
    fn sweep_only_removes_expired() {
        let history = MessageHistory::new(WINDOW);
        let old = envelope(b"old");
        let mut fresh = envelope(b"fresh");
        fresh.received_at = old.received_at + Duration::from_secs(30);
        history.record(&old);
        history.record(&fresh);

        assert_eq!(history.sweep(old.received_at + WINDOW), 1);
        assert!(!history.has_seen(&old.hash));
        assert!(history.has_seen(&fresh.hash));
    }

    #[test]
    fn concurrent_records_across_hashes() {
        let history = Arc::new(MessageHistory::new(WINDOW));
        let handles: Vec<_> = (0..8u8)
            .map(|t| {
                let history = Arc::clone(&history);
                std::thread::spawn(move || {
                    for i in 0..100u8 {
                        history.record(&envelope(&[t, i]));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(history.len(), 800);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_expires_entries() {
        let history = Arc::new(MessageHistory::new(Duration::from_secs(5)));
        let shutdown = CancellationToken::new();
        let task = history.spawn_sweeper(Duration::from_secs(1), shutdown.clone());

        let env = envelope(b"a");
        history.record(&env);

        tokio::time::sleep(Duration::from_millis(4_500)).await;
        assert!(history.has_seen(&env.hash));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!history.has_seen(&env.hash));

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_sweeper_stops() {
        let history = Arc::new(MessageHistory::new(Duration::from_secs(1)));
        let shutdown = CancellationToken::new();
        let task = history.spawn_sweeper(Duration::from_millis(100), shutdown.clone());
        shutdown.cancel();
        task.await.unwrap();

        let env = envelope(b"a");
        history.record(&env);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(history.has_seen(&env.hash));
    }
}
