//! Veto window timers
//!
//! One task per open session, keyed by session id. A timer that fires sends
//! an [`Expiry`] on the channel; the consumer re-checks persisted state, so a
//! timer that fires after being cancelled is harmless.

use custos_core::SessionId;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Fired timer notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expiry {
    /// Session whose window elapsed
    pub session: SessionId,
    /// Arming generation; stale generations are ignored by the registry
    pub generation: u64,
}

#[derive(Debug)]
struct TimerEntry {
    generation: u64,
    cancel: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Registry of cancellable session timers
#[derive(Debug)]
pub struct TimerRegistry {
    timers: DashMap<SessionId, TimerEntry>,
    next_generation: AtomicU64,
    expiry_tx: mpsc::UnboundedSender<Expiry>,
}

impl TimerRegistry {
    /// Create registry delivering expiries to `expiry_tx`
    #[must_use]
    pub fn new(expiry_tx: mpsc::UnboundedSender<Expiry>) -> Self {
        Self {
            timers: DashMap::new(),
            next_generation: AtomicU64::new(1),
            expiry_tx,
        }
    }

    /// Arm (or re-arm) the timer for `session`
    ///
    /// The entry is registered before the task may fire, so an expiry for a
    /// zero delay is never mistaken for a stale one.
    pub fn arm(&self, session: SessionId, delay: Duration) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + delay;
        let (cancel, cancelled) = oneshot::channel::<()>();
        let (registered_tx, registered) = oneshot::channel::<()>();
        let tx = self.expiry_tx.clone();
        let handle = tokio::spawn(async move {
            if registered.await.is_err() {
                return;
            }
            tokio::select! {
                () = tokio::time::sleep_until(deadline) => {
                    if tx.send(Expiry { session, generation }).is_err() {
                        tracing::debug!(%session, "expiry consumer gone");
                    }
                }
                _ = cancelled => {}
            }
        });

        if let Some(previous) = self.timers.insert(
            session,
            TimerEntry {
                generation,
                cancel,
                handle,
            },
        ) {
            let _ = previous.cancel.send(());
        }
        let _ = registered_tx.send(());
        tracing::trace!(
            %session,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "veto timer armed"
        );
    }

    /// Cancel the timer for `session`; returns whether one was live
    pub fn cancel(&self, session: SessionId) -> bool {
        match self.timers.remove(&session) {
            Some((_, entry)) => {
                let _ = entry.cancel.send(());
                true
            }
            None => false,
        }
    }

    /// Forget the entry for a fired timer
    ///
    /// Returns `false` when the expiry is stale (the session was re-armed or
    /// cancelled after the timer fired).
    pub fn complete(&self, expiry: Expiry) -> bool {
        self.timers
            .remove_if(&expiry.session, |_, entry| entry.generation == expiry.generation)
            .is_some()
    }

    /// Check if `session` has a live timer
    #[must_use]
    pub fn is_armed(&self, session: SessionId) -> bool {
        self.timers.contains_key(&session)
    }

    /// Number of live timers
    #[must_use]
    pub fn len(&self) -> usize {
        self.timers.len()
    }

    /// Check if no timers are live
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    /// Cancel every timer
    pub fn shutdown(&self) {
        let sessions: Vec<SessionId> = self.timers.iter().map(|entry| *entry.key()).collect();
        for session in sessions {
            if let Some((_, entry)) = self.timers.remove(&session) {
                entry.handle.abort();
            }
        }
    }
}

impl Drop for TimerRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn fires_after_delay() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let registry = TimerRegistry::new(tx);
        let session = SessionId::new();
        registry.arm(session, Duration::from_secs(60));

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(rx.try_recv().is_err());

        let expiry = rx.recv().await.unwrap();
        assert_eq!(expiry.session, session);
        assert!(registry.complete(expiry));
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_fires() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let registry = TimerRegistry::new(tx);
        let session = SessionId::new();
        registry.arm(session, Duration::from_secs(1));
        assert!(registry.cancel(session));
        assert!(!registry.cancel(session));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn rearm_makes_earlier_expiry_stale() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let registry = TimerRegistry::new(tx);
        let session = SessionId::new();
        registry.arm(session, Duration::from_secs(1));
        let stale = Expiry {
            session,
            generation: 1,
        };
        registry.arm(session, Duration::from_secs(10));
        assert!(!registry.complete(stale));
        assert!(registry.is_armed(session));

        let fresh = rx.recv().await.unwrap();
        assert_eq!(fresh.generation, 2);
        assert!(registry.complete(fresh));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn zero_delay_expiry_is_never_stale() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let registry = TimerRegistry::new(tx);
        let sessions: Vec<SessionId> = (0..500).map(|_| SessionId::new()).collect();
        for session in &sessions {
            registry.arm(*session, Duration::ZERO);
        }
        for _ in &sessions {
            let expiry = rx.recv().await.unwrap();
            assert!(registry.complete(expiry), "expiry for {} dropped", expiry.session);
        }
        assert!(registry.is_empty());
    }
}
