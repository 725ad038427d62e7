//! The reference embedding and its expiry timer.
//!
//! At most one reference is live. It is replaced by enrollment, and removed
//! either by the first match or by its timer, whichever comes first. Every
//! installation gets a fresh id so a timer or a comparison that belongs to
//! an older installation can never act on a newer one.

use crate::events::PipelineEvent;
use chrono::{DateTime, Utc};
use facewatch_core::Embedding;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::AbortHandle;

struct Installed {
    installation: u64,
    embedding: Arc<Embedding>,
    expires_at: DateTime<Utc>,
    timer: AbortHandle,
}

/// A reference captured for one comparison. Stays valid after the store is
/// cleared or replaced.
#[derive(Debug, Clone)]
pub struct ReferenceSnapshot {
    pub installation: u64,
    pub embedding: Arc<Embedding>,
}

pub struct ReferenceStore {
    state: Mutex<Option<Installed>>,
    next_installation: AtomicU64,
    events: UnboundedSender<PipelineEvent>,
    runtime: Handle,
}

impl ReferenceStore {
    /// Create an empty store. Expiry timers run on `runtime`.
    pub fn new(events: UnboundedSender<PipelineEvent>, runtime: Handle) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(None),
            next_installation: AtomicU64::new(1),
            events,
            runtime,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Option<Installed>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the reference and arm a timer for `timeout`.
    ///
    /// Any pending timer of the previous installation is cancelled first.
    /// Returns the new installation id.
    pub fn install(self: &Arc<Self>, embedding: Embedding, timeout: Duration) -> u64 {
        let installation = self.next_installation.fetch_add(1, Ordering::Relaxed);
        let weak: Weak<Self> = Arc::downgrade(self);

        let mut state = self.lock();
        if let Some(previous) = state.take() {
            previous.timer.abort();
            tracing::debug!(installation = previous.installation, "reference replaced");
        }

        let timer = self
            .runtime
            .spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(store) = weak.upgrade() {
                    store.on_timeout(installation);
                }
            })
            .abort_handle();

        let expires_at = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        *state = Some(Installed {
            installation,
            embedding: Arc::new(embedding),
            expires_at,
            timer,
        });
        drop(state);

        tracing::info!(installation, timeout_ms = timeout.as_millis() as u64, "reference installed");
        installation
    }

    /// The current reference, if any.
    pub fn snapshot(&self) -> Option<ReferenceSnapshot> {
        self.lock().as_ref().map(|s| ReferenceSnapshot {
            installation: s.installation,
            embedding: Arc::clone(&s.embedding),
        })
    }

    /// Clear the reference after a match, if it is still the installation
    /// the comparison was made against. Returns whether it was cleared.
    pub fn clear_on_match(&self, snapshot: &ReferenceSnapshot) -> bool {
        let mut state = self.lock();
        match state.as_ref() {
            Some(s) if s.installation == snapshot.installation => {
                if let Some(s) = state.take() {
                    s.timer.abort();
                }
                tracing::info!(installation = snapshot.installation, "reference cleared on match");
                true
            }
            _ => false,
        }
    }

    /// Expire `installation`. A no-op unless it is still the live reference,
    /// so each installation produces at most one expiry event.
    pub fn on_timeout(&self, installation: u64) {
        let mut state = self.lock();
        if !state.as_ref().is_some_and(|s| s.installation == installation) {
            tracing::trace!(installation, "stale reference timer");
            return;
        }
        *state = None;
        drop(state);

        tracing::info!(installation, "reference expired");
        if self.events.send(PipelineEvent::expired()).is_err() {
            tracing::debug!("event receiver gone; expiry not delivered");
        }
    }

    /// Cancel the timer and drop the reference without an expiry event.
    pub fn shutdown(&self) {
        if let Some(s) = self.lock().take() {
            s.timer.abort();
            tracing::debug!(installation = s.installation, "reference dropped at shutdown");
        }
    }

    pub fn is_armed(&self) -> bool {
        self.lock().is_some()
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.lock().as_ref().map(|s| s.expires_at)
    }
}

impl Drop for ReferenceStore {
    fn drop(&mut self) {
        if let Some(s) = self.state.get_mut().unwrap_or_else(PoisonError::into_inner).take() {
            s.timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn store() -> (Arc<ReferenceStore>, mpsc::UnboundedReceiver<PipelineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ReferenceStore::new(tx, Handle::current()), rx)
    }

    fn embedding() -> Embedding {
        Embedding::new(vec![0.25; 128])
    }

    #[tokio::test]
    async fn test_empty_store() {
        let (store, _rx) = store();
        assert!(store.snapshot().is_none());
        assert!(!store.is_armed());
        assert!(store.expires_at().is_none());
    }

    #[tokio::test]
    async fn test_clear_on_match_then_stale_timer_is_noop() {
        let (store, mut rx) = store();
        let id = store.install(embedding(), Duration::from_millis(1000));

        let snap = store.snapshot().unwrap();
        assert_eq!(snap.installation, id);
        assert!(store.clear_on_match(&snap));
        assert!(store.snapshot().is_none());

        // A late timer for the cleared installation changes nothing.
        store.on_timeout(id);
        assert!(store.snapshot().is_none());
        assert!(rx.try_recv().is_err());

        // Neither does a second clear with the same snapshot.
        assert!(!store.clear_on_match(&snap));
    }

    #[tokio::test]
    async fn test_timeout_expires_once() {
        let (store, mut rx) = store();
        store.install(embedding(), Duration::from_millis(100));
        assert!(store.is_armed());

        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(store.snapshot().is_none());
        assert!(matches!(rx.try_recv(), Ok(PipelineEvent::ReferenceExpired { .. })));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_install_replaces_and_cancels_previous_timer() {
        let (store, mut rx) = store();
        let first = store.install(embedding(), Duration::from_millis(50));
        let second = store.install(Embedding::new(vec![1.0; 128]), Duration::from_millis(1000));
        assert_ne!(first, second);

        tokio::time::sleep(Duration::from_millis(120)).await;

        let snap = store.snapshot().unwrap();
        assert_eq!(snap.installation, second);
        assert_eq!(snap.embedding.values[0], 1.0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_snapshot_survives_clear() {
        let (store, _rx) = store();
        store.install(embedding(), Duration::from_millis(1000));
        let snap = store.snapshot().unwrap();
        store.shutdown();
        assert!(store.snapshot().is_none());
        assert_eq!(snap.embedding.len(), 128);
    }

    #[tokio::test]
    async fn test_clear_with_outdated_snapshot_keeps_new_reference() {
        let (store, _rx) = store();
        store.install(embedding(), Duration::from_millis(1000));
        let old = store.snapshot().unwrap();
        let new_id = store.install(embedding(), Duration::from_millis(1000));

        assert!(!store.clear_on_match(&old));
        assert_eq!(store.snapshot().unwrap().installation, new_id);
    }

    #[tokio::test]
    async fn test_shutdown_emits_nothing() {
        let (store, mut rx) = store();
        store.install(embedding(), Duration::from_millis(50));
        store.shutdown();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
        assert!(!store.is_armed());
    }
}
