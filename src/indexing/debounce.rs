// Debounced per-file scheduling
//
// Coalesces bursts of change notifications (keystroke-driven edits)
// into a single deferred action per file: a new notification for a file
// with a pending timer cancels and replaces that timer, so only the
// last action of a burst runs.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::debug;

/// Short enough that single edits feel responsive, long enough to
/// absorb a typing burst.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

struct Slot {
    generation: u64,
    handle: JoinHandle<()>,
}

pub struct Debouncer {
    delay: Duration,
    slots: Arc<DashMap<String, Slot>>,
    generations: AtomicU64,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            slots: Arc::new(DashMap::new()),
            generations: AtomicU64::new(0),
        }
    }

    /// Schedule `action` to run after the delay. A pending action for
    /// the same key is cancelled and replaced; last write wins.
    pub fn schedule<F>(&self, key: &str, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let slots = Arc::clone(&self.slots);
        let slot_key = key.to_string();
        let delay = self.delay;

        let handle = tokio::spawn({
            let slots = Arc::clone(&slots);
            let slot_key = slot_key.clone();
            async move {
                tokio::time::sleep(delay).await;
                // Clear our own slot first so the action can reschedule.
                slots.remove_if(&slot_key, |_, slot| slot.generation == generation);
                action.await;
            }
        });

        if let Some(previous) = self.slots.insert(slot_key, Slot { generation, handle }) {
            debug!("Replacing pending index timer for {}", key);
            previous.handle.abort();
        }
    }

    /// Drop a pending timer without running its action.
    pub fn cancel(&self, key: &str) {
        if let Some((_, slot)) = self.slots.remove(key) {
            slot.handle.abort();
        }
    }

    /// Number of files with a pending timer.
    pub fn pending(&self) -> usize {
        self.slots.len()
    }
}

impl Default for Debouncer {
    fn default() -> Self {
        Self::new(DEFAULT_DEBOUNCE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_burst_coalesces_to_last_action() {
        let debouncer = Debouncer::new(Duration::from_millis(20));
        let (tx, mut rx) = mpsc::unbounded_channel();

        // Five rapid "edits"; only the last one's content must run.
        for revision in 1..=5 {
            let tx = tx.clone();
            debouncer.schedule("/src/A.php", async move {
                let _ = tx.send(revision);
            });
        }
        assert_eq!(debouncer.pending(), 1);

        let fired = rx.recv().await.unwrap();
        assert_eq!(fired, 5);
        assert!(
            tokio::time::timeout(Duration::from_millis(80), rx.recv())
                .await
                .is_err(),
            "exactly one action may fire per burst"
        );
        assert_eq!(debouncer.pending(), 0);
    }

    #[tokio::test]
    async fn test_distinct_files_do_not_interfere() {
        let debouncer = Debouncer::new(Duration::from_millis(10));
        let counter = Arc::new(AtomicUsize::new(0));

        for key in ["/src/A.php", "/src/B.php"] {
            let counter = Arc::clone(&counter);
            debouncer.schedule(key, async move {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(debouncer.pending(), 2);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancel_drops_pending_action() {
        let debouncer = Debouncer::new(Duration::from_millis(10));
        let counter = Arc::new(AtomicUsize::new(0));

        {
            let counter = Arc::clone(&counter);
            debouncer.schedule("/src/A.php", async move {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        debouncer.cancel("/src/A.php");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(debouncer.pending(), 0);
    }
}
