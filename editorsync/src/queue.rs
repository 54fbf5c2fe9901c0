//! Strict one-at-a-time sequencer for incoming patches.
//!
//! Patches are diffs against a specific baseline, so two of them must
//! never be applied concurrently. Items are handed to a single worker task
//! that awaits the task for item N before it looks at item N+1:
//!
//! ```text
//! defer(P1) defer(P2) defer(P3)
//!     │         │         │
//!     ▼         ▼         ▼
//! ┌────────────────────────────┐      ┌──────────────┐
//! │ mpsc (FIFO, unbounded)     │ ───► │ worker task  │ ─► task(P1).await
//! └────────────────────────────┘      │ (sequential) │ ─► task(P2).await
//!                                     └──────────────┘ ─► task(P3).await
//! ```
//!
//! The enqueuer gets no result back; outcomes are observed elsewhere.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// FIFO sequencer running `task` for each deferred item, one at a time.
pub struct PatchQueue<T> {
    tx: mpsc::UnboundedSender<T>,
    worker: JoinHandle<()>,
    pending: Arc<AtomicUsize>,
    closed: AtomicBool,
}

impl<T: Send + 'static> PatchQueue<T> {
    /// Spawn the worker. Must be called within a tokio runtime.
    pub fn new<F, Fut>(mut task: F) -> Self
    where
        F: FnMut(T) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<T>();
        let pending = Arc::new(AtomicUsize::new(0));

        let counter = pending.clone();
        let worker = tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                task(item).await;
                counter.fetch_sub(1, Ordering::SeqCst);
            }
        });

        Self { tx, worker, pending, closed: AtomicBool::new(false) }
    }

    /// Queue an item behind everything already deferred.
    ///
    /// Returns `false` once the queue is closed.
    pub fn defer(&self, item: T) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(item).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        true
    }

    /// Items deferred but not yet fully processed (including the one in flight).
    pub fn len(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop the worker and discard every item not yet processed.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.worker.abort();
        let discarded = self.pending.swap(0, Ordering::SeqCst);
        if discarded > 0 {
            log::debug!("Discarded {discarded} queued patches");
        }
    }
}

impl<T> Drop for PatchQueue<T> {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::Mutex;

    #[tokio::test(start_paused = true)]
    async fn test_slow_item_blocks_followers() {
        let log = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = log.clone();
        let queue = PatchQueue::new(move |n: u32| {
            let sink = sink.clone();
            async move {
                sink.lock().await.push(format!("start {n}"));
                if n == 1 {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
                sink.lock().await.push(format!("end {n}"));
            }
        });

        assert!(queue.defer(1));
        assert!(queue.defer(2));
        assert!(queue.defer(3));
        assert_eq!(queue.len(), 3);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(*log.lock().await, vec!["start 1"]);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(
            *log.lock().await,
            vec!["start 1", "end 1", "start 2", "end 2", "start 3", "end 3"]
        );
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_discards_pending() {
        let seen = Arc::new(Mutex::new(Vec::<u32>::new()));
        let sink = seen.clone();
        let queue = PatchQueue::new(move |n: u32| {
            let sink = sink.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                sink.lock().await.push(n);
            }
        });

        queue.defer(1);
        queue.defer(2);
        queue.close();
        assert!(queue.is_closed());
        assert!(queue.is_empty());
        assert!(!queue.defer(3));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(seen.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_items_processed_in_order() {
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let queue = PatchQueue::new(move |n: usize| {
            let done_tx = done_tx.clone();
            async move {
                tokio::task::yield_now().await;
                let _ = done_tx.send(n);
            }
        });

        for n in 0..20 {
            queue.defer(n);
        }
        for expected in 0..20 {
            assert_eq!(done_rx.recv().await, Some(expected));
        }
    }
}
