//! Admission control for pipelines.
//!
//! The queue manager is the single gate on how many backup/restore
//! pipelines run at once. Trigger bursts beyond the limit queue FIFO on
//! the semaphore and are admitted as slots free. A slot is reclaimed
//! exactly once per pipeline by dropping its owned permit on every
//! termination path, including panics inside the pipeline future.

use arc_swap::ArcSwap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info};

struct RunningGuard {
    gauge: Arc<AtomicUsize>,
}

impl RunningGuard {
    fn enter(gauge: Arc<AtomicUsize>) -> Self {
        gauge.fetch_add(1, Ordering::SeqCst);
        Self { gauge }
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.gauge.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Bounds the number of simultaneously running pipelines
pub struct QueueManager {
    semaphore: ArcSwap<Semaphore>,
    limit: AtomicUsize,
    running: Arc<AtomicUsize>,
}

impl QueueManager {
    /// Queue admitting at most `limit` concurrent pipelines
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            semaphore: ArcSwap::from_pointee(Semaphore::new(limit)),
            limit: AtomicUsize::new(limit),
            running: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Current admission limit
    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::SeqCst)
    }

    /// Number of admitted, currently running pipelines
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Change the admission limit. Affects future admissions only:
    /// pipelines already running hold permits of the previous semaphore
    /// and release them there.
    pub fn set_limit(&self, limit: usize) {
        let limit = limit.max(1);
        self.semaphore.store(Arc::new(Semaphore::new(limit)));
        self.limit.store(limit, Ordering::SeqCst);
        info!(limit, "admission limit changed");
    }

    /// Submit a pipeline. Returns immediately; the future runs once a
    /// slot frees up, in FIFO admission order.
    pub fn submit<F>(&self, pipeline: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let semaphore = self.semaphore.load_full();
        let gauge = Arc::clone(&self.running);
        tokio::spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                // the semaphore is never closed; treat as shutdown
                return;
            };
            let _running = RunningGuard::enter(gauge);
            debug!("pipeline admitted");
            pipeline.await;
            // permit and gauge release on drop, exactly once per pipeline
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_burst_never_exceeds_limit() {
        let queue = Arc::new(QueueManager::new(3));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let queue_ref = Arc::clone(&queue);
            let peak_ref = Arc::clone(&peak);
            let running = Arc::clone(&queue.running);
            handles.push(queue_ref.submit(async move {
                let now = running.load(Ordering::SeqCst);
                peak_ref.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                let now = running.load(Ordering::SeqCst);
                peak_ref.fetch_max(now, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(queue.running(), 0);
    }

    #[tokio::test]
    async fn test_slot_reclaimed_after_panic() {
        let queue = Arc::new(QueueManager::new(1));

        let handle = queue.submit(async {
            panic!("pipeline blew up");
        });
        assert!(handle.await.is_err());

        // the slot must be free again: a second pipeline runs to completion
        let done = Arc::new(AtomicUsize::new(0));
        let done_ref = Arc::clone(&done);
        queue
            .submit(async move {
                done_ref.store(1, Ordering::SeqCst);
            })
            .await
            .unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert_eq!(queue.running(), 0);
    }

    #[tokio::test]
    async fn test_limit_change_affects_future_admissions_only() {
        let queue = Arc::new(QueueManager::new(1));
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let first = queue.submit(async move {
            let _ = release_rx.await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(queue.running(), 1);

        queue.set_limit(2);
        let second = queue.submit(async {});
        let third = queue.submit(async {});
        second.await.unwrap();
        third.await.unwrap();

        release_tx.send(()).unwrap();
        first.await.unwrap();
        assert_eq!(queue.running(), 0);
    }
}
