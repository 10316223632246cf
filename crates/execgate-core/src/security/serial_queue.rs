//! Per-resource FIFO critical sections.
//!
//! Operations submitted for the same key run one at a time in submission
//! order. Each operation releases its successor exactly once, whether it
//! succeeds, fails, panics or is dropped. A lane disappears as soon as its
//! backlog drains.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

#[derive(Default)]
struct Lane {
    /// Completion signal of the most recently submitted operation.
    last_done: Option<oneshot::Receiver<()>>,
    pending: usize,
}

type Lanes = Arc<Mutex<HashMap<PathBuf, Lane>>>;

#[derive(Clone, Default)]
pub struct SerialQueue {
    lanes: Lanes,
}

impl SerialQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `op` on `key`. The position in the queue is taken when this
    /// method is called, not when the returned future is first polled.
    pub fn run<F, Fut, T>(
        &self,
        key: impl Into<PathBuf>,
        op: F,
    ) -> impl Future<Output = T> + Send + 'static
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let mut ticket = self.enqueue(key.into());
        async move {
            ticket.wait_turn().await;
            let output = op().await;
            drop(ticket);
            output
        }
    }

    /// Number of keys with queued or running operations.
    pub fn lane_count(&self) -> usize {
        self.lanes.lock().len()
    }

    fn enqueue(&self, key: PathBuf) -> Ticket {
        let (release, done) = oneshot::channel();
        let mut lanes = self.lanes.lock();
        let lane = lanes.entry(key.clone()).or_default();
        lane.pending += 1;
        let wait_for = lane.last_done.replace(done);
        Ticket {
            key,
            lanes: self.lanes.clone(),
            wait_for,
            release: Some(release),
        }
    }
}

struct Ticket {
    key: PathBuf,
    lanes: Lanes,
    wait_for: Option<oneshot::Receiver<()>>,
    release: Option<oneshot::Sender<()>>,
}

impl Ticket {
    async fn wait_turn(&mut self) {
        if let Some(predecessor) = self.wait_for.take() {
            // A dropped sender also means the predecessor is done.
            let _ = predecessor.await;
        }
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        let lanes = self.lanes.clone();
        let key = std::mem::take(&mut self.key);
        let release = self.release.take();

        match (self.wait_for.take(), tokio::runtime::Handle::try_current()) {
            // Dropped while still queued: hold our place until the
            // predecessor finishes so the successor keeps FIFO order.
            (Some(predecessor), Ok(handle)) => {
                handle.spawn(async move {
                    let _ = predecessor.await;
                    finish(&lanes, &key, release);
                });
            }
            _ => finish(&lanes, &key, release),
        }
    }
}

fn finish(lanes: &Lanes, key: &PathBuf, release: Option<oneshot::Sender<()>>) {
    if let Some(release) = release {
        let _ = release.send(());
    }
    let mut lanes = lanes.lock();
    if let Some(lane) = lanes.get_mut(key) {
        lane.pending = lane.pending.saturating_sub(1);
        if lane.pending == 0 {
            lanes.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_runs_in_submission_order() {
        let queue = SerialQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut futures = Vec::new();
        for i in 0..5u64 {
            let log = log.clone();
            futures.push(queue.run("/tmp/a.json", move || async move {
                // Later submissions sleep less; order must still hold.
                tokio::time::sleep(Duration::from_millis(20 - i * 4)).await;
                log.lock().push(i);
            }));
        }
        let handles: Vec<_> = futures.into_iter().map(tokio::spawn).collect();
        for handle in handles.into_iter().rev() {
            handle.await.unwrap();
        }

        assert_eq!(*log.lock(), vec![0, 1, 2, 3, 4]);
        assert_eq!(queue.lane_count(), 0);
    }

    #[tokio::test]
    async fn test_operations_are_exclusive() {
        let queue = SerialQueue::new();
        let active = Arc::new(Mutex::new(0usize));
        let max_seen = Arc::new(Mutex::new(0usize));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let active = active.clone();
                let max_seen = max_seen.clone();
                tokio::spawn(queue.run("/tmp/b.json", move || async move {
                    {
                        let mut a = active.lock();
                        *a += 1;
                        let mut m = max_seen.lock();
                        *m = (*m).max(*a);
                    }
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    *active.lock() -= 1;
                }))
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*max_seen.lock(), 1);
    }

    #[tokio::test]
    async fn test_failure_does_not_block_queue() {
        let queue = SerialQueue::new();
        let first: Result<(), String> = queue
            .run("/tmp/c.json", || async { Err("boom".to_string()) })
            .await;
        assert!(first.is_err());

        let second = queue.run("/tmp/c.json", || async { 7 }).await;
        assert_eq!(second, 7);
        assert_eq!(queue.lane_count(), 0);
    }

    #[tokio::test]
    async fn test_panicking_operation_releases_lane() {
        let queue = SerialQueue::new();
        let panicked = tokio::spawn(queue.run("/tmp/d.json", || async {
            panic!("op failed");
        }));
        let next = queue.run("/tmp/d.json", || async { "ran" });
        let result: Result<(), _> = panicked.await;
        assert!(result.is_err());
        assert_eq!(next.await, "ran");
        assert_eq!(queue.lane_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_waiter_keeps_order() {
        let queue = SerialQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let first = {
            let log = log.clone();
            tokio::spawn(queue.run("/tmp/e.json", move || async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                log.lock().push("first");
            }))
        };
        let abandoned = queue.run("/tmp/e.json", || async {});
        let third = {
            let log = log.clone();
            queue.run("/tmp/e.json", move || async move {
                log.lock().push("third");
            })
        };
        drop(abandoned);

        third.await;
        first.await.unwrap();
        assert_eq!(*log.lock(), vec!["first", "third"]);
        assert_eq!(queue.lane_count(), 0);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let queue = SerialQueue::new();
        let blocker = queue.run("/tmp/f.json", || async {
            tokio::time::sleep(Duration::from_millis(50)).await;
        });
        let handle = tokio::spawn(blocker);
        let other = queue.run("/tmp/g.json", || async { 1 });
        assert_eq!(
            tokio::time::timeout(Duration::from_millis(20), other)
                .await
                .unwrap(),
            1
        );
        handle.await.unwrap();
    }
}
