//! Work Queue
//!
//! Deduplicating queue feeding the reconcile workers. A key waits in the
//! queue at most once, and a key that is being processed is never handed to
//! a second worker: re-adds during processing are held back until `done`.

use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug)]
struct QueueState<K> {
    queue: VecDeque<K>,
    /// Keys waiting to be processed, queued or held back
    dirty: HashSet<K>,
    /// Keys handed to a worker and not yet done
    processing: HashSet<K>,
    shutting_down: bool,
}

/// Deduplicating work queue
#[derive(Debug)]
pub struct WorkQueue<K> {
    state: Mutex<QueueState<K>>,
    notify: Notify,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Enqueue a key unless it is already waiting
    pub fn add(&self, key: K) {
        let mut state = self.state.lock();
        if state.shutting_down || !state.dirty.insert(key.clone()) {
            return;
        }
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.notify.notify_one();
    }

    /// Enqueue a key once `delay` has elapsed
    pub fn add_after(self: &Arc<Self>, key: K, delay: Duration) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Wait for the next key, `None` once the queue is shut down
    pub async fn next(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Release a key handed out by `next`, requeueing it if re-added meanwhile
    pub fn done(&self, key: &K) {
        let mut state = self.state.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Stop handing out keys and wake every waiting worker
    pub fn shutdown(&self) {
        self.state.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    /// Number of keys waiting in the queue
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K> Default for WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    #[tokio::test]
    async fn test_deduplicates_waiting_keys() {
        let queue = WorkQueue::new();
        queue.add("a");
        queue.add("b");
        queue.add("a");
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.next().await, Some("a"));
        assert_eq!(queue.next().await, Some("b"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_readd_during_processing_is_deferred() {
        let queue = WorkQueue::new();
        queue.add("a");
        let key = queue.next().await.unwrap();

        // Re-added while processing: not handed out to another worker
        queue.add("a");
        queue.add("a");
        assert!(queue.is_empty());

        queue.done(&key);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.next().await, Some("a"));
        queue.done(&"a");
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_next_waits_for_add() {
        let queue = Arc::new(WorkQueue::new());
        let mut next = task::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.next().await }
        });
        assert_pending!(next.poll());

        queue.add(7u32);
        assert!(next.is_woken());
        assert_eq!(assert_ready!(next.poll()), Some(7));
    }

    #[tokio::test]
    async fn test_shutdown_releases_waiters() {
        let queue = Arc::new(WorkQueue::<u32>::new());
        let mut next = task::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.next().await }
        });
        assert_pending!(next.poll());

        queue.shutdown();
        assert_eq!(assert_ready!(next.poll()), None);

        // Adds after shutdown are ignored
        queue.add(1);
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_after() {
        let queue = Arc::new(WorkQueue::new());
        queue.add_after("a", Duration::from_secs(5));
        tokio::task::yield_now().await;
        assert!(queue.is_empty());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(queue.len(), 1);
    }
}
