use std::collections::{HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};

pub trait QueueKey: Clone + Eq + Hash + Debug + Send + Sync + 'static {}
impl<T: Clone + Eq + Hash + Debug + Send + Sync + 'static> QueueKey for T {}

#[derive(Debug, Default)]
struct QueueState<K> {
    ready: VecDeque<K>,
    queued: HashSet<K>,
    active: HashSet<K>,
    dirty: HashSet<K>,
}

/// Keyed work queue with duplicate collapsing and single-flight semantics.
///
/// A key enqueued while already waiting is dropped; a key enqueued while its
/// reconcile is in flight sets a dirty bit that guarantees exactly one
/// follow-up run after [`WorkQueue::done`]. At most one reconcile per key is
/// ever handed out concurrently, regardless of worker count.
#[derive(Debug)]
pub struct WorkQueue<K: QueueKey> {
    state: Arc<Mutex<QueueState<K>>>,
    notify: Arc<Notify>,
}

impl<K: QueueKey> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            notify: self.notify.clone(),
        }
    }
}

impl<K: QueueKey> Default for WorkQueue<K> {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState {
                ready: VecDeque::new(),
                queued: HashSet::new(),
                active: HashSet::new(),
                dirty: HashSet::new(),
            })),
            notify: Arc::new(Notify::new()),
        }
    }
}

impl<K: QueueKey> WorkQueue<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue `key`. Collapses with any already-waiting enqueue of the same
    /// key; marks the key dirty if it is currently being reconciled.
    pub async fn add(&self, key: K) {
        let mut state = self.state.lock().await;
        if state.active.contains(&key) {
            state.dirty.insert(key);
            return;
        }
        if state.queued.insert(key.clone()) {
            state.ready.push_back(key);
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Enqueue `key` after `delay`.
    pub fn add_after(&self, key: K, delay: Duration) {
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key).await;
        });
    }

    /// Wait for the next key and mark it in flight.
    pub async fn next(&self) -> K {
        loop {
            {
                let mut state = self.state.lock().await;
                if let Some(key) = state.ready.pop_front() {
                    state.queued.remove(&key);
                    state.active.insert(key.clone());
                    return key;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Mark a reconcile finished. A dirty key goes straight back to ready.
    pub async fn done(&self, key: &K) {
        let mut state = self.state.lock().await;
        state.active.remove(key);
        if state.dirty.remove(key) && state.queued.insert(key.clone()) {
            state.ready.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Keys currently waiting (not in flight).
    pub async fn waiting(&self) -> usize {
        self.state.lock().await.ready.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplicate_adds_collapse() {
        let queue: WorkQueue<String> = WorkQueue::new();
        queue.add("a".to_string()).await;
        queue.add("a".to_string()).await;
        queue.add("b".to_string()).await;
        assert_eq!(queue.waiting().await, 2);

        let first = queue.next().await;
        assert_eq!(first, "a");
        let second = queue.next().await;
        assert_eq!(second, "b");
        assert_eq!(queue.waiting().await, 0);
    }

    #[tokio::test]
    async fn key_added_mid_flight_runs_exactly_once_more() {
        let queue: WorkQueue<String> = WorkQueue::new();
        queue.add("a".to_string()).await;

        let key = queue.next().await;
        // two re-adds while in flight collapse into one follow-up
        queue.add("a".to_string()).await;
        queue.add("a".to_string()).await;
        assert_eq!(queue.waiting().await, 0, "in-flight key must not re-queue yet");

        queue.done(&key).await;
        assert_eq!(queue.waiting().await, 1);

        let again = queue.next().await;
        queue.done(&again).await;
        assert_eq!(queue.waiting().await, 0, "dirty bit fires exactly once");
    }

    #[tokio::test]
    async fn done_without_dirty_leaves_queue_empty() {
        let queue: WorkQueue<String> = WorkQueue::new();
        queue.add("a".to_string()).await;
        let key = queue.next().await;
        queue.done(&key).await;
        assert_eq!(queue.waiting().await, 0);
    }

    #[tokio::test]
    async fn add_after_delivers_later() {
        let queue: WorkQueue<String> = WorkQueue::new();
        queue.add_after("a".to_string(), Duration::from_millis(10));
        let key = queue.next().await;
        assert_eq!(key, "a");
    }
}
