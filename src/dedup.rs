//! Deduplicator — collapses concurrent work sharing a key into one execution.
//!
//! The first caller for a key runs the work inline. Callers arriving while it
//! is outstanding park on a oneshot and receive a clone of the same settled
//! result. The key is evicted before results are handed out, so a call made
//! after settlement always starts fresh work.
//!
//! If the running caller is dropped before the work settles, the key is
//! evicted and every parked caller receives [`SyncError::Abandoned`].

use std::collections::HashMap;
use std::future::Future;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{Result, SyncError};

type Waiters<T> = Vec<oneshot::Sender<Result<T>>>;

pub struct Deduplicator<T> {
    in_flight: Mutex<HashMap<String, Waiters<T>>>,
}

/// What the caller should do after checking the key.
enum Slot<T> {
    /// Nothing outstanding: the caller runs the work.
    Run,
    /// Work outstanding: the caller awaits the shared result.
    Join(oneshot::Receiver<Result<T>>),
}

impl<T: Clone> Deduplicator<T> {
    pub fn new() -> Self {
        Self {
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Run `work` under `key`, or join the execution already outstanding.
    pub async fn run<F, Fut>(&self, key: &str, work: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match self.claim(key) {
            Slot::Join(rx) => {
                return rx.await.unwrap_or_else(|_| {
                    Err(SyncError::Abandoned {
                        key: key.to_string(),
                    })
                });
            }
            Slot::Run => {}
        }

        // No lock held across the await.
        let mut guard = EvictOnDrop {
            owner: self,
            key,
            armed: true,
        };
        let result = work().await;
        let waiters = guard.settle();

        for tx in waiters {
            let _ = tx.send(result.clone());
        }
        result
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.in_flight.lock().contains_key(key)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    fn claim(&self, key: &str) -> Slot<T> {
        let mut in_flight = self.in_flight.lock();
        match in_flight.get_mut(key) {
            Some(waiters) => {
                let (tx, rx) = oneshot::channel();
                waiters.push(tx);
                Slot::Join(rx)
            }
            None => {
                in_flight.insert(key.to_string(), Vec::new());
                Slot::Run
            }
        }
    }

    fn evict(&self, key: &str) -> Waiters<T> {
        self.in_flight.lock().remove(key).unwrap_or_default()
    }
}

impl<T: Clone> Default for Deduplicator<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Evicts the key if the running future is dropped mid-flight. Dropping the
/// evicted senders wakes joined callers with `Abandoned`.
struct EvictOnDrop<'a, T: Clone> {
    owner: &'a Deduplicator<T>,
    key: &'a str,
    armed: bool,
}

impl<T: Clone> EvictOnDrop<'_, T> {
    fn settle(&mut self) -> Waiters<T> {
        self.armed = false;
        self.owner.evict(self.key)
    }
}

impl<T: Clone> Drop for EvictOnDrop<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            drop(self.owner.evict(self.key));
        }
    }
}
