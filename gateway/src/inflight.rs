//! In-flight request de-duplication.
//!
//! Concurrent callers asking for the same key share one spawned task. The
//! task runs to completion even if every caller goes away, and its entry is
//! removed when it settles, whatever the outcome.

use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::error::{Fetched, Unavailable, UnavailableReason};

type SharedFetch<T> = Shared<BoxFuture<'static, Fetched<T>>>;

pub struct InFlight<K, T> {
    entries: Mutex<FxHashMap<K, (u64, SharedFetch<T>)>>,
    generation: AtomicU64,
}

impl<K, T> Default for InFlight<K, T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(FxHashMap::default()),
            generation: AtomicU64::new(0),
        }
    }
}

impl<K, T> InFlight<K, T>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Join the request for `key`, starting it with `start` if none is running.
    pub async fn run<F, Fut>(self: &Arc<Self>, key: K, start: F) -> Fetched<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Fetched<T>> + Send + 'static,
    {
        let shared = {
            let mut entries = self.entries.lock();
            match entries.get(&key) {
                Some((_, shared)) => shared.clone(),
                None => {
                    let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
                    // Spawned under the lock so the entry exists before the
                    // task can try to remove it.
                    let this = Arc::clone(self);
                    let task_key = key.clone();
                    let work = start();
                    let handle = tokio::spawn(async move {
                        let result = work.await;
                        this.settle(&task_key, generation);
                        result
                    });
                    let shared = async move {
                        handle.await.unwrap_or_else(|e| {
                            Err(Unavailable::new(
                                UnavailableReason::Broker,
                                format!("request task failed: {e}"),
                            ))
                        })
                    }
                    .boxed()
                    .shared();
                    entries.insert(key, (generation, shared.clone()));
                    shared
                }
            }
        };
        shared.await
    }

    fn settle(&self, key: &K, generation: u64) {
        let mut entries = self.entries.lock();
        if entries.get(key).is_some_and(|(g, _)| *g == generation) {
            entries.remove(key);
        }
    }

    pub fn is_pending(&self, key: &K) -> bool {
        self.entries.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Forget every entry. Running tasks finish but are no longer shared.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_run() {
        let flight: Arc<InFlight<&'static str, u32>> = InFlight::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let make = || {
            let runs = Arc::clone(&runs);
            move || async move {
                runs.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(7)
            }
        };
        let (a, b) = tokio::join!(flight.run("positions", make()), flight.run("positions", make()));
        assert_eq!(a, Ok(7));
        assert_eq!(b, Ok(7));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(flight.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn entry_cleared_after_failure() {
        let flight: Arc<InFlight<u8, u32>> = InFlight::new();
        let failed = flight
            .run(1, || async { Err(Unavailable::new(UnavailableReason::NoData, "empty")) })
            .await;
        assert!(failed.is_err());
        assert!(!flight.is_pending(&1));

        let ok = flight.run(1, || async { Ok(3) }).await;
        assert_eq!(ok, Ok(3));
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_request_still_completes() {
        let flight: Arc<InFlight<u8, u32>> = InFlight::new();
        let done = Arc::new(AtomicUsize::new(0));

        let waiter = {
            let flight = Arc::clone(&flight);
            let done = Arc::clone(&done);
            tokio::spawn(async move {
                flight
                    .run(9, move || async move {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        done.fetch_add(1, Ordering::SeqCst);
                        Ok(1)
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        waiter.abort();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert!(!flight.is_pending(&9));
    }
}
