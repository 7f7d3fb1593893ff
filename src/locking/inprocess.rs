//! In-process single-flight locker
//!
//! Keeps a map from key to the shared future of the in-flight producer.
//! The first caller for a key becomes the leader: it inserts the shared
//! future, drives the producer, and removes the entry once the result is
//! delivered. Everyone who finds an existing entry awaits the same future
//! and receives the same `(value, error)` pair. Map entries exist only
//! while a producer is in flight.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;

use super::{Locker, Work};
use crate::error::{Error, Result};

type SharedFlight<T> = Shared<BoxFuture<'static, std::result::Result<T, Arc<Error>>>>;

/// Single-flight deduplication within one process.
pub struct InProcessLocker<T>
where
    T: Clone + Send + Sync + 'static,
{
    inflight: Mutex<HashMap<String, SharedFlight<T>>>,
}

impl<T> InProcessLocker<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Number of keys currently in flight.
    pub fn inflight_len(&self) -> usize {
        self.inflight.lock().len()
    }
}

impl<T> Default for InProcessLocker<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T> Locker<T> for InProcessLocker<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn do_with_lock(&self, key: &str, work: Work<T>) -> Result<T> {
        let (flight, leader) = {
            let mut inflight = self.inflight.lock();
            match inflight.get(key) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let flight = async move { work.await.map_err(Arc::new) }.boxed().shared();
                    inflight.insert(key.to_string(), flight.clone());
                    (flight, true)
                }
            }
        };

        let outcome = flight.await;

        if leader {
            self.inflight.lock().remove(key);
        }

        outcome.map_err(Error::shared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_single_caller_runs_work() {
        let locker = InProcessLocker::<u64>::new();
        let value = locker
            .do_with_lock("k", async { Ok(7) }.boxed())
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(locker.inflight_len(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_execution() {
        let locker = Arc::new(InProcessLocker::<usize>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..32 {
            let locker = locker.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                locker
                    .do_with_lock(
                        "shared",
                        async move {
                            let value = calls.fetch_add(1, Ordering::SeqCst) + 1;
                            tokio::time::sleep(Duration::from_millis(25)).await;
                            Ok(value)
                        }
                        .boxed(),
                    )
                    .await
                    .unwrap()
            }));
        }

        let mut values = Vec::new();
        for handle in handles {
            values.push(handle.await.unwrap());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1, "producer ran once");
        assert!(values.iter().all(|v| *v == values[0]));
        assert_eq!(locker.inflight_len(), 0);
    }

    #[tokio::test]
    async fn test_key_released_after_completion() {
        let locker = InProcessLocker::<usize>::new();
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let calls = calls.clone();
            locker
                .do_with_lock(
                    "k",
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(0)
                    }
                    .boxed(),
                )
                .await
                .unwrap();
        }

        // Sequential calls each produce: no caching across release cycles.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_distinct_keys_run_concurrently() {
        let locker = Arc::new(InProcessLocker::<&'static str>::new());

        let a = {
            let locker = locker.clone();
            tokio::spawn(async move {
                locker
                    .do_with_lock(
                        "a",
                        async {
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok("a")
                        }
                        .boxed(),
                    )
                    .await
                    .unwrap()
            })
        };
        let b = {
            let locker = locker.clone();
            tokio::spawn(async move {
                locker
                    .do_with_lock("b", async { Ok("b") }.boxed())
                    .await
                    .unwrap()
            })
        };

        assert_eq!(b.await.unwrap(), "b");
        assert_eq!(a.await.unwrap(), "a");
    }

    #[tokio::test]
    async fn test_errors_are_shared_with_waiters() {
        let locker = Arc::new(InProcessLocker::<usize>::new());

        let mut handles = Vec::new();
        for _ in 0..4 {
            let locker = locker.clone();
            handles.push(tokio::spawn(async move {
                locker
                    .do_with_lock(
                        "failing",
                        async {
                            tokio::time::sleep(Duration::from_millis(10)).await;
                            Err(Error::Internal("boom".to_string()))
                        }
                        .boxed(),
                    )
                    .await
            }));
        }

        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert!(err.to_string().contains("boom"));
        }
        assert_eq!(locker.inflight_len(), 0);
    }
}
