//! Filesystem locker
//!
//! Extends single-flight across OS processes with an exclusive advisory
//! lock on `<lock-dir>/<key>.lock`. An in-process locker is layered on top
//! of the same key so that N local callers cost one syscall round-trip, not
//! N. Keys are hex strings (action IDs), which keeps the lock-file names
//! path-safe.
//!
//! Across processes the guarantee is serialisation, not result sharing: a
//! process that waited for the lock runs its own producer and is expected to
//! observe the previous holder's side effects through the backend.

use std::fs::OpenOptions;
use std::path::PathBuf;

use async_trait::async_trait;
use fs4::FileExt;
use futures::FutureExt;
use tracing::trace;

use super::{InProcessLocker, Locker, Work};
use crate::error::{Error, Result};

/// Cross-process single-flight via advisory file locks.
pub struct FsLocker<T>
where
    T: Clone + Send + Sync + 'static,
{
    inner: InProcessLocker<T>,
    lock_dir: PathBuf,
}

impl<T> FsLocker<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a locker rooted at `lock_dir`, creating the directory if
    /// needed.
    pub fn new(lock_dir: impl Into<PathBuf>) -> Result<Self> {
        let lock_dir = lock_dir.into();
        std::fs::create_dir_all(&lock_dir).map_err(|source| Error::LockFile {
            path: lock_dir.clone(),
            source,
        })?;
        Ok(Self {
            inner: InProcessLocker::new(),
            lock_dir,
        })
    }

    fn lock_path(&self, key: &str) -> PathBuf {
        self.lock_dir.join(format!("{key}.lock"))
    }
}

/// Open the lock file and block until the exclusive lock is held. Runs on
/// the blocking pool because `flock` suspends the calling thread.
async fn acquire(path: PathBuf) -> Result<std::fs::File> {
    tokio::task::spawn_blocking(move || {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| Error::LockFile {
                path: path.clone(),
                source,
            })?;
        file.lock_exclusive().map_err(|source| Error::LockFile {
            path: path.clone(),
            source,
        })?;
        Ok(file)
    })
    .await
    .map_err(|err| Error::Internal(format!("lock acquisition task failed: {err}")))?
}

#[async_trait]
impl<T> Locker<T> for FsLocker<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn do_with_lock(&self, key: &str, work: Work<T>) -> Result<T> {
        let path = self.lock_path(key);
        let guarded = async move {
            trace!(path = %path.display(), "acquiring advisory lock");
            let lock_file = acquire(path).await?;
            let outcome = work.await;
            // Closing the descriptor releases the advisory lock on every
            // exit path, including unwinds.
            drop(lock_file);
            outcome
        }
        .boxed();
        self.inner.do_with_lock(key, guarded).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_runs_work_and_releases_lock() {
        let dir = tempfile::tempdir().unwrap();
        let locker = FsLocker::<u64>::new(dir.path()).unwrap();

        let value = locker
            .do_with_lock("0a", async { Ok(1) }.boxed())
            .await
            .unwrap();
        assert_eq!(value, 1);

        // A second cycle on the same key must be able to re-acquire.
        let value = locker
            .do_with_lock("0a", async { Ok(2) }.boxed())
            .await
            .unwrap();
        assert_eq!(value, 2);

        assert!(dir.path().join("0a.lock").exists());
    }

    #[tokio::test]
    async fn test_local_callers_are_deduplicated() {
        let dir = tempfile::tempdir().unwrap();
        let locker = Arc::new(FsLocker::<usize>::new(dir.path()).unwrap());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locker = locker.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                locker
                    .do_with_lock(
                        "42",
                        async move {
                            let value = calls.fetch_add(1, Ordering::SeqCst) + 1;
                            tokio::time::sleep(Duration::from_millis(20)).await;
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
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(values.iter().all(|v| *v == values[0]));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_separate_instances_are_serialised() {
        let dir = tempfile::tempdir().unwrap();
        let locker_a = Arc::new(FsLocker::<()>::new(dir.path()).unwrap());
        let locker_b = Arc::new(FsLocker::<()>::new(dir.path()).unwrap());
        let held = Arc::new(AtomicBool::new(false));
        let overlapped = Arc::new(AtomicBool::new(false));

        let task = |locker: Arc<FsLocker<()>>,
                    held: Arc<AtomicBool>,
                    overlapped: Arc<AtomicBool>| {
            tokio::spawn(async move {
                locker
                    .do_with_lock(
                        "7f",
                        async move {
                            if held.swap(true, Ordering::SeqCst) {
                                overlapped.store(true, Ordering::SeqCst);
                            }
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            held.store(false, Ordering::SeqCst);
                            Ok(())
                        }
                        .boxed(),
                    )
                    .await
                    .unwrap()
            })
        };

        let a = task(locker_a, held.clone(), overlapped.clone());
        let b = task(locker_b, held.clone(), overlapped.clone());
        a.await.unwrap();
        b.await.unwrap();

        assert!(
            !overlapped.load(Ordering::SeqCst),
            "critical sections overlapped across locker instances"
        );
    }

    #[tokio::test]
    async fn test_work_error_propagates_and_lock_releases() {
        let dir = tempfile::tempdir().unwrap();
        let locker = FsLocker::<u64>::new(dir.path()).unwrap();

        let err = locker
            .do_with_lock(
                "ee",
                async { Err(Error::Internal("nope".to_string())) }.boxed(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("nope"));

        // Lock must be free again.
        let value = locker
            .do_with_lock("ee", async { Ok(3) }.boxed())
            .await
            .unwrap();
        assert_eq!(value, 3);
    }
}
