//! Single-flight locking
//!
//! A locker guarantees that for a given key at most one producer runs at a
//! time. Callers that arrive while a producer is in flight wait and receive
//! the producer's result; once the producer finishes the key is released and
//! the next caller may produce again. This is single-flight plus result
//! sharing, not a memoiser: nothing is cached across release boundaries.
//!
//! Two variants:
//!
//! - [`InProcessLocker`] deduplicates within one process.
//! - [`FsLocker`] extends the guarantee across OS processes with advisory
//!   file locks. Cross-process callers are serialised but each runs its own
//!   producer; the second entrant observes the first one's side effects
//!   (typically via its own cache lookup after the lock is released).

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::config::Config;
use crate::error::{Error, Result};

mod fslock;
mod inprocess;

pub use fslock::FsLocker;
pub use inprocess::InProcessLocker;

/// The producer passed to [`Locker::do_with_lock`]. Waiters that share a
/// winner's result drop their own producer unpolled.
pub type Work<T> = BoxFuture<'static, Result<T>>;

/// Per-key single-flight execution with shared results.
#[async_trait]
pub trait Locker<T>: Send + Sync
where
    T: Clone + Send + Sync + 'static,
{
    /// Run `work` under the single-flight lock for `key`, or wait for the
    /// in-flight producer and return its result. `work` is polled zero or
    /// one times.
    async fn do_with_lock(&self, key: &str, work: Work<T>) -> Result<T>;
}

/// Build the locker named by the configuration.
pub fn from_config<T>(cfg: &Config) -> Result<Arc<dyn Locker<T>>>
where
    T: Clone + Send + Sync + 'static,
{
    match cfg.lock_type.as_str() {
        "inprocess" => Ok(Arc::new(InProcessLocker::new())),
        "fslock" => Ok(Arc::new(FsLocker::new(&cfg.lock_dir)?)),
        other => Err(Error::Config(format!("unknown lock type: {other}"))),
    }
}
