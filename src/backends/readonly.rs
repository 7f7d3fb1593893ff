//! Read-only wrapper
//!
//! Suppresses every mutating operation on the wrapped backend while letting
//! reads pass through. CI workers (for example PR builds) use this to
//! consume a shared remote cache without polluting it; the local disk tier
//! keeps full read-write access.
//!
//! `put` and `touch` succeed silently because the compiler driver issues
//! them implicitly on every build. `clear` fails loudly: it is only ever
//! invoked by an explicit user command, and silently ignoring it would be
//! surprising.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use super::{Backend, Body, GetHit, PutReceipt};
use crate::error::{Error, Result};
use crate::keys::{ActionId, OutputId};

/// Counters for suppressed write operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadOnlyStats {
    pub puts_skipped: u64,
    pub touches_skipped: u64,
    pub clears_blocked: u64,
}

/// Decorator that turns a backend read-only.
pub struct ReadOnlyBackend {
    inner: Arc<dyn Backend>,
    puts_skipped: AtomicU64,
    touches_skipped: AtomicU64,
    clears_blocked: AtomicU64,
}

impl ReadOnlyBackend {
    pub fn new(inner: Arc<dyn Backend>) -> Self {
        Self {
            inner,
            puts_skipped: AtomicU64::new(0),
            touches_skipped: AtomicU64::new(0),
            clears_blocked: AtomicU64::new(0),
        }
    }

    /// The wrapped backend, for composition.
    pub fn unwrap(&self) -> Arc<dyn Backend> {
        self.inner.clone()
    }

    pub fn stats(&self) -> ReadOnlyStats {
        ReadOnlyStats {
            puts_skipped: self.puts_skipped.load(Ordering::Relaxed),
            touches_skipped: self.touches_skipped.load(Ordering::Relaxed),
            clears_blocked: self.clears_blocked.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl Backend for ReadOnlyBackend {
    async fn get(&self, action: &ActionId) -> Result<Option<GetHit>> {
        self.inner.get(action).await
    }

    async fn has(&self, action: &ActionId) -> Result<bool> {
        self.inner.has(action).await
    }

    async fn put(
        &self,
        _action: &ActionId,
        _output: &OutputId,
        mut body: Body,
        _size: u64,
    ) -> Result<PutReceipt> {
        self.puts_skipped.fetch_add(1, Ordering::Relaxed);
        // Drain the body so upstream producers don't block on an unread
        // stream.
        tokio::io::copy(&mut body, &mut tokio::io::sink()).await?;
        Ok(PutReceipt::default())
    }

    async fn touch(&self, _action: &ActionId) -> Result<()> {
        self.touches_skipped.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.clears_blocked.fetch_add(1, Ordering::Relaxed);
        Err(Error::ReadOnly)
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}
