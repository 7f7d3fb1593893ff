//! Tiered backend
//!
//! Layers a fast local backend in front of a slow remote one:
//!
//! - `get` consults the local tier first; a remote hit is filled into the
//!   local tier and then served from it, so the driver always receives a
//!   local disk path. Remote failures degrade to a miss.
//! - `put` commits to the local tier synchronously and enqueues a bounded
//!   write-through upload to the remote tier. The queue never blocks the
//!   caller: on overflow the upload is dropped and counted. The uploader
//!   re-reads the entry from the local tier, so no body is duplicated.
//! - `touch` is local-only; `clear` and `close` hit both tiers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{Backend, Body, GetHit, PutReceipt};
use crate::error::Result;
use crate::keys::{ActionId, OutputId};

/// Maximum outstanding write-through uploads.
const UPLOAD_QUEUE_DEPTH: usize = 128;

struct UploadJob {
    action: ActionId,
}

/// Counters for the background behaviours, readable by tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TieredStats {
    /// Write-through uploads dropped because the queue was full
    pub uploads_dropped: u64,
    /// Remote hits filled into the local tier
    pub local_fills: u64,
}

/// Local + remote composition with asynchronous write-through.
pub struct TieredBackend {
    local: Arc<dyn Backend>,
    remote: Arc<dyn Backend>,
    uploads: Mutex<Option<mpsc::Sender<UploadJob>>>,
    uploader: Mutex<Option<JoinHandle<()>>>,
    uploads_dropped: AtomicU64,
    local_fills: AtomicU64,
}

impl TieredBackend {
    /// Compose `local` and `remote` and start the write-through worker.
    /// Must be called from within a tokio runtime.
    pub fn new(local: Arc<dyn Backend>, remote: Arc<dyn Backend>) -> Self {
        let (tx, mut rx) = mpsc::channel::<UploadJob>(UPLOAD_QUEUE_DEPTH);
        let worker_local = local.clone();
        let worker_remote = remote.clone();
        let uploader = tokio::spawn(async move {
            while let Some(UploadJob { action }) = rx.recv().await {
                match worker_local.get(&action).await {
                    Ok(Some(hit)) => {
                        let GetHit {
                            output_id,
                            size,
                            body,
                            ..
                        } = hit;
                        if let Err(err) =
                            worker_remote.put(&action, &output_id, body, size).await
                        {
                            warn!(action = %action, error = %err, "write-through upload failed");
                        } else {
                            debug!(action = %action, size, "write-through upload complete");
                        }
                    }
                    // Entry vanished (e.g. clear) before the upload ran.
                    Ok(None) => {}
                    Err(err) => {
                        warn!(action = %action, error = %err, "write-through read-back failed")
                    }
                }
            }
        });

        Self {
            local,
            remote,
            uploads: Mutex::new(Some(tx)),
            uploader: Mutex::new(Some(uploader)),
            uploads_dropped: AtomicU64::new(0),
            local_fills: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> TieredStats {
        TieredStats {
            uploads_dropped: self.uploads_dropped.load(Ordering::Relaxed),
            local_fills: self.local_fills.load(Ordering::Relaxed),
        }
    }

    fn enqueue_upload(&self, action: ActionId) {
        let sender = self.uploads.lock().clone();
        let Some(sender) = sender else {
            // Already closed; late puts simply skip the remote tier.
            return;
        };
        if let Err(mpsc::error::TrySendError::Full(job)) = sender.try_send(UploadJob { action }) {
            self.uploads_dropped.fetch_add(1, Ordering::Relaxed);
            warn!(action = %job.action, "write-through queue full, dropping upload");
        }
    }
}

#[async_trait]
impl Backend for TieredBackend {
    async fn get(&self, action: &ActionId) -> Result<Option<GetHit>> {
        if let Some(hit) = self.local.get(action).await? {
            return Ok(Some(hit));
        }

        match self.remote.get(action).await {
            Ok(Some(hit)) => {
                let GetHit {
                    output_id,
                    size,
                    body,
                    ..
                } = hit;
                if let Err(err) = self.local.put(action, &output_id, body, size).await {
                    warn!(action = %action, error = %err, "local fill failed, serving remote copy");
                    return self.remote.get(action).await.or(Ok(None));
                }
                self.local_fills.fetch_add(1, Ordering::Relaxed);
                self.local.get(action).await
            }
            Ok(None) => Ok(None),
            Err(err) => {
                // A broken remote tier must not fail local builds.
                warn!(action = %action, error = %err, "remote get failed, degrading to miss");
                Ok(None)
            }
        }
    }

    async fn has(&self, action: &ActionId) -> Result<bool> {
        if self.local.has(action).await? {
            return Ok(true);
        }
        self.remote.has(action).await
    }

    async fn put(
        &self,
        action: &ActionId,
        output: &OutputId,
        body: Body,
        size: u64,
    ) -> Result<PutReceipt> {
        let receipt = self.local.put(action, output, body, size).await?;
        self.enqueue_upload(action.clone());
        Ok(receipt)
    }

    async fn touch(&self, action: &ActionId) -> Result<()> {
        self.local.touch(action).await
    }

    async fn clear(&self) -> Result<()> {
        let local = self.local.clear().await;
        let remote = self.remote.clear().await;
        local?;
        remote
    }

    async fn close(&self) -> Result<()> {
        // Drop the sender so the uploader drains its queue and exits.
        let sender = self.uploads.lock().take();
        drop(sender);
        let uploader = self.uploader.lock().take();
        if let Some(handle) = uploader {
            let _ = handle.await;
        }
        let local = self.local.close().await;
        let remote = self.remote.close().await;
        local?;
        remote
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryBackend;
    use tokio::io::AsyncReadExt;

    fn body_of(bytes: &'static [u8]) -> Body {
        Box::new(std::io::Cursor::new(bytes))
    }

    async fn read_body(mut body: Body) -> Vec<u8> {
        let mut buf = Vec::new();
        body.read_to_end(&mut buf).await.unwrap();
        buf
    }

    fn tiers() -> (Arc<MemoryBackend>, Arc<MemoryBackend>, TieredBackend) {
        let local = Arc::new(MemoryBackend::new());
        let remote = Arc::new(MemoryBackend::new());
        let tiered = TieredBackend::new(local.clone(), remote.clone());
        (local, remote, tiered)
    }

    #[tokio::test]
    async fn test_put_writes_through_to_remote() {
        let (local, remote, tiered) = tiers();
        let action = ActionId::new(vec![0x01]);
        let output = OutputId::new(vec![0xaa]);

        tiered
            .put(&action, &output, body_of(b"hello"), 5)
            .await
            .unwrap();

        assert!(local.has(&action).await.unwrap());
        // close() drains the upload queue.
        tiered.close().await.unwrap();
        assert!(remote.has(&action).await.unwrap());
    }

    #[tokio::test]
    async fn test_remote_hit_fills_local() {
        let (local, remote, tiered) = tiers();
        let action = ActionId::new(vec![0x02]);
        let output = OutputId::new(vec![0xbb]);

        remote
            .put(&action, &output, body_of(b"warm"), 4)
            .await
            .unwrap();
        assert!(!local.has(&action).await.unwrap());

        let hit = tiered.get(&action).await.unwrap().unwrap();
        assert_eq!(read_body(hit.body).await, b"warm");

        assert!(local.has(&action).await.unwrap());
        assert_eq!(tiered.stats().local_fills, 1);
    }

    #[tokio::test]
    async fn test_local_hit_skips_remote() {
        let (local, remote, tiered) = tiers();
        let action = ActionId::new(vec![0x03]);
        let output = OutputId::new(vec![0xcc]);

        local
            .put(&action, &output, body_of(b"fast"), 4)
            .await
            .unwrap();
        let remote_gets_before = remote.stats().gets;

        let hit = tiered.get(&action).await.unwrap().unwrap();
        assert_eq!(read_body(hit.body).await, b"fast");
        assert_eq!(remote.stats().gets, remote_gets_before);
    }

    #[tokio::test]
    async fn test_miss_on_both_tiers() {
        let (_, _, tiered) = tiers();
        assert!(tiered.get(&ActionId::new(vec![0xff])).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_touch_is_local_only() {
        let (_, remote, tiered) = tiers();
        tiered.touch(&ActionId::new(vec![0x04])).await.unwrap();
        assert_eq!(remote.stats().touches, 0);
    }

    #[tokio::test]
    async fn test_clear_hits_both_tiers() {
        let (local, remote, tiered) = tiers();
        let action = ActionId::new(vec![0x05]);
        let output = OutputId::new(vec![0xdd]);

        local.put(&action, &output, body_of(b"l"), 1).await.unwrap();
        remote.put(&action, &output, body_of(b"r"), 1).await.unwrap();

        tiered.clear().await.unwrap();
        assert!(local.is_empty());
        assert!(remote.is_empty());
    }

    #[tokio::test]
    async fn test_put_after_close_stays_local() {
        let (local, remote, tiered) = tiers();
        tiered.close().await.unwrap();

        let action = ActionId::new(vec![0x06]);
        tiered
            .put(&action, &OutputId::new(vec![0xee]), body_of(b"x"), 1)
            .await
            .unwrap();

        assert!(local.has(&action).await.unwrap());
        assert!(!remote.has(&action).await.unwrap());
    }
}
