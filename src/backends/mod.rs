//! Cache backends
//!
//! A backend owns the byte storage for cache entries: the index record
//! binding an action to an output plus metadata, and the object holding the
//! output's raw bytes.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      Protocol Engine                          │
//! └──────────────────────────────┬───────────────────────────────┘
//!                                │ Arc<dyn Backend>
//!            ┌───────────────────┼───────────────────┐
//!            ▼                   ▼                   ▼
//!     ┌────────────┐     ┌──────────────┐    ┌──────────────┐
//!     │ DiskBackend│     │TieredBackend │    │ReadOnly(inner)│
//!     │  (local)   │     │ disk + s3    │    │ wrapper       │
//!     └────────────┘     └──────────────┘    └──────────────┘
//!                          │          │
//!                          ▼          ▼
//!                    DiskBackend   S3Backend
//! ```
//!
//! Backends are safe for concurrent use; bodies are finite byte streams of
//! known length, consumed or released exactly once.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::AsyncRead;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::keys::{ActionId, OutputId};

mod disk;
mod memory;
mod readonly;
mod s3;
mod tiered;

pub use disk::DiskBackend;
pub use memory::{MemoryBackend, MemoryStats};
pub use readonly::{ReadOnlyBackend, ReadOnlyStats};
pub use s3::S3Backend;
pub use tiered::{TieredBackend, TieredStats};

/// Streaming object body of known length.
pub type Body = Box<dyn AsyncRead + Send + Unpin>;

/// A successful cache lookup.
pub struct GetHit {
    /// Output the action resolves to
    pub output_id: OutputId,
    /// Object size in bytes; `body` yields exactly this many
    pub size: u64,
    /// When the entry was stored
    pub stored_at: DateTime<Utc>,
    /// The object bytes
    pub body: Body,
    /// Local file holding the object, when the backend materialises one.
    /// The protocol engine hands this path to the compiler driver directly.
    pub disk_path: Option<PathBuf>,
}

impl std::fmt::Debug for GetHit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GetHit")
            .field("output_id", &self.output_id)
            .field("size", &self.size)
            .field("stored_at", &self.stored_at)
            .field("disk_path", &self.disk_path)
            .finish()
    }
}

/// Result of a committed Put.
#[derive(Debug, Clone, Default)]
pub struct PutReceipt {
    /// Local file the object landed in, when the backend materialises one
    pub disk_path: Option<PathBuf>,
}

/// Uniform operations over cache entries.
///
/// A miss is `Ok(None)` / `Ok(false)`, never an error. A failed `put` must
/// leave the backend in its pre-put state; partial entries are never
/// observable.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Look up the entry for `action`.
    async fn get(&self, action: &ActionId) -> Result<Option<GetHit>>;

    /// Cheap existence probe; does not materialise the body.
    async fn has(&self, action: &ActionId) -> Result<bool>;

    /// Store `size` bytes of `body` as the object for `output` and bind
    /// `action` to it. Discoverable by `get`/`has` only after commit.
    async fn put(
        &self,
        action: &ActionId,
        output: &OutputId,
        body: Body,
        size: u64,
    ) -> Result<PutReceipt>;

    /// Refresh the entry's recency for external LRU policies. Touching a
    /// missing key is a silent no-op; it never fabricates an entry.
    async fn touch(&self, action: &ActionId) -> Result<()>;

    /// Delete every entry.
    async fn clear(&self) -> Result<()>;

    /// Release backend resources. Idempotent.
    async fn close(&self) -> Result<()>;
}

/// Build the backend composition described by the configuration.
///
/// With `read_only` set, single backends are wrapped whole; in the tiered
/// composition only the remote tier is wrapped, so the local disk cache
/// keeps operating read-write while the shared cache stays pristine.
pub async fn from_config(cfg: &Config) -> Result<Arc<dyn Backend>> {
    match cfg.backend_type.as_str() {
        "disk" => Ok(wrap_if_read_only(
            cfg,
            Arc::new(DiskBackend::new(&cfg.cache_dir)?),
        )),
        "memory" => Ok(wrap_if_read_only(cfg, Arc::new(MemoryBackend::new()))),
        "s3" => Ok(wrap_if_read_only(cfg, Arc::new(connect_s3(cfg).await?))),
        "disk+s3" | "tiered" => {
            let local: Arc<dyn Backend> = Arc::new(DiskBackend::new(&cfg.cache_dir)?);
            let mut remote: Arc<dyn Backend> = Arc::new(connect_s3(cfg).await?);
            if cfg.read_only {
                remote = Arc::new(ReadOnlyBackend::new(remote));
            }
            Ok(Arc::new(TieredBackend::new(local, remote)))
        }
        other => Err(Error::Config(format!("unknown backend type: {other}"))),
    }
}

fn wrap_if_read_only(cfg: &Config, backend: Arc<dyn Backend>) -> Arc<dyn Backend> {
    if cfg.read_only {
        Arc::new(ReadOnlyBackend::new(backend))
    } else {
        backend
    }
}

async fn connect_s3(cfg: &Config) -> Result<S3Backend> {
    if cfg.s3_bucket.is_empty() {
        return Err(Error::Config(
            "S3_BUCKET must be set for the s3 backend".to_string(),
        ));
    }
    let region = if cfg.s3_region.is_empty() {
        None
    } else {
        Some(cfg.s3_region.clone())
    };
    S3Backend::connect(&cfg.s3_bucket, &cfg.s3_prefix, region).await
}
