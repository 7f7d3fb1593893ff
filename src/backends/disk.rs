//! Disk backend
//!
//! Content-addressed store under a root directory. Entries are sharded by
//! the first two hex characters of their ID:
//!
//! ```text
//! <root>/<aa>/<action-hex>.a    index record: "<output-hex> <size> <nanos>"
//! <root>/<oo>/<output-hex>.o    raw object bytes
//! ```
//!
//! All writes go through temp-file + fsync + rename (see `fsutil`), so a
//! reader observes either the previous entry or the committed new one. The
//! object is renamed into place before its index record, which keeps the
//! invariant that an index record never names a partially-written object.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs;
use tracing::debug;

use super::{Backend, Body, GetHit, PutReceipt};
use crate::error::{Error, Result};
use crate::fsutil;
use crate::keys::{ActionId, OutputId};

/// Index-file suffix.
const INDEX_SUFFIX: &str = "a";
/// Object-file suffix.
const OBJECT_SUFFIX: &str = "o";

/// Content-addressed local filesystem store.
pub struct DiskBackend {
    root: PathBuf,
}

/// One parsed index record.
#[derive(Debug, Clone, PartialEq)]
struct IndexRecord {
    output_id: OutputId,
    size: u64,
    stored_at: DateTime<Utc>,
}

impl IndexRecord {
    /// Parse `<output-hex> <size> <nanos>`. Surrounding whitespace is
    /// tolerated.
    fn parse(content: &str) -> std::result::Result<Self, String> {
        let mut fields = content.split_whitespace();
        let output_hex = fields.next().ok_or_else(|| "missing output ID".to_string())?;
        let size = fields
            .next()
            .ok_or_else(|| "missing size".to_string())?
            .parse::<u64>()
            .map_err(|err| format!("bad size: {err}"))?;
        let nanos = fields
            .next()
            .ok_or_else(|| "missing timestamp".to_string())?
            .parse::<i64>()
            .map_err(|err| format!("bad timestamp: {err}"))?;
        if fields.next().is_some() {
            return Err("trailing fields".to_string());
        }
        let output_id =
            OutputId::from_hex(output_hex).ok_or_else(|| "bad output ID hex".to_string())?;
        Ok(Self {
            output_id,
            size,
            stored_at: DateTime::from_timestamp_nanos(nanos),
        })
    }

    fn encode(&self) -> String {
        format!(
            "{} {} {}\n",
            self.output_id.to_hex(),
            self.size,
            self.stored_at.timestamp_nanos_opt().unwrap_or_default()
        )
    }
}

fn shard(hex: &str) -> &str {
    hex.get(0..2).unwrap_or("xx")
}

impl DiskBackend {
    /// Open (creating if necessary) a disk store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|source| Error::IoAt {
            path: root.clone(),
            source,
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn index_path(&self, action: &ActionId) -> PathBuf {
        let hex = action.to_hex();
        self.root
            .join(shard(&hex))
            .join(format!("{hex}.{INDEX_SUFFIX}"))
    }

    fn object_path(&self, output: &OutputId) -> PathBuf {
        let hex = output.to_hex();
        self.root
            .join(shard(&hex))
            .join(format!("{hex}.{OBJECT_SUFFIX}"))
    }

    async fn read_index(&self, action: &ActionId) -> Result<Option<IndexRecord>> {
        let path = self.index_path(action);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(Error::IoAt { path, source }),
        };
        let record = IndexRecord::parse(&content)
            .map_err(|reason| Error::IndexParse { path, reason })?;
        Ok(Some(record))
    }
}

#[async_trait]
impl Backend for DiskBackend {
    async fn get(&self, action: &ActionId) -> Result<Option<GetHit>> {
        let Some(record) = self.read_index(action).await? else {
            return Ok(None);
        };
        let object = self.object_path(&record.output_id);
        let file = match fs::File::open(&object).await {
            Ok(file) => file,
            // Index orphan: the object was removed out from under us.
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(Error::IoAt { path: object, source }),
        };
        let len = file.metadata().await?.len();
        if len != record.size {
            return Err(Error::SizeMismatch {
                expected: record.size,
                actual: len,
            });
        }
        Ok(Some(GetHit {
            output_id: record.output_id,
            size: record.size,
            stored_at: record.stored_at,
            body: Box::new(file),
            disk_path: Some(object),
        }))
    }

    async fn has(&self, action: &ActionId) -> Result<bool> {
        match fs::metadata(self.index_path(action)).await {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn put(
        &self,
        action: &ActionId,
        output: &OutputId,
        body: Body,
        size: u64,
    ) -> Result<PutReceipt> {
        let object = self.object_path(output);
        fsutil::write_stream_atomic(&object, body, size).await?;

        let record = IndexRecord {
            output_id: output.clone(),
            size,
            stored_at: Utc::now(),
        };
        fsutil::write_bytes_atomic(&self.index_path(action), record.encode().as_bytes()).await?;

        debug!(action = %action, output = %output, size, "stored cache entry");
        Ok(PutReceipt {
            disk_path: Some(object),
        })
    }

    async fn touch(&self, action: &ActionId) -> Result<()> {
        // Rewriting the record with a fresh timestamp refreshes both mtime
        // and the recorded store time. A missing entry stays missing.
        let Some(mut record) = self.read_index(action).await? else {
            return Ok(());
        };
        record.stored_at = Utc::now();
        fsutil::write_bytes_atomic(&self.index_path(action), record.encode().as_bytes()).await
    }

    async fn clear(&self) -> Result<()> {
        match fs::remove_dir_all(&self.root).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(Error::IoAt {
                    path: self.root.clone(),
                    source,
                })
            }
        }
        fs::create_dir_all(&self.root).await.map_err(|source| Error::IoAt {
            path: self.root.clone(),
            source,
        })
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn body_of(bytes: &'static [u8]) -> Body {
        Box::new(std::io::Cursor::new(bytes))
    }

    async fn read_body(mut body: Body) -> Vec<u8> {
        let mut buf = Vec::new();
        body.read_to_end(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = DiskBackend::new(dir.path()).unwrap();
        let action = ActionId::new(vec![0x01]);
        let output = OutputId::new(vec![0xaa]);

        backend
            .put(&action, &output, body_of(b"hello"), 5)
            .await
            .unwrap();

        let hit = backend.get(&action).await.unwrap().unwrap();
        assert_eq!(hit.output_id, output);
        assert_eq!(hit.size, 5);
        assert!(hit.disk_path.is_some());
        assert_eq!(read_body(hit.body).await, b"hello");
        assert!(backend.has(&action).await.unwrap());
    }

    #[tokio::test]
    async fn test_get_miss() {
        let dir = tempfile::tempdir().unwrap();
        let backend = DiskBackend::new(dir.path()).unwrap();

        let miss = backend.get(&ActionId::new(vec![0xff])).await.unwrap();
        assert!(miss.is_none());
        assert!(!backend.has(&ActionId::new(vec![0xff])).await.unwrap());
    }

    #[tokio::test]
    async fn test_index_orphan_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let backend = DiskBackend::new(dir.path()).unwrap();
        let action = ActionId::new(vec![0x02]);
        let output = OutputId::new(vec![0xbb]);

        backend
            .put(&action, &output, body_of(b"data"), 4)
            .await
            .unwrap();
        fs::remove_file(backend.object_path(&output)).await.unwrap();

        assert!(backend.get(&action).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_short_body_leaves_no_entry() {
        let dir = tempfile::tempdir().unwrap();
        let backend = DiskBackend::new(dir.path()).unwrap();
        let action = ActionId::new(vec![0x03]);
        let output = OutputId::new(vec![0xcc]);

        let err = backend
            .put(&action, &output, body_of(b"ab"), 10)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SizeMismatch { .. }));

        assert!(!backend.has(&action).await.unwrap());
        assert!(backend.get(&action).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_touch_refreshes_existing_entry() {
        let dir = tempfile::tempdir().unwrap();
        let backend = DiskBackend::new(dir.path()).unwrap();
        let action = ActionId::new(vec![0x04]);
        let output = OutputId::new(vec![0xdd]);

        backend
            .put(&action, &output, body_of(b"x"), 1)
            .await
            .unwrap();
        let before = backend.read_index(&action).await.unwrap().unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        backend.touch(&action).await.unwrap();

        let after = backend.read_index(&action).await.unwrap().unwrap();
        assert_eq!(after.output_id, before.output_id);
        assert_eq!(after.size, before.size);
        assert!(after.stored_at > before.stored_at);
    }

    #[tokio::test]
    async fn test_touch_missing_does_not_fabricate() {
        let dir = tempfile::tempdir().unwrap();
        let backend = DiskBackend::new(dir.path()).unwrap();
        let action = ActionId::new(vec![0x05]);

        backend.touch(&action).await.unwrap();
        assert!(!backend.has(&action).await.unwrap());
    }

    #[tokio::test]
    async fn test_clear_then_roundtrip_again() {
        let dir = tempfile::tempdir().unwrap();
        let backend = DiskBackend::new(dir.path()).unwrap();
        let action = ActionId::new(vec![0x06]);
        let output = OutputId::new(vec![0xee]);

        backend
            .put(&action, &output, body_of(b"one"), 3)
            .await
            .unwrap();
        backend.clear().await.unwrap();

        assert!(!backend.has(&action).await.unwrap());
        assert!(backend.get(&action).await.unwrap().is_none());

        backend
            .put(&action, &output, body_of(b"two"), 3)
            .await
            .unwrap();
        let hit = backend.get(&action).await.unwrap().unwrap();
        assert_eq!(read_body(hit.body).await, b"two");
    }

    #[tokio::test]
    async fn test_shared_output_across_actions() {
        let dir = tempfile::tempdir().unwrap();
        let backend = DiskBackend::new(dir.path()).unwrap();
        let output = OutputId::new(vec![0x99]);

        backend
            .put(&ActionId::new(vec![0x11]), &output, body_of(b"obj"), 3)
            .await
            .unwrap();
        backend
            .put(&ActionId::new(vec![0x22]), &output, body_of(b"obj"), 3)
            .await
            .unwrap();

        let hit1 = backend.get(&ActionId::new(vec![0x11])).await.unwrap().unwrap();
        let hit2 = backend.get(&ActionId::new(vec![0x22])).await.unwrap().unwrap();
        assert_eq!(hit1.disk_path, hit2.disk_path);
    }

    #[tokio::test]
    async fn test_concurrent_get_sees_old_or_new_value() {
        let dir = tempfile::tempdir().unwrap();
        let backend = std::sync::Arc::new(DiskBackend::new(dir.path()).unwrap());
        let action = ActionId::new(vec![0x42]);

        backend
            .put(&action, &OutputId::new(vec![0x01]), body_of(b"aaaa"), 4)
            .await
            .unwrap();

        let writer = {
            let backend = backend.clone();
            let action = action.clone();
            tokio::spawn(async move {
                for _ in 0..50 {
                    backend
                        .put(&action, &OutputId::new(vec![0x02]), body_of(b"bbbb"), 4)
                        .await
                        .unwrap();
                }
            })
        };

        for _ in 0..50 {
            let hit = backend.get(&action).await.unwrap().unwrap();
            let bytes = read_body(hit.body).await;
            assert!(bytes == b"aaaa" || bytes == b"bbbb", "torn read: {bytes:?}");
        }
        writer.await.unwrap();
    }

    #[test]
    fn test_index_record_parse_tolerates_whitespace() {
        let record = IndexRecord::parse("aabb 12 1700000000000000000  \n").unwrap();
        assert_eq!(record.output_id, OutputId::new(vec![0xaa, 0xbb]));
        assert_eq!(record.size, 12);
    }

    #[test]
    fn test_index_record_parse_rejects_garbage() {
        assert!(IndexRecord::parse("").is_err());
        assert!(IndexRecord::parse("aabb").is_err());
        assert!(IndexRecord::parse("aabb twelve 0").is_err());
        assert!(IndexRecord::parse("zz 1 0").is_err());
        assert!(IndexRecord::parse("aabb 1 0 extra").is_err());
    }

    #[test]
    fn test_index_record_encode_parse_roundtrip() {
        let record = IndexRecord {
            output_id: OutputId::new(vec![0x0f, 0xf0]),
            size: 1234,
            stored_at: DateTime::from_timestamp_nanos(1_700_000_000_123_456_789),
        };
        assert_eq!(IndexRecord::parse(&record.encode()).unwrap(), record);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(24))]

            #[test]
            fn prop_roundtrip(
                action in proptest::collection::vec(any::<u8>(), 1..16),
                output in proptest::collection::vec(any::<u8>(), 1..16),
                data in proptest::collection::vec(any::<u8>(), 0..4096),
            ) {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .unwrap();
                rt.block_on(async move {
                    let dir = tempfile::tempdir().unwrap();
                    let backend = DiskBackend::new(dir.path()).unwrap();
                    let action = ActionId::new(action);
                    let output = OutputId::new(output);
                    let size = data.len() as u64;

                    backend
                        .put(&action, &output, Box::new(std::io::Cursor::new(data.clone())), size)
                        .await
                        .unwrap();

                    let hit = backend.get(&action).await.unwrap().unwrap();
                    assert_eq!(hit.output_id, output);
                    assert_eq!(hit.size, size);
                    assert_eq!(read_body(hit.body).await, data);
                    assert!(backend.has(&action).await.unwrap());
                });
            }

            #[test]
            fn prop_index_record_roundtrip(
                output in proptest::collection::vec(any::<u8>(), 1..32),
                size in any::<u64>(),
                nanos in -1_000_000_000_000_000_000i64..2_000_000_000_000_000_000,
            ) {
                let record = IndexRecord {
                    output_id: OutputId::new(output),
                    size,
                    stored_at: DateTime::from_timestamp_nanos(nanos),
                };
                prop_assert_eq!(IndexRecord::parse(&record.encode()).unwrap(), record);
            }
        }
    }
}
