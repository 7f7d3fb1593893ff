//! S3 object-store backend
//!
//! Keys under the configured prefix:
//!
//! ```text
//! <prefix>/a/<action-hex>   index record (small JSON document)
//! <prefix>/o/<output-hex>   raw object bytes
//! ```
//!
//! The index record is written only after the object upload commits, so a
//! reader never finds an index naming an absent object (short of external
//! deletion, which `get` treats as a miss). Uploads stream from a spool
//! file and downloads stream through the SDK byte stream; objects are never
//! held in memory whole.
//!
//! Transient transport errors (connection resets, 5xx, throttling) are
//! retried by the SDK's standard retry mode, configured at client
//! construction; what surfaces here has already exhausted its retries.

use aws_config::retry::RetryConfig;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{Delete, ObjectIdentifier};
use aws_sdk_s3::Client;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, trace};

use super::{Backend, Body, GetHit, PutReceipt};
use crate::error::{Error, Result};
use crate::keys::{ActionId, OutputId};

/// Upper bound on SDK attempts per operation.
const MAX_ATTEMPTS: u32 = 5;

/// Index record stored under the `a/` key space.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RemoteIndex {
    output_id: String,
    size: u64,
    stored_at: DateTime<Utc>,
}

/// Object-storage-backed store.
pub struct S3Backend {
    client: Client,
    bucket: String,
    /// Normalised to either empty or `…/`-terminated.
    prefix: String,
}

impl S3Backend {
    /// Connect using the ambient AWS credential chain.
    pub async fn connect(
        bucket: impl Into<String>,
        prefix: impl Into<String>,
        region: Option<String>,
    ) -> Result<Self> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .retry_config(RetryConfig::standard().with_max_attempts(MAX_ATTEMPTS));
        if let Some(region) = region {
            loader = loader.region(Region::new(region));
        }
        let shared = loader.load().await;
        Ok(Self::with_client(Client::new(&shared), bucket, prefix))
    }

    /// Build from an existing client (used against S3-compatible endpoints).
    pub fn with_client(
        client: Client,
        bucket: impl Into<String>,
        prefix: impl Into<String>,
    ) -> Self {
        let mut prefix = prefix.into();
        while prefix.ends_with('/') {
            prefix.pop();
        }
        if !prefix.is_empty() {
            prefix.push('/');
        }
        Self {
            client,
            bucket: bucket.into(),
            prefix,
        }
    }

    fn index_key(&self, action: &ActionId) -> String {
        format!("{}a/{}", self.prefix, action.to_hex())
    }

    fn object_key(&self, output: &OutputId) -> String {
        format!("{}o/{}", self.prefix, output.to_hex())
    }

    async fn read_index(&self, action: &ActionId) -> Result<Option<RemoteIndex>> {
        let response = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.index_key(action))
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                if err
                    .as_service_error()
                    .is_some_and(|svc| svc.is_no_such_key())
                {
                    return Ok(None);
                }
                return Err(Error::Remote {
                    op: "get index",
                    message: format!("{}", DisplayErrorContext(&err)),
                });
            }
        };
        let bytes = response
            .body
            .collect()
            .await
            .map_err(|err| Error::Remote {
                op: "read index",
                message: err.to_string(),
            })?
            .into_bytes();
        Ok(Some(serde_json::from_slice(&bytes)?))
    }
}

#[async_trait]
impl Backend for S3Backend {
    async fn get(&self, action: &ActionId) -> Result<Option<GetHit>> {
        let Some(index) = self.read_index(action).await? else {
            return Ok(None);
        };
        let output_id = OutputId::from_hex(&index.output_id).ok_or_else(|| Error::Remote {
            op: "decode index",
            message: format!("bad output ID hex: {}", index.output_id),
        })?;

        let response = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.object_key(&output_id))
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                // Index orphan: object deleted externally.
                if err
                    .as_service_error()
                    .is_some_and(|svc| svc.is_no_such_key())
                {
                    return Ok(None);
                }
                return Err(Error::Remote {
                    op: "get object",
                    message: format!("{}", DisplayErrorContext(&err)),
                });
            }
        };

        Ok(Some(GetHit {
            output_id,
            size: index.size,
            stored_at: index.stored_at,
            body: Box::new(response.body.into_async_read()),
            disk_path: None,
        }))
    }

    async fn has(&self, action: &ActionId) -> Result<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.index_key(action))
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) => {
                if err
                    .as_service_error()
                    .is_some_and(|svc| svc.is_not_found())
                {
                    return Ok(false);
                }
                Err(Error::Remote {
                    op: "head index",
                    message: format!("{}", DisplayErrorContext(&err)),
                })
            }
        }
    }

    async fn put(
        &self,
        action: &ActionId,
        output: &OutputId,
        body: Body,
        size: u64,
    ) -> Result<PutReceipt> {
        // Spool to disk so the SDK gets a replayable, seekable body without
        // the object ever sitting in memory.
        let spool = tempfile::NamedTempFile::new()?;
        let mut file = tokio::fs::File::from_std(spool.reopen()?);
        let mut limited = body.take(size);
        let copied = tokio::io::copy(&mut limited, &mut file).await?;
        if copied != size {
            return Err(Error::SizeMismatch {
                expected: size,
                actual: copied,
            });
        }
        file.flush().await?;
        file.rewind().await?;
        drop(file);

        let stream = ByteStream::from_path(spool.path())
            .await
            .map_err(|err| Error::Remote {
                op: "open upload spool",
                message: err.to_string(),
            })?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.object_key(output))
            .content_length(size as i64)
            .body(stream)
            .send()
            .await
            .map_err(|err| Error::Remote {
                op: "put object",
                message: format!("{}", DisplayErrorContext(&err)),
            })?;

        // Index record goes last; until it lands the entry is invisible.
        let index = RemoteIndex {
            output_id: output.to_hex(),
            size,
            stored_at: Utc::now(),
        };
        let json = serde_json::to_vec(&index)?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.index_key(action))
            .body(ByteStream::from(bytes::Bytes::from(json)))
            .send()
            .await
            .map_err(|err| Error::Remote {
                op: "put index",
                message: format!("{}", DisplayErrorContext(&err)),
            })?;

        debug!(action = %action, output = %output, size, "uploaded cache entry");
        Ok(PutReceipt::default())
    }

    async fn touch(&self, action: &ActionId) -> Result<()> {
        // Object stores have no cheap mtime refresh; recency policies on the
        // bucket side key off last access instead.
        trace!(action = %action, "touch is a no-op on the s3 backend");
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let mut token: Option<String> = None;
        loop {
            let mut request = self.client.list_objects_v2().bucket(&self.bucket);
            if !self.prefix.is_empty() {
                request = request.prefix(&self.prefix);
            }
            let page = request
                .set_continuation_token(token.take())
                .send()
                .await
                .map_err(|err| Error::Remote {
                    op: "list",
                    message: format!("{}", DisplayErrorContext(&err)),
                })?;

            let identifiers = page
                .contents()
                .iter()
                .filter_map(|object| object.key())
                .map(|key| ObjectIdentifier::builder().key(key).build())
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|err| Error::Remote {
                    op: "build delete batch",
                    message: err.to_string(),
                })?;

            if !identifiers.is_empty() {
                let delete = Delete::builder()
                    .set_objects(Some(identifiers))
                    .quiet(true)
                    .build()
                    .map_err(|err| Error::Remote {
                        op: "build delete batch",
                        message: err.to_string(),
                    })?;
                self.client
                    .delete_objects()
                    .bucket(&self.bucket)
                    .delete(delete)
                    .send()
                    .await
                    .map_err(|err| Error::Remote {
                        op: "delete batch",
                        message: format!("{}", DisplayErrorContext(&err)),
                    })?;
            }

            if page.is_truncated().unwrap_or(false) {
                token = page.next_continuation_token().map(str::to_string);
            } else {
                return Ok(());
            }
        }
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend_with_prefix(prefix: &str) -> S3Backend {
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .build();
        S3Backend::with_client(Client::from_conf(config), "bucket", prefix)
    }

    #[test]
    fn test_key_layout() {
        let backend = backend_with_prefix("team/cache");
        let action = ActionId::new(vec![0x01, 0x02]);
        let output = OutputId::new(vec![0xaa]);

        assert_eq!(backend.index_key(&action), "team/cache/a/0102");
        assert_eq!(backend.object_key(&output), "team/cache/o/aa");
    }

    #[test]
    fn test_prefix_normalisation() {
        assert_eq!(
            backend_with_prefix("p///").index_key(&ActionId::new(vec![0x01])),
            "p/a/01"
        );
        assert_eq!(
            backend_with_prefix("").index_key(&ActionId::new(vec![0x01])),
            "a/01"
        );
    }

    #[test]
    fn test_remote_index_json_roundtrip() {
        let index = RemoteIndex {
            output_id: "aabb".to_string(),
            size: 42,
            stored_at: Utc::now(),
        };
        let json = serde_json::to_vec(&index).unwrap();
        let parsed: RemoteIndex = serde_json::from_slice(&json).unwrap();
        assert_eq!(parsed.output_id, index.output_id);
        assert_eq!(parsed.size, index.size);
        assert_eq!(parsed.stored_at, index.stored_at);
    }
}
