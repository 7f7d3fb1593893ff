//! In-memory backend
//!
//! Holds entries in a `DashMap` for lock-free concurrent access. Used by
//! tests that need to observe backend traffic, and available as
//! `BACKEND_TYPE=memory` for throwaway sessions. Objects live entirely in
//! memory, so this is not meant for large caches.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::io::AsyncReadExt;

use super::{Backend, Body, GetHit, PutReceipt};
use crate::error::{Error, Result};
use crate::keys::{ActionId, OutputId};

#[derive(Clone)]
struct MemoryEntry {
    output_id: OutputId,
    data: Bytes,
    stored_at: DateTime<Utc>,
}

/// Operation counters, readable by tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub gets: u64,
    pub puts: u64,
    pub touches: u64,
    pub clears: u64,
}

/// Map-backed backend with operation counters.
#[derive(Default)]
pub struct MemoryBackend {
    entries: DashMap<Vec<u8>, MemoryEntry>,
    gets: AtomicU64,
    puts: AtomicU64,
    touches: AtomicU64,
    clears: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            gets: self.gets.load(Ordering::Relaxed),
            puts: self.puts.load(Ordering::Relaxed),
            touches: self.touches.load(Ordering::Relaxed),
            clears: self.clears.load(Ordering::Relaxed),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn get(&self, action: &ActionId) -> Result<Option<GetHit>> {
        self.gets.fetch_add(1, Ordering::Relaxed);
        let Some(entry) = self.entries.get(action.as_bytes()).map(|e| e.clone()) else {
            return Ok(None);
        };
        Ok(Some(GetHit {
            output_id: entry.output_id,
            size: entry.data.len() as u64,
            stored_at: entry.stored_at,
            body: Box::new(std::io::Cursor::new(entry.data)),
            disk_path: None,
        }))
    }

    async fn has(&self, action: &ActionId) -> Result<bool> {
        Ok(self.entries.contains_key(action.as_bytes()))
    }

    async fn put(
        &self,
        action: &ActionId,
        output: &OutputId,
        body: Body,
        size: u64,
    ) -> Result<PutReceipt> {
        self.puts.fetch_add(1, Ordering::Relaxed);
        let mut data = Vec::with_capacity(size.min(1 << 20) as usize);
        let mut limited = body.take(size);
        limited.read_to_end(&mut data).await?;
        if data.len() as u64 != size {
            return Err(Error::SizeMismatch {
                expected: size,
                actual: data.len() as u64,
            });
        }
        self.entries.insert(
            action.as_bytes().to_vec(),
            MemoryEntry {
                output_id: output.clone(),
                data: Bytes::from(data),
                stored_at: Utc::now(),
            },
        );
        Ok(PutReceipt::default())
    }

    async fn touch(&self, action: &ActionId) -> Result<()> {
        self.touches.fetch_add(1, Ordering::Relaxed);
        if let Some(mut entry) = self.entries.get_mut(action.as_bytes()) {
            entry.stored_at = Utc::now();
        }
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.clears.fetch_add(1, Ordering::Relaxed);
        self.entries.clear();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
