//! Protocol session engine
//!
//! One reader decodes requests from stdin, a bounded pool of handler tasks
//! serves them through the locker and backend, and a single writer task
//! serialises responses to stdout so JSON objects never interleave.
//! Handlers enqueue complete responses; they never write directly.
//!
//! Session lifecycle: the handshake response is emitted first, then
//! requests are accepted until `close` arrives or stdin reaches EOF. At
//! that point no new work is admitted, in-flight handlers run to
//! completion, the backend is closed, the final response is flushed, and
//! `run` returns. A framing failure that desynchronises stdin aborts the
//! session with an error after an attempt to report it.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::fs;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite,
    AsyncWriteExt, BufReader, BufWriter,
};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::{Command, Request, Response};
use crate::backends::{Backend, Body, GetHit};
use crate::error::{Error, Result};
use crate::fsutil;
use crate::keys::{ActionId, OutputId};
use crate::locking::Locker;

/// Default cap on concurrently served requests.
const DEFAULT_MAX_INFLIGHT: usize = 64;
/// Default depth of the response queue feeding the writer.
const DEFAULT_RESPONSE_QUEUE: usize = 256;
/// Put bodies above this size are spooled to disk instead of held in memory.
const MAX_INLINE_BODY: u64 = 4 * 1024 * 1024;

/// Engine tunables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Handler pool size; the reader blocks once this many requests are in
    /// flight.
    pub max_inflight: usize,
    /// Response queue depth between handlers and the writer.
    pub response_queue: usize,
    /// Where objects are materialised when the backend has no disk path of
    /// its own.
    pub objects_dir: PathBuf,
    /// Log session statistics at close.
    pub print_stats: bool,
}

impl EngineConfig {
    pub fn new(objects_dir: impl Into<PathBuf>) -> Self {
        Self {
            max_inflight: DEFAULT_MAX_INFLIGHT,
            response_queue: DEFAULT_RESPONSE_QUEUE,
            objects_dir: objects_dir.into(),
            print_stats: false,
        }
    }
}

/// Session counters, logged at close when `PRINT_STATS` is set.
#[derive(Debug, Default)]
pub struct SessionStats {
    gets: AtomicU64,
    get_hits: AtomicU64,
    get_misses: AtomicU64,
    puts: AtomicU64,
    put_bytes: AtomicU64,
    errors: AtomicU64,
}

/// Point-in-time copy of the session counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub gets: u64,
    pub get_hits: u64,
    pub get_misses: u64,
    pub puts: u64,
    pub put_bytes: u64,
    pub errors: u64,
}

impl SessionStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            gets: self.gets.load(Ordering::Relaxed),
            get_hits: self.get_hits.load(Ordering::Relaxed),
            get_misses: self.get_misses.load(Ordering::Relaxed),
            puts: self.puts.load(Ordering::Relaxed),
            put_bytes: self.put_bytes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    fn log(&self) {
        let s = self.snapshot();
        info!(
            gets = s.gets,
            hits = s.get_hits,
            misses = s.get_misses,
            puts = s.puts,
            put_bytes = s.put_bytes,
            errors = s.errors,
            "cache session statistics"
        );
    }
}

/// Result of a deduplicated cache operation, shared between all waiters of
/// the same action ID. Response IDs are attached per request afterwards.
#[derive(Debug, Clone)]
pub enum FlightOutcome {
    Hit(ResolvedHit),
    Miss,
    Stored(Option<PathBuf>),
}

/// A get hit with its object already materialised on local disk.
#[derive(Debug, Clone)]
pub struct ResolvedHit {
    pub output_id: Vec<u8>,
    pub size: u64,
    pub stored_at: DateTime<Utc>,
    pub disk_path: PathBuf,
}

/// A put body as captured by the reader.
enum BodyPayload {
    Empty,
    Inline(Vec<u8>),
    Spooled(tokio::fs::File),
}

impl BodyPayload {
    fn into_body(self) -> Body {
        match self {
            BodyPayload::Empty => Box::new(tokio::io::empty()),
            BodyPayload::Inline(bytes) => Box::new(std::io::Cursor::new(bytes)),
            BodyPayload::Spooled(file) => Box::new(file),
        }
    }
}

/// One GOCACHEPROG session.
pub struct Engine {
    backend: Arc<dyn Backend>,
    locker: Arc<dyn Locker<FlightOutcome>>,
    config: EngineConfig,
    stats: Arc<SessionStats>,
}

impl Engine {
    pub fn new(
        backend: Arc<dyn Backend>,
        locker: Arc<dyn Locker<FlightOutcome>>,
        config: EngineConfig,
    ) -> Self {
        Self {
            backend,
            locker,
            config,
            stats: Arc::new(SessionStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<SessionStats> {
        self.stats.clone()
    }

    /// Serve one session on the given transport. Returns once the session
    /// is drained; an error means the stream desynchronised or the
    /// transport broke.
    pub async fn run<R, W>(self, input: R, output: W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let mut reader = BufReader::new(input);
        let (responses, queue) = mpsc::channel::<Response>(self.config.response_queue);
        let writer = tokio::spawn(write_responses(queue, output));

        responses
            .send(Response::capabilities())
            .await
            .map_err(|_| Error::Protocol("response writer unavailable".to_string()))?;

        let semaphore = Arc::new(Semaphore::new(self.config.max_inflight));
        let mut handlers = JoinSet::new();
        let mut seen_ids: HashSet<u64> = HashSet::new();
        let mut close_id: Option<u64> = None;
        let mut fatal: Option<Error> = None;
        let mut line = String::new();

        loop {
            line.clear();
            let n = match reader.read_line(&mut line).await {
                Ok(n) => n,
                Err(err) => {
                    fatal = Some(err.into());
                    break;
                }
            };
            if n == 0 {
                // EOF on stdin is equivalent to close.
                debug!("stdin closed, draining session");
                break;
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let request: Request = match serde_json::from_str(trimmed) {
                Ok(request) => request,
                Err(err) => {
                    // Without an ID we cannot resynchronise the stream.
                    let _ = responses
                        .send(Response::error(0, format!("malformed request: {err}")))
                        .await;
                    fatal = Some(Error::Protocol(format!("malformed request: {err}")));
                    break;
                }
            };

            // The body must be consumed before anything else to keep the
            // stream in sync, even for requests we end up rejecting.
            let body = if request.body_size > 0 {
                match capture_body(&mut reader, &request).await {
                    Ok(body) => body,
                    Err(CaptureError::Request(message)) => {
                        self.stats.errors.fetch_add(1, Ordering::Relaxed);
                        let _ = responses.send(Response::error(request.id, message)).await;
                        continue;
                    }
                    Err(CaptureError::Fatal(err)) => {
                        let _ = responses
                            .send(Response::error(request.id, err.to_string()))
                            .await;
                        fatal = Some(err);
                        break;
                    }
                }
            } else {
                BodyPayload::Empty
            };

            if !seen_ids.insert(request.id) {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                let _ = responses
                    .send(Response::error(
                        request.id,
                        format!("duplicate request ID {}", request.id),
                    ))
                    .await;
                continue;
            }

            if request.command == Command::Close {
                close_id = Some(request.id);
                break;
            }

            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    fatal = Some(Error::Internal("handler pool closed".to_string()));
                    break;
                }
            };
            let handler = Handler {
                backend: self.backend.clone(),
                locker: self.locker.clone(),
                objects_dir: self.config.objects_dir.clone(),
                stats: self.stats.clone(),
                responses: responses.clone(),
            };
            handlers.spawn(async move {
                let _permit = permit;
                handler.handle(request, body).await;
            });
        }

        // Closing: let in-flight handlers run to completion.
        while handlers.join_next().await.is_some() {}

        let close_result = self.backend.close().await;
        if let Some(id) = close_id {
            let response = match &close_result {
                Ok(()) => Response::ok(id),
                Err(err) => Response::error(id, err.to_string()),
            };
            let _ = responses.send(response).await;
        } else if let Err(err) = &close_result {
            error!(error = %err, "backend close failed");
        }

        if self.config.print_stats {
            self.stats.log();
        }

        drop(responses);
        writer
            .await
            .map_err(|err| Error::Internal(format!("writer task failed: {err}")))??;

        match fatal {
            Some(err) => Err(err),
            None => close_result,
        }
    }
}

enum CaptureError {
    /// Reported on the request's own response; the session continues.
    Request(String),
    /// The stream is desynchronised; the session must end.
    Fatal(Error),
}

/// Pull the put body off the wire: inline base-64 if present, otherwise raw
/// bytes following the request line. Large raw bodies are spooled to an
/// anonymous temp file.
async fn capture_body<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    request: &Request,
) -> std::result::Result<BodyPayload, CaptureError> {
    if let Some(inline) = &request.body {
        if inline.len() as u64 != request.body_size {
            return Err(CaptureError::Request(format!(
                "inline body is {} bytes but BodySize says {}",
                inline.len(),
                request.body_size
            )));
        }
        return Ok(BodyPayload::Inline(inline.clone()));
    }

    if request.body_size <= MAX_INLINE_BODY {
        let mut buf = vec![0u8; request.body_size as usize];
        reader.read_exact(&mut buf).await.map_err(|err| {
            CaptureError::Fatal(Error::Protocol(format!("truncated request body: {err}")))
        })?;
        return Ok(BodyPayload::Inline(buf));
    }

    let spool = tempfile::tempfile().map_err(|err| CaptureError::Fatal(err.into()))?;
    let mut file = tokio::fs::File::from_std(spool);
    let mut limited = reader.take(request.body_size);
    let copied = tokio::io::copy(&mut limited, &mut file)
        .await
        .map_err(|err| CaptureError::Fatal(err.into()))?;
    if copied != request.body_size {
        return Err(CaptureError::Fatal(Error::Protocol(format!(
            "truncated request body: got {copied} of {} bytes",
            request.body_size
        ))));
    }
    file.rewind()
        .await
        .map_err(|err| CaptureError::Fatal(err.into()))?;
    Ok(BodyPayload::Spooled(file))
}

struct Handler {
    backend: Arc<dyn Backend>,
    locker: Arc<dyn Locker<FlightOutcome>>,
    objects_dir: PathBuf,
    stats: Arc<SessionStats>,
    responses: mpsc::Sender<Response>,
}

impl Handler {
    async fn handle(self, request: Request, body: BodyPayload) {
        let id = request.id;
        let response = match self.dispatch(request, body).await {
            Ok(response) => response,
            Err(err) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                Response::error(id, err.to_string())
            }
        };
        // A closed queue means the writer died; the session loop notices.
        let _ = self.responses.send(response).await;
    }

    async fn dispatch(&self, request: Request, body: BodyPayload) -> Result<Response> {
        match request.command {
            Command::Get => self.handle_get(request).await,
            Command::Put => self.handle_put(request, body).await,
            Command::Close => Err(Error::Protocol(
                "close is handled by the session loop".to_string(),
            )),
        }
    }

    async fn handle_get(&self, request: Request) -> Result<Response> {
        if request.action_id.is_empty() {
            return Err(Error::Protocol("get request missing ActionID".to_string()));
        }
        self.stats.gets.fetch_add(1, Ordering::Relaxed);

        let action = ActionId::new(request.action_id);
        let key = action.to_hex();
        let outcome = {
            let backend = self.backend.clone();
            let objects_dir = self.objects_dir.clone();
            let action = action.clone();
            self.locker
                .do_with_lock(
                    &key,
                    async move { resolve_get(backend, objects_dir, action).await }.boxed(),
                )
                .await?
        };

        // A concurrent store may have won the key; read our own answer back.
        let outcome = match outcome {
            FlightOutcome::Stored(_) => {
                resolve_get(self.backend.clone(), self.objects_dir.clone(), action).await?
            }
            other => other,
        };

        match outcome {
            FlightOutcome::Hit(hit) => {
                self.stats.get_hits.fetch_add(1, Ordering::Relaxed);
                let disk_path = match &request.output_file {
                    Some(dest) => {
                        copy_into(&hit.disk_path, dest).await?;
                        dest.clone()
                    }
                    None => hit.disk_path.clone(),
                };
                Ok(Response {
                    id: request.id,
                    output_id: hit.output_id,
                    size: hit.size,
                    time: Some(hit.stored_at),
                    disk_path: Some(disk_path),
                    ..Response::default()
                })
            }
            FlightOutcome::Miss => {
                self.stats.get_misses.fetch_add(1, Ordering::Relaxed);
                Ok(Response::miss(request.id))
            }
            FlightOutcome::Stored(_) => {
                Err(Error::Internal("unexpected stored outcome for get".to_string()))
            }
        }
    }

    async fn handle_put(&self, request: Request, body: BodyPayload) -> Result<Response> {
        if request.action_id.is_empty() {
            return Err(Error::Protocol("put request missing ActionID".to_string()));
        }
        if request.output_id.is_empty() {
            return Err(Error::Protocol("put request missing OutputID".to_string()));
        }
        self.stats.puts.fetch_add(1, Ordering::Relaxed);
        self.stats
            .put_bytes
            .fetch_add(request.body_size, Ordering::Relaxed);

        let action = ActionId::new(request.action_id);
        let output = OutputId::new(request.output_id);
        let key = action.to_hex();
        let size = request.body_size;

        // The body sits in a slot the producer takes from, so it survives
        // when this call becomes a single-flight follower and its producer
        // is dropped unpolled.
        let body_slot = Arc::new(Mutex::new(Some(body)));
        let outcome = {
            let backend = self.backend.clone();
            let action = action.clone();
            let output = output.clone();
            let slot = body_slot.clone();
            let work = async move {
                let Some(body) = slot.lock().take() else {
                    return Err(Error::Internal("put body already consumed".to_string()));
                };
                let receipt = backend.put(&action, &output, body.into_body(), size).await?;
                Ok(FlightOutcome::Stored(receipt.disk_path))
            }
            .boxed();
            self.locker.do_with_lock(&key, work).await?
        };

        let disk_path = match outcome {
            // Our own store, or a concurrent put for the same action that
            // won the key and committed in our stead.
            FlightOutcome::Stored(disk_path) => disk_path,
            // A lookup for the same action held the key, so our producer
            // never ran and the shared result says nothing about our bytes;
            // a hit in it may even be bound to a different output. Store
            // them now. The backend commits atomically, so readers see the
            // prior entry or ours, never a torn one.
            FlightOutcome::Hit(_) | FlightOutcome::Miss => {
                let Some(body) = body_slot.lock().take() else {
                    return Err(Error::Internal("put body already consumed".to_string()));
                };
                let receipt = self
                    .backend
                    .put(&action, &output, body.into_body(), size)
                    .await?;
                receipt.disk_path
            }
        };

        Ok(Response {
            id: request.id,
            disk_path,
            ..Response::default()
        })
    }
}

/// Look up `action` and make sure a hit is backed by a local file the
/// driver can read.
async fn resolve_get(
    backend: Arc<dyn Backend>,
    objects_dir: PathBuf,
    action: ActionId,
) -> Result<FlightOutcome> {
    let Some(hit) = backend.get(&action).await? else {
        return Ok(FlightOutcome::Miss);
    };
    let GetHit {
        output_id,
        size,
        stored_at,
        body,
        disk_path,
    } = hit;
    let disk_path = match disk_path {
        Some(path) => {
            // Backend already materialises objects; release the stream.
            drop(body);
            path
        }
        None => {
            let dest = objects_dir.join(output_id.to_hex());
            fsutil::write_stream_atomic(&dest, body, size).await?;
            dest
        }
    };
    Ok(FlightOutcome::Hit(ResolvedHit {
        output_id: output_id.into_bytes(),
        size,
        stored_at,
        disk_path,
    }))
}

/// Copy a materialised object into the destination the driver asked for.
async fn copy_into(src: &Path, dest: &Path) -> Result<()> {
    let file = fs::File::open(src).await.map_err(|source| Error::IoAt {
        path: src.to_path_buf(),
        source,
    })?;
    let size = file.metadata().await?.len();
    fsutil::write_stream_atomic(dest, file, size).await
}

/// Single writer: serialises responses so JSON objects never interleave.
async fn write_responses<W: AsyncWrite + Unpin>(
    mut queue: mpsc::Receiver<Response>,
    output: W,
) -> Result<()> {
    let mut output = BufWriter::new(output);
    while let Some(response) = queue.recv().await {
        let line = match serde_json::to_string(&response) {
            Ok(line) => line,
            Err(err) => {
                // Sentinel referencing the original ID; the driver sees a
                // failed request instead of a dead session.
                warn!(id = response.id, error = %err, "failed to encode response");
                let fallback = Response::error(response.id, format!("encoding failed: {err}"));
                serde_json::to_string(&fallback).unwrap_or_else(|_| {
                    format!("{{\"ID\":{},\"Err\":\"response encoding failed\"}}", response.id)
                })
            }
        };
        output.write_all(line.as_bytes()).await?;
        output.write_all(b"\n").await?;
        output.flush().await?;
    }
    output.flush().await?;
    Ok(())
}
