//! gobuildcache - External build cache for the Go toolchain
//!
//! Spawned by the compiler driver through the `GOCACHEPROG` contract, the
//! helper serves cache lookups and accepts stores over a line-delimited
//! JSON protocol on stdin/stdout. Entries can live on local disk, in
//! S3-compatible object storage, or both.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         gobuildcache                             │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │   Protocol   │───▶│    Locker    │───▶│   Backend    │       │
//! │  │    Engine    │    │(single-flight│    │ (disk / s3 / │       │
//! │  │ (stdin/out)  │    │  per action) │    │tiered/rdonly)│       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The engine dispatches concurrent requests, the locker collapses
//! duplicate work per action ID (in-process, or across processes with
//! advisory file locks), and the backend owns byte storage with streaming
//! bodies and atomic commits.
//!
//! # Modules
//!
//! - [`backends`] - Backend trait and the disk / s3 / memory / read-only /
//!   tiered implementations
//! - [`config`] - Environment configuration with `GOBUILDCACHE_` prefixes
//! - [`error`] - Error types
//! - [`keys`] - Action and output identifiers
//! - [`locking`] - Single-flight lockers
//! - [`proto`] - Wire protocol and session engine

pub mod backends;
pub mod config;
pub mod error;
mod fsutil;
pub mod keys;
pub mod locking;
pub mod proto;

pub use error::{Error, Result};
pub use keys::{ActionId, OutputId};
