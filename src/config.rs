//! Environment-driven configuration
//!
//! Every key is recognised both in its plain form and with the
//! `GOBUILDCACHE_` prefix. The prefixed form wins when both are set; an
//! empty or unparsable prefixed value falls through to the unprefixed form,
//! and from there to the default. This lets operators scope settings to the
//! cache helper without clobbering unrelated variables named `DEBUG` or
//! `CACHE_DIR`.

use std::env;
use std::path::PathBuf;

/// Prefix recognised in front of every configuration key.
pub const ENV_PREFIX: &str = "GOBUILDCACHE_";

fn env_non_empty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

/// Resolve a string key: prefixed form first, then plain, then the default.
pub fn env_with_prefix(key: &str, default: &str) -> String {
    env_non_empty(&format!("{ENV_PREFIX}{key}"))
        .or_else(|| env_non_empty(key))
        .unwrap_or_else(|| default.to_string())
}

/// Parse a boolean setting. Truthy: `1`, `true`, `yes`, `on`; falsy: `0`,
/// `false`, `no`, `off` (case-insensitive). Anything else is an invalid
/// parse and the caller falls through to the next source.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Resolve a boolean key with prefix precedence and parse fallthrough.
pub fn env_bool_with_prefix(key: &str, default: bool) -> bool {
    env_non_empty(&format!("{ENV_PREFIX}{key}"))
        .as_deref()
        .and_then(parse_bool)
        .or_else(|| env_non_empty(key).as_deref().and_then(parse_bool))
        .unwrap_or(default)
}

/// Resolve a float key with prefix precedence and parse fallthrough.
pub fn env_float_with_prefix(key: &str, default: f64) -> f64 {
    env_non_empty(&format!("{ENV_PREFIX}{key}"))
        .and_then(|v| v.parse::<f64>().ok())
        .or_else(|| env_non_empty(key).and_then(|v| v.parse::<f64>().ok()))
        .unwrap_or(default)
}

/// Snapshot of the environment the helper was launched with.
#[derive(Debug, Clone)]
pub struct Config {
    /// Backend composition: `disk`, `s3`, `disk+s3`, or `memory`
    pub backend_type: String,
    /// Root directory of the disk backend
    pub cache_dir: PathBuf,
    /// S3 bucket name (required for `s3` and `disk+s3`)
    pub s3_bucket: String,
    /// Key prefix inside the bucket
    pub s3_prefix: String,
    /// AWS region; empty means the SDK's default provider chain
    pub s3_region: String,
    /// Suppress writes to the shared cache
    pub read_only: bool,
    /// Locker kind: `inprocess` or `fslock`
    pub lock_type: String,
    /// Directory holding advisory lock files
    pub lock_dir: PathBuf,
    /// Raise the default log level to debug
    pub debug: bool,
    /// Log session statistics at close
    pub print_stats: bool,
}

impl Config {
    /// Read the configuration from the environment.
    pub fn from_env() -> Self {
        Self {
            backend_type: env_with_prefix("BACKEND_TYPE", "disk"),
            cache_dir: PathBuf::from(env_with_prefix("CACHE_DIR", &default_cache_dir())),
            s3_bucket: env_with_prefix("S3_BUCKET", ""),
            s3_prefix: env_with_prefix("S3_PREFIX", "gobuildcache"),
            s3_region: env_with_prefix("S3_REGION", ""),
            read_only: env_bool_with_prefix("READ_ONLY", false),
            lock_type: env_with_prefix("LOCK_TYPE", "inprocess"),
            lock_dir: PathBuf::from(env_with_prefix("LOCK_DIR", &default_lock_dir())),
            debug: env_bool_with_prefix("DEBUG", false),
            print_stats: env_bool_with_prefix("PRINT_STATS", false),
        }
    }
}

fn default_cache_dir() -> String {
    match env::var("HOME") {
        Ok(home) if !home.is_empty() => format!("{home}/.cache/gobuildcache"),
        _ => env::temp_dir()
            .join("gobuildcache")
            .to_string_lossy()
            .into_owned(),
    }
}

fn default_lock_dir() -> String {
    env::temp_dir()
        .join("gobuildcache-locks")
        .to_string_lossy()
        .into_owned()
}
