//! GOCACHEPROG wire protocol
//!
//! The compiler driver speaks line-delimited JSON over the helper's
//! stdin/stdout. Each request is one JSON object on its own line; binary
//! IDs travel base-64 encoded. A put body arrives either inline in the
//! `Body` field (base-64) or, when the field is absent and `BodySize` is
//! non-zero, as exactly `BodySize` raw bytes immediately following the
//! request line. Responses are one JSON object per line in completion
//! order; the `ID` field is the only correlation between the two streams.
//!
//! The first response of a session carries `KnownCommands` and ID 0.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

mod engine;

pub use engine::{Engine, EngineConfig, FlightOutcome, ResolvedHit, SessionStats, StatsSnapshot};

/// Command tags understood by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    Get,
    Put,
    Close,
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Get => write!(f, "get"),
            Command::Put => write!(f, "put"),
            Command::Close => write!(f, "close"),
        }
    }
}

/// One request from the driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    #[serde(rename = "ID")]
    pub id: u64,
    #[serde(rename = "Command")]
    pub command: Command,
    #[serde(
        rename = "ActionID",
        default,
        with = "base64_bytes",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub action_id: Vec<u8>,
    #[serde(
        rename = "OutputID",
        default,
        with = "base64_bytes",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub output_id: Vec<u8>,
    #[serde(rename = "BodySize", default, skip_serializing_if = "is_zero")]
    pub body_size: u64,
    /// Inline body; when absent with `BodySize > 0`, raw bytes follow the
    /// request line.
    #[serde(
        rename = "Body",
        default,
        with = "base64_bytes_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub body: Option<Vec<u8>>,
    /// Destination the driver wants the object materialised into.
    #[serde(rename = "OutputFile", default, skip_serializing_if = "Option::is_none")]
    pub output_file: Option<PathBuf>,
}

/// One response to the driver.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Response {
    #[serde(rename = "ID", default)]
    pub id: u64,
    #[serde(
        rename = "KnownCommands",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub known_commands: Vec<String>,
    #[serde(rename = "Miss", default, skip_serializing_if = "is_false")]
    pub miss: bool,
    #[serde(
        rename = "OutputID",
        default,
        with = "base64_bytes",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub output_id: Vec<u8>,
    #[serde(rename = "Size", default, skip_serializing_if = "is_zero")]
    pub size: u64,
    #[serde(rename = "Time", default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    #[serde(rename = "DiskPath", default, skip_serializing_if = "Option::is_none")]
    pub disk_path: Option<PathBuf>,
    #[serde(rename = "Err", default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

impl Response {
    /// Session handshake listing the supported commands.
    pub fn capabilities() -> Self {
        Self {
            known_commands: vec!["get".to_string(), "put".to_string(), "close".to_string()],
            ..Self::default()
        }
    }

    pub fn ok(id: u64) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    pub fn miss(id: u64) -> Self {
        Self {
            id,
            miss: true,
            ..Self::default()
        }
    }

    pub fn error(id: u64, message: impl Into<String>) -> Self {
        Self {
            id,
            err: Some(message.into()),
            ..Self::default()
        }
    }
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

fn is_false(b: &bool) -> bool {
    !*b
}

mod base64_bytes {
    use base64::prelude::{Engine as _, BASE64_STANDARD};
    use serde::de::Error;
    use serde::Deserialize;

    pub fn serialize<S: serde::Serializer>(
        bytes: &Vec<u8>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64_STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        BASE64_STANDARD.decode(s.as_bytes()).map_err(D::Error::custom)
    }
}

mod base64_bytes_opt {
    use base64::prelude::{Engine as _, BASE64_STANDARD};
    use serde::de::Error;
    use serde::Deserialize;

    pub fn serialize<S: serde::Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&BASE64_STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(s) => BASE64_STANDARD
                .decode(s.as_bytes())
                .map(Some)
                .map_err(D::Error::custom),
            None => Ok(None),
        }
    }
}
