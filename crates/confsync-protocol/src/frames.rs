//! Newline-delimited JSON framing for stream transports.
//!
//! Requests are numbered by the client so responses can be matched while
//! pushes interleave on the same connection.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::messages::{SyncPush, SyncRequest, SyncResponse};

/// Frame written by a replica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientFrame {
    pub id: u64,
    pub request: SyncRequest,
}

/// Frame written by the owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum ServerFrame {
    Response { id: u64, response: SyncResponse },
    Push { push: SyncPush },
}

/// Serialize a frame as a single line, terminated by `\n`.
pub fn encode_line<T: Serialize>(frame: &T) -> serde_json::Result<String> {
    let mut line = serde_json::to_string(frame)?;
    line.push('\n');
    Ok(line)
}

/// Parse one line (trailing whitespace allowed).
pub fn decode_line<T: DeserializeOwned>(line: &str) -> serde_json::Result<T> {
    serde_json::from_str(line.trim_end())
}
