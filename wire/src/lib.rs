//! Quake-style out-of-band wire formats shared by the tracker pipeline.
//!
//! This crate contains the byte-exact request builders and response decoders
//! for the two UDP protocols the tracker speaks: the master server list
//! protocol (`getservers`/`getserversExt`) and the per-server status protocol
//! (`getstatus`). It performs no I/O; the tracker crate drives the sockets
//! and feeds raw datagrams in.

use serde::{Deserialize, Serialize};
use std::fmt;

pub mod master;
pub mod status;

/// Four 0xFF bytes prefixing every out-of-band message, distinguishing
/// control traffic from in-game packets.
pub const OOB_PADDING: &[u8] = b"\xFF\xFF\xFF\xFF";

/// Fixed byte sequence terminating a master server list response.
pub const EOT_MARKER: &[u8] = b"EOT\x00\x00\x00";

/// Address family of a server endpoint.
///
/// Serialized as `"udp4"`/`"udp6"` to match the names used on the feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Family {
    #[serde(rename = "udp4")]
    V4,
    #[serde(rename = "udp6")]
    V6,
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::V4 => write!(f, "udp4"),
            Family::V6 => write!(f, "udp6"),
        }
    }
}

/// A single value in a server info mapping.
///
/// Known numeric keys are coerced to `Int` during status decoding; everything
/// else stays `Text`. Untagged serde representation keeps the feed payloads
/// plain JSON numbers and strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InfoValue {
    Int(i64),
    Text(String),
}

impl InfoValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            InfoValue::Int(n) => Some(*n),
            InfoValue::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            InfoValue::Int(_) => None,
            InfoValue::Text(s) => Some(s.as_str()),
        }
    }
}

impl From<i64> for InfoValue {
    fn from(n: i64) -> Self {
        InfoValue::Int(n)
    }
}

impl From<&str> for InfoValue {
    fn from(s: &str) -> Self {
        InfoValue::Text(s.to_string())
    }
}

impl From<String> for InfoValue {
    fn from(s: String) -> Self {
        InfoValue::Text(s)
    }
}
