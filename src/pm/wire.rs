//! Control-plane wire codec: newline-delimited JSON.
//!
//! Streams give no message boundaries; a single `\n` delimiter is enough
//! because serialized messages never contain raw newlines. End-of-stream is
//! signalled by the explicit `fin` flag rather than by connection close —
//! closing destroys buffered data the peer has not drained yet, which is
//! exactly the bug the flag exists to avoid.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Control commands exchanged between host, guests and the CLI.
///
/// Serialized as the bare command string. An unrecognized string decodes
/// as [`Cmd::Invalid`] rather than failing the frame, so the host can
/// answer with a protocol error instead of silently dropping it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Cmd {
    Handshake,
    Goodbye,
    Stop,
    Reload,
    List,
    Stat,
    StopHost,
    Reply,
    Online,
    #[default]
    Invalid,
}

impl Cmd {
    pub fn as_str(&self) -> &'static str {
        match self {
            Cmd::Handshake => "handshake",
            Cmd::Goodbye => "goodbye",
            Cmd::Stop => "stop",
            Cmd::Reload => "reload",
            Cmd::List => "list",
            Cmd::Stat => "stat",
            Cmd::StopHost => "stop-host",
            Cmd::Reply => "reply",
            Cmd::Online => "online",
            Cmd::Invalid => "invalid",
        }
    }

    pub fn parse(s: &str) -> Cmd {
        match s {
            "handshake" => Cmd::Handshake,
            "goodbye" => Cmd::Goodbye,
            "stop" => Cmd::Stop,
            "reload" => Cmd::Reload,
            "list" => Cmd::List,
            "stat" => Cmd::Stat,
            "stop-host" => Cmd::StopHost,
            "reply" => Cmd::Reply,
            "online" => Cmd::Online,
            _ => Cmd::Invalid,
        }
    }
}

impl Serialize for Cmd {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Cmd {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Cmd, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Cmd::parse(&s))
    }
}

/// A roster entry as reported by `list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuestInfo {
    pub app: String,
    pub pid: u32,
    /// Unix seconds at which the host recorded the handshake.
    pub start_time: i64,
}

/// One process's resource sample, carried in `stat` replies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatEntry {
    pub app: String,
    pub pid: u32,
    /// Resident memory in bytes, when the platform could sample it.
    pub memory: Option<u64>,
    /// CPU usage percent, when the platform could sample it.
    pub cpu: Option<f64>,
}

/// The on-the-wire control message. All fields other than `cmd` are
/// optional; unknown fields are ignored by both peers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ControlMessage {
    pub cmd: Cmd,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub app: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub msg_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guests: Option<Vec<GuestInfo>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<Vec<StatEntry>>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
    /// Provided when `cmd` is `handshake` (and on `online` events).
    #[serde(skip_serializing_if = "is_zero")]
    pub pid: u32,
    /// Marks the final reply for a correlation id.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub fin: bool,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

impl ControlMessage {
    pub fn new(cmd: Cmd) -> ControlMessage {
        ControlMessage {
            cmd,
            ..ControlMessage::default()
        }
    }

    pub fn reply_error(error: impl Into<String>) -> ControlMessage {
        ControlMessage {
            cmd: Cmd::Reply,
            error: error.into(),
            fin: true,
            ..ControlMessage::default()
        }
    }
}

/// Serialize a message and append the frame delimiter. Multiple encoded
/// messages may be concatenated into a single write; receivers split.
pub fn encode_message(msg: &ControlMessage) -> Vec<u8> {
    let mut buf = serde_json::to_vec(msg).unwrap_or_default();
    buf.push(b'\n');
    buf
}

/// Encode a batch of messages into one contiguous write.
pub fn encode_batch(msgs: &[ControlMessage]) -> Vec<u8> {
    let mut buf = Vec::new();
    for msg in msgs {
        buf.extend_from_slice(&encode_message(msg));
    }
    buf
}

/// Append `chunk` to `buffer` and split out complete frames.
///
/// With `eof` the buffer is emptied and every non-empty piece is yielded —
/// the last message may lack its trailing `\n` because the peer closed
/// right after writing. Otherwise the trailing (possibly empty) piece stays
/// buffered until more data arrives. Pieces that fail JSON decoding are
/// dropped silently.
pub fn decode_messages(buffer: &mut Vec<u8>, chunk: &[u8], eof: bool) -> Vec<ControlMessage> {
    buffer.extend_from_slice(chunk);

    let mut pieces: Vec<Vec<u8>> = buffer.split(|b| *b == b'\n').map(|s| s.to_vec()).collect();

    if eof {
        buffer.clear();
        pieces.retain(|piece| !piece.is_empty());
    } else if pieces.len() > 1 {
        *buffer = pieces.pop().unwrap_or_default();
    } else {
        // No delimiter received yet; wait for more data.
        return Vec::new();
    }

    pieces
        .iter()
        .filter(|piece| !piece.is_empty())
        .filter_map(|piece| serde_json::from_slice::<ControlMessage>(piece).ok())
        .collect()
}

/// Frames handed to a connection's writer task.
#[derive(Debug)]
pub(crate) enum Frame {
    /// Pre-encoded bytes, written as one contiguous chunk.
    Bytes(Vec<u8>),
    /// Drain and close the connection.
    Close,
}

impl Frame {
    pub(crate) fn message(msg: &ControlMessage) -> Frame {
        Frame::Bytes(encode_message(msg))
    }
}
