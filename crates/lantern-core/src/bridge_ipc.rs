//! Envelope and NDJSON framing for the tray <-> window bridge socket.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;
pub const PROTOCOL_VERSION: u16 = 1;

fn current_version() -> u16 {
    PROTOCOL_VERSION
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BridgeEnvelope {
    #[serde(default = "current_version")]
    pub version: u16,
    pub sender_id: String,
    pub timestamp: String,
    #[serde(flatten)]
    pub msg: BridgeMsg,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum BridgeMsg {
    Hello(HelloPayload),
    TrayAction(TrayActionPayload),
    ActionResult(ActionResultPayload),
    Refresh(RefreshPayload),
    DaemonStatus(DaemonStatusPayload),
}

impl BridgeMsg {
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeMsg::Hello(_) => "hello",
            BridgeMsg::TrayAction(_) => "tray_action",
            BridgeMsg::ActionResult(_) => "action_result",
            BridgeMsg::Refresh(_) => "refresh",
            BridgeMsg::DaemonStatus(_) => "daemon_status",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BridgeRole {
    Window,
    Tray,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HelloPayload {
    pub client_id: String,
    pub role: BridgeRole,
}

/// The four verbs the tray can raise.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ActionKind {
    #[serde(rename = "project:start")]
    ProjectStart,
    #[serde(rename = "project:stop")]
    ProjectStop,
    #[serde(rename = "service:start")]
    ServiceStart,
    #[serde(rename = "service:stop")]
    ServiceStop,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::ProjectStart => "project:start",
            ActionKind::ProjectStop => "project:stop",
            ActionKind::ServiceStart => "service:start",
            ActionKind::ServiceStop => "service:stop",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrayActionPayload {
    #[serde(rename = "actionId")]
    pub action_id: String,
    #[serde(rename = "type")]
    pub kind: ActionKind,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActionResultPayload {
    #[serde(rename = "actionId")]
    pub action_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RefreshPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DaemonStatusPayload {
    pub connected: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    Oversized { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

/// Serializes one envelope as a single newline-terminated JSON line.
pub fn encode_frame<T: Serialize>(
    value: &T,
    max_frame_bytes: usize,
) -> Result<Vec<u8>, FrameError> {
    let mut line =
        serde_json::to_vec(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    if line.len() > max_frame_bytes {
        return Err(FrameError::Oversized {
            size: line.len(),
            max: max_frame_bytes,
        });
    }
    line.push(b'\n');
    Ok(line)
}

/// Splits a byte stream into JSON lines. Lines that do not decode are
/// reported and skipped; a partial line longer than the frame limit is
/// discarded without waiting for its newline.
pub struct NdjsonFrameDecoder<T> {
    max_frame_bytes: usize,
    buffer: Vec<u8>,
    marker: PhantomData<T>,
}

#[derive(Debug)]
pub struct DecodeReport<T> {
    pub frames: Vec<T>,
    pub errors: Vec<FrameError>,
}

impl<T> NdjsonFrameDecoder<T> {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            buffer: Vec::new(),
            marker: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> NdjsonFrameDecoder<T> {
    pub fn push_chunk(&mut self, chunk: &[u8]) -> DecodeReport<T> {
        let mut frames = Vec::new();
        let mut errors = Vec::new();
        self.buffer.extend_from_slice(chunk);

        let mut start = 0;
        while let Some(offset) = self.buffer[start..].iter().position(|b| *b == b'\n') {
            let line = &self.buffer[start..start + offset];
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            start += offset + 1;
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            if line.len() > self.max_frame_bytes {
                errors.push(FrameError::Oversized {
                    size: line.len(),
                    max: self.max_frame_bytes,
                });
                continue;
            }
            match serde_json::from_slice(line) {
                Ok(frame) => frames.push(frame),
                Err(err) => errors.push(FrameError::Decode(err.to_string())),
            }
        }
        self.buffer.drain(..start);

        if self.buffer.len() > self.max_frame_bytes {
            errors.push(FrameError::Oversized {
                size: self.buffer.len(),
                max: self.max_frame_bytes,
            });
            self.buffer.clear();
        }
        DecodeReport { frames, errors }
    }
}
