//! Typed message envelope.
//!
//! On the wire every message is `{"type": "<TYPE>", "data": <payload>}`.
//! The payload shape is fixed by the type, so the envelope is a sum type
//! with one variant per type instead of an untyped blob.

use crate::lesson::{Lesson, LessonMetadata};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncMessage {
    /// Display name of the sending peer
    Username(String),
    /// Keys of every lesson the sender holds
    Metadata(Vec<LessonMetadata>),
    /// Ask the peer for one lesson
    LessonRequest(LessonMetadata),
    /// Full lessons, sent in reply to a request
    LessonData(Vec<Lesson>),
    /// Topic ids the sender is interested in
    Preferences(Vec<String>),
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Malformed message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unknown message type: {0}")]
    UnknownType(String),
}

/// Untyped envelope used to dispatch on the `type` field before the payload
/// is parsed.
#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

impl SyncMessage {
    /// Wire name of this message's type.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Username(_) => "USERNAME",
            Self::Metadata(_) => "METADATA",
            Self::LessonRequest(_) => "LESSON_REQUEST",
            Self::LessonData(_) => "LESSON_DATA",
            Self::Preferences(_) => "PREFERENCES",
        }
    }

    /// Serialize to JSON bytes (no delimiter).
    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("SyncMessage serialization should not fail")
    }

    /// Serialize to a newline-terminated frame ready for the socket.
    pub fn to_line(&self) -> Vec<u8> {
        let mut line = self.to_json();
        line.push(b'\n');
        line
    }

    /// Parse one line (without its delimiter).
    ///
    /// A well-formed envelope with an unrecognised `type` yields
    /// [`DecodeError::UnknownType`] so callers can ignore it separately from
    /// garbage input.
    pub fn decode(line: &[u8]) -> Result<Self, DecodeError> {
        let raw: RawEnvelope = serde_json::from_slice(line)?;
        let message = match raw.kind.as_str() {
            "USERNAME" => Self::Username(serde_json::from_value(raw.data)?),
            "METADATA" => Self::Metadata(serde_json::from_value(raw.data)?),
            "LESSON_REQUEST" => Self::LessonRequest(serde_json::from_value(raw.data)?),
            "LESSON_DATA" => Self::LessonData(serde_json::from_value(raw.data)?),
            "PREFERENCES" => Self::Preferences(serde_json::from_value(raw.data)?),
            _ => return Err(DecodeError::UnknownType(raw.kind)),
        };
        Ok(message)
    }
}
