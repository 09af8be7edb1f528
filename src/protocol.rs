//! Wire protocol: typed events, JSON framing and boundary validation.
//!
//! Every WebSocket text frame carries one envelope:
//!
//! ```json
//! {"event": "message", "data": {"username": "alice", "text": "hi", "timestamp": "2024-05-01T10:00:00Z"}}
//! ```
//!
//! Inbound frames are decoded with [`decode`], which validates the payload
//! against [`Limits`] and returns a [`ClientEvent`] only if every field is
//! acceptable. Nothing unvalidated reaches the hub.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::config::Limits;
use crate::error::ProtocolError;

/// Top-level MIME types the browser client knows how to render.
pub const MEDIA_KINDS: &[&str] = &["image", "video", "audio"];

/// An embedded attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Media {
    /// Self-contained `data:` URL.
    pub url: String,
    #[serde(rename = "type")]
    pub mime: String,
}

/// A chat message as stored in history and broadcast to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<Media>,
    /// Client clock, relayed verbatim.
    pub timestamp: String,
}

/// A validated inbound message that has not been assigned an id yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub username: String,
    pub text: String,
    pub media: Option<Media>,
    pub timestamp: String,
}

impl NewMessage {
    pub fn into_message(self, id: String) -> Message {
        Message {
            id,
            username: self.username,
            text: self.text,
            media: self.media,
            timestamp: self.timestamp,
        }
    }
}

/// `{username}` payload shared by `typing` and `userLeft`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Presence {
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorNotice {
    pub code: String,
    pub message: String,
}

impl From<&ProtocolError> for ErrorNotice {
    fn from(err: &ProtocolError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// Events a client may send, after validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Message(NewMessage),
    Typing(Presence),
    StopTyping,
}

/// Events the server sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    /// History snapshot, oldest first. Sent once per connection.
    PreviousMessages(Vec<Arc<Message>>),
    Message(Arc<Message>),
    Typing(Presence),
    StopTyping {},
    UserLeft(Presence),
    Error(ErrorNotice),
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::PreviousMessages(_) => "previousMessages",
            ServerEvent::Message(_) => "message",
            ServerEvent::Typing(_) => "typing",
            ServerEvent::StopTyping {} => "stopTyping",
            ServerEvent::UserLeft(_) => "userLeft",
            ServerEvent::Error(_) => "error",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ---------------------------------------------------------------------------
// Raw inbound shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawMessage {
    username: Option<String>,
    text: Option<String>,
    media: Option<RawMedia>,
    timestamp: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawMedia {
    url: Option<String>,
    #[serde(rename = "type")]
    mime: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawPresence {
    username: Option<String>,
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Decode and validate one inbound text frame.
pub fn decode(frame: &str, limits: &Limits) -> Result<ClientEvent, ProtocolError> {
    let envelope: Envelope =
        serde_json::from_str(frame).map_err(|e| ProtocolError::MalformedFrame(e.to_string()))?;

    match envelope.event.as_str() {
        "message" => {
            let raw: RawMessage = payload(envelope.data)?;
            validate_message(raw, limits).map(ClientEvent::Message)
        }
        "typing" => {
            let raw: RawPresence = payload(envelope.data)?;
            let username = validate_username(raw.username, limits)?;
            Ok(ClientEvent::Typing(Presence { username }))
        }
        // Payload is ignored; browsers commonly send none at all.
        "stopTyping" => Ok(ClientEvent::StopTyping),
        other => Err(ProtocolError::UnknownEvent(other.to_string())),
    }
}

fn payload<T: serde::de::DeserializeOwned>(data: serde_json::Value) -> Result<T, ProtocolError> {
    if !data.is_object() {
        return Err(ProtocolError::MalformedFrame("data must be an object".into()));
    }
    serde_json::from_value(data).map_err(|e| ProtocolError::MalformedFrame(e.to_string()))
}

fn validate_username(raw: Option<String>, limits: &Limits) -> Result<String, ProtocolError> {
    let invalid = ProtocolError::InvalidUsername {
        max: limits.max_username_chars,
    };
    let name = raw.as_deref().map(str::trim).unwrap_or("");
    if name.is_empty() || name.chars().count() > limits.max_username_chars {
        return Err(invalid);
    }
    Ok(name.to_string())
}

fn validate_message(raw: RawMessage, limits: &Limits) -> Result<NewMessage, ProtocolError> {
    let username = validate_username(raw.username, limits)?;

    let text = raw.text.unwrap_or_default();
    if text.chars().count() > limits.max_text_chars {
        return Err(ProtocolError::TextTooLong {
            max: limits.max_text_chars,
        });
    }

    let media = raw.media.map(|m| validate_media(m, limits)).transpose()?;
    if text.trim().is_empty() && media.is_none() {
        return Err(ProtocolError::EmptyMessage);
    }

    let timestamp = raw.timestamp.unwrap_or_default();
    if timestamp.trim().is_empty() {
        return Err(ProtocolError::MissingTimestamp);
    }

    Ok(NewMessage {
        username,
        text,
        media,
        timestamp,
    })
}

/// MIME essence without parameters, lowercased: `"Audio/WebM;codecs=opus"` → `"audio/webm"`.
fn essence(mime: &str) -> String {
    mime.split(';').next().unwrap_or("").trim().to_ascii_lowercase()
}

fn validate_media(raw: RawMedia, limits: &Limits) -> Result<Media, ProtocolError> {
    let mime = raw.mime.unwrap_or_default();
    let kind = essence(&mime);
    let top = kind.split('/').next().unwrap_or("");
    if !MEDIA_KINDS.contains(&top) || !kind.contains('/') {
        return Err(ProtocolError::UnsupportedMediaType(mime));
    }

    let url = raw.url.unwrap_or_default();
    let rest = url
        .strip_prefix("data:")
        .ok_or_else(|| ProtocolError::MalformedMedia("expected a data: URL".into()))?;
    let (header, body) = rest
        .split_once(',')
        .ok_or_else(|| ProtocolError::MalformedMedia("missing ',' separator".into()))?;
    if !header.ends_with(";base64") {
        return Err(ProtocolError::MalformedMedia("only base64 data URLs are accepted".into()));
    }
    let declared = essence(header);
    if declared != kind {
        return Err(ProtocolError::MalformedMedia(format!(
            "declared type '{declared}' does not match '{kind}'"
        )));
    }

    // Reject oversized payloads before paying for the decode.
    let too_large = ProtocolError::MediaTooLarge {
        max: limits.max_media_bytes,
    };
    if body.len() / 4 * 3 > limits.max_media_bytes.saturating_add(3) {
        return Err(too_large);
    }
    let bytes = STANDARD
        .decode(body)
        .map_err(|e| ProtocolError::MalformedMedia(e.to_string()))?;
    if bytes.len() > limits.max_media_bytes {
        return Err(too_large);
    }

    Ok(Media { url, mime })
}
