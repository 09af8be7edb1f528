//! Crate-level error types.
//!
//! [`RelayError`] covers everything that can stop the server or a session.
//! [`ProtocolError`] is a per-frame rejection: it never ends a session, it is
//! reported back to the offending client as an `error` event carrying
//! [`ProtocolError::code`].

use thiserror::Error;

/// Fatal or session-ending failures.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("could not parse config file: {0}")]
    ConfigFile(#[from] toml::de::Error),

    #[error("HTTP request could not be parsed: {0}")]
    Http(#[from] httparse::Error),

    #[error("HTTP request head exceeds the size limit")]
    HeadTooLarge,

    /// The hub task has stopped; no further events can be processed.
    #[error("broadcast hub is no longer running")]
    HubClosed,
}

/// Why a single inbound frame was rejected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("frame is not a valid event envelope: {0}")]
    MalformedFrame(String),

    #[error("unknown event '{0}'")]
    UnknownEvent(String),

    #[error("username must be between 1 and {max} characters")]
    InvalidUsername { max: usize },

    #[error("message needs text or media")]
    EmptyMessage,

    #[error("text exceeds {max} characters")]
    TextTooLong { max: usize },

    #[error("timestamp is required")]
    MissingTimestamp,

    #[error("media type '{0}' is not an image, video or audio type")]
    UnsupportedMediaType(String),

    #[error("media url is not a valid base64 data URL: {0}")]
    MalformedMedia(String),

    #[error("media exceeds {max} bytes")]
    MediaTooLarge { max: usize },
}

impl ProtocolError {
    /// Stable machine-readable code sent to clients in `error` events.
    pub fn code(&self) -> &'static str {
        match self {
            ProtocolError::MalformedFrame(_) => "malformed_frame",
            ProtocolError::UnknownEvent(_) => "unknown_event",
            ProtocolError::InvalidUsername { .. } => "invalid_username",
            ProtocolError::EmptyMessage => "empty_message",
            ProtocolError::TextTooLong { .. } => "text_too_long",
            ProtocolError::MissingTimestamp => "missing_timestamp",
            ProtocolError::UnsupportedMediaType(_) => "unsupported_media_type",
            ProtocolError::MalformedMedia(_) => "malformed_media",
            ProtocolError::MediaTooLarge { .. } => "media_too_large",
        }
    }
}
