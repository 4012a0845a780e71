//! Error taxonomy for the voice session engine.
//!
//! Only [`DeviceError`] and [`TransportError`] end a session. [`CodecError`]
//! drops a single inbound chunk and [`ToolError`] is folded into the tool
//! response that goes back to the model.

use thiserror::Error;

/// Microphone / speaker acquisition failures. Fatal to session start.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("no audio device available: {0}")]
    NotFound(String),

    #[error("audio device permission denied: {0}")]
    PermissionDenied(String),

    #[error("audio backend error: {0}")]
    Backend(String),
}

/// Handshake or mid-session network failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("connection closed by server: {0}")]
    ClosedByServer(String),

    #[error("transport I/O error: {0}")]
    Io(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("session closed while connecting")]
    Cancelled,
}

/// Malformed audio frames. The offending chunk is dropped, nothing else.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("odd PCM frame length: {0} bytes")]
    OddLength(usize),

    #[error("PCM frame of {samples} samples does not divide into {channels} channels")]
    PartialFrame { samples: usize, channels: u16 },

    #[error("invalid stream format: rate={sample_rate}, channels={channels}")]
    InvalidFormat { sample_rate: u32, channels: u16 },

    #[error("invalid base64 audio payload: {0}")]
    Base64(String),
}

/// Tool handler failures, reported back to the model as an error result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolError {
    #[error("Tool {0} not found")]
    UnknownTool(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("tool execution failed: {0}")]
    Failed(String),
}

/// Errors surfaced by `open()` / `start()`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("a session is already active")]
    AlreadyActive,

    #[error("voice engine is not running")]
    EngineStopped,
}
