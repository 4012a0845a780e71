//! lima_voice - realtime voice session engine for the farm advisor.
//!
//! Streams microphone audio to a conversational model, plays its speech back
//! gaplessly and answers its tool calls (climate risk, insurance status, farm
//! records) without pausing the audio.

pub mod audio;
pub mod config;
pub mod controller;
pub mod error;
pub mod farm;
pub mod mode_config;
pub mod net_link;
pub mod protocol;
pub mod session;
pub mod tools;

#[cfg(test)]
mod test_support;

pub use config::AppConfig;
pub use controller::{EngineHandle, SessionStatus, VoiceEngine};
pub use error::{CodecError, DeviceError, SessionError, ToolError, TransportError};
pub use session::{Session, SessionChannel, Speaker, TranscriptFragment};
