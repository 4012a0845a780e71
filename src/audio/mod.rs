//! audio - Audio capture, playback scheduling and PCM codec
//!
//! Uses ALSA for audio I/O on dedicated OS threads. Outbound audio is 16 kHz
//! mono 16-bit PCM, inbound speech is 24 kHz mono 16-bit PCM.

mod alsa_device;
pub mod capture;
pub mod pcm_codec;
pub mod play;
pub mod resample;
pub mod scheduler;

pub use capture::{
    AlsaCaptureDevice, AudioCaptureLine, CaptureDevice, CaptureSource, DEFAULT_CAPTURE_WINDOW,
};
pub use pcm_codec::AudioBuffer;
pub use play::{AlsaPlayback, PlaybackEvent, PlaybackOutput, ScheduledUnit};
pub use scheduler::{PlaybackScheduler, PlaybackStatus, ScheduledSlot};
