//! ALSA PCM device wrappers for audio capture and playback.

use alsa::pcm::{Access, Format, HwParams, PCM};
use alsa::{Direction, ValueOr};

use crate::error::DeviceError;

const EPERM: i32 = 1;
const ENOENT: i32 = 2;
const EACCES: i32 = 13;
const ENODEV: i32 = 19;

/// Parameters negotiated with the ALSA hardware.
#[derive(Debug, Clone)]
pub struct AlsaParams {
    /// Actual sample rate after negotiation
    pub sample_rate: u32,
    /// Actual number of channels
    pub channels: u32,
    /// Period size in frames (one frame = channels × sample_width)
    pub period_size: usize,
}

/// Open a PCM device for capture (recording).
pub fn open_capture(
    device: &str,
    sample_rate: u32,
    channels: u32,
) -> Result<(PCM, AlsaParams), DeviceError> {
    open_pcm(device, Direction::Capture, sample_rate, channels, None, "Capture")
}

/// Open a PCM device for playback.
pub fn open_playback(
    device: &str,
    sample_rate: u32,
    channels: u32,
    period_size: Option<usize>,
) -> Result<(PCM, AlsaParams), DeviceError> {
    open_pcm(
        device,
        Direction::Playback,
        sample_rate,
        channels,
        period_size,
        "Playback",
    )
}

fn open_pcm(
    device: &str,
    direction: Direction,
    sample_rate: u32,
    channels: u32,
    period_size: Option<usize>,
    dir_name: &str,
) -> Result<(PCM, AlsaParams), DeviceError> {
    let pcm = PCM::new(device, direction, false)
        .map_err(|e| map_alsa_error(&format!("open '{}' for {}", device, dir_name), e))?;

    // Configure hardware parameters
    {
        let hwp = HwParams::any(&pcm).map_err(|e| map_alsa_error("HwParams::any", e))?;
        let configure = || -> Result<(), alsa::Error> {
            hwp.set_access(Access::RWInterleaved)?;
            hwp.set_format(Format::S16LE)?;
            hwp.set_channels(channels)?;
            hwp.set_rate_near(sample_rate, ValueOr::Nearest)?;
            if let Some(ps) = period_size {
                hwp.set_period_size_near(ps as alsa::pcm::Frames, ValueOr::Nearest)?;
            }
            pcm.hw_params(&hwp)
        };
        configure().map_err(|e| map_alsa_error("configure hw params", e))?;
    }

    // Read back actual negotiated parameters
    let read_back = || -> Result<(u32, u32, usize), alsa::Error> {
        let hwp = pcm.hw_params_current()?;
        Ok((
            hwp.get_rate()?,
            hwp.get_channels()?,
            hwp.get_period_size()? as usize,
        ))
    };
    let (actual_rate, actual_channels, period_size) =
        read_back().map_err(|e| map_alsa_error("read hw params", e))?;

    let params = AlsaParams {
        sample_rate: actual_rate,
        channels: actual_channels,
        period_size,
    };

    log::info!(
        "ALSA {}: device={}, rate={}, channels={}, period_size={}",
        dir_name,
        device,
        actual_rate,
        actual_channels,
        period_size,
    );

    Ok((pcm, params))
}

/// Classify an ALSA failure. Permission and missing-device errnos get their
/// own variants so the caller can tell the user what to fix.
pub fn map_alsa_error(what: &str, err: alsa::Error) -> DeviceError {
    let msg = format!("{}: {}", what, err);
    match err.errno().abs() {
        EPERM | EACCES => DeviceError::PermissionDenied(msg),
        ENOENT | ENODEV => DeviceError::NotFound(msg),
        _ => DeviceError::Backend(msg),
    }
}
