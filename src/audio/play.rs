//! Playback output: the device side of the playback timeline.
//!
//! The scheduler decides *when* a unit plays; an output renders it. The ALSA
//! output runs on its own OS thread, mixes pending units into device periods and
//! writes silence when idle so its clock keeps moving in real time.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, mpsc as std_mpsc};
use std::thread::{self, JoinHandle};

use tokio::sync::mpsc;

use super::alsa_device;
use super::pcm_codec::{PLAYBACK_SAMPLE_RATE, float_to_i16};
use super::resample::{LinearResampler, from_mono};
use crate::error::DeviceError;

/// One scheduled piece of mono audio at the timeline rate.
#[derive(Debug, Clone)]
pub struct ScheduledUnit {
    pub id: u64,
    /// Start position on the timeline, in frames.
    pub start: u64,
    pub samples: Arc<[f32]>,
}

impl ScheduledUnit {
    pub fn end(&self) -> u64 {
        self.start + self.samples.len() as u64
    }
}

/// Notifications from the output back to the engine loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// The unit played to its end. Never sent for cancelled units.
    UnitEnded(u64),
}

pub trait PlaybackOutput: Send + Sync {
    /// Frames per second of the timeline.
    fn timeline_rate(&self) -> u32;

    /// Earliest timeline frame that can still be rendered. Monotonic.
    fn now(&self) -> u64;

    /// Queue `unit` and return the start it will actually play at. A start
    /// the output has already rendered past is moved up to `now()`.
    fn schedule(&self, unit: ScheduledUnit) -> u64;

    /// Silence everything scheduled, including the unit playing right now.
    fn cancel_all(&self);
}

// ======================== ALSA output ========================

struct Shared {
    /// Timeline frames rendered so far. Only advanced with `pending` held.
    clock: AtomicU64,
    running: AtomicBool,
    pending: Mutex<Vec<ScheduledUnit>>,
    events: mpsc::UnboundedSender<PlaybackEvent>,
}

/// Speaker output on ALSA, timeline at [`PLAYBACK_SAMPLE_RATE`].
pub struct AlsaPlayback {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl AlsaPlayback {
    /// Open the playback device and start the mixing thread.
    ///
    /// `period_size` of `None` lets ALSA decide.
    pub fn start(
        device: &str,
        sample_rate: u32,
        channels: u32,
        period_size: Option<usize>,
        events: mpsc::UnboundedSender<PlaybackEvent>,
    ) -> Result<Self, DeviceError> {
        let shared = Arc::new(Shared {
            clock: AtomicU64::new(0),
            running: AtomicBool::new(true),
            pending: Mutex::new(Vec::new()),
            events,
        });

        let (open_tx, open_rx) = std_mpsc::sync_channel::<Result<(), DeviceError>>(1);
        let device = device.to_string();
        let thread_shared = shared.clone();

        let handle = thread::Builder::new()
            .name("audio-playback".into())
            .spawn(move || {
                play_thread(
                    &device,
                    sample_rate,
                    channels,
                    period_size,
                    &thread_shared,
                    open_tx,
                );
            })
            .map_err(|e| DeviceError::Backend(format!("failed to spawn playback thread: {}", e)))?;

        let opened = open_rx.recv().unwrap_or_else(|_| {
            Err(DeviceError::Backend(
                "playback thread exited before opening the device".into(),
            ))
        });
        if let Err(e) = opened {
            let _ = handle.join();
            return Err(e);
        }

        Ok(Self {
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        let handle = match self.handle.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(h) = handle {
            let _ = h.join();
        }
    }
}

impl Drop for AlsaPlayback {
    fn drop(&mut self) {
        self.stop();
    }
}

impl PlaybackOutput for AlsaPlayback {
    fn timeline_rate(&self) -> u32 {
        PLAYBACK_SAMPLE_RATE
    }

    fn now(&self) -> u64 {
        self.shared.clock.load(Ordering::Acquire)
    }

    fn schedule(&self, unit: ScheduledUnit) -> u64 {
        schedule_unit(&self.shared, unit)
    }

    fn cancel_all(&self) {
        if let Ok(mut pending) = self.shared.pending.lock() {
            pending.clear();
        }
    }
}

// ======================== Playback thread ========================

fn play_thread(
    device: &str,
    sample_rate: u32,
    channels: u32,
    period_size: Option<usize>,
    shared: &Shared,
    open_tx: std_mpsc::SyncSender<Result<(), DeviceError>>,
) {
    let (pcm, params) = match alsa_device::open_playback(device, sample_rate, channels, period_size)
    {
        Ok(opened) => opened,
        Err(e) => {
            log::error!("Failed to open playback device {}: {}", device, e);
            let _ = open_tx.send(Err(e));
            return;
        }
    };
    let io = match pcm.io_i16() {
        Ok(io) => io,
        Err(e) => {
            let _ = open_tx.send(Err(alsa_device::map_alsa_error("io_i16", e)));
            return;
        }
    };
    let _ = open_tx.send(Ok(()));

    let device_rate = params.sample_rate;
    let device_channels = params.channels as u16;
    // Timeline frames rendered per device period
    let block = ((params.period_size as u64 * PLAYBACK_SAMPLE_RATE as u64)
        / device_rate.max(1) as u64)
        .max(1) as usize;

    let mut resampler = LinearResampler::new(PLAYBACK_SAMPLE_RATE, device_rate);
    let mut mix = vec![0.0f32; block];
    let mut device_mono: Vec<f32> = Vec::with_capacity(params.period_size * 2);
    let mut out_i16: Vec<i16> = Vec::new();

    log::info!(
        "Playback started: rate={}, ch={}, period={}, timeline block={} frames @ {}Hz",
        device_rate,
        device_channels,
        params.period_size,
        block,
        PLAYBACK_SAMPLE_RATE,
    );

    while shared.running.load(Ordering::Relaxed) {
        mix.iter_mut().for_each(|s| *s = 0.0);
        let finished = render_block(shared, &mut mix);

        device_mono.clear();
        resampler.process(&mix, &mut device_mono);
        out_i16.clear();
        out_i16.extend(
            from_mono(&device_mono, device_channels)
                .into_iter()
                .map(float_to_i16),
        );

        // Write with retry loop to handle short writes and XRUN recovery
        let total_frames = out_i16.len() / device_channels.max(1) as usize;
        let mut frames_written = 0;
        let mut retry_count = 0u32;
        while frames_written < total_frames {
            let offset = frames_written * device_channels as usize;
            match io.writei(&out_i16[offset..]) {
                Ok(n) => {
                    frames_written += n;
                    retry_count = 0;
                }
                Err(e) => {
                    log::warn!("ALSA XRUN or error: {}, recovering...", e);
                    retry_count += 1;
                    if let Err(e2) = pcm.prepare() {
                        log::error!("Failed to recover PCM playback: {}", e2);
                        break;
                    }
                    // 底层持续跟不上时丢弃剩余帧，防止死循环
                    if retry_count >= 3 {
                        log::error!(
                            "Max recovery retries ({}) reached. Dropping {} unwritten frames.",
                            retry_count,
                            total_frames - frames_written
                        );
                        break;
                    }
                }
            }
        }

        for id in finished {
            let _ = shared.events.send(PlaybackEvent::UnitEnded(id));
        }
    }

    let _ = pcm.drain();
    log::info!("Playback stopped");
}

/// Queue a unit, moving its start up to the render position if that block
/// has already been mixed.
fn schedule_unit(shared: &Shared, mut unit: ScheduledUnit) -> u64 {
    let Ok(mut pending) = shared.pending.lock() else {
        return unit.start;
    };
    let rendered = shared.clock.load(Ordering::Acquire);
    if unit.start < rendered {
        log::trace!(
            "Unit {} moved from {} to {} (already rendered)",
            unit.id,
            unit.start,
            rendered
        );
        unit.start = rendered;
    }
    let start = unit.start;
    pending.push(unit);
    start
}

/// Mix every pending unit overlapping the next block into `mix`, advance the
/// render position past it and return the ids of units that end inside it.
fn render_block(shared: &Shared, mix: &mut [f32]) -> Vec<u64> {
    let mut finished = Vec::new();

    let Ok(mut pending) = shared.pending.lock() else {
        return finished;
    };
    let clock = shared.clock.load(Ordering::Acquire);
    let block_end = clock + mix.len() as u64;

    for unit in pending.iter() {
        let from = unit.start.max(clock);
        let to = unit.end().min(block_end);
        if from < to {
            let src = (from - unit.start) as usize;
            let dst = (from - clock) as usize;
            let len = (to - from) as usize;
            for (d, s) in mix[dst..dst + len]
                .iter_mut()
                .zip(&unit.samples[src..src + len])
            {
                *d = (*d + *s).clamp(-1.0, 1.0);
            }
        }
    }

    pending.retain(|unit| {
        if unit.end() <= block_end {
            finished.push(unit.id);
            false
        } else {
            true
        }
    });
    shared.clock.store(block_end, Ordering::Release);
    finished
}
