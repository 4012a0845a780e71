//! Microphone capture line.
//!
//! Uses a dedicated std::thread (NOT a tokio task) for real-time audio I/O,
//! like the playback side. The thread reads device periods, down-mixes to
//! mono, resamples to [`CAPTURE_SAMPLE_RATE`] and hands out fixed-size windows.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc as std_mpsc};
use std::thread::{self, JoinHandle};

use alsa::pcm::PCM;

use super::alsa_device::{self, AlsaParams};
use super::pcm_codec::CAPTURE_SAMPLE_RATE;
use super::resample::{LinearResampler, to_mono};
use crate::error::DeviceError;

/// Default window: 512 frames at 16 kHz = 32 ms per outbound chunk.
pub const DEFAULT_CAPTURE_WINDOW: usize = 512;

/// An opened input stream. Lives on the capture thread only.
pub trait CaptureSource {
    fn sample_rate(&self) -> u32;
    fn channels(&self) -> u16;

    /// Block until one device period is available and append it to `out` as
    /// interleaved f32. Recoverable device errors are handled inside; an `Err`
    /// means the stream is gone.
    fn read(&mut self, out: &mut Vec<f32>) -> Result<(), DeviceError>;
}

/// Something that can hand out exclusive microphone access.
pub trait CaptureDevice: Send + Sync {
    fn name(&self) -> &str;
    fn open(&self) -> Result<Box<dyn CaptureSource>, DeviceError>;
}

/// Continuous microphone-to-chunk pipeline.
pub struct AudioCaptureLine {
    device: Arc<dyn CaptureDevice>,
    window: usize,
    running: Arc<AtomicBool>,
    holding: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl AudioCaptureLine {
    pub fn new(device: Arc<dyn CaptureDevice>, window: usize) -> Self {
        Self {
            device,
            window: window.max(1),
            running: Arc::new(AtomicBool::new(false)),
            holding: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    /// Acquire the microphone and start emitting windows to `on_chunk`.
    ///
    /// Blocks until the device open has succeeded or failed, so a
    /// [`DeviceError`] reaches the caller before anything else happens.
    /// `on_chunk` runs on the capture thread and must not block.
    pub fn start<F>(&self, on_chunk: F) -> Result<(), DeviceError>
    where
        F: FnMut(&[f32]) + Send + 'static,
    {
        // A previous run must release the device first
        self.stop();

        self.running.store(true, Ordering::SeqCst);
        let (open_tx, open_rx) = std_mpsc::sync_channel::<Result<(), DeviceError>>(1);

        let device = self.device.clone();
        let running = self.running.clone();
        let holding = self.holding.clone();
        let window = self.window;

        let handle = thread::Builder::new()
            .name("audio-capture".into())
            .spawn(move || {
                capture_thread(device, window, on_chunk, open_tx, &running, &holding);
            })
            .map_err(|e| DeviceError::Backend(format!("failed to spawn capture thread: {}", e)))?;

        let opened = open_rx.recv().unwrap_or_else(|_| {
            Err(DeviceError::Backend(
                "capture thread exited before opening the device".into(),
            ))
        });

        match opened {
            Ok(()) => {
                if let Ok(mut slot) = self.handle.lock() {
                    *slot = Some(handle);
                }
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                let _ = handle.join();
                Err(e)
            }
        }
    }

    /// Release the microphone. Idempotent; safe before or during `start()`.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handle = match self.handle.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(h) = handle {
            if h.thread().id() != thread::current().id() {
                let _ = h.join();
            }
        }
    }

    /// Whether the capture thread currently holds the device.
    pub fn is_capturing(&self) -> bool {
        self.holding.load(Ordering::SeqCst)
    }

    pub fn device_name(&self) -> &str {
        self.device.name()
    }
}

impl Drop for AudioCaptureLine {
    fn drop(&mut self) {
        self.stop();
    }
}

// ======================== Capture thread ========================

fn capture_thread<F>(
    device: Arc<dyn CaptureDevice>,
    window: usize,
    mut on_chunk: F,
    open_tx: std_mpsc::SyncSender<Result<(), DeviceError>>,
    running: &AtomicBool,
    holding: &AtomicBool,
) where
    F: FnMut(&[f32]),
{
    let mut source = match device.open() {
        Ok(s) => s,
        Err(e) => {
            log::error!("Failed to open capture device {}: {}", device.name(), e);
            let _ = open_tx.send(Err(e));
            return;
        }
    };
    holding.store(true, Ordering::SeqCst);
    let _ = open_tx.send(Ok(()));

    let device_rate = source.sample_rate();
    let device_channels = source.channels();
    let mut resampler = LinearResampler::new(device_rate, CAPTURE_SAMPLE_RATE);
    let mut period: Vec<f32> = Vec::new();
    let mut accum: Vec<f32> = Vec::with_capacity(window * 2);

    log::info!(
        "Capture started: device={}, rate={}, ch={}, window={} frames @ {}Hz",
        device.name(),
        device_rate,
        device_channels,
        window,
        CAPTURE_SAMPLE_RATE,
    );

    while running.load(Ordering::Relaxed) {
        period.clear();
        if let Err(e) = source.read(&mut period) {
            log::error!("Capture stream lost: {}", e);
            break;
        }

        let mono = to_mono(&period, device_channels);
        resampler.process(&mono, &mut accum);

        while accum.len() >= window {
            on_chunk(&accum[..window]);
            accum.drain(..window);
        }
    }

    drop(source);
    holding.store(false, Ordering::SeqCst);
    log::info!("Capture stopped");
}

// ======================== ALSA backend ========================

/// ALSA microphone.
pub struct AlsaCaptureDevice {
    device: String,
    sample_rate: u32,
    channels: u32,
}

impl AlsaCaptureDevice {
    pub fn new(device: impl Into<String>, sample_rate: u32, channels: u32) -> Self {
        Self {
            device: device.into(),
            sample_rate,
            channels,
        }
    }
}

impl CaptureDevice for AlsaCaptureDevice {
    fn name(&self) -> &str {
        &self.device
    }

    fn open(&self) -> Result<Box<dyn CaptureSource>, DeviceError> {
        let (pcm, params) =
            alsa_device::open_capture(&self.device, self.sample_rate, self.channels)?;
        let read_buf = vec![0i16; params.period_size * params.channels as usize];
        Ok(Box::new(AlsaCaptureSource {
            pcm,
            params,
            read_buf,
        }))
    }
}

struct AlsaCaptureSource {
    pcm: PCM,
    params: AlsaParams,
    read_buf: Vec<i16>,
}

impl CaptureSource for AlsaCaptureSource {
    fn sample_rate(&self) -> u32 {
        self.params.sample_rate
    }

    fn channels(&self) -> u16 {
        self.params.channels as u16
    }

    fn read(&mut self, out: &mut Vec<f32>) -> Result<(), DeviceError> {
        let io = self
            .pcm
            .io_i16()
            .map_err(|e| alsa_device::map_alsa_error("io_i16", e))?;
        match io.readi(&mut self.read_buf) {
            Ok(frames) => {
                let n = frames * self.params.channels as usize;
                out.extend(self.read_buf[..n].iter().map(|&s| s as f32 / 32768.0));
                Ok(())
            }
            Err(e) => {
                log::warn!("ALSA capture error: {}, recovering...", e);
                self.pcm
                    .prepare()
                    .map_err(|e2| alsa_device::map_alsa_error("recover capture", e2))
            }
        }
    }
}
