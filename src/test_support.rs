//! Fakes shared by the unit tests: devices, playback clock, connector, tools.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::audio::{CaptureDevice, CaptureSource, PlaybackEvent, PlaybackOutput, ScheduledUnit};
use crate::error::{DeviceError, ToolError, TransportError};
use crate::farm::{
    ClimateRiskLookup, ClimateRiskSnapshot, FarmProfile, InsuranceLookup, InsurancePolicySnapshot,
    offline_climate_snapshot, offline_insurance_snapshot,
};
use crate::mode_config::SessionSetup;
use crate::protocol::{ClientMessage, FunctionResponse, ServerMessage};
use crate::session::{Connector, Transport};
use crate::tools::ToolHandler;

/// Poll `cond` for up to two seconds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

// ======================== Capture ========================

#[derive(Debug, Clone, Copy)]
enum Signal {
    Ramp,
    Constant(f32),
}

/// Microphone that produces a synthetic signal in real time.
pub struct FakeCaptureDevice {
    sample_rate: u32,
    channels: u16,
    period: usize,
    signal: Signal,
    open_delay: Duration,
    opens: AtomicUsize,
}

impl FakeCaptureDevice {
    /// Strictly increasing samples, so ordering can be checked downstream.
    pub fn ramp(sample_rate: u32, channels: u16, period: usize) -> Self {
        Self::with_signal(sample_rate, channels, period, Signal::Ramp)
    }

    pub fn constant(sample_rate: u32, channels: u16, period: usize, value: f32) -> Self {
        Self::with_signal(sample_rate, channels, period, Signal::Constant(value))
    }

    fn with_signal(sample_rate: u32, channels: u16, period: usize, signal: Signal) -> Self {
        Self {
            sample_rate,
            channels,
            period,
            signal,
            open_delay: Duration::ZERO,
            opens: AtomicUsize::new(0),
        }
    }

    /// Make every open take `delay`, like a slow permission prompt.
    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl CaptureDevice for FakeCaptureDevice {
    fn name(&self) -> &str {
        "fake-mic"
    }

    fn open(&self) -> Result<Box<dyn CaptureSource>, DeviceError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        thread::sleep(self.open_delay);
        Ok(Box::new(FakeCaptureSource {
            sample_rate: self.sample_rate,
            channels: self.channels,
            period: self.period,
            signal: self.signal,
            produced: 0,
        }))
    }
}

struct FakeCaptureSource {
    sample_rate: u32,
    channels: u16,
    period: usize,
    signal: Signal,
    produced: u64,
}

impl CaptureSource for FakeCaptureSource {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn read(&mut self, out: &mut Vec<f32>) -> Result<(), DeviceError> {
        let period_us = self.period as u64 * 1_000_000 / self.sample_rate as u64;
        thread::sleep(Duration::from_micros(period_us));

        for _ in 0..self.period {
            let value = match self.signal {
                Signal::Ramp => self.produced as f32 * 1e-5,
                Signal::Constant(v) => v,
            };
            self.produced += 1;
            for _ in 0..self.channels {
                out.push(value);
            }
        }
        Ok(())
    }
}

/// Microphone the user refused access to.
pub struct DeniedCaptureDevice;

impl CaptureDevice for DeniedCaptureDevice {
    fn name(&self) -> &str {
        "denied-mic"
    }

    fn open(&self) -> Result<Box<dyn CaptureSource>, DeviceError> {
        Err(DeviceError::PermissionDenied("microphone access denied".into()))
    }
}

// ======================== Playback ========================

/// Playback output whose clock only moves when the test says so.
pub struct ManualOutput {
    rate: u32,
    now: AtomicU64,
    units: Mutex<Vec<ScheduledUnit>>,
    starts: Mutex<Vec<u64>>,
    cancels: AtomicUsize,
    events: mpsc::UnboundedSender<PlaybackEvent>,
}

impl ManualOutput {
    pub fn new(rate: u32) -> (Arc<Self>, mpsc::UnboundedReceiver<PlaybackEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let output = Arc::new(Self {
            rate,
            now: AtomicU64::new(0),
            units: Mutex::new(Vec::new()),
            starts: Mutex::new(Vec::new()),
            cancels: AtomicUsize::new(0),
            events,
        });
        (output, rx)
    }

    /// Move the clock forward and report the units that finished playing.
    pub fn advance(&self, frames: u64) -> Vec<u64> {
        let now = self.now.fetch_add(frames, Ordering::SeqCst) + frames;
        let mut units = self.units.lock().unwrap();
        let mut ended: Vec<ScheduledUnit> = Vec::new();
        units.retain(|u| {
            if u.end() <= now {
                ended.push(u.clone());
                false
            } else {
                true
            }
        });
        ended.sort_by_key(|u| u.end());
        ended
            .into_iter()
            .map(|u| {
                let _ = self.events.send(PlaybackEvent::UnitEnded(u.id));
                u.id
            })
            .collect()
    }

    pub fn scheduled_starts(&self) -> Vec<u64> {
        self.starts.lock().unwrap().clone()
    }

    pub fn cancel_count(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }
}

impl PlaybackOutput for ManualOutput {
    fn timeline_rate(&self) -> u32 {
        self.rate
    }

    fn now(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn schedule(&self, mut unit: ScheduledUnit) -> u64 {
        unit.start = unit.start.max(self.now());
        let start = unit.start;
        self.starts.lock().unwrap().push(start);
        self.units.lock().unwrap().push(unit);
        start
    }

    fn cancel_all(&self) {
        self.units.lock().unwrap().clear();
        self.cancels.fetch_add(1, Ordering::SeqCst);
    }
}

// ======================== Tools ========================

/// Response sink that records what it is given.
pub struct CollectingSink {
    open: bool,
    responses: Mutex<Vec<FunctionResponse>>,
}

impl CollectingSink {
    pub fn open() -> Arc<Self> {
        Arc::new(Self {
            open: true,
            responses: Mutex::new(Vec::new()),
        })
    }

    /// A sink for a session that has already ended.
    pub fn closed() -> Arc<Self> {
        Arc::new(Self {
            open: false,
            responses: Mutex::new(Vec::new()),
        })
    }

    pub fn responses(&self) -> Vec<FunctionResponse> {
        self.responses.lock().unwrap().clone()
    }
}

impl crate::tools::ResponseSink for CollectingSink {
    fn send_tool_response(&self, response: FunctionResponse) -> bool {
        if !self.open {
            return false;
        }
        self.responses.lock().unwrap().push(response);
        true
    }
}

/// Sleeps, then answers `{"tool": <name>}`.
pub struct DelayTool {
    name: String,
    delay: Duration,
}

impl DelayTool {
    pub fn new(name: &str, delay: Duration) -> Self {
        Self {
            name: name.to_string(),
            delay,
        }
    }
}

#[async_trait]
impl ToolHandler for DelayTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Sleeps, then echoes its name"
    }

    fn input_schema(&self) -> Value {
        json!({"type": "OBJECT", "properties": {}})
    }

    async fn call(&self, _args: Value) -> Result<Value, ToolError> {
        tokio::time::sleep(self.delay).await;
        Ok(json!({"tool": self.name}))
    }
}

pub struct FailingTool;

#[async_trait]
impl ToolHandler for FailingTool {
    fn name(&self) -> &str {
        "always_fails"
    }

    fn description(&self) -> &str {
        "Always fails"
    }

    fn input_schema(&self) -> Value {
        json!({"type": "OBJECT", "properties": {}})
    }

    async fn call(&self, _args: Value) -> Result<Value, ToolError> {
        Err(ToolError::Failed("boom".into()))
    }
}

/// Climate lookup that always serves the offline snapshot for 2025-01-06.
#[derive(Default)]
pub struct StaticClimate {
    locations: Mutex<Vec<String>>,
}

impl StaticClimate {
    pub fn locations(&self) -> Vec<String> {
        self.locations.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClimateRiskLookup for StaticClimate {
    async fn climate_risk(&self, location: &str) -> Result<ClimateRiskSnapshot, ToolError> {
        self.locations.lock().unwrap().push(location.to_string());
        let today = NaiveDate::from_ymd_opt(2025, 1, 6).unwrap();
        Ok(offline_climate_snapshot(today))
    }
}

pub struct StaticInsurance;

#[async_trait]
impl InsuranceLookup for StaticInsurance {
    async fn insurance_policy(
        &self,
        farm: &FarmProfile,
    ) -> Result<InsurancePolicySnapshot, ToolError> {
        Ok(offline_insurance_snapshot(farm))
    }
}

// ======================== Transport ========================

enum ServerScript {
    Message(ServerMessage),
    Fail(TransportError),
    HangUp,
}

#[derive(Clone)]
enum ConnectBehavior {
    Pending,
    Ready,
    Failing(TransportError),
}

/// Connector whose "server" is driven from the test through a [`ServerHandle`].
pub struct ScriptedConnector {
    behavior: ConnectBehavior,
    connects: AtomicUsize,
    server: Mutex<Option<ServerHandle>>,
}

impl ScriptedConnector {
    /// Handshake never completes.
    pub fn pending() -> Arc<Self> {
        Self::with_behavior(ConnectBehavior::Pending)
    }

    pub fn ready() -> Arc<Self> {
        Self::with_behavior(ConnectBehavior::Ready)
    }

    pub fn failing(err: TransportError) -> Arc<Self> {
        Self::with_behavior(ConnectBehavior::Failing(err))
    }

    fn with_behavior(behavior: ConnectBehavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            connects: AtomicUsize::new(0),
            server: Mutex::new(None),
        })
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Server side of the most recent connection.
    pub fn take_server(&self) -> Option<ServerHandle> {
        self.server.lock().unwrap().take()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, _setup: &SessionSetup) -> Result<Box<dyn Transport>, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        match self.behavior.clone() {
            ConnectBehavior::Pending => std::future::pending().await,
            ConnectBehavior::Failing(err) => Err(err),
            ConnectBehavior::Ready => {
                let (client_tx, client_rx) = mpsc::unbounded_channel();
                let (script_tx, script_rx) = mpsc::unbounded_channel();
                let closed = Arc::new(AtomicBool::new(false));
                *self.server.lock().unwrap() = Some(ServerHandle {
                    client_rx,
                    script_tx,
                    closed: closed.clone(),
                });
                Ok(Box::new(ScriptedTransport {
                    client_tx,
                    script_rx,
                    closed,
                }))
            }
        }
    }
}

struct ScriptedTransport {
    client_tx: mpsc::UnboundedSender<ClientMessage>,
    script_rx: mpsc::UnboundedReceiver<ServerScript>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&mut self, msg: ClientMessage) -> Result<(), TransportError> {
        let _ = self.client_tx.send(msg);
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<ServerMessage, TransportError>> {
        match self.script_rx.recv().await? {
            ServerScript::Message(msg) => Some(Ok(msg)),
            ServerScript::Fail(err) => Some(Err(err)),
            ServerScript::HangUp => None,
        }
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct ServerHandle {
    client_rx: mpsc::UnboundedReceiver<ClientMessage>,
    script_tx: mpsc::UnboundedSender<ServerScript>,
    closed: Arc<AtomicBool>,
}

impl ServerHandle {
    /// Next message the client sent, or `None` after two seconds.
    pub async fn next_client(&mut self) -> Option<ClientMessage> {
        tokio::time::timeout(Duration::from_secs(2), self.client_rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Next tool response, skipping microphone audio.
    pub async fn next_tool_response(&mut self) -> Option<FunctionResponse> {
        loop {
            match self.next_client().await? {
                ClientMessage::ToolResponse(mut r) if !r.function_responses.is_empty() => {
                    return Some(r.function_responses.remove(0));
                }
                _ => continue,
            }
        }
    }

    pub fn transport_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn push(&self, msg: ServerMessage) {
        let _ = self.script_tx.send(ServerScript::Message(msg));
    }

    pub fn push_json(&self, json: &str) {
        self.push(ServerMessage::parse(json).unwrap());
    }

    pub fn fail(&self, err: TransportError) {
        let _ = self.script_tx.send(ServerScript::Fail(err));
    }

    pub fn hang_up(&self) {
        let _ = self.script_tx.send(ServerScript::HangUp);
    }
}
