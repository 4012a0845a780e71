//! Duplex session channel.
//!
//! `Idle -> Connecting -> Open -> Closed`, with `Errored` reachable from
//! Connecting and Open. Sends are fire-and-forget into an unbounded queue
//! drained by the link task; anything sent outside `Open` is dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::runtime::RuntimeFlavor;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::audio::AudioCaptureLine;
use crate::error::{DeviceError, SessionError, TransportError};
use crate::mode_config::{Language, PersonaMode, SessionModeConfig, SessionSetup};
use crate::protocol::{ClientMessage, FunctionResponse, ServerMessage, ToolCall};
use crate::tools::ResponseSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Connecting,
    Open,
    Closed,
    Errored,
}

// ======================== Transport seam ========================

/// An established, set-up conversation stream.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, msg: ClientMessage) -> Result<(), TransportError>;

    /// Next server message; `None` once the server has closed the stream.
    /// Must be cancel-safe.
    async fn recv(&mut self) -> Option<Result<ServerMessage, TransportError>>;

    async fn close(&mut self);
}

/// Opens a transport and completes the setup handshake.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, setup: &SessionSetup) -> Result<Box<dyn Transport>, TransportError>;
}

// ======================== Events ========================

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEventKind {
    Message(ServerMessage),
    TransportFailed(TransportError),
    ServerClosed,
}

/// Link-task output, tagged with the session generation that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionEvent {
    pub generation: u64,
    pub kind: SessionEventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    User,
    Model,
    /// Progress notes while a tool runs.
    Tool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptFragment {
    pub speaker: Speaker,
    pub text: String,
}

/// One demultiplexed piece of a server message.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Transcript(TranscriptFragment),
    Audio {
        data: String,
        mime_type: Option<String>,
    },
    ToolCall(ToolCall),
    ToolCancellation(Vec<String>),
    Interrupted,
    TurnComplete,
    ServerError(String),
}

/// Split a server message into events, in the order they must be handled.
pub fn demux(msg: ServerMessage) -> Vec<InboundEvent> {
    let mut events = Vec::new();

    if let Some(content) = msg.server_content {
        // Barge-in first so audio later in this message survives the reset
        if content.interrupted {
            events.push(InboundEvent::Interrupted);
        }
        if let Some(text) = content.input_transcription.and_then(|t| t.text) {
            if !text.is_empty() {
                events.push(InboundEvent::Transcript(TranscriptFragment {
                    speaker: Speaker::User,
                    text,
                }));
            }
        }
        for part in content.model_turn.map(|t| t.parts).unwrap_or_default() {
            if let Some(inline) = part.inline_data {
                events.push(InboundEvent::Audio {
                    data: inline.data,
                    mime_type: inline.mime_type,
                });
            }
            if let Some(text) = part.text.filter(|t| !t.is_empty()) {
                events.push(InboundEvent::Transcript(TranscriptFragment {
                    speaker: Speaker::Model,
                    text,
                }));
            }
        }
        if let Some(text) = content.output_transcription.and_then(|t| t.text) {
            if !text.is_empty() {
                events.push(InboundEvent::Transcript(TranscriptFragment {
                    speaker: Speaker::Model,
                    text,
                }));
            }
        }
        if content.turn_complete {
            events.push(InboundEvent::TurnComplete);
        }
    }

    if let Some(call) = msg.tool_call {
        events.extend(call.function_calls.into_iter().map(InboundEvent::ToolCall));
    }
    if let Some(cancel) = msg.tool_call_cancellation {
        if !cancel.ids.is_empty() {
            events.push(InboundEvent::ToolCancellation(cancel.ids));
        }
    }
    if let Some(err) = msg.error {
        events.push(InboundEvent::ServerError(
            err.message.unwrap_or_else(|| "unknown server error".to_string()),
        ));
    }

    events
}

// ======================== Shared state ========================

struct Inner {
    state: ChannelState,
    generation: u64,
    cancel: CancellationToken,
    outbound: Option<mpsc::UnboundedSender<ClientMessage>>,
}

struct Shared {
    inner: Mutex<Inner>,
    audio_sent: AtomicU64,
    /// Held while a session acquires or hands back the microphone.
    capture_gate: Mutex<()>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn capture_gate(&self) -> MutexGuard<'_, ()> {
        match self.capture_gate.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.lock().generation == generation
    }

    fn set_state_if_current(&self, generation: u64, state: ChannelState) {
        let mut inner = self.lock();
        if inner.generation == generation {
            inner.state = state;
            inner.outbound = None;
        }
    }
}

/// Cheap handle for pushing messages into one session. Bound to the session
/// generation it was created for; later sessions never see its messages.
#[derive(Clone)]
pub struct ChannelSender {
    shared: Arc<Shared>,
    generation: u64,
}

impl ChannelSender {
    fn send(&self, msg: ClientMessage) -> bool {
        let inner = self.shared.lock();
        if inner.generation != self.generation || inner.state != ChannelState::Open {
            log::debug!("Dropping outbound message: channel {:?}", inner.state);
            return false;
        }
        match &inner.outbound {
            Some(tx) => tx.send(msg).is_ok(),
            None => false,
        }
    }

    /// Encode and queue one capture window. Never blocks.
    pub fn send_audio(&self, samples: &[f32]) -> bool {
        let sent = self.send(ClientMessage::audio_chunk(samples));
        if sent {
            self.shared.audio_sent.fetch_add(1, Ordering::Relaxed);
        }
        sent
    }

    pub fn send_tool_response(&self, response: FunctionResponse) -> bool {
        self.send(ClientMessage::tool_response(response))
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl ResponseSink for ChannelSender {
    fn send_tool_response(&self, response: FunctionResponse) -> bool {
        ChannelSender::send_tool_response(self, response)
    }
}

// ======================== Session ========================

/// A live conversation as seen by the UI layer.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub id: Uuid,
    pub generation: u64,
    pub mode: PersonaMode,
    pub ambient: bool,
    pub language: Language,
    pub started_at: DateTime<Utc>,
}

/// A session slot claimed by [`SessionChannel::begin_open`]. A `close()`
/// issued after the claim cancels the session it stands for.
#[derive(Debug)]
pub struct OpenTicket {
    generation: u64,
    cancel: CancellationToken,
}

impl OpenTicket {
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

pub struct SessionChannel {
    connector: Arc<dyn Connector>,
    capture: Arc<AudioCaptureLine>,
    shared: Arc<Shared>,
}

impl SessionChannel {
    pub fn new(connector: Arc<dyn Connector>, capture: AudioCaptureLine) -> Self {
        Self {
            connector,
            capture: Arc::new(capture),
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: ChannelState::Idle,
                    generation: 0,
                    cancel: CancellationToken::new(),
                    outbound: None,
                }),
                audio_sent: AtomicU64::new(0),
                capture_gate: Mutex::new(()),
            }),
        }
    }

    /// Acquire the microphone, connect, and wait for the setup acknowledgment.
    ///
    /// A `close()` while this is pending makes it return
    /// `TransportError::Cancelled` with the channel already Closed.
    pub async fn open(
        &self,
        config: &SessionModeConfig,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Session, SessionError> {
        let ticket = self.begin_open()?;
        self.complete_open(ticket, config, events).await
    }

    /// Claim the next session generation and enter Connecting. Never blocks,
    /// so a caller can claim synchronously and run the handshake elsewhere.
    pub fn begin_open(&self) -> Result<OpenTicket, SessionError> {
        let mut inner = self.shared.lock();
        if matches!(inner.state, ChannelState::Connecting | ChannelState::Open) {
            return Err(SessionError::AlreadyActive);
        }
        inner.generation += 1;
        inner.state = ChannelState::Connecting;
        inner.cancel = CancellationToken::new();
        inner.outbound = None;
        self.shared.audio_sent.store(0, Ordering::Relaxed);
        Ok(OpenTicket {
            generation: inner.generation,
            cancel: inner.cancel.clone(),
        })
    }

    /// Second half of [`open`](Self::open) for a claimed ticket.
    pub async fn complete_open(
        &self,
        ticket: OpenTicket,
        config: &SessionModeConfig,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Session, SessionError> {
        let OpenTicket { generation, cancel } = ticket;
        let setup = config.build();
        log::info!(
            "Opening session #{}: mode={:?}, ambient={}, language={}, tools={}",
            generation,
            config.mode,
            config.ambient,
            config.language.code(),
            setup.tool_declarations.len(),
        );

        // 1. Microphone first; no device, no connection attempt
        match self.start_capture(generation, &cancel).await {
            Ok(true) => {}
            Ok(false) => {
                log::info!("Session #{} closed before the microphone opened", generation);
                return Err(TransportError::Cancelled.into());
            }
            Err(e) => {
                log::error!("Session #{} microphone unavailable: {}", generation, e);
                self.shared
                    .set_state_if_current(generation, ChannelState::Errored);
                return Err(e.into());
            }
        }

        // 2. Connect + setup handshake, raced against close()
        let connected = tokio::select! {
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            result = self.connector.connect(&setup) => result,
        };

        let mut transport = match connected {
            Ok(t) => t,
            Err(TransportError::Cancelled) => {
                log::info!("Session #{} closed during handshake", generation);
                self.release_capture(generation);
                return Err(TransportError::Cancelled.into());
            }
            Err(e) => {
                log::error!("Session #{} connect failed: {}", generation, e);
                self.release_capture(generation);
                self.shared
                    .set_state_if_current(generation, ChannelState::Errored);
                return Err(e.into());
            }
        };

        // 3. Open, unless close() slipped in after the handshake finished
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let still_wanted = {
            let mut inner = self.shared.lock();
            if inner.generation == generation && !cancel.is_cancelled() {
                inner.state = ChannelState::Open;
                inner.outbound = Some(out_tx);
                true
            } else {
                false
            }
        };
        if !still_wanted {
            transport.close().await;
            self.release_capture(generation);
            return Err(TransportError::Cancelled.into());
        }

        tokio::spawn(link_task(
            transport,
            out_rx,
            cancel,
            events,
            generation,
            self.shared.clone(),
        ));

        log::info!("Session #{} open", generation);
        Ok(Session {
            id: Uuid::new_v4(),
            generation,
            mode: config.mode,
            ambient: config.ambient,
            language: config.language,
            started_at: Utc::now(),
        })
    }

    /// Release everything. Idempotent; safe in any state.
    pub fn close(&self) {
        self.shutdown(ChannelState::Closed);
    }

    /// Same teardown as `close()`, but leaves the channel Errored.
    pub fn fail(&self) {
        self.shutdown(ChannelState::Errored);
    }

    fn shutdown(&self, final_state: ChannelState) {
        let previous = {
            let mut inner = self.shared.lock();
            inner.cancel.cancel();
            inner.outbound = None;
            let previous = inner.state;
            inner.state = final_state;
            previous
        };
        off_worker(|| self.capture.stop());
        if previous != final_state {
            log::info!("Session channel {:?} -> {:?}", previous, final_state);
        }
    }

    /// Start the microphone for `generation` on the blocking pool.
    ///
    /// `Ok(false)` means the session was closed before or while the device
    /// opened; the microphone is released again in that case.
    async fn start_capture(
        &self,
        generation: u64,
        cancel: &CancellationToken,
    ) -> Result<bool, DeviceError> {
        let capture = self.capture.clone();
        let shared = self.shared.clone();
        let cancel = cancel.clone();
        let sender = self.sender_for(generation);

        tokio::task::spawn_blocking(move || -> Result<bool, DeviceError> {
            let _gate = shared.capture_gate();
            if cancel.is_cancelled() || !shared.is_current(generation) {
                return Ok(false);
            }
            capture.start(move |window| {
                sender.send_audio(window);
            })?;
            // close() may have landed while the device was opening
            if cancel.is_cancelled() || !shared.is_current(generation) {
                capture.stop();
                return Ok(false);
            }
            Ok(true)
        })
        .await
        .unwrap_or_else(|e| Err(DeviceError::Backend(format!("capture start task failed: {}", e))))
    }

    /// Stop the microphone unless a newer session already owns it.
    fn release_capture(&self, generation: u64) {
        off_worker(|| {
            let _gate = self.shared.capture_gate();
            if self.shared.is_current(generation) {
                self.capture.stop();
            }
        });
    }

    pub fn state(&self) -> ChannelState {
        self.shared.lock().state
    }

    pub fn generation(&self) -> u64 {
        self.shared.lock().generation
    }

    /// Sender bound to the current session generation.
    pub fn sender(&self) -> ChannelSender {
        let generation = self.generation();
        self.sender_for(generation)
    }

    fn sender_for(&self, generation: u64) -> ChannelSender {
        ChannelSender {
            shared: self.shared.clone(),
            generation,
        }
    }

    /// Audio chunks queued for sending in the current session.
    pub fn audio_chunks_sent(&self) -> u64 {
        self.shared.audio_sent.load(Ordering::Relaxed)
    }

    pub fn is_capturing(&self) -> bool {
        self.capture.is_capturing()
    }
}

impl Drop for SessionChannel {
    fn drop(&mut self) {
        self.close();
    }
}

/// Run blocking device work without parking a runtime worker. Falls back to
/// running inline outside a multi-threaded runtime.
fn off_worker<R>(f: impl FnOnce() -> R) -> R {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

// ======================== Link task ========================

enum LinkStep {
    Cancelled,
    Outbound(Option<ClientMessage>),
    Inbound(Option<Result<ServerMessage, TransportError>>),
}

async fn link_task(
    mut transport: Box<dyn Transport>,
    mut out_rx: mpsc::UnboundedReceiver<ClientMessage>,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<SessionEvent>,
    generation: u64,
    shared: Arc<Shared>,
) {
    let emit = |kind: SessionEventKind| {
        let _ = events.send(SessionEvent { generation, kind });
    };

    loop {
        let step = tokio::select! {
            biased;
            _ = cancel.cancelled() => LinkStep::Cancelled,
            msg = out_rx.recv() => LinkStep::Outbound(msg),
            inbound = transport.recv() => LinkStep::Inbound(inbound),
        };

        match step {
            LinkStep::Cancelled | LinkStep::Outbound(None) => {
                transport.close().await;
                break;
            }
            LinkStep::Outbound(Some(msg)) => {
                if let Err(e) = transport.send(msg).await {
                    log::error!("Session #{} send failed: {}", generation, e);
                    shared.set_state_if_current(generation, ChannelState::Errored);
                    emit(SessionEventKind::TransportFailed(e));
                    break;
                }
            }
            LinkStep::Inbound(Some(Ok(msg))) => emit(SessionEventKind::Message(msg)),
            LinkStep::Inbound(Some(Err(e))) => {
                log::error!("Session #{} receive failed: {}", generation, e);
                shared.set_state_if_current(generation, ChannelState::Errored);
                emit(SessionEventKind::TransportFailed(e));
                break;
            }
            LinkStep::Inbound(None) => {
                log::info!("Session #{} closed by server", generation);
                shared.set_state_if_current(generation, ChannelState::Closed);
                emit(SessionEventKind::ServerClosed);
                break;
            }
        }
    }
    log::debug!("Session #{} link task finished", generation);
}
