//! VoiceEngine - owner of one live voice session.
//!
//! All scheduler mutation happens on the engine loop: inbound session events,
//! playback completions and UI commands are serialised through one
//! `tokio::select!`. Tool handlers and the capture thread never touch it.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};

use crate::audio::pcm_codec;
use crate::audio::{PlaybackEvent, PlaybackOutput, PlaybackScheduler, PlaybackStatus};
use crate::error::{SessionError, TransportError};
use crate::mode_config::SessionModeConfig;
use crate::session::{
    ChannelState, InboundEvent, OpenTicket, Session, SessionChannel, SessionEvent,
    SessionEventKind, Speaker, TranscriptFragment, demux,
};
use crate::tools::ToolCallDispatcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Connecting,
    Listening,
    Speaking,
    Closed,
    Errored,
}

impl SessionStatus {
    fn is_live(self) -> bool {
        matches!(
            self,
            SessionStatus::Connecting | SessionStatus::Listening | SessionStatus::Speaking
        )
    }
}

pub enum EngineCommand {
    Start {
        config: SessionModeConfig,
        reply: oneshot::Sender<Result<Session, SessionError>>,
    },
    Stop,
}

struct OpenOutcome {
    generation: u64,
    result: Result<Session, SessionError>,
    reply: oneshot::Sender<Result<Session, SessionError>>,
}

enum EngineStep {
    Command(Option<EngineCommand>),
    Opened(OpenOutcome),
    Session(SessionEvent),
    Playback(PlaybackEvent),
}

pub struct VoiceEngine {
    channel: Arc<SessionChannel>,
    scheduler: PlaybackScheduler,
    dispatcher: Arc<ToolCallDispatcher>,
    status: watch::Sender<SessionStatus>,
    transcript: mpsc::UnboundedSender<TranscriptFragment>,
    session: Option<Session>,
    session_tx: mpsc::UnboundedSender<SessionEvent>,
    session_rx: mpsc::UnboundedReceiver<SessionEvent>,
    playback_rx: mpsc::UnboundedReceiver<PlaybackEvent>,
}

impl VoiceEngine {
    pub fn new(
        channel: Arc<SessionChannel>,
        output: Arc<dyn PlaybackOutput>,
        playback_rx: mpsc::UnboundedReceiver<PlaybackEvent>,
        dispatcher: ToolCallDispatcher,
        transcript: mpsc::UnboundedSender<TranscriptFragment>,
    ) -> Self {
        let (status, _) = watch::channel(SessionStatus::Idle);
        let (session_tx, session_rx) = mpsc::unbounded_channel();
        Self {
            channel,
            scheduler: PlaybackScheduler::new(output),
            dispatcher: Arc::new(dispatcher),
            status,
            transcript,
            session: None,
            session_tx,
            session_rx,
            playback_rx,
        }
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Open a session and wait for it to be live.
    pub async fn start(&mut self, config: &SessionModeConfig) -> Result<Session, SessionError> {
        let ticket = self.begin_start()?;
        let generation = ticket.generation();
        let result = self
            .channel
            .complete_open(ticket, config, self.session_tx.clone())
            .await;
        self.finish_start(generation, result)
    }

    /// Claim the channel for a new session. Synchronous, so a Stop handled
    /// right after it cancels this very session.
    fn begin_start(&mut self) -> Result<OpenTicket, SessionError> {
        if self.status().is_live() {
            log::warn!("Start ignored: session already {:?}", self.status());
            return Err(SessionError::AlreadyActive);
        }
        let ticket = self.channel.begin_open()?;
        self.scheduler.reset();
        self.session = None;
        self.set_status(SessionStatus::Connecting);
        Ok(ticket)
    }

    /// Adopt the outcome of the handshake for `generation`. A session that
    /// finished its handshake after a stop is closed again and reported as
    /// cancelled; outcomes of superseded starts leave the status alone.
    fn finish_start(
        &mut self,
        generation: u64,
        result: Result<Session, SessionError>,
    ) -> Result<Session, SessionError> {
        let same_generation = self.channel.generation() == generation;
        let wanted = same_generation && self.status().is_live();
        match result {
            Ok(session) => {
                if !wanted || self.channel.state() != ChannelState::Open {
                    log::info!("Session #{} stopped during start", generation);
                    if same_generation {
                        self.channel.close();
                    }
                    return Err(TransportError::Cancelled.into());
                }
                log::info!("Session {} started ({:?})", session.id, session.mode);
                self.session = Some(session.clone());
                self.sync_status();
                Ok(session)
            }
            Err(e) if !wanted => {
                log::debug!("Start of session #{} superseded: {}", generation, e);
                Err(e)
            }
            Err(SessionError::AlreadyActive) => Err(SessionError::AlreadyActive),
            Err(SessionError::Transport(TransportError::Cancelled)) => {
                self.set_status(SessionStatus::Closed);
                Err(TransportError::Cancelled.into())
            }
            Err(e) => {
                log::error!("Session start failed: {}", e);
                self.set_status(SessionStatus::Errored);
                Err(e)
            }
        }
    }

    /// Tear the session down. Idempotent; safe in any state.
    pub fn close(&mut self) {
        self.teardown(SessionStatus::Closed);
    }

    fn teardown(&mut self, final_status: SessionStatus) {
        match final_status {
            SessionStatus::Errored => self.channel.fail(),
            _ => self.channel.close(),
        }
        self.dispatcher.cancel_all();
        self.scheduler.reset();
        if let Some(session) = self.session.take() {
            log::info!("Session {} ended: {:?}", session.id, final_status);
        }
        self.set_status(final_status);
    }

    // ======================== Event routing ========================

    pub fn handle_session_event(&mut self, event: SessionEvent) {
        if event.generation != self.channel.generation() || !self.status().is_live() {
            log::debug!("Ignoring stale event from session #{}", event.generation);
            return;
        }

        match event.kind {
            SessionEventKind::Message(msg) => {
                for inbound in demux(msg) {
                    self.handle_inbound(inbound);
                }
            }
            SessionEventKind::TransportFailed(e) => {
                log::error!("Transport failed: {}", e);
                self.teardown(SessionStatus::Errored);
                return;
            }
            SessionEventKind::ServerClosed => {
                log::info!("Server ended the session");
                self.teardown(SessionStatus::Closed);
                return;
            }
        }
        self.sync_status();
    }

    fn handle_inbound(&mut self, event: InboundEvent) {
        match event {
            InboundEvent::Transcript(fragment) => self.push_transcript(fragment),
            InboundEvent::Audio { data, mime_type } => {
                match pcm_codec::decode_base64(&data, mime_type.as_deref()) {
                    Ok(buffer) => {
                        if let Some(slot) = self.scheduler.enqueue(&buffer) {
                            log::trace!("Scheduled unit {} at {}+{}", slot.id, slot.start, slot.frames);
                        }
                    }
                    // 坏帧只丢弃本块
                    Err(e) => log::warn!("Dropping audio chunk: {}", e),
                }
            }
            InboundEvent::ToolCall(call) => {
                if let Some(note) = self.dispatcher.progress_note(&call.name) {
                    self.push_transcript(TranscriptFragment {
                        speaker: Speaker::Tool,
                        text: note,
                    });
                }
                let sender = Arc::new(self.channel.sender());
                self.dispatcher.dispatch(call, sender);
            }
            InboundEvent::ToolCancellation(ids) => {
                let cancelled = self.dispatcher.cancel(&ids);
                log::info!("Server cancelled {} of {} tool call(s)", cancelled, ids.len());
            }
            InboundEvent::Interrupted => {
                log::info!("Barge-in: clearing scheduled speech");
                self.scheduler.reset();
            }
            InboundEvent::TurnComplete => log::debug!("Model turn complete"),
            InboundEvent::ServerError(message) => log::error!("Server error: {}", message),
        }
    }

    pub fn handle_playback_event(&mut self, event: PlaybackEvent) {
        match event {
            PlaybackEvent::UnitEnded(id) => self.scheduler.on_unit_ended(id),
        }
        self.sync_status();
    }

    fn push_transcript(&self, fragment: TranscriptFragment) {
        if self.transcript.send(fragment).is_err() {
            log::debug!("Transcript receiver gone");
        }
    }

    // ======================== Status ========================

    /// Listening/Speaking follow the scheduler once the session is live.
    fn sync_status(&mut self) {
        if self.session.is_none() || !self.status().is_live() {
            return;
        }
        let next = match self.scheduler.status() {
            PlaybackStatus::Listening => SessionStatus::Listening,
            PlaybackStatus::Speaking => SessionStatus::Speaking,
        };
        self.set_status(next);
    }

    fn set_status(&self, next: SessionStatus) {
        let mut previous = next;
        self.status.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            previous = *current;
            *current = next;
            true
        });
        if previous != next {
            log::info!("Status: {:?} -> {:?}", previous, next);
        }
    }

    // ======================== Event loop ========================

    /// Run the engine on its own task and return the UI handle.
    pub fn spawn(self) -> EngineHandle {
        let (commands, rx) = mpsc::unbounded_channel();
        let status = self.subscribe_status();
        tokio::spawn(self.run(rx));
        EngineHandle { commands, status }
    }

    /// Serve commands until every command sender is gone, then close.
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<EngineCommand>) {
        let (opened_tx, mut opened_rx) = mpsc::unbounded_channel::<OpenOutcome>();

        loop {
            let step = tokio::select! {
                cmd = commands.recv() => EngineStep::Command(cmd),
                Some(outcome) = opened_rx.recv() => EngineStep::Opened(outcome),
                Some(event) = self.session_rx.recv() => EngineStep::Session(event),
                Some(event) = self.playback_rx.recv() => EngineStep::Playback(event),
            };

            match step {
                EngineStep::Command(None) => {
                    log::info!("Command channel closed, shutting engine down");
                    self.close();
                    break;
                }
                EngineStep::Command(Some(EngineCommand::Start { config, reply })) => {
                    let ticket = match self.begin_start() {
                        Ok(ticket) => ticket,
                        Err(e) => {
                            let _ = reply.send(Err(e));
                            continue;
                        }
                    };
                    // The handshake runs off-loop so Stop can still be served
                    let generation = ticket.generation();
                    let channel = self.channel.clone();
                    let events = self.session_tx.clone();
                    let opened_tx = opened_tx.clone();
                    tokio::spawn(async move {
                        let result = channel.complete_open(ticket, &config, events).await;
                        let _ = opened_tx.send(OpenOutcome {
                            generation,
                            result,
                            reply,
                        });
                    });
                }
                EngineStep::Command(Some(EngineCommand::Stop)) => self.close(),
                EngineStep::Opened(OpenOutcome {
                    generation,
                    result,
                    reply,
                }) => {
                    let _ = reply.send(self.finish_start(generation, result));
                }
                EngineStep::Session(event) => self.handle_session_event(event),
                EngineStep::Playback(event) => self.handle_playback_event(event),
            }
        }
    }
}

/// UI-facing handle to a running [`VoiceEngine`].
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::UnboundedSender<EngineCommand>,
    status: watch::Receiver<SessionStatus>,
}

impl EngineHandle {
    pub async fn start(&self, config: SessionModeConfig) -> Result<Session, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(EngineCommand::Start { config, reply })
            .map_err(|_| SessionError::EngineStopped)?;
        rx.await.map_err(|_| SessionError::EngineStopped)?
    }

    pub fn stop(&self) {
        if self.commands.send(EngineCommand::Stop).is_err() {
            log::debug!("Stop ignored: engine not running");
        }
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioCaptureLine;
    use crate::audio::pcm_codec::{PLAYBACK_SAMPLE_RATE, encode_base64};
    use crate::farm::offline_climate_snapshot;
    use crate::protocol::ServerMessage;
    use crate::test_support::{
        DelayTool, FakeCaptureDevice, ManualOutput, ScriptedConnector, StaticClimate, wait_until,
    };
    use crate::tools::builtins::ClimateRiskTool;
    use serde_json::json;
    use std::time::Duration;

    struct Rig {
        engine: VoiceEngine,
        channel: Arc<SessionChannel>,
        connector: Arc<ScriptedConnector>,
        output: Arc<ManualOutput>,
        transcript: mpsc::UnboundedReceiver<TranscriptFragment>,
    }

    fn rig(connector: Arc<ScriptedConnector>) -> Rig {
        let device = Arc::new(FakeCaptureDevice::constant(16_000, 1, 160, 0.0));
        let channel = Arc::new(SessionChannel::new(
            connector.clone(),
            AudioCaptureLine::new(device, 512),
        ));
        let (output, playback_rx) = ManualOutput::new(PLAYBACK_SAMPLE_RATE);

        let mut dispatcher = ToolCallDispatcher::new();
        dispatcher.register(Arc::new(ClimateRiskTool::new(
            Arc::new(StaticClimate::default()),
            "Nakuru",
        )));
        dispatcher.register(Arc::new(DelayTool::new("slow", Duration::from_millis(300))));

        let (transcript_tx, transcript) = mpsc::unbounded_channel();
        let engine = VoiceEngine::new(
            channel.clone(),
            output.clone(),
            playback_rx,
            dispatcher,
            transcript_tx,
        );
        Rig {
            engine,
            channel,
            connector,
            output,
            transcript,
        }
    }

    async fn pump_session(engine: &mut VoiceEngine) {
        let event = tokio::time::timeout(Duration::from_secs(2), engine.session_rx.recv())
            .await
            .expect("session event")
            .expect("session channel open");
        engine.handle_session_event(event);
    }

    async fn pump_playback(engine: &mut VoiceEngine) {
        let event = tokio::time::timeout(Duration::from_secs(2), engine.playback_rx.recv())
            .await
            .expect("playback event")
            .expect("playback channel open");
        engine.handle_playback_event(event);
    }

    fn audio_message(chunks: &[String]) -> ServerMessage {
        let parts: Vec<_> = chunks
            .iter()
            .map(|data| json!({"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": data}}))
            .collect();
        let msg = json!({"serverContent": {"modelTurn": {"parts": parts}}});
        ServerMessage::parse(&msg.to_string()).unwrap()
    }

    fn speech(frames: usize) -> String {
        encode_base64(&vec![0.1; frames])
    }

    #[tokio::test]
    async fn stop_during_handshake_ends_closed_without_sending_audio() {
        let Rig {
            engine,
            channel,
            connector,
            ..
        } = rig(ScriptedConnector::pending());
        let handle = engine.spawn();

        let starting = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.start(SessionModeConfig::default()).await })
        };
        assert!(wait_until(|| connector.connect_count() == 1).await);
        assert_eq!(handle.status(), SessionStatus::Connecting);

        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.stop();

        let result = starting.await.unwrap();
        assert_eq!(result, Err(SessionError::Transport(TransportError::Cancelled)));
        assert!(wait_until(|| handle.status() == SessionStatus::Closed).await);
        assert_eq!(channel.audio_chunks_sent(), 0);
        assert!(!channel.is_capturing());
    }

    #[tokio::test]
    async fn consecutive_buffers_play_back_to_back() {
        let mut rig = rig(ScriptedConnector::ready());
        rig.engine.start(&SessionModeConfig::default()).await.unwrap();
        assert_eq!(rig.engine.status(), SessionStatus::Listening);
        let server = rig.connector.take_server().unwrap();

        rig.output.advance(24_000);
        server.push(audio_message(&[speech(12_000), speech(12_000)]));
        pump_session(&mut rig.engine).await;

        assert_eq!(rig.output.scheduled_starts(), vec![24_000, 36_000]);
        assert_eq!(rig.engine.status(), SessionStatus::Speaking);

        assert_eq!(rig.output.advance(24_000).len(), 2);
        pump_playback(&mut rig.engine).await;
        assert_eq!(rig.engine.status(), SessionStatus::Speaking);
        pump_playback(&mut rig.engine).await;
        assert_eq!(rig.engine.status(), SessionStatus::Listening);
        rig.engine.close();
    }

    #[tokio::test]
    async fn tool_call_does_not_interrupt_playback() {
        let mut rig = rig(ScriptedConnector::ready());
        rig.engine.start(&SessionModeConfig::default()).await.unwrap();
        let mut server = rig.connector.take_server().unwrap();

        server.push_json(
            r#"{"toolCall":{"functionCalls":[{"id":"c1","name":"get_climate_risk","args":{}}]}}"#,
        );
        for _ in 0..3 {
            server.push(audio_message(&[speech(2_400)]));
        }
        for _ in 0..4 {
            pump_session(&mut rig.engine).await;
        }

        assert_eq!(rig.output.scheduled_starts(), vec![0, 2_400, 4_800]);
        assert_eq!(rig.engine.status(), SessionStatus::Speaking);

        let note = rig.transcript.recv().await.unwrap();
        assert_eq!(note.speaker, Speaker::Tool);
        assert_eq!(note.text, "Checking climate satellites...");

        let response = server.next_tool_response().await.unwrap();
        assert_eq!(response.id, "c1");
        assert_eq!(response.name, "get_climate_risk");
        let expected = offline_climate_snapshot(chrono::NaiveDate::from_ymd_opt(2025, 1, 6).unwrap());
        assert_eq!(
            response.response,
            json!({"result": serde_json::to_value(expected).unwrap()})
        );
        rig.engine.close();
    }

    #[tokio::test]
    async fn malformed_chunk_is_dropped_and_session_continues() {
        let mut rig = rig(ScriptedConnector::ready());
        rig.engine.start(&SessionModeConfig::default()).await.unwrap();
        let server = rig.connector.take_server().unwrap();

        // "AQID" decodes to three bytes: not whole 16-bit samples
        server.push(audio_message(&[speech(2_400), "AQID".into(), speech(2_400)]));
        pump_session(&mut rig.engine).await;

        assert_eq!(rig.output.scheduled_starts(), vec![0, 2_400]);
        assert_eq!(rig.engine.scheduler.cursor(), 4_800);
        assert_eq!(rig.engine.status(), SessionStatus::Speaking);
        assert_eq!(rig.channel.state(), ChannelState::Open);
        rig.engine.close();
    }

    #[tokio::test]
    async fn barge_in_clears_scheduled_speech() {
        let mut rig = rig(ScriptedConnector::ready());
        rig.engine.start(&SessionModeConfig::default()).await.unwrap();
        let server = rig.connector.take_server().unwrap();

        server.push(audio_message(&[speech(12_000), speech(12_000)]));
        pump_session(&mut rig.engine).await;
        rig.output.advance(3_000);

        server.push_json(r#"{"serverContent":{"interrupted":true}}"#);
        pump_session(&mut rig.engine).await;

        assert_eq!(rig.engine.status(), SessionStatus::Listening);
        assert_eq!(rig.output.cancel_count(), 2); // start + barge-in
        assert_eq!(rig.engine.scheduler.cursor(), 3_000);
        rig.engine.close();
    }

    #[tokio::test]
    async fn close_is_idempotent_and_releases_everything() {
        let mut rig = rig(ScriptedConnector::ready());
        rig.engine.start(&SessionModeConfig::default()).await.unwrap();
        let server = rig.connector.take_server().unwrap();
        server.push(audio_message(&[speech(4_800)]));
        pump_session(&mut rig.engine).await;

        rig.engine.close();
        rig.engine.close();

        assert_eq!(rig.engine.status(), SessionStatus::Closed);
        assert!(rig.engine.session().is_none());
        assert_eq!(rig.engine.scheduler.active_len(), 0);
        assert_eq!(rig.channel.state(), ChannelState::Closed);
        assert!(!rig.channel.is_capturing());
        assert!(wait_until(|| server.transport_closed()).await);
    }

    #[tokio::test]
    async fn transport_failure_ends_errored() {
        let mut rig = rig(ScriptedConnector::ready());
        rig.engine.start(&SessionModeConfig::default()).await.unwrap();
        let server = rig.connector.take_server().unwrap();

        server.fail(TransportError::Io("connection reset".into()));
        pump_session(&mut rig.engine).await;

        assert_eq!(rig.engine.status(), SessionStatus::Errored);
        assert_eq!(rig.channel.state(), ChannelState::Errored);
        assert!(!rig.channel.is_capturing());
    }

    #[tokio::test]
    async fn server_hang_up_ends_closed() {
        let mut rig = rig(ScriptedConnector::ready());
        rig.engine.start(&SessionModeConfig::default()).await.unwrap();
        rig.connector.take_server().unwrap().hang_up();

        pump_session(&mut rig.engine).await;
        assert_eq!(rig.engine.status(), SessionStatus::Closed);
    }

    #[tokio::test]
    async fn events_from_an_earlier_session_are_ignored() {
        let mut rig = rig(ScriptedConnector::ready());
        let first = rig.engine.start(&SessionModeConfig::default()).await.unwrap();
        rig.engine.close();
        let second = rig.engine.start(&SessionModeConfig::default()).await.unwrap();
        assert_eq!(second.generation, first.generation + 1);

        rig.engine.handle_session_event(SessionEvent {
            generation: first.generation,
            kind: SessionEventKind::Message(audio_message(&[speech(2_400)])),
        });
        rig.engine.handle_session_event(SessionEvent {
            generation: first.generation,
            kind: SessionEventKind::TransportFailed(TransportError::Io("late".into())),
        });

        assert!(rig.output.scheduled_starts().is_empty());
        assert_eq!(rig.engine.status(), SessionStatus::Listening);
        assert_eq!(rig.channel.state(), ChannelState::Open);
        rig.engine.close();
    }

    #[tokio::test]
    async fn second_start_while_live_is_rejected() {
        let mut rig = rig(ScriptedConnector::ready());
        rig.engine.start(&SessionModeConfig::default()).await.unwrap();
        assert_eq!(
            rig.engine.start(&SessionModeConfig::default()).await,
            Err(SessionError::AlreadyActive)
        );
        assert_eq!(rig.engine.status(), SessionStatus::Listening);
        assert_eq!(rig.connector.connect_count(), 1);
        rig.engine.close();
    }

    #[tokio::test]
    async fn server_cancellation_suppresses_tool_response() {
        let mut rig = rig(ScriptedConnector::ready());
        rig.engine.start(&SessionModeConfig::default()).await.unwrap();
        let mut server = rig.connector.take_server().unwrap();

        server.push_json(r#"{"toolCall":{"functionCalls":[{"id":"s1","name":"slow"}]}}"#);
        pump_session(&mut rig.engine).await;
        assert_eq!(rig.engine.dispatcher.in_flight(), 1);

        server.push_json(r#"{"toolCallCancellation":{"ids":["s1"]}}"#);
        pump_session(&mut rig.engine).await;
        assert_eq!(rig.engine.dispatcher.in_flight(), 0);

        let late = tokio::time::timeout(Duration::from_millis(600), server.next_tool_response()).await;
        assert!(late.is_err() || late.unwrap().is_none());
        rig.engine.close();
    }

    #[tokio::test]
    async fn handle_drives_a_full_session() {
        let Rig {
            engine,
            connector,
            mut transcript,
            ..
        } = rig(ScriptedConnector::ready());
        let handle = engine.spawn();

        let session = handle.start(SessionModeConfig::default()).await.unwrap();
        assert_eq!(session.generation, 1);
        assert!(wait_until(|| handle.status() == SessionStatus::Listening).await);

        let server = connector.take_server().unwrap();
        server.push_json(r#"{"serverContent":{"inputTranscription":{"text":"Habari"}}}"#);
        let fragment = tokio::time::timeout(Duration::from_secs(2), transcript.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fragment.speaker, Speaker::User);
        assert_eq!(fragment.text, "Habari");

        handle.stop();
        assert!(wait_until(|| handle.status() == SessionStatus::Closed).await);
        assert!(wait_until(|| server.transport_closed()).await);
    }

    #[tokio::test]
    async fn stop_queued_right_behind_start_sticks() {
        let Rig {
            engine,
            channel,
            connector,
            ..
        } = rig(ScriptedConnector::ready());
        let status = engine.subscribe_status();
        let (commands, rx) = mpsc::unbounded_channel();
        let (reply, started) = oneshot::channel();
        commands
            .send(EngineCommand::Start {
                config: SessionModeConfig::default(),
                reply,
            })
            .unwrap();
        commands.send(EngineCommand::Stop).unwrap();
        tokio::spawn(engine.run(rx));

        let result = tokio::time::timeout(Duration::from_secs(2), started)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Err(SessionError::Transport(TransportError::Cancelled)));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*status.borrow(), SessionStatus::Closed);
        assert_eq!(channel.state(), ChannelState::Closed);
        assert!(!channel.is_capturing());
        assert_eq!(channel.audio_chunks_sent(), 0);
        assert_eq!(connector.connect_count(), 0);
        assert!(connector.take_server().is_none());
        drop(commands);
    }

    #[tokio::test]
    async fn cancelled_start_does_not_clobber_the_next_one() {
        let Rig {
            engine,
            channel,
            ..
        } = rig(ScriptedConnector::ready());
        let status = engine.subscribe_status();
        let (commands, rx) = mpsc::unbounded_channel();
        let (first_reply, first) = oneshot::channel();
        let (second_reply, second) = oneshot::channel();
        commands
            .send(EngineCommand::Start {
                config: SessionModeConfig::default(),
                reply: first_reply,
            })
            .unwrap();
        commands.send(EngineCommand::Stop).unwrap();
        commands
            .send(EngineCommand::Start {
                config: SessionModeConfig::default(),
                reply: second_reply,
            })
            .unwrap();
        tokio::spawn(engine.run(rx));

        assert_eq!(
            first.await.unwrap(),
            Err(SessionError::Transport(TransportError::Cancelled))
        );
        let session = second.await.unwrap().unwrap();
        assert_eq!(session.generation, 2);
        assert_eq!(*status.borrow(), SessionStatus::Listening);
        assert_eq!(channel.state(), ChannelState::Open);
        assert!(channel.is_capturing());

        commands.send(EngineCommand::Stop).unwrap();
        let mut status = status;
        tokio::time::timeout(
            Duration::from_secs(2),
            status.wait_for(|s| *s == SessionStatus::Closed),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(!channel.is_capturing());
    }
}
