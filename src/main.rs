use std::sync::Arc;
use std::time::Duration;

use lima_voice::audio::{AlsaCaptureDevice, AlsaPlayback, AudioCaptureLine};
use lima_voice::farm::{HttpClimateService, HttpInsuranceService, JsonlRecordLogger};
use lima_voice::net_link::WsConnector;
use lima_voice::tools::{self, FarmServices};
use lima_voice::{AppConfig, SessionChannel, SessionStatus, Speaker, VoiceEngine};
use tokio::signal;
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    env_logger::init();

    // 加载配置
    let config = AppConfig::load()?;
    if std::env::args().any(|arg| arg == "--print-config") {
        print!("{}", config.to_toml()?);
        return Ok(());
    }
    if config.session.api_key.is_empty() {
        log::warn!("No API key configured, set LIMA_VOICE__SESSION__API_KEY");
    }

    // 扬声器：独立线程混音播放
    let (playback_tx, playback_rx) = mpsc::unbounded_channel();
    let playback = Arc::new(AlsaPlayback::start(
        &config.audio.playback_device,
        config.audio.playback_sample_rate,
        config.audio.playback_channels,
        config.audio.playback_period,
        playback_tx,
    )?);

    // 麦克风：会话开始时才打开
    let mic = Arc::new(AlsaCaptureDevice::new(
        config.audio.capture_device.clone(),
        config.audio.capture_sample_rate,
        config.audio.capture_channels,
    ));
    let capture = AudioCaptureLine::new(mic, config.audio.capture_window);

    let connector = Arc::new(WsConnector::new(
        config.session.ws_url.clone(),
        config.session.api_key.clone(),
        config.session.model.clone(),
    ));
    let channel = Arc::new(SessionChannel::new(connector, capture));

    // 工具依赖的外部服务
    let http = reqwest::Client::new();
    let services = FarmServices {
        climate: Arc::new(HttpClimateService::new(
            http.clone(),
            config.services.climate_url.clone(),
        )),
        insurance: Arc::new(HttpInsuranceService::new(
            http,
            config.services.insurance_url.clone(),
        )),
        records: Arc::new(JsonlRecordLogger::new(config.services.journal_path.clone())),
    };
    let dispatcher = tools::init_advisor_dispatcher(&services, &config.farm);

    let (transcript_tx, mut transcript_rx) = mpsc::unbounded_channel();
    let engine = VoiceEngine::new(
        channel,
        playback.clone(),
        playback_rx,
        dispatcher,
        transcript_tx,
    );
    let handle = engine.spawn();
    let mut status_rx = handle.subscribe_status();

    let mode = config.mode_config();
    match handle.start(mode).await {
        Ok(session) => println!(
            "Session {} started: mode={:?}, ambient={}, language={}",
            session.id,
            session.mode,
            session.ambient,
            session.language.code()
        ),
        Err(e) => {
            eprintln!("Failed to start session: {}", e);
            playback.stop();
            return Err(e.into());
        }
    }

    // 主事件循环：打印转写文本和状态变化
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                println!("Received Ctrl+C, shutting down...");
                break;
            }

            Some(fragment) = transcript_rx.recv() => {
                match fragment.speaker {
                    Speaker::User => println!("You: {}", fragment.text),
                    Speaker::Model => println!("Lima: {}", fragment.text),
                    Speaker::Tool => println!("  ... {}", fragment.text),
                }
            }

            changed = status_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let status = *status_rx.borrow_and_update();
                println!("Status: {:?}", status);
                if matches!(status, SessionStatus::Closed | SessionStatus::Errored) {
                    break;
                }
            }
        }
    }

    handle.stop();
    let _ = tokio::time::timeout(
        Duration::from_secs(2),
        status_rx.wait_for(|s| matches!(s, SessionStatus::Closed | SessionStatus::Errored)),
    )
    .await;
    playback.stop();
    Ok(())
}
