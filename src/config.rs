//! Runtime configuration.
//!
//! Layers, later wins: built-in defaults, `config.toml` in the working
//! directory (optional), then `LIMA_VOICE__<SECTION>__<KEY>` environment
//! variables, e.g. `LIMA_VOICE__SESSION__API_KEY`.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::audio::DEFAULT_CAPTURE_WINDOW;
use crate::farm::FarmProfile;
use crate::mode_config::{DEFAULT_VOICE, Language, PersonaMode, SessionModeConfig, VoiceParams};

const ENV_PREFIX: &str = "LIMA_VOICE";
const DEFAULT_WS_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";
const DEFAULT_MODEL: &str = "gemini-2.5-flash-native-audio-preview-09-2025";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub session: SessionConfig,
    pub audio: AudioConfig,
    pub services: ServicesConfig,
    pub farm: FarmProfile,
    pub mode: ModeConfig,
}

// 服务器连接
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub ws_url: String,
    pub api_key: String,
    pub model: String,
    pub voice_name: String,
    pub language_code: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ws_url: DEFAULT_WS_URL.to_string(),
            api_key: String::new(),
            model: DEFAULT_MODEL.to_string(),
            voice_name: DEFAULT_VOICE.to_string(),
            language_code: None,
        }
    }
}

// ALSA 设备
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub capture_device: String,
    pub capture_sample_rate: u32,
    pub capture_channels: u32,
    /// Frames per outbound chunk at 16 kHz.
    pub capture_window: usize,
    pub playback_device: String,
    pub playback_sample_rate: u32,
    pub playback_channels: u32,
    pub playback_period: Option<usize>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            capture_device: "default".to_string(),
            capture_sample_rate: 16000,
            capture_channels: 1,
            capture_window: DEFAULT_CAPTURE_WINDOW,
            playback_device: "default".to_string(),
            playback_sample_rate: 24000,
            playback_channels: 1,
            playback_period: None,
        }
    }
}

/// Farm collaborators. An empty URL runs that lookup offline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    pub climate_url: Option<String>,
    pub insurance_url: Option<String>,
    pub journal_path: PathBuf,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            climate_url: None,
            insurance_url: None,
            journal_path: PathBuf::from("farm_records.jsonl"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModeConfig {
    pub mode: PersonaMode,
    pub ambient: bool,
    pub language: Language,
}

impl AppConfig {
    /// Load from `config.toml` in the working directory plus environment.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(Path::new("config.toml"))
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let defaults = config::Config::try_from(&AppConfig::default())
            .context("Failed to serialise default configuration")?;

        let settings = config::Config::builder()
            .add_source(defaults)
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("farm.crops"),
            )
            .build()
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?;

        settings
            .try_deserialize()
            .context("Invalid configuration")
    }

    /// The persona configuration for the next session.
    pub fn mode_config(&self) -> SessionModeConfig {
        SessionModeConfig::new(self.mode.mode, self.mode.ambient, self.mode.language)
            .with_farm(self.farm.clone())
            .with_voice(VoiceParams {
                voice_name: self.session.voice_name.clone(),
                language_code: self.session.language_code.clone(),
            })
    }

    /// Effective configuration rendered as TOML.
    pub fn to_toml(&self) -> anyhow::Result<String> {
        toml::to_string_pretty(self).context("Failed to render configuration")
    }
}
