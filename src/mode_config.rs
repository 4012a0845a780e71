//! Session persona/tool configuration.
//!
//! `(mode, ambient, language, farm profile) -> SessionSetup`. Pure; changing any
//! input needs a new session.

use serde::{Deserialize, Serialize};

pub use crate::farm::FarmProfile;
use crate::protocol::FunctionDeclaration;
use crate::tools::builtins;

pub const DEFAULT_VOICE: &str = "Aoede";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersonaMode {
    #[default]
    Advisor,
    Negotiator,
    CallSimulation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    En,
    Sw,
    Ki,
    Luo,
    Luy,
    Kal,
    Maa,
}

impl Language {
    pub fn code(self) -> &'static str {
        match self {
            Language::En => "en",
            Language::Sw => "sw",
            Language::Ki => "ki",
            Language::Luo => "luo",
            Language::Luy => "luy",
            Language::Kal => "kal",
            Language::Maa => "maa",
        }
    }

    /// Locale sent as the speech language. Only languages the speech
    /// service recognises get one; the rest rely on the instruction text.
    pub fn speech_code(self) -> Option<&'static str> {
        match self {
            Language::En => Some("en-KE"),
            Language::Sw => Some("sw-KE"),
            _ => None,
        }
    }

    fn directive(self) -> &'static str {
        match self {
            Language::En => "Speak in English with a Kenyan accent.",
            Language::Sw => "Ongea Kiswahili sanifu chenye lahaja ya Kenya.",
            Language::Ki => "Speak in Gikuyu and use Gikuyu farming terms.",
            Language::Luo => "Speak in Dholuo and use Dholuo farming terms.",
            Language::Luy => "Speak in Luhya and use Luhya farming terms.",
            Language::Kal => "Speak in Kalenjin. Use terms relevant to Rift Valley farming.",
            Language::Maa => "Speak in Maa. Focus on pastoral and farming terms.",
        }
    }
}

impl std::str::FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "en" => Ok(Language::En),
            "sw" => Ok(Language::Sw),
            "ki" => Ok(Language::Ki),
            "luo" => Ok(Language::Luo),
            "luy" => Ok(Language::Luy),
            "kal" => Ok(Language::Kal),
            "maa" => Ok(Language::Maa),
            other => Err(format!("unsupported language: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceParams {
    pub voice_name: String,
    pub language_code: Option<String>,
}

impl Default for VoiceParams {
    fn default() -> Self {
        Self {
            voice_name: DEFAULT_VOICE.to_string(),
            language_code: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionModeConfig {
    pub mode: PersonaMode,
    pub ambient: bool,
    pub language: Language,
    pub farm: Option<FarmProfile>,
    pub voice: VoiceParams,
}

/// Everything the setup message needs from the persona layer.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSetup {
    pub instruction_text: String,
    pub tool_declarations: Vec<FunctionDeclaration>,
    pub voice: VoiceParams,
}

impl SessionModeConfig {
    pub fn new(mode: PersonaMode, ambient: bool, language: Language) -> Self {
        Self {
            mode,
            ambient,
            language,
            ..Default::default()
        }
    }

    pub fn with_farm(mut self, farm: FarmProfile) -> Self {
        self.farm = Some(farm);
        self
    }

    pub fn with_voice(mut self, voice: VoiceParams) -> Self {
        self.voice = voice;
        self
    }

    /// Whether this configuration exposes the advisor toolset.
    pub fn tools_enabled(&self) -> bool {
        !self.ambient && matches!(self.mode, PersonaMode::Advisor | PersonaMode::CallSimulation)
    }

    pub fn build(&self) -> SessionSetup {
        let persona = if self.ambient {
            AMBIENT_PERSONA.to_string()
        } else {
            match self.mode {
                PersonaMode::Advisor | PersonaMode::CallSimulation => {
                    advisor_persona(self.farm.as_ref())
                }
                PersonaMode::Negotiator => NEGOTIATOR_PERSONA.to_string(),
            }
        };

        let instruction_text = format!(
            "{}\nLANGUAGE INSTRUCTION: {}\nIMPORTANT: Maintain this language and persona throughout the session.",
            persona.trim_end(),
            self.language.directive(),
        );

        let tool_declarations = if self.tools_enabled() {
            builtins::advisor_declarations()
        } else {
            Vec::new()
        };

        let mut voice = self.voice.clone();
        if voice.language_code.is_none() {
            voice.language_code = self.language.speech_code().map(str::to_string);
        }

        SessionSetup {
            instruction_text,
            tool_declarations,
            voice,
        }
    }
}

const AMBIENT_PERSONA: &str = "MODE: AMBIENT LISTENING.
Goal: Listen silently. Only speak if addressed as \"LIMA\".
Context: The farmer might be discussing climate risks or insurance. Listen for words like \"drought\", \"rain\", \"insurance\", \"payout\".";

const NEGOTIATOR_PERSONA: &str = "ROLEPLAY MODE: TOUGH MARKET BROKER.
Goal: Negotiate hard. Claim prices are low due to \"bad weather\" or \"oversupply\".";

fn advisor_persona(farm: Option<&FarmProfile>) -> String {
    let mut text = String::new();
    match farm {
        Some(f) if !f.farmer_name.is_empty() => {
            text.push_str(&format!(
                "You are 'LIMA', a helpful agricultural assistant for {}.\n",
                f.farmer_name
            ));
        }
        _ => text.push_str("You are 'LIMA', a helpful agricultural assistant.\n"),
    }
    text.push_str("Tone: Encouraging, educational, expert.\n");

    if let Some(f) = farm {
        text.push_str("\nFARM DATA:\n");
        text.push_str(&format!("- Location: {}\n", f.location));
        text.push_str(&format!("- Crops: {}\n", f.crops.join(", ")));
        text.push_str(&format!("- Revenue: KES {}\n", f.total_revenue));
        text.push_str(&format!("- Expenses: KES {}\n", f.total_expenses));
    }

    text.push_str(
        "\nCAPABILITIES:
1. CLIMATE INTELLIGENCE: You can fetch climate risk scores (drought, NDVI, soil moisture).
2. INSURANCE: You can check insurance policy status and estimated payouts.
3. RECORDS: You can log harvests and expenses for the farmer.

INTERACTION STYLE:
- If asked \"Should I plant?\", check the climate risk first.
- If asked about insurance, explain triggers simply.
- Use the 'get_climate_risk' and 'get_insurance_status' tools to answer specific questions accurately.",
    );
    text
}
