//! Realtime wire messages (BidiGenerateContent style JSON).
//!
//! Client messages are externally tagged: `{"setup": {...}}`,
//! `{"realtimeInput": {...}}`, `{"toolResponse": {...}}`.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::audio::pcm_codec::{self, CAPTURE_MIME};
use crate::mode_config::SessionSetup;

// ======================== Client → server ========================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(SetupPayload),
    RealtimeInput(RealtimeInput),
    ToolResponse(ToolResponse),
}

impl ClientMessage {
    /// One outbound microphone window.
    pub fn audio_chunk(samples: &[f32]) -> Self {
        ClientMessage::RealtimeInput(RealtimeInput {
            audio: Blob {
                mime_type: CAPTURE_MIME.to_string(),
                data: pcm_codec::encode_base64(samples),
            },
        })
    }

    pub fn tool_response(response: FunctionResponse) -> Self {
        ClientMessage::ToolResponse(ToolResponse {
            function_responses: vec![response],
        })
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupPayload {
    pub model: String,
    pub generation_config: GenerationConfig,
    pub system_instruction: Content,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSet>,
    pub input_audio_transcription: EmptyObject,
    pub output_audio_transcription: EmptyObject,
}

impl SetupPayload {
    pub fn new(model: &str, setup: &SessionSetup) -> Self {
        let model = if model.starts_with("models/") {
            model.to_string()
        } else {
            format!("models/{}", model)
        };
        let tools = if setup.tool_declarations.is_empty() {
            Vec::new()
        } else {
            vec![ToolSet {
                function_declarations: setup.tool_declarations.clone(),
            }]
        };

        Self {
            model,
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: setup.voice.voice_name.clone(),
                        },
                    },
                    language_code: setup.voice.language_code.clone(),
                },
            },
            system_instruction: Content {
                parts: vec![TextPart {
                    text: setup.instruction_text.clone(),
                }],
            },
            tools,
            input_audio_transcription: EmptyObject {},
            output_audio_transcription: EmptyObject {},
        }
    }
}

/// Serialises as `{}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EmptyObject {}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Content {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextPart {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSet {
    pub function_declarations: Vec<FunctionDeclaration>,
}

/// A tool as advertised to the model. `parameters` is a JSON schema.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RealtimeInput {
    pub audio: Blob,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponse {
    pub function_responses: Vec<FunctionResponse>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionResponse {
    pub id: String,
    pub name: String,
    pub response: Value,
}

impl FunctionResponse {
    pub fn result(id: impl Into<String>, name: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            response: json!({ "result": result }),
        }
    }

    pub fn error(id: impl Into<String>, name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            response: json!({ "error": message.into() }),
        }
    }

    pub fn is_error(&self) -> bool {
        self.response.get("error").is_some()
    }
}

// ======================== Server → client ========================

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    pub setup_complete: Option<Value>,
    pub server_content: Option<ServerContent>,
    pub tool_call: Option<ToolCallRequest>,
    pub tool_call_cancellation: Option<ToolCallCancellation>,
    pub go_away: Option<Value>,
    pub error: Option<ServerError>,
}

impl ServerMessage {
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// Binary frames carry the same JSON.
    pub fn parse_bytes(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    pub model_turn: Option<ModelTurn>,
    pub input_transcription: Option<Transcription>,
    pub output_transcription: Option<Transcription>,
    #[serde(default)]
    pub turn_complete: bool,
    #[serde(default)]
    pub interrupted: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    pub inline_data: Option<InlineData>,
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    pub mime_type: Option<String>,
    pub data: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Transcription {
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRequest {
    #[serde(default)]
    pub function_calls: Vec<ToolCall>,
}

/// A model request to run a named tool.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ToolCall {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ToolCallCancellation {
    #[serde(default)]
    pub ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ServerError {
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mode_config::VoiceParams;

    fn setup(tools: Vec<FunctionDeclaration>) -> SessionSetup {
        SessionSetup {
            instruction_text: "Be brief.".into(),
            tool_declarations: tools,
            voice: VoiceParams::default(),
        }
    }

    #[test]
    fn setup_serialises_in_wire_shape() {
        let decl = FunctionDeclaration {
            name: "get_climate_risk".into(),
            description: "Climate".into(),
            parameters: json!({"type": "OBJECT", "properties": {}}),
        };
        let msg = ClientMessage::Setup(SetupPayload::new("gemini-live", &setup(vec![decl])));
        let v: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();

        assert_eq!(v["setup"]["model"], "models/gemini-live");
        assert_eq!(v["setup"]["generationConfig"]["responseModalities"][0], "AUDIO");
        assert_eq!(
            v["setup"]["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]
                ["voiceName"],
            "Aoede"
        );
        assert_eq!(v["setup"]["systemInstruction"]["parts"][0]["text"], "Be brief.");
        assert_eq!(
            v["setup"]["tools"][0]["functionDeclarations"][0]["name"],
            "get_climate_risk"
        );
        assert_eq!(v["setup"]["inputAudioTranscription"], json!({}));
    }

    #[test]
    fn setup_without_tools_omits_the_key() {
        let msg = ClientMessage::Setup(SetupPayload::new("models/x", &setup(Vec::new())));
        let v: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(v["setup"]["model"], "models/x");
        assert!(v["setup"].get("tools").is_none());
    }

    #[test]
    fn audio_chunk_carries_capture_mime() {
        let v: Value = serde_json::to_value(ClientMessage::audio_chunk(&[0.0; 4])).unwrap();
        assert_eq!(v["realtimeInput"]["audio"]["mimeType"], "audio/pcm;rate=16000");
        assert_eq!(v["realtimeInput"]["audio"]["data"], "AAAAAAAAAAA=");
    }

    #[test]
    fn tool_response_shapes() {
        let ok = ClientMessage::tool_response(FunctionResponse::result(
            "c1",
            "get_climate_risk",
            json!({"score": 35}),
        ));
        let v = serde_json::to_value(ok).unwrap();
        assert_eq!(
            v,
            json!({"toolResponse": {"functionResponses": [
                {"id": "c1", "name": "get_climate_risk", "response": {"result": {"score": 35}}}
            ]}})
        );

        let err = FunctionResponse::error("c2", "nope", "Tool nope not found");
        assert!(err.is_error());
        assert_eq!(err.response, json!({"error": "Tool nope not found"}));
    }

    #[test]
    fn parses_server_content_with_audio_and_transcripts() {
        let text = r#"{
            "serverContent": {
                "modelTurn": {"parts": [
                    {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AAA="}},
                    {"text": "hello"}
                ]},
                "outputTranscription": {"text": "Habari"},
                "turnComplete": true
            }
        }"#;
        let msg = ServerMessage::parse(text).unwrap();
        let content = msg.server_content.unwrap();
        let parts = content.model_turn.unwrap().parts;
        assert_eq!(parts.len(), 2);
        assert_eq!(
            parts[0].inline_data.as_ref().unwrap().mime_type.as_deref(),
            Some("audio/pcm;rate=24000")
        );
        assert_eq!(content.output_transcription.unwrap().text.as_deref(), Some("Habari"));
        assert!(content.turn_complete);
        assert!(!content.interrupted);
    }

    #[test]
    fn parses_tool_call_and_cancellation_from_bytes() {
        let msg = ServerMessage::parse_bytes(
            br#"{"toolCall":{"functionCalls":[{"id":"a","name":"log_harvest","args":{"crop":"maize"}}]}}"#,
        )
        .unwrap();
        let calls = msg.tool_call.unwrap().function_calls;
        assert_eq!(calls[0].id, "a");
        assert_eq!(calls[0].args["crop"], "maize");

        let msg = ServerMessage::parse(r#"{"toolCallCancellation":{"ids":["a","b"]}}"#).unwrap();
        assert_eq!(msg.tool_call_cancellation.unwrap().ids, vec!["a", "b"]);
    }

    #[test]
    fn setup_complete_detected() {
        assert!(ServerMessage::parse(r#"{"setupComplete":{}}"#).unwrap().is_setup_complete());
        assert!(!ServerMessage::parse("{}").unwrap().is_setup_complete());
    }
}
