//! Wire envelopes exchanged between the client, the relay and the agent.
//!
//! The relay never parses these; only the client side and the context
//! injection use them.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::identity::Identity;

/// Error code the agent emits when a turn contained no speech.
pub const NO_SPEECH_ERROR_CODE: &str = "NO_VALID_AUDIO_ERROR";

pub const OUTBOUND_SAMPLE_RATE: u32 = 16000;
pub const OUTBOUND_CHANNELS: u8 = 1;
pub const OUTBOUND_FORMAT: &str = "pcm_s16le";

// ==========================================
// 1. Client -> agent
// ==========================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioMetadata {
    pub sample_rate: u32,
    pub channels: u8,
    pub format: String,
}

impl Default for AudioMetadata {
    fn default() -> Self {
        Self {
            sample_rate: OUTBOUND_SAMPLE_RATE,
            channels: OUTBOUND_CHANNELS,
            format: OUTBOUND_FORMAT.to_string(),
        }
    }
}

/// Outbound audio: base64 PCM16 plus fixed metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioEnvelope {
    pub audio: String,
    pub metadata: AudioMetadata,
}

impl AudioEnvelope {
    pub fn from_pcm(pcm: &[u8]) -> Self {
        Self {
            audio: STANDARD.encode(pcm),
            metadata: AudioMetadata::default(),
        }
    }

    pub fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(&self.audio)
    }
}

/// Control messages the client may send besides audio.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    UserInput { input_type: String, text: String },
    EndAudio,
    EndSession {
        #[serde(skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
    },
}

impl ClientMessage {
    pub fn text(text: impl Into<String>) -> Self {
        ClientMessage::UserInput {
            input_type: "text".to_string(),
            text: text.into(),
        }
    }
}

// ==========================================
// 2. Relay -> agent context injection
// ==========================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextUser {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextMessage {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub user: ContextUser,
    pub timestamp: String,
}

impl ContextMessage {
    pub fn for_identity(identity: &Identity, now: DateTime<Utc>) -> Self {
        Self {
            msg_type: "context".to_string(),
            user: ContextUser {
                id: identity.id.clone(),
                name: identity.display_name.clone(),
            },
            timestamp: now.to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }
}

// ==========================================
// 3. Agent -> client
// ==========================================

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ChunkMetadata {
    pub sample_rate: Option<u32>,
}

/// Either a bare string or a `{code, message}` object.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ErrorBody {
    Detailed {
        #[serde(default)]
        code: Option<String>,
        #[serde(default)]
        message: String,
    },
    Plain(String),
}

impl ErrorBody {
    pub fn code(&self) -> Option<&str> {
        match self {
            ErrorBody::Detailed { code, .. } => code.as_deref(),
            ErrorBody::Plain(_) => None,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ErrorBody::Detailed { message, .. } => message,
            ErrorBody::Plain(message) => message,
        }
    }

    /// Silence and the agent's "missing audio field" warning are expected
    /// outcomes, not failures.
    pub fn is_expected_empty_input(&self) -> bool {
        let message = self.message();
        self.code() == Some(NO_SPEECH_ERROR_CODE)
            || message.contains(NO_SPEECH_ERROR_CODE)
            || (message.contains("Missing") && message.contains("audio"))
    }
}

/// Every text envelope the agent side may send.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    Audio {
        audio: Option<String>,
        #[serde(default)]
        metadata: ChunkMetadata,
    },
    ResponseAudio {
        audio: String,
        #[serde(default)]
        sample_rate: Option<u32>,
    },
    AsrResult {
        text: String,
        #[serde(default)]
        is_final: bool,
    },
    ResponseText {
        delta: String,
        #[serde(default)]
        is_final: bool,
        #[serde(default)]
        full_text: Option<String>,
    },
    Thinking {
        #[serde(default)]
        message: String,
    },
    Error {
        error: ErrorBody,
    },
    SessionStarted {
        session_id: String,
    },
    MemoryStored {
        memory_id: String,
        #[serde(default)]
        content: String,
    },
    Cmd {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        data: Value,
    },
    Data {
        name: String,
        #[serde(default)]
        data: Value,
    },
    #[serde(other)]
    Unknown,
}

impl AgentMessage {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn audio_envelope_carries_fixed_metadata() {
        let envelope = AudioEnvelope::from_pcm(&[1, 2, 3, 4]);
        let json: Value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["metadata"]["sample_rate"], 16000);
        assert_eq!(json["metadata"]["channels"], 1);
        assert_eq!(json["metadata"]["format"], "pcm_s16le");
        assert_eq!(json["audio"], "AQIDBA==");
    }

    #[test]
    fn audio_envelope_base64_is_lossless() {
        let bytes: Vec<u8> = (0..=255u8).chain([0, 0, 255, 1, 7]).collect();
        let envelope = AudioEnvelope::from_pcm(&bytes);
        assert_eq!(envelope.decode().unwrap(), bytes);

        let empty = AudioEnvelope::from_pcm(&[]);
        assert_eq!(empty.decode().unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn parses_known_agent_messages() {
        let msg = AgentMessage::parse(r#"{"type":"asr_result","text":"你好","is_final":true}"#).unwrap();
        assert_eq!(
            msg,
            AgentMessage::AsrResult { text: "你好".into(), is_final: true }
        );

        let msg = AgentMessage::parse(
            r#"{"type":"audio","audio":"AAA=","metadata":{"sample_rate":24000}}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            AgentMessage::Audio {
                audio: Some("AAA=".into()),
                metadata: ChunkMetadata { sample_rate: Some(24000) },
            }
        );
    }

    #[test]
    fn unknown_type_lands_in_catch_all() {
        let msg = AgentMessage::parse(r#"{"type":"brand_new","x":1}"#).unwrap();
        assert_eq!(msg, AgentMessage::Unknown);
    }

    #[test]
    fn error_body_accepts_both_shapes() {
        let msg = AgentMessage::parse(
            r#"{"type":"error","error":{"code":"NO_VALID_AUDIO_ERROR","message":"silence"}}"#,
        )
        .unwrap();
        match msg {
            AgentMessage::Error { error } => assert!(error.is_expected_empty_input()),
            other => panic!("unexpected {other:?}"),
        }

        let msg = AgentMessage::parse(r#"{"type":"error","error":"asr backend down"}"#).unwrap();
        match msg {
            AgentMessage::Error { error } => {
                assert!(!error.is_expected_empty_input());
                assert_eq!(error.message(), "asr backend down");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn context_message_shape() {
        let identity = Identity {
            id: "u-1".into(),
            display_name: "小明".into(),
        };
        let now = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let json = serde_json::to_value(ContextMessage::for_identity(&identity, now)).unwrap();
        assert_eq!(json["type"], "context");
        assert_eq!(json["user"]["id"], "u-1");
        assert_eq!(json["user"]["name"], "小明");
        assert_eq!(json["timestamp"], "2026-01-02T03:04:05.000Z");
    }

    #[test]
    fn control_messages_serialize_with_type_tag() {
        let json = serde_json::to_value(ClientMessage::text("hi")).unwrap();
        assert_eq!(json["type"], "user_input");
        assert_eq!(json["input_type"], "text");
        let json = serde_json::to_value(ClientMessage::EndAudio).unwrap();
        assert_eq!(json, serde_json::json!({"type": "end_audio"}));
    }
}
