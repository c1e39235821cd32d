//! Session wire messages.
//!
//! Inbound text frames are parsed once into [`ServerMessage`]; the rest of the
//! core only ever sees typed values. Outbound control messages are built from
//! [`ClientMessage`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;

pub const PROTOCOL_VERSION: u8 = 1;

// 音频参数结构体
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct AudioParams {
    pub format: String,
    pub sample_rate: u32,
    pub channels: u8,
    pub frame_duration: u32,
}

/// Everything the device sends on the control channel.
#[derive(Serialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Hello {
        version: u8,
        transport: String,
        audio_params: AudioParams,
    },
    Listen {
        session_id: String,
        state: ListenState,
        #[serde(skip_serializing_if = "Option::is_none")]
        mode: Option<&'static str>,
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    Abort {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<&'static str>,
    },
    Iot {
        session_id: String,
        update: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        descriptors: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        states: Option<Value>,
    },
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ListenState {
    Start,
    Stop,
    Detect,
}

impl ClientMessage {
    pub fn to_json(&self) -> String {
        // enum of plain strings/values, serialization cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Server hello, only the parts the device reads.
#[derive(Deserialize, Debug, Clone)]
pub struct HelloResponse {
    pub transport: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub audio_params: Option<HelloAudioParams>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct HelloAudioParams {
    #[serde(default)]
    pub sample_rate: Option<u32>,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TtsMessage {
    pub state: String,
    #[serde(default)]
    pub text: Option<String>,
}

/// Typed inbound control message, discriminated by `type`.
#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Hello(HelloResponse),
    Tts(TtsMessage),
    Stt {
        text: String,
    },
    Llm {
        emotion: String,
    },
    Iot {
        commands: Vec<Value>,
    },
    /// Types this firmware does not know about; ignored.
    #[serde(other)]
    Unknown,
}

impl ServerMessage {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hello_matches_wire_format() {
        let hello = ClientMessage::Hello {
            version: PROTOCOL_VERSION,
            transport: "websocket".into(),
            audio_params: AudioParams {
                format: "opus".into(),
                sample_rate: 16000,
                channels: 1,
                frame_duration: 60,
            },
        };
        let value: Value = serde_json::from_str(&hello.to_json()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "hello",
                "version": 1,
                "transport": "websocket",
                "audio_params": {"format": "opus", "sample_rate": 16000, "channels": 1, "frame_duration": 60}
            })
        );
    }

    #[test]
    fn listen_and_abort_messages() {
        let start = ClientMessage::Listen {
            session_id: "s1".into(),
            state: ListenState::Start,
            mode: Some("auto"),
            text: None,
        };
        let value: Value = serde_json::from_str(&start.to_json()).unwrap();
        assert_eq!(
            value,
            json!({"session_id": "s1", "type": "listen", "state": "start", "mode": "auto"})
        );

        let abort = ClientMessage::Abort {
            session_id: "s1".into(),
            reason: Some("wake_word_detected"),
        };
        let value: Value = serde_json::from_str(&abort.to_json()).unwrap();
        assert_eq!(
            value,
            json!({"session_id": "s1", "type": "abort", "reason": "wake_word_detected"})
        );
    }

    #[test]
    fn parses_known_types() {
        match ServerMessage::parse(r#"{"type":"tts","state":"sentence_start","text":"hi"}"#).unwrap() {
            ServerMessage::Tts(tts) => {
                assert_eq!(tts.state, "sentence_start");
                assert_eq!(tts.text.as_deref(), Some("hi"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            ServerMessage::parse(r#"{"type":"iot","commands":[{"name":"lamp"}]}"#).unwrap(),
            ServerMessage::Iot { commands } if commands.len() == 1
        ));
        match ServerMessage::parse(
            r#"{"type":"hello","transport":"websocket","session_id":"abc","audio_params":{"sample_rate":24000}}"#,
        )
        .unwrap()
        {
            ServerMessage::Hello(hello) => {
                assert_eq!(hello.session_id.as_deref(), Some("abc"));
                assert_eq!(hello.audio_params.and_then(|p| p.sample_rate), Some(24000));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn unknown_types_are_ignored_and_missing_fields_rejected() {
        assert!(matches!(
            ServerMessage::parse(r#"{"type":"mcp","payload":{}}"#).unwrap(),
            ServerMessage::Unknown
        ));
        assert!(matches!(
            ServerMessage::parse(r#"{"type":"stt"}"#),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(ServerMessage::parse("not json").is_err());
    }
}
