//! Single dispatch point for everything the link delivers.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audio::PlaybackItem;
use crate::net_link::{LinkState, NetEvent};
use crate::protocol::{AgentMessage, ErrorBody};

/// Events surfaced to whatever renders the conversation.
#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    Connection(LinkState),
    SessionStarted { session_id: String },
    Transcript { text: String, is_final: bool },
    AssistantText { delta: String, is_final: bool, full_text: Option<String> },
    Thinking { message: String },
    MemoryStored { memory_id: String, content: String },
    Error { code: Option<String>, message: String },
}

pub struct CoreController {
    current_session_id: Option<String>,
    last_error: Option<String>,
    playback_tx: mpsc::UnboundedSender<PlaybackItem>,
}

impl CoreController {
    pub fn new(playback_tx: mpsc::UnboundedSender<PlaybackItem>) -> Self {
        Self {
            current_session_id: None,
            last_error: None,
            playback_tx,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        self.current_session_id.as_deref()
    }

    /// Last user-facing error. Expected "no speech" outcomes never land here.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn handle_net_event(&mut self, event: NetEvent) -> Vec<UiEvent> {
        match event {
            NetEvent::Text(text) => self.process_server_text(&text),
            NetEvent::Binary(data) => {
                self.process_server_audio(data, None);
                Vec::new()
            }
            NetEvent::Connected => {
                // 连接建立即视为会话开始，远端 session_started 会覆盖这个 id
                let session_id = format!("session_{}", Uuid::new_v4().simple());
                info!("Link connected, local session {}", session_id);
                self.current_session_id = Some(session_id.clone());
                self.last_error = None;
                vec![
                    UiEvent::Connection(LinkState::Connected),
                    UiEvent::SessionStarted { session_id },
                ]
            }
            NetEvent::Disconnected { clean } => {
                info!("Link disconnected (clean={})", clean);
                vec![UiEvent::Connection(LinkState::Disconnected)]
            }
            NetEvent::Reconnecting { attempt, delay } => {
                info!("Reconnect attempt {} in {:?}", attempt, delay);
                vec![UiEvent::Connection(LinkState::Reconnecting { attempt })]
            }
            NetEvent::Failed { attempts } => {
                let message = format!("connection failed after {} attempts", attempts);
                self.last_error = Some(message.clone());
                vec![
                    UiEvent::Connection(LinkState::Failed),
                    UiEvent::Error { code: None, message },
                ]
            }
        }
    }

    fn process_server_text(&mut self, text: &str) -> Vec<UiEvent> {
        let msg = match AgentMessage::parse(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Dropping unparseable agent message: {}", e);
                return Vec::new();
            }
        };

        match msg {
            AgentMessage::Audio { audio, metadata } => {
                match audio {
                    Some(audio) => self.process_encoded_audio(&audio, metadata.sample_rate),
                    None => debug!("Audio event without payload"),
                }
                Vec::new()
            }
            AgentMessage::ResponseAudio { audio, sample_rate } => {
                self.process_encoded_audio(&audio, sample_rate);
                Vec::new()
            }
            AgentMessage::AsrResult { text, is_final } => {
                vec![UiEvent::Transcript { text, is_final }]
            }
            AgentMessage::ResponseText {
                delta,
                is_final,
                full_text,
            } => vec![UiEvent::AssistantText {
                delta,
                is_final,
                full_text,
            }],
            AgentMessage::Thinking { message } => vec![UiEvent::Thinking { message }],
            AgentMessage::Error { error } => self.process_error(error),
            AgentMessage::SessionStarted { session_id } => {
                info!("Session started: {}", session_id);
                self.current_session_id = Some(session_id.clone());
                vec![UiEvent::SessionStarted { session_id }]
            }
            AgentMessage::MemoryStored { memory_id, content } => {
                vec![UiEvent::MemoryStored { memory_id, content }]
            }
            AgentMessage::Cmd { name, data } => {
                debug!("Agent command {:?}: {}", name, data);
                Vec::new()
            }
            AgentMessage::Data { name, data } => self.process_data(&name, &data).into_iter().collect(),
            AgentMessage::Unknown => {
                debug!("Ignoring unknown agent message: {}", text);
                Vec::new()
            }
        }
    }

    fn process_error(&mut self, error: ErrorBody) -> Vec<UiEvent> {
        if error.is_expected_empty_input() {
            info!("No speech detected: {}", error.message());
            return Vec::new();
        }
        warn!("Agent error: {}", error.message());
        self.last_error = Some(error.message().to_string());
        vec![UiEvent::Error {
            code: error.code().map(str::to_string),
            message: error.message().to_string(),
        }]
    }

    /// Named data messages from the agent pipeline.
    fn process_data(&mut self, name: &str, data: &Value) -> Option<UiEvent> {
        let text = data.get("text").and_then(Value::as_str);
        let is_final = data.get("is_final").and_then(Value::as_bool);

        match name {
            "text_data" => {
                let text = text?.to_string();
                Some(match is_final {
                    Some(is_final) => UiEvent::Transcript { text, is_final },
                    None => UiEvent::AssistantText {
                        delta: text.clone(),
                        is_final: true,
                        full_text: Some(text),
                    },
                })
            }
            "interim_text" => Some(UiEvent::Transcript {
                text: text?.to_string(),
                is_final: false,
            }),
            "corrected_text" => {
                let text = data
                    .get("corrected_text")
                    .and_then(Value::as_str)
                    .or(text)?
                    .to_string();
                Some(UiEvent::AssistantText {
                    delta: text.clone(),
                    is_final: true,
                    full_text: Some(text),
                })
            }
            "transcript" => {
                let text = text?.to_string();
                let role = data.get("role").and_then(Value::as_str).unwrap_or("user");
                if role == "user" {
                    Some(UiEvent::Transcript {
                        text,
                        is_final: is_final.unwrap_or(true),
                    })
                } else {
                    Some(UiEvent::AssistantText {
                        delta: text.clone(),
                        is_final: is_final.unwrap_or(true),
                        full_text: Some(text),
                    })
                }
            }
            other => {
                debug!("Unhandled data message: {}", other);
                None
            }
        }
    }

    fn process_encoded_audio(&mut self, audio: &str, sample_rate: Option<u32>) {
        match STANDARD.decode(audio) {
            Ok(pcm) => self.process_server_audio(Bytes::from(pcm), sample_rate),
            Err(e) => warn!("Dropping audio chunk with bad base64: {}", e),
        }
    }

    fn process_server_audio(&mut self, pcm: Bytes, sample_rate: Option<u32>) {
        if pcm.is_empty() {
            return;
        }
        if self.playback_tx.send(PlaybackItem { pcm, sample_rate }).is_err() {
            warn!("Playback queue closed, dropping audio chunk");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn controller() -> (CoreController, mpsc::UnboundedReceiver<PlaybackItem>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (CoreController::new(tx), rx)
    }

    fn text(json: &str) -> NetEvent {
        NetEvent::Text(json.to_string())
    }

    #[test]
    fn binary_goes_to_playback_with_default_rate() {
        let (mut ctl, mut rx) = controller();
        assert!(ctl.handle_net_event(NetEvent::Binary(Bytes::from_static(&[1, 0, 2, 0]))).is_empty());
        let item = rx.try_recv().unwrap();
        assert_eq!(item.pcm, Bytes::from_static(&[1, 0, 2, 0]));
        assert_eq!(item.sample_rate, None);
    }

    #[test]
    fn base64_audio_is_decoded_with_rate() {
        let (mut ctl, mut rx) = controller();
        ctl.handle_net_event(text(r#"{"type":"audio","audio":"AQIDBA==","metadata":{"sample_rate":24000}}"#));
        ctl.handle_net_event(text(r#"{"type":"response_audio","audio":"BQY=","sample_rate":22050}"#));

        let first = rx.try_recv().unwrap();
        assert_eq!(first.pcm.as_ref(), &[1, 2, 3, 4]);
        assert_eq!(first.sample_rate, Some(24000));
        let second = rx.try_recv().unwrap();
        assert_eq!(second.pcm.as_ref(), &[5, 6]);
        assert_eq!(second.sample_rate, Some(22050));
    }

    #[test]
    fn bad_base64_is_dropped() {
        let (mut ctl, mut rx) = controller();
        ctl.handle_net_event(text(r#"{"type":"audio","audio":"%%%"}"#));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn text_events_become_ui_events() {
        let (mut ctl, _rx) = controller();
        assert_eq!(
            ctl.handle_net_event(text(r#"{"type":"asr_result","text":"hi","is_final":false}"#)),
            vec![UiEvent::Transcript { text: "hi".into(), is_final: false }]
        );
        assert_eq!(
            ctl.handle_net_event(text(
                r#"{"type":"response_text","delta":"!","is_final":true,"full_text":"Hello!"}"#
            )),
            vec![UiEvent::AssistantText {
                delta: "!".into(),
                is_final: true,
                full_text: Some("Hello!".into())
            }]
        );
        assert_eq!(
            ctl.handle_net_event(text(r#"{"type":"thinking","message":"..."}"#)),
            vec![UiEvent::Thinking { message: "...".into() }]
        );
    }

    #[test]
    fn no_speech_error_is_suppressed() {
        let (mut ctl, _rx) = controller();
        let events = ctl.handle_net_event(text(
            r#"{"type":"error","error":{"code":"NO_VALID_AUDIO_ERROR","message":"no speech"}}"#,
        ));
        assert!(events.is_empty());
        assert_eq!(ctl.last_error(), None);

        let events = ctl.handle_net_event(text(r#"{"type":"error","error":"Missing audio field"}"#));
        assert!(events.is_empty());
        assert_eq!(ctl.last_error(), None);

        let events = ctl.handle_net_event(text(r#"{"type":"error","error":{"code":"E1","message":"boom"}}"#));
        assert_eq!(
            events,
            vec![UiEvent::Error { code: Some("E1".into()), message: "boom".into() }]
        );
        assert_eq!(ctl.last_error(), Some("boom"));
    }

    #[test]
    fn unknown_and_malformed_messages_are_ignored() {
        let (mut ctl, mut rx) = controller();
        assert!(ctl.handle_net_event(text(r#"{"type":"future_thing"}"#)).is_empty());
        assert!(ctl.handle_net_event(text("not json")).is_empty());
        assert!(ctl.handle_net_event(text(r#"{"type":"cmd","name":"flush"}"#)).is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn far_end_session_id_replaces_local_one() {
        let (mut ctl, _rx) = controller();
        let events = ctl.handle_net_event(NetEvent::Connected);
        let local = ctl.session_id().unwrap().to_string();
        assert!(local.starts_with("session_"));
        assert!(events.contains(&UiEvent::SessionStarted { session_id: local }));

        ctl.handle_net_event(text(r#"{"type":"session_started","session_id":"s-42"}"#));
        assert_eq!(ctl.session_id(), Some("s-42"));
    }

    #[test]
    fn data_messages_map_to_transcripts() {
        let (mut ctl, _rx) = controller();
        assert_eq!(
            ctl.handle_net_event(text(r#"{"type":"data","name":"interim_text","data":{"text":"he"}}"#)),
            vec![UiEvent::Transcript { text: "he".into(), is_final: false }]
        );
        assert_eq!(
            ctl.handle_net_event(text(
                r#"{"type":"data","name":"transcript","data":{"text":"ok","role":"assistant"}}"#
            )),
            vec![UiEvent::AssistantText {
                delta: "ok".into(),
                is_final: true,
                full_text: Some("ok".into())
            }]
        );
        assert_eq!(
            ctl.handle_net_event(text(
                r#"{"type":"data","name":"text_data","data":{"text":"yo","is_final":true}}"#
            )),
            vec![UiEvent::Transcript { text: "yo".into(), is_final: true }]
        );
        assert!(ctl
            .handle_net_event(text(r#"{"type":"data","name":"text_data","data":{}}"#))
            .is_empty());
    }

    #[test]
    fn exhausted_reconnect_sets_error() {
        let (mut ctl, _rx) = controller();
        ctl.handle_net_event(NetEvent::Reconnecting {
            attempt: 1,
            delay: Duration::from_secs(1),
        });
        let events = ctl.handle_net_event(NetEvent::Failed { attempts: 3 });
        assert_eq!(events[0], UiEvent::Connection(LinkState::Failed));
        assert!(ctl.last_error().is_some());
    }
}
