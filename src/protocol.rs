//! Realtime wire protocol: typed inbound and outbound event frames.
//!
//! Inbound frames are JSON objects discriminated by `type`. Anything that
//! is not valid JSON, or does not fit a known shape, becomes
//! [`ServerEvent::Opaque`] so a misbehaving server can never break the
//! session loop. Unknown `type` values map to [`ServerEvent::Unknown`].

use serde::{Deserialize, Serialize};

use crate::error::{GateError, Result};

/// Modalities requested for every locally issued response.
pub const RESPONSE_MODALITIES: [&str; 2] = ["audio", "text"];

// ---------------------------------------------------------------------------
// Inbound (server → client)
// ---------------------------------------------------------------------------

/// Events received from the realtime model.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// The session exists and reports its effective configuration.
    #[serde(rename = "session.created")]
    SessionCreated {
        #[serde(default)]
        session: SessionInfo,
    },
    /// The model started generating a response.
    #[serde(rename = "response.created")]
    ResponseCreated { response: ResponseRef },
    /// A response finished (completed, cancelled or failed).
    #[serde(rename = "response.done")]
    ResponseDone { response: ResponseRef },
    /// Final transcript of one user speech segment.
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    TranscriptionCompleted {
        #[serde(default)]
        transcript: String,
    },
    /// The server rejected a client event.
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        error: ErrorDetail,
    },
    /// Payload that could not be decoded as a typed event.
    #[serde(skip)]
    Opaque { text: String },
    /// Any event type this client does not act on. Must stay last.
    #[serde(other)]
    Unknown,
}

impl ServerEvent {
    /// Short label for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionCreated { .. } => "session.created",
            Self::ResponseCreated { .. } => "response.created",
            Self::ResponseDone { .. } => "response.done",
            Self::TranscriptionCompleted { .. } => {
                "conversation.item.input_audio_transcription.completed"
            }
            Self::Error { .. } => "error",
            Self::Unknown => "unknown",
            Self::Opaque { .. } => "opaque",
        }
    }
}

/// Session configuration reported by `session.created`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SessionInfo {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub turn_detection: Option<TurnDetection>,
}

/// Response identifier carried by response lifecycle events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ResponseRef {
    #[serde(default)]
    pub id: String,
}

/// Body of an `error` event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ErrorDetail {
    /// Dotted path of the offending field, e.g. `session.turn_detection`.
    #[serde(default)]
    pub param: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
}

impl ErrorDetail {
    /// Whether the server refused a `response.create` from this client.
    #[must_use]
    pub fn rejects_response_request(&self) -> bool {
        self.code.as_deref() == Some("conversation_already_has_active_response")
            || self
                .param
                .as_deref()
                .is_some_and(|p| p == "response" || p.starts_with("response."))
    }
}

/// Decode one inbound frame. Never fails: undecodable payloads are returned
/// as [`ServerEvent::Opaque`].
#[must_use]
pub fn parse_frame(raw: &str) -> ServerEvent {
    let value: serde_json::Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(_) => {
            return ServerEvent::Opaque {
                text: raw.to_owned(),
            };
        }
    };
    match serde_json::from_value(value) {
        Ok(event) => event,
        Err(e) => {
            tracing::debug!("inbound frame does not match any event shape: {e}");
            ServerEvent::Opaque {
                text: raw.to_owned(),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Shared
// ---------------------------------------------------------------------------

/// Turn-detection configuration as exchanged with the server.
///
/// Fields the client does not model are kept in `extra` so a configuration
/// observed at session start can be restored without loss.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnDetection {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix_padding_ms: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub silence_duration_ms: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_ms: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_response: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interrupt_response: Option<bool>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TurnDetection {
    /// Server VAD with autonomous responses and interruption left on.
    #[must_use]
    pub fn permissive_default() -> Self {
        Self {
            kind: "server_vad".to_owned(),
            create_response: Some(true),
            interrupt_response: Some(true),
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Outbound (client → server)
// ---------------------------------------------------------------------------

/// Events sent to the realtime model.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    /// Ask the model to produce a response.
    #[serde(rename = "response.create")]
    ResponseCreate { response: ResponseRequest },
    /// Patch the session configuration.
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionPatch },
    /// Cancel an in-progress response.
    #[serde(rename = "response.cancel")]
    ResponseCancel { response_id: String },
}

/// Body of `response.create`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseRequest {
    pub modalities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    /// `"none"` keeps the response out of the conversation history.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation: Option<String>,
}

/// Body of `session.update`. Only populated fields are sent.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_detection: Option<TurnDetection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<TranscriptionSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

/// Input transcription settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscriptionSettings {
    pub model: String,
}

impl ClientEvent {
    /// A response that makes the model speak `text` word for word.
    #[must_use]
    pub fn verbatim(text: &str) -> Self {
        Self::ResponseCreate {
            response: ResponseRequest {
                modalities: modalities(),
                instructions: Some(verbatim_instructions(text)),
                conversation: Some("none".to_owned()),
            },
        }
    }

    /// A regular in-conversation reply to the user's last turn.
    #[must_use]
    pub fn reply() -> Self {
        Self::ResponseCreate {
            response: ResponseRequest {
                modalities: modalities(),
                instructions: None,
                conversation: None,
            },
        }
    }

    /// Replace the session's turn-detection configuration.
    #[must_use]
    pub fn turn_detection(config: TurnDetection) -> Self {
        Self::SessionUpdate {
            session: SessionPatch {
                turn_detection: Some(config),
                ..SessionPatch::default()
            },
        }
    }

    /// Cancel the response with `response_id`.
    #[must_use]
    pub fn cancel(response_id: impl Into<String>) -> Self {
        Self::ResponseCancel {
            response_id: response_id.into(),
        }
    }

    /// Session configuration frames are queued until the channel is ready.
    #[must_use]
    pub fn is_session_update(&self) -> bool {
        matches!(self, Self::SessionUpdate { .. })
    }

    /// Short label for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ResponseCreate { .. } => "response.create",
            Self::SessionUpdate { .. } => "session.update",
            Self::ResponseCancel { .. } => "response.cancel",
        }
    }
}

/// Wire envelope adding a client-generated `event_id`.
#[derive(Serialize)]
struct OutboundFrame<'a> {
    event_id: String,
    #[serde(flatten)]
    event: &'a ClientEvent,
}

/// Serialize an outbound event with a fresh `event_id`.
///
/// # Errors
///
/// Returns [`GateError::Protocol`] if serialization fails.
pub fn encode_frame(event: &ClientEvent) -> Result<String> {
    let frame = OutboundFrame {
        event_id: format!("evt_{}", uuid::Uuid::new_v4().simple()),
        event,
    };
    serde_json::to_string(&frame).map_err(|e| GateError::Protocol(e.to_string()))
}

/// Instructions constraining the model to speak `text` exactly.
#[must_use]
pub fn verbatim_instructions(text: &str) -> String {
    format!(
        "Say exactly the following text, word for word, and nothing else. \
         Do not paraphrase, translate, or add any commentary: \"{text}\""
    )
}

fn modalities() -> Vec<String> {
    RESPONSE_MODALITIES.iter().map(|m| (*m).to_owned()).collect()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn parse_response_created() {
        let event = parse_frame(r#"{"type":"response.created","response":{"id":"resp_1","status":"in_progress"}}"#);
        assert_eq!(
            event,
            ServerEvent::ResponseCreated {
                response: ResponseRef {
                    id: "resp_1".into()
                }
            }
        );
    }

    #[test]
    fn parse_transcription_completed() {
        let json = r#"{
            "type": "conversation.item.input_audio_transcription.completed",
            "item_id": "item_1",
            "content_index": 0,
            "transcript": "Hey model, this is the body."
        }"#;
        match parse_frame(json) {
            ServerEvent::TranscriptionCompleted { transcript } => {
                assert_eq!(transcript, "Hey model, this is the body.");
            }
            other => unreachable!("expected TranscriptionCompleted, got {other:?}"),
        }
    }

    #[test]
    fn parse_session_created_keeps_turn_detection_extras() {
        let json = r#"{
            "type": "session.created",
            "session": {
                "id": "sess_1",
                "turn_detection": {
                    "type": "server_vad",
                    "threshold": 0.5,
                    "prefix_padding_ms": 300,
                    "silence_duration_ms": 200,
                    "create_response": true,
                    "eagerness": "auto"
                }
            }
        }"#;
        match parse_frame(json) {
            ServerEvent::SessionCreated { session } => {
                assert_eq!(session.id.as_deref(), Some("sess_1"));
                let td = session.turn_detection.unwrap();
                assert_eq!(td.kind, "server_vad");
                assert_eq!(td.silence_duration_ms, Some(200));
                assert_eq!(td.create_response, Some(true));
                assert_eq!(td.extra.get("eagerness"), Some(&serde_json::json!("auto")));
            }
            other => unreachable!("expected SessionCreated, got {other:?}"),
        }
    }

    #[test]
    fn parse_error_with_param() {
        let json = r#"{"type":"error","error":{"type":"invalid_request_error","param":"session.turn_detection.idle_timeout_ms","message":"bad"}}"#;
        match parse_frame(json) {
            ServerEvent::Error { error } => {
                assert_eq!(
                    error.param.as_deref(),
                    Some("session.turn_detection.idle_timeout_ms")
                );
                assert_eq!(error.message.as_deref(), Some("bad"));
            }
            other => unreachable!("expected Error, got {other:?}"),
        }
    }

    #[test]
    fn rejected_response_request_is_recognized() {
        let busy = ErrorDetail {
            code: Some("conversation_already_has_active_response".into()),
            ..ErrorDetail::default()
        };
        assert!(busy.rejects_response_request());
        let bad_param = ErrorDetail {
            param: Some("response.modalities".into()),
            ..ErrorDetail::default()
        };
        assert!(bad_param.rejects_response_request());
        let other = ErrorDetail {
            param: Some("session.turn_detection".into()),
            ..ErrorDetail::default()
        };
        assert!(!other.rejects_response_request());
    }

    #[test]
    fn unknown_type_is_unknown_variant() {
        let event = parse_frame(r#"{"type":"response.audio.delta","delta":"AAAA"}"#);
        assert_eq!(event, ServerEvent::Unknown);
    }

    #[test]
    fn non_json_is_opaque() {
        let event = parse_frame("hello there");
        assert_eq!(
            event,
            ServerEvent::Opaque {
                text: "hello there".into()
            }
        );
    }

    #[test]
    fn known_type_with_wrong_shape_is_opaque() {
        let event = parse_frame(r#"{"type":"response.created","response":"oops"}"#);
        assert!(matches!(event, ServerEvent::Opaque { .. }));
        let event = parse_frame(r#"{"no_type":true}"#);
        assert!(matches!(event, ServerEvent::Opaque { .. }));
    }

    #[test]
    fn encode_cancel_frame() {
        let json = encode_frame(&ClientEvent::cancel("resp_9")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "response.cancel");
        assert_eq!(value["response_id"], "resp_9");
        assert!(value["event_id"].as_str().unwrap().starts_with("evt_"));
    }

    #[test]
    fn encode_verbatim_frame() {
        let json = encode_frame(&ClientEvent::verbatim("you sent me 42")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "response.create");
        assert_eq!(value["response"]["conversation"], "none");
        assert_eq!(value["response"]["modalities"], serde_json::json!(["audio", "text"]));
        let instructions = value["response"]["instructions"].as_str().unwrap();
        assert!(instructions.contains("\"you sent me 42\""));
        assert!(instructions.contains("word for word"));
    }

    #[test]
    fn encode_reply_omits_instructions() {
        let json = encode_frame(&ClientEvent::reply()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(value["response"].get("instructions").is_none());
        assert!(value["response"].get("conversation").is_none());
    }

    #[test]
    fn encode_turn_detection_override() {
        let td = TurnDetection {
            kind: "server_vad".into(),
            threshold: Some(0.6),
            prefix_padding_ms: Some(300),
            silence_duration_ms: Some(800),
            idle_timeout_ms: Some(10_000),
            create_response: Some(false),
            interrupt_response: Some(false),
            extra: serde_json::Map::new(),
        };
        let json = encode_frame(&ClientEvent::turn_detection(td)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "session.update");
        let sent = &value["session"]["turn_detection"];
        assert_eq!(sent["type"], "server_vad");
        assert_eq!(sent["create_response"], false);
        assert_eq!(sent["interrupt_response"], false);
        assert_eq!(sent["idle_timeout_ms"], 10_000);
        assert!(value["session"].get("instructions").is_none());
    }

    #[test]
    fn session_update_is_flagged_for_queueing() {
        assert!(ClientEvent::turn_detection(TurnDetection::permissive_default()).is_session_update());
        assert!(!ClientEvent::reply().is_session_update());
        assert!(!ClientEvent::cancel("x").is_session_update());
    }
}
