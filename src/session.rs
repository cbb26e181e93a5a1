//! Session orchestrator.
//!
//! Owns one realtime session at a time and routes every inbound frame
//! through the response tracker, the turn-detection controller and the
//! capture machine. Processing is strictly one event at a time; the only
//! work that leaves this module is an action submission, returned as a
//! [`Submission`] for the runtime to execute and report back through
//! [`SessionOrchestrator::complete_action`].

use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::action::ActionBridge;
use crate::capture::{CaptureEvent, CaptureMachine, CaptureMode};
use crate::channel::{EventChannel, SendOutcome};
use crate::config::GateConfig;
use crate::error::{GateError, Result};
use crate::protocol::{ClientEvent, ServerEvent, SessionPatch, TranscriptionSettings, parse_frame};
use crate::response::{ResponseState, ResponseTracker};
use crate::transport::FrameSink;
use crate::turn::TurnDetectionController;

/// Lifecycle of the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Active,
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Captured text waiting to be sent to the action endpoint.
#[derive(Debug, Clone)]
pub struct Submission {
    /// Session the text was captured in.
    pub generation: u64,
    pub text: String,
    /// Cancelled when that session stops.
    pub liveness: CancellationToken,
}

/// Per-connection state. Dropped as a whole on teardown.
struct Session {
    channel: EventChannel,
    tracker: ResponseTracker,
    turn: TurnDetectionController,
    capture: CaptureMachine,
    liveness: CancellationToken,
    generation: u64,
}

impl Session {
    /// Ask the model to say `text` exactly.
    fn speak(&mut self, text: &str) {
        if self.channel.send(ClientEvent::verbatim(text)) == SendOutcome::Sent {
            self.tracker.note_local_request();
        }
    }
}

/// Drives one realtime session at a time.
pub struct SessionOrchestrator {
    config: GateConfig,
    bridge: ActionBridge,
    state: SessionState,
    session: Option<Session>,
    generation: u64,
}

impl SessionOrchestrator {
    #[must_use]
    pub fn new(config: GateConfig) -> Self {
        let bridge = ActionBridge::new(&config.action);
        Self {
            config,
            bridge,
            state: SessionState::Idle,
            session: None,
            generation: 0,
        }
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Capture mode of the live session (`Normal` when there is none).
    #[must_use]
    pub fn capture_mode(&self) -> CaptureMode {
        self.session
            .as_ref()
            .map_or(CaptureMode::Normal, |s| s.capture.mode())
    }

    /// Generation of the current (or last) session.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Response currently tracked as active, if any.
    #[must_use]
    pub fn active_response(&self) -> Option<&str> {
        self.session.as_ref().and_then(|s| s.tracker.active_id())
    }

    /// Whether the turn-detection override is in effect.
    #[must_use]
    pub fn turn_detection_disabled(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.turn.is_disabled())
    }

    /// Action bridge used to execute [`Submission`]s.
    #[must_use]
    pub fn bridge(&self) -> &ActionBridge {
        &self.bridge
    }

    /// Start a session over `sink`. Frames are held until
    /// [`on_channel_open`](Self::on_channel_open).
    ///
    /// # Errors
    ///
    /// Returns [`GateError::Session`] if a session is already connecting or
    /// active.
    pub fn connect(&mut self, sink: Box<dyn FrameSink>) -> Result<()> {
        if matches!(self.state, SessionState::Connecting | SessionState::Active) {
            return Err(GateError::Session(format!(
                "cannot connect while {}",
                self.state
            )));
        }

        self.generation += 1;
        let mut session = Session {
            channel: EventChannel::new(sink),
            tracker: ResponseTracker::new(),
            turn: TurnDetectionController::new(&self.config.turn_detection),
            capture: CaptureMachine::new(&self.config.capture),
            liveness: CancellationToken::new(),
            generation: self.generation,
        };
        if let Some(initial) = self.initial_update() {
            session.channel.send(initial);
        }

        self.session = Some(session);
        self.state = SessionState::Connecting;
        info!(generation = self.generation, "session connecting");
        Ok(())
    }

    /// The transport accepts frames: flush queued configuration and go live.
    pub fn on_channel_open(&mut self) {
        if self.state != SessionState::Connecting {
            warn!("channel open while {}, ignoring", self.state);
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let flushed = session.channel.mark_ready();
        session.capture.reset();
        self.state = SessionState::Active;
        info!(
            generation = session.generation,
            flushed, "session active"
        );
    }

    /// Process one inbound text frame.
    pub fn handle_frame(&mut self, raw: &str) -> Option<Submission> {
        self.handle_frame_at(raw, Instant::now())
    }

    /// [`handle_frame`](Self::handle_frame) with an explicit clock.
    pub fn handle_frame_at(&mut self, raw: &str, now: Instant) -> Option<Submission> {
        let event = parse_frame(raw);
        if self.state != SessionState::Active {
            debug!("{} frame while {}, ignoring", event.kind(), self.state);
            return None;
        }
        let session = self.session.as_mut()?;
        session.channel.log_inbound(&event, raw.len());

        match event {
            ServerEvent::SessionCreated { session: created } => {
                info!(
                    session_id = created.id.as_deref().unwrap_or("-"),
                    turn_detection = created.turn_detection.is_some(),
                    "realtime session created"
                );
                session.turn.observe_session(created.turn_detection);
                None
            }
            ServerEvent::ResponseCreated { response } => {
                let suppress = session.capture.mode() == CaptureMode::Test;
                let disposition =
                    session
                        .tracker
                        .on_created(&mut session.channel, &response.id, suppress);
                debug!(id = %response.id, ?disposition, "response created");
                None
            }
            ServerEvent::ResponseDone { response } => {
                session.tracker.on_done(&response.id);
                None
            }
            ServerEvent::TranscriptionCompleted { transcript } => {
                let events = session.capture.process(&transcript, now);
                apply_capture_events(session, events)
            }
            ServerEvent::Error { error } => {
                if error.rejects_response_request() {
                    session.tracker.on_request_rejected();
                }
                if !session.turn.on_error(error.param.as_deref()) {
                    warn!(
                        code = error.code.as_deref().unwrap_or("-"),
                        param = error.param.as_deref().unwrap_or("-"),
                        "server error: {}",
                        error.message.as_deref().unwrap_or("(no message)")
                    );
                }
                None
            }
            ServerEvent::Unknown => None,
            ServerEvent::Opaque { text } => {
                debug!(bytes = text.len(), "ignoring undecodable frame");
                None
            }
        }
    }

    /// Speak the result of an action submitted from session `generation`.
    ///
    /// Returns `true` if the reply was sent. Results for a stopped or
    /// replaced session are logged and dropped.
    pub fn complete_action(&mut self, generation: u64, result: Option<String>) -> bool {
        let live = self.state == SessionState::Active;
        let Some(session) = self.session.as_mut().filter(|s| {
            live && s.generation == generation && !s.liveness.is_cancelled()
        }) else {
            info!(generation, "dropping action result for a closed session");
            return false;
        };
        let reply = self.bridge.spoken_reply(result);
        // The server refuses a new response while another one is playing.
        session.tracker.cancel_autonomous(&mut session.channel);
        session.speak(&reply);
        true
    }

    /// Abandon a capture cycle that outlived the capture timeout.
    pub fn expire_capture(&mut self, now: Instant) {
        if self.state != SessionState::Active {
            return;
        }
        if let Some(session) = self.session.as_mut()
            && let Some(event) = session.capture.expire(now)
        {
            apply_capture_events(session, vec![event]);
        }
    }

    /// The transport went away underneath the session.
    pub fn on_transport_closed(&mut self, reason: &str) {
        if !matches!(self.state, SessionState::Connecting | SessionState::Active) {
            debug!("transport closed while {} ({reason})", self.state);
            return;
        }
        warn!("transport closed: {reason}");
        self.teardown(false);
    }

    /// Stop the session and release the transport. Safe to call repeatedly.
    pub fn stop(&mut self) {
        if self.session.is_none() {
            if self.state != SessionState::Idle {
                self.state = SessionState::Closed;
            }
            return;
        }
        self.teardown(true);
    }

    fn teardown(&mut self, restore: bool) {
        self.state = SessionState::Closed;
        let Some(mut session) = self.session.take() else {
            return;
        };
        if restore {
            session.turn.restore(&mut session.channel);
        }
        session.liveness.cancel();
        session.capture.reset();
        session.tracker.reset();
        if let Some(sink) = session.channel.release() {
            sink.close();
        }
        info!(generation = session.generation, "session closed");
    }

    /// `session.update` sent once the channel is ready: input transcription
    /// and session instructions.
    fn initial_update(&self) -> Option<ClientEvent> {
        let realtime = &self.config.realtime;
        let model = realtime.transcription_model.trim();
        let instructions = realtime.instructions.trim();
        if model.is_empty() && instructions.is_empty() {
            return None;
        }
        Some(ClientEvent::SessionUpdate {
            session: SessionPatch {
                input_audio_transcription: (!model.is_empty()).then(|| TranscriptionSettings {
                    model: model.to_owned(),
                }),
                instructions: (!instructions.is_empty()).then(|| instructions.to_owned()),
                ..SessionPatch::default()
            },
        })
    }
}

/// Turn capture decisions into outbound frames.
fn apply_capture_events(session: &mut Session, events: Vec<CaptureEvent>) -> Option<Submission> {
    let mut submission = None;
    for event in events {
        match event {
            CaptureEvent::Duplicate | CaptureEvent::Appended { .. } => {}
            CaptureEvent::Noise => {
                if session
                    .tracker
                    .cancel_autonomous(&mut session.channel)
                    .is_none()
                {
                    session.tracker.suppress_next();
                }
            }
            CaptureEvent::Reply => {
                session.tracker.clear_suppression();
                if !session.turn.responds_autonomously()
                    && session.tracker.state() == &ResponseState::NoActiveResponse
                    && session.channel.send(ClientEvent::reply()) == SendOutcome::Sent
                {
                    session.tracker.note_local_request();
                }
            }
            CaptureEvent::Triggered { acknowledgement } => {
                session.turn.disable(&mut session.channel);
                session.tracker.cancel(&mut session.channel, None);
                session.speak(&acknowledgement);
            }
            CaptureEvent::Completed { captured } => {
                session.turn.restore(&mut session.channel);
                match captured {
                    Some(text) => {
                        info!(chars = text.len(), "submitting captured text");
                        submission = Some(Submission {
                            generation: session.generation,
                            text,
                            liveness: session.liveness.clone(),
                        });
                    }
                    None => info!("capture was empty, nothing to submit"),
                }
            }
            CaptureEvent::Aborted { reason } => {
                warn!(?reason, "capture aborted");
                session.turn.restore(&mut session.channel);
            }
        }
    }
    submission
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::transport::MemorySink;

    fn transcript(text: &str) -> String {
        json!({
            "type": "conversation.item.input_audio_transcription.completed",
            "transcript": text,
        })
        .to_string()
    }

    fn created(id: &str) -> String {
        json!({"type": "response.created", "response": {"id": id}}).to_string()
    }

    fn done(id: &str) -> String {
        json!({"type": "response.done", "response": {"id": id}}).to_string()
    }

    fn active() -> (SessionOrchestrator, MemorySink) {
        let sink = MemorySink::new();
        let mut orch = SessionOrchestrator::new(GateConfig::default());
        orch.connect(Box::new(sink.clone())).unwrap();
        orch.on_channel_open();
        (orch, sink)
    }

    #[test]
    fn lifecycle_transitions() {
        let sink = MemorySink::new();
        let mut orch = SessionOrchestrator::new(GateConfig::default());
        assert_eq!(orch.state(), SessionState::Idle);
        orch.connect(Box::new(sink.clone())).unwrap();
        assert_eq!(orch.state(), SessionState::Connecting);
        assert!(orch.connect(Box::new(MemorySink::new())).is_err());
        orch.on_channel_open();
        assert_eq!(orch.state(), SessionState::Active);
        orch.stop();
        assert_eq!(orch.state(), SessionState::Closed);
        assert!(sink.is_closed());
        orch.stop();
        assert_eq!(orch.state(), SessionState::Closed);
    }

    #[test]
    fn initial_update_is_flushed_on_open() {
        let sink = MemorySink::new();
        let mut orch = SessionOrchestrator::new(GateConfig::default());
        orch.connect(Box::new(sink.clone())).unwrap();
        assert!(sink.frames().is_empty());
        orch.on_channel_open();

        let updates = sink.frames_of_type("session.update");
        assert_eq!(updates.len(), 1);
        assert_eq!(
            updates[0]["session"]["input_audio_transcription"]["model"],
            "whisper-1"
        );
    }

    #[test]
    fn trigger_overrides_cancels_and_acknowledges() {
        let (mut orch, sink) = active();
        orch.handle_frame(&created("speaking"));
        orch.handle_frame(&transcript("Hey model"));

        assert_eq!(orch.capture_mode(), CaptureMode::Test);
        assert!(orch.turn_detection_disabled());
        let cancels = sink.frames_of_type("response.cancel");
        assert_eq!(cancels.len(), 1);
        assert_eq!(cancels[0]["response_id"], "speaking");

        let creates = sink.frames_of_type("response.create");
        assert_eq!(creates.len(), 1);
        assert_eq!(creates[0]["response"]["conversation"], "none");
        assert!(
            creates[0]["response"]["instructions"]
                .as_str()
                .unwrap()
                .contains("Test mode. I'm listening.")
        );
    }

    #[test]
    fn acknowledgement_is_not_cancelled_but_autonomous_reply_is() {
        let (mut orch, sink) = active();
        orch.handle_frame(&transcript("hey model"));
        orch.handle_frame(&created("ack"));
        assert_eq!(orch.active_response(), Some("ack"));
        orch.handle_frame(&created("auto"));

        let cancels = sink.frames_of_type("response.cancel");
        assert_eq!(cancels.len(), 1);
        assert_eq!(cancels[0]["response_id"], "auto");
    }

    #[test]
    fn completed_capture_restores_and_submits() {
        let (mut orch, sink) = active();
        let mut submission = None;
        for text in ["hey model", "my", "test", "is", "one", "model stop"] {
            submission = orch.handle_frame(&transcript(text)).or(submission);
        }
        let submission = submission.unwrap();
        assert_eq!(submission.text, "my test is one");
        assert_eq!(submission.generation, orch.generation());
        assert!(!submission.liveness.is_cancelled());
        assert_eq!(orch.capture_mode(), CaptureMode::Normal);
        assert!(!orch.turn_detection_disabled());

        // initial + override + restore
        assert_eq!(sink.frames_of_type("session.update").len(), 3);
    }

    #[test]
    fn empty_capture_is_not_submitted() {
        let (mut orch, _sink) = active();
        assert!(orch.handle_frame(&transcript("hey model")).is_none());
        assert!(orch.handle_frame(&transcript("model stop")).is_none());
        assert!(!orch.turn_detection_disabled());
    }

    #[test]
    fn action_reply_is_spoken_verbatim() {
        let (mut orch, sink) = active();
        assert!(orch.complete_action(orch.generation(), Some("you sent me 42".into())));
        let creates = sink.frames_of_type("response.create");
        let instructions = creates[0]["response"]["instructions"].as_str().unwrap();
        assert!(instructions.contains("\"you sent me 42\""));
    }

    #[test]
    fn failed_action_speaks_fallback() {
        let (mut orch, sink) = active();
        orch.complete_action(orch.generation(), None);
        let creates = sink.frames_of_type("response.create");
        assert!(
            creates[0]["response"]["instructions"]
                .as_str()
                .unwrap()
                .contains("Sorry, I couldn't complete that action.")
        );
    }

    #[test]
    fn late_completion_after_stop_is_dropped() {
        let (mut orch, sink) = active();
        let generation = orch.generation();
        orch.stop();
        assert!(!orch.complete_action(generation, Some("late".into())));
        assert!(sink.frames_of_type("response.create").is_empty());
    }

    #[test]
    fn stale_generation_is_dropped() {
        let (mut orch, _old) = active();
        let stale = orch.generation();
        orch.stop();
        let sink = MemorySink::new();
        orch.connect(Box::new(sink.clone())).unwrap();
        orch.on_channel_open();
        assert!(!orch.complete_action(stale, Some("late".into())));
        assert!(sink.frames_of_type("response.create").is_empty());
    }

    #[test]
    fn stop_cancels_submission_liveness() {
        let (mut orch, _sink) = active();
        let sub = orch
            .handle_frame(&transcript("hey model remember eight model stop"))
            .unwrap();
        orch.stop();
        assert!(sub.liveness.is_cancelled());
    }

    #[test]
    fn stop_restores_turn_detection_mid_capture() {
        let (mut orch, sink) = active();
        orch.handle_frame(&transcript("hey model"));
        orch.stop();
        let updates = sink.frames_of_type("session.update");
        let last = updates.last().unwrap();
        assert_eq!(last["session"]["turn_detection"]["create_response"], true);
        assert!(sink.is_closed());
    }

    #[test]
    fn transport_close_tears_down() {
        let (mut orch, sink) = active();
        orch.handle_frame(&transcript("hey model"));
        let before = sink.frames().len();
        orch.on_transport_closed("reset by peer");
        assert_eq!(orch.state(), SessionState::Closed);
        assert_eq!(orch.capture_mode(), CaptureMode::Normal);
        assert_eq!(sink.frames().len(), before);
        assert!(sink.is_closed());
    }

    #[test]
    fn noise_cancels_active_response() {
        let (mut orch, sink) = active();
        orch.handle_frame(&created("reply"));
        orch.handle_frame(&transcript("uh"));
        let cancels = sink.frames_of_type("response.cancel");
        assert_eq!(cancels[0]["response_id"], "reply");
    }

    #[test]
    fn noise_does_not_cut_off_action_reply() {
        let (mut orch, sink) = active();
        assert!(orch.complete_action(orch.generation(), Some("you sent me 42".into())));
        orch.handle_frame(&created("action-reply"));
        orch.handle_frame(&transcript("uh"));

        assert!(sink.frames_of_type("response.cancel").is_empty());
        assert_eq!(orch.active_response(), Some("action-reply"));

        // The noise still gets no reply of its own.
        orch.handle_frame(&done("action-reply"));
        orch.handle_frame(&created("noise-reply"));
        let cancels = sink.frames_of_type("response.cancel");
        assert_eq!(cancels.len(), 1);
        assert_eq!(cancels[0]["response_id"], "noise-reply");
    }

    #[test]
    fn action_reply_cancels_autonomous_response_first() {
        let (mut orch, sink) = active();
        orch.handle_frame(&created("chatter"));
        assert!(orch.complete_action(orch.generation(), Some("you sent me 42".into())));

        let kinds: Vec<_> = sink
            .json_frames()
            .iter()
            .skip(1)
            .map(|f| f["type"].as_str().unwrap().to_owned())
            .collect();
        assert_eq!(kinds, ["response.cancel", "response.create"]);
        assert_eq!(sink.frames_of_type("response.cancel")[0]["response_id"], "chatter");
    }

    #[test]
    fn rejected_action_reply_does_not_shield_next_capture() {
        let (mut orch, sink) = active();
        assert!(orch.complete_action(orch.generation(), Some("you sent me 42".into())));
        orch.handle_frame(
            &json!({"type": "error", "error": {
                "type": "invalid_request_error",
                "code": "conversation_already_has_active_response",
                "message": "busy"
            }})
            .to_string(),
        );
        assert_eq!(orch.state(), SessionState::Active);

        orch.handle_frame(&transcript("hey model"));
        orch.handle_frame(&created("ack"));
        orch.handle_frame(&created("auto"));

        let cancels = sink.frames_of_type("response.cancel");
        assert_eq!(cancels.len(), 1);
        assert_eq!(cancels[0]["response_id"], "auto");
        assert_eq!(orch.active_response(), None);
    }

    #[test]
    fn noise_before_response_suppresses_next() {
        let (mut orch, sink) = active();
        orch.handle_frame(&transcript("the"));
        orch.handle_frame(&created("late-reply"));
        let cancels = sink.frames_of_type("response.cancel");
        assert_eq!(cancels.len(), 1);
        assert_eq!(cancels[0]["response_id"], "late-reply");
        assert_eq!(orch.active_response(), None);
    }

    #[test]
    fn reply_is_left_to_server_when_autonomous() {
        let (mut orch, sink) = active();
        orch.handle_frame(&transcript("what time is it"));
        assert!(sink.frames_of_type("response.create").is_empty());
    }

    #[test]
    fn reply_is_requested_when_server_turn_detection_is_off() {
        let (mut orch, sink) = active();
        orch.handle_frame(
            &json!({"type": "session.created", "session": {"id": "s", "turn_detection": null}})
                .to_string(),
        );
        orch.handle_frame(&transcript("what time is it"));
        let creates = sink.frames_of_type("response.create");
        assert_eq!(creates.len(), 1);
        assert!(creates[0]["response"].get("instructions").is_none());
    }

    #[test]
    fn turn_detection_rejection_keeps_session_up() {
        let (mut orch, _sink) = active();
        orch.handle_frame(&transcript("hey model"));
        orch.handle_frame(
            &json!({"type": "error", "error": {"param": "session.turn_detection", "message": "nope"}})
                .to_string(),
        );
        assert_eq!(orch.state(), SessionState::Active);
        assert!(!orch.turn_detection_disabled());
    }

    #[test]
    fn capture_timeout_restores_turn_detection() {
        let config = GateConfig {
            capture: crate::config::CaptureConfig {
                capture_timeout_s: 1,
                ..Default::default()
            },
            ..GateConfig::default()
        };
        let sink = MemorySink::new();
        let mut orch = SessionOrchestrator::new(config);
        orch.connect(Box::new(sink.clone())).unwrap();
        orch.on_channel_open();

        let start = Instant::now();
        orch.handle_frame_at(&transcript("hey model"), start);
        assert!(orch.turn_detection_disabled());
        orch.expire_capture(start + Duration::from_secs(2));
        assert_eq!(orch.capture_mode(), CaptureMode::Normal);
        assert!(!orch.turn_detection_disabled());
    }

    #[test]
    fn frames_before_open_are_ignored() {
        let sink = MemorySink::new();
        let mut orch = SessionOrchestrator::new(GateConfig::default());
        orch.connect(Box::new(sink.clone())).unwrap();
        assert!(orch.handle_frame(&transcript("hey model")).is_none());
        assert_eq!(orch.capture_mode(), CaptureMode::Normal);
    }

    #[test]
    fn malformed_frame_is_ignored() {
        let (mut orch, sink) = active();
        assert!(orch.handle_frame("not json at all").is_none());
        assert_eq!(orch.state(), SessionState::Active);
        assert_eq!(sink.frames().len(), 1);
    }
}
