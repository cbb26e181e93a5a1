//! Capture state machine.
//!
//! Interprets recognized utterances from the always-listening channel. In
//! `Normal` mode the model converses freely, minus recognizer noise. A
//! trigger phrase switches to `Test` mode, where fragments are buffered
//! until a stop phrase arrives; the framing phrases are then stripped and
//! the remaining text is handed off as the captured command.
//!
//! The machine only decides. Every side effect (turn-detection changes,
//! cancellations, spoken acknowledgements, action submission) is performed
//! by the session from the returned [`CaptureEvent`]s.

pub mod phrases;

use std::collections::HashSet;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::CaptureConfig;
use phrases::{PhraseTable, text_after, text_before, tokenize, words};

/// Capture mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    /// Free conversation; utterances are filtered for noise.
    Normal,
    /// Capturing fragments until a stop phrase.
    Test,
}

/// Why a capture cycle was abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// The buffer reached its fragment limit.
    BufferFull,
    /// No stop phrase arrived within the capture timeout.
    TimedOut,
}

/// Outcome of feeding one utterance (or one timeout tick) to the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    /// Same text as the previous utterance; nothing changed.
    Duplicate,
    /// Normal-mode recognizer noise; no reply should be spoken.
    Noise,
    /// Normal-mode utterance the model may answer.
    Reply,
    /// A trigger phrase started a capture cycle.
    Triggered { acknowledgement: String },
    /// A fragment was buffered. `fragments` is the new buffer length.
    Appended { fragments: usize },
    /// A stop phrase ended the cycle. `None` when nothing was said between
    /// the framing phrases.
    Completed { captured: Option<String> },
    /// The cycle was abandoned and the machine is back in normal mode.
    Aborted { reason: AbortReason },
}

/// Mutable capture state. Reset to `{Normal, [], None}` between cycles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureState {
    pub mode: CaptureMode,
    pub buffer: Vec<String>,
    pub last_utterance: Option<String>,
}

impl Default for CaptureState {
    fn default() -> Self {
        Self {
            mode: CaptureMode::Normal,
            buffer: Vec::new(),
            last_utterance: None,
        }
    }
}

/// Trigger/stop phrase state machine over recognized utterances.
#[derive(Debug)]
pub struct CaptureMachine {
    triggers: PhraseTable,
    stops: PhraseTable,
    allowlist: HashSet<String>,
    acknowledgement: String,
    max_fragments: usize,
    timeout: Option<Duration>,
    state: CaptureState,
    test_since: Option<Instant>,
    /// `buffer[0]` is the bare trigger utterance rather than captured text.
    trigger_in_buffer: bool,
}

impl CaptureMachine {
    /// Build a machine from the `[capture]` section. Phrase tables and the
    /// allow-list are normalized here once.
    #[must_use]
    pub fn new(config: &CaptureConfig) -> Self {
        let allowlist = config
            .noise_allowlist
            .iter()
            .map(String::as_str)
            .map(phrases::normalize)
            .filter(|w| !w.is_empty())
            .collect();
        let timeout = (config.capture_timeout_s > 0)
            .then(|| Duration::from_secs(u64::from(config.capture_timeout_s)));

        Self {
            triggers: PhraseTable::new(config.trigger_phrases.as_slice()),
            stops: PhraseTable::new(config.stop_phrases.as_slice()),
            allowlist,
            acknowledgement: config.acknowledgement.clone(),
            max_fragments: config.max_fragments.max(1),
            timeout,
            state: CaptureState::default(),
            test_since: None,
            trigger_in_buffer: false,
        }
    }

    #[must_use]
    pub fn mode(&self) -> CaptureMode {
        self.state.mode
    }

    /// Raw fragments buffered in the current cycle.
    #[must_use]
    pub fn buffer(&self) -> &[String] {
        &self.state.buffer
    }

    #[must_use]
    pub fn state(&self) -> &CaptureState {
        &self.state
    }

    /// Return to `{Normal, [], None}`.
    pub fn reset(&mut self) {
        self.state = CaptureState::default();
        self.test_since = None;
        self.trigger_in_buffer = false;
    }

    /// Feed one recognized utterance.
    pub fn process(&mut self, utterance: &str, now: Instant) -> Vec<CaptureEvent> {
        let trimmed = utterance.trim();
        if self.state.last_utterance.as_deref() == Some(trimmed) {
            debug!("duplicate utterance dropped");
            return vec![CaptureEvent::Duplicate];
        }
        self.state.last_utterance = Some(trimmed.to_owned());

        match self.state.mode {
            CaptureMode::Normal => self.process_normal(trimmed, now),
            CaptureMode::Test => {
                if tokenize(trimmed).is_empty() {
                    debug!("empty fragment ignored during capture");
                    return Vec::new();
                }
                self.append(trimmed)
            }
        }
    }

    /// Abandon the cycle if it has been open longer than the capture timeout.
    pub fn expire(&mut self, now: Instant) -> Option<CaptureEvent> {
        let timeout = self.timeout?;
        let since = self.test_since?;
        if now.saturating_duration_since(since) < timeout {
            return None;
        }
        warn!(
            "capture timed out after {}s without a stop phrase",
            timeout.as_secs()
        );
        Some(self.abort(AbortReason::TimedOut))
    }

    fn process_normal(&mut self, raw: &str, now: Instant) -> Vec<CaptureEvent> {
        let tokens = tokenize(raw);
        let norms = words(&tokens);

        if let Some(consumed) = self.triggers.match_prefix(&norms) {
            info!("trigger phrase detected, entering capture");
            self.state.mode = CaptureMode::Test;
            self.state.buffer.clear();
            self.test_since = Some(now);

            let mut events = vec![CaptureEvent::Triggered {
                acknowledgement: self.acknowledgement.clone(),
            }];
            if consumed == tokens.len() {
                self.state.buffer.push(raw.to_owned());
                self.trigger_in_buffer = true;
            } else {
                self.trigger_in_buffer = false;
                let remainder = text_after(raw, &tokens, consumed);
                events.extend(self.append(&remainder));
            }
            return events;
        }

        if self.is_noise(&norms) {
            debug!("noise utterance filtered: {raw:?}");
            return vec![CaptureEvent::Noise];
        }
        vec![CaptureEvent::Reply]
    }

    fn is_noise(&self, norms: &[&str]) -> bool {
        match norms {
            [] => true,
            [word] => {
                !self.allowlist.contains(*word)
                    && !self.triggers.matches_exact(norms)
                    && !self.stops.matches_exact(norms)
            }
            _ => false,
        }
    }

    fn append(&mut self, raw: &str) -> Vec<CaptureEvent> {
        if self.state.buffer.len() >= self.max_fragments {
            warn!(
                "capture buffer reached {} fragments, abandoning cycle",
                self.max_fragments
            );
            return vec![self.abort(AbortReason::BufferFull)];
        }
        self.state.buffer.push(raw.to_owned());
        let mut events = vec![CaptureEvent::Appended {
            fragments: self.state.buffer.len(),
        }];

        let tokens = tokenize(raw);
        if self.stops.match_suffix(&words(&tokens)).is_some() {
            let captured = self.extract_capture();
            info!(
                chars = captured.as_ref().map_or(0, String::len),
                "stop phrase detected, capture complete"
            );
            self.reset();
            events.push(CaptureEvent::Completed { captured });
        }
        events
    }

    /// Strip the framing phrases from the buffer and join what is left.
    ///
    /// The trigger was either buffered alone or already cut off the first
    /// fragment, so later fragments that happen to start with a trigger
    /// spelling are kept as captured text.
    fn extract_capture(&self) -> Option<String> {
        let skip = usize::from(self.trigger_in_buffer);
        let mut fragments: Vec<String> = self.state.buffer.iter().skip(skip).cloned().collect();

        // The stop phrase and everything after it.
        let stop_at = fragments.iter().enumerate().find_map(|(idx, fragment)| {
            let tokens = tokenize(fragment);
            self.stops
                .match_suffix(&words(&tokens))
                .map(|start| (idx, text_before(fragment, &tokens, start)))
        });
        if let Some((idx, kept)) = stop_at {
            fragments.truncate(idx);
            if !kept.is_empty() {
                fragments.push(kept);
            }
        }

        let captured = fragments
            .iter()
            .map(|f| f.trim())
            .filter(|f| !f.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        (!captured.is_empty()).then_some(captured)
    }

    fn abort(&mut self, reason: AbortReason) -> CaptureEvent {
        self.reset();
        CaptureEvent::Aborted { reason }
    }
}
