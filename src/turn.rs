//! Turn-detection override and restore.
//!
//! While local control is active the model must not start responses on its
//! own, so the controller patches the session's turn detection with
//! `create_response: false` and `interrupt_response: false`. Teardown puts
//! back whatever the server reported at session start.

use tracing::{info, warn};

use crate::channel::{EventChannel, SendOutcome};
use crate::config::TurnDetectionConfig;
use crate::protocol::{ClientEvent, TurnDetection};

/// Field name the server uses when it rejects a turn-detection patch.
const TURN_DETECTION_PARAM: &str = "turn_detection";

/// Issues and reverts turn-detection overrides for one session.
#[derive(Debug)]
pub struct TurnDetectionController {
    override_config: TurnDetection,
    observed: Option<TurnDetection>,
    disabled: bool,
    /// Whether the server starts responses on its own when not overridden.
    autonomous: bool,
}

impl TurnDetectionController {
    #[must_use]
    pub fn new(config: &TurnDetectionConfig) -> Self {
        Self {
            override_config: override_from_config(config),
            observed: None,
            disabled: false,
            autonomous: true,
        }
    }

    /// Whether the override is currently in effect (as far as we know).
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Whether the server will answer a user turn without being asked.
    #[must_use]
    pub fn responds_autonomously(&self) -> bool {
        !self.disabled && self.autonomous
    }

    /// Remember the configuration the server reported at session start.
    ///
    /// A missing configuration means turn detection is off server-side; it
    /// is not kept as a restore target.
    pub fn observe_session(&mut self, turn_detection: Option<TurnDetection>) {
        self.autonomous = turn_detection
            .as_ref()
            .is_some_and(|td| td.create_response != Some(false));
        if let Some(td) = turn_detection {
            self.observed = Some(td);
        }
    }

    /// Switch autonomous responses off. No-op if already disabled.
    pub fn disable(&mut self, channel: &mut EventChannel) -> Option<SendOutcome> {
        if self.disabled {
            return None;
        }
        let outcome = channel.send(ClientEvent::turn_detection(self.override_config.clone()));
        if outcome == SendOutcome::Dropped {
            warn!("turn-detection override was not delivered");
            return Some(outcome);
        }
        self.disabled = true;
        info!("turn detection overridden (autonomous responses off)");
        Some(outcome)
    }

    /// Revert to the configuration observed at session start, or to a
    /// permissive default. No-op if not disabled.
    pub fn restore(&mut self, channel: &mut EventChannel) -> Option<SendOutcome> {
        if !self.disabled {
            return None;
        }
        let target = self
            .observed
            .clone()
            .unwrap_or_else(TurnDetection::permissive_default);
        self.disabled = false;
        self.autonomous = target.create_response != Some(false);
        info!("turn detection restored");
        Some(channel.send(ClientEvent::turn_detection(target)))
    }

    /// React to a server `error` event. Returns `true` if it concerned the
    /// turn-detection override, in which case the next [`disable`] sends
    /// again.
    ///
    /// [`disable`]: Self::disable
    pub fn on_error(&mut self, param: Option<&str>) -> bool {
        let Some(param) = param else {
            return false;
        };
        if !param.contains(TURN_DETECTION_PARAM) {
            return false;
        }
        warn!("server rejected turn-detection override ({param}), will retry on next capture");
        self.disabled = false;
        true
    }
}

fn override_from_config(config: &TurnDetectionConfig) -> TurnDetection {
    TurnDetection {
        kind: config.kind.clone(),
        threshold: Some(config.threshold),
        prefix_padding_ms: Some(config.prefix_padding_ms),
        silence_duration_ms: Some(config.silence_duration_ms),
        idle_timeout_ms: config.idle_timeout_ms,
        create_response: Some(false),
        interrupt_response: Some(false),
        extra: serde_json::Map::new(),
    }
}
