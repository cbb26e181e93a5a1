//! Configuration types for the realtime gate.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{GateError, Result};

/// Environment variable overriding [`ActionConfig::bearer_token`].
pub const ENV_ACTION_TOKEN: &str = "REALTIME_GATE_ACTION_TOKEN";
/// Environment variable overriding [`TokenConfig::bearer_token`].
pub const ENV_BACKEND_TOKEN: &str = "REALTIME_GATE_BACKEND_TOKEN";
/// Environment variable overriding [`TokenConfig::base_url`].
pub const ENV_API_BASE_URL: &str = "REALTIME_GATE_API_BASE_URL";

/// Top-level configuration for a realtime gate client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Realtime model connection settings.
    pub realtime: RealtimeConfig,
    /// Turn-detection override sent while local control is active.
    pub turn_detection: TurnDetectionConfig,
    /// Trigger/stop phrase tables and capture bounds.
    pub capture: CaptureConfig,
    /// External action endpoint.
    pub action: ActionConfig,
    /// Backend endpoint that mints ephemeral realtime credentials.
    pub token: TokenConfig,
}

/// Realtime model connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// WebSocket endpoint of the realtime API (without query string).
    pub ws_url: String,
    /// Realtime model name, appended as `?model=`.
    pub model: String,
    /// Voice requested when minting the session token.
    pub voice: Option<String>,
    /// Session-level instructions sent once the channel is ready.
    ///
    /// Empty means the server default is kept.
    pub instructions: String,
    /// Input transcription model. Transcripts drive the capture machine, so
    /// an empty value is only useful when the server enables it by default.
    pub transcription_model: String,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            ws_url: "wss://api.openai.com/v1/realtime".to_owned(),
            model: "gpt-4o-realtime-preview".to_owned(),
            voice: None,
            instructions: String::new(),
            transcription_model: "whisper-1".to_owned(),
        }
    }
}

/// Voice-activity parameters used when autonomous turn-taking is switched off.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnDetectionConfig {
    /// Turn-detection type understood by the server (e.g. `server_vad`).
    pub kind: String,
    /// Speech activation threshold (0.0–1.0).
    pub threshold: f32,
    /// Audio retained before detected speech, in ms.
    pub prefix_padding_ms: u32,
    /// Silence that closes a speech segment, in ms.
    pub silence_duration_ms: u32,
    /// Server idle timeout, in ms. `None` leaves it unset.
    pub idle_timeout_ms: Option<u32>,
}

impl Default for TurnDetectionConfig {
    fn default() -> Self {
        Self {
            kind: "server_vad".to_owned(),
            threshold: 0.6,
            prefix_padding_ms: 300,
            silence_duration_ms: 800,
            idle_timeout_ms: None,
        }
    }
}

/// Phrase tables and bounds for the capture state machine.
///
/// Phrase lists are matched after normalization (lowercase, punctuation
/// stripped), so `"hey, model"` and `"hey model"` are the same entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Accepted spellings of the trigger phrase.
    pub trigger_phrases: Vec<String>,
    /// Accepted spellings of the stop phrase.
    pub stop_phrases: Vec<String>,
    /// Single-word utterances that are not treated as noise in normal mode.
    pub noise_allowlist: Vec<String>,
    /// Phrase spoken verbatim when capture starts.
    pub acknowledgement: String,
    /// Maximum number of fragments held in one capture cycle.
    pub max_fragments: usize,
    /// Seconds a capture cycle may stay open before it is abandoned.
    ///
    /// Set to 0 to disable the timeout.
    pub capture_timeout_s: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            trigger_phrases: vec![
                "hey model".to_owned(),
                "hay model".to_owned(),
                "hey models".to_owned(),
            ],
            stop_phrases: vec![
                "model stop".to_owned(),
                "models stop".to_owned(),
                "model stopped".to_owned(),
            ],
            noise_allowlist: ["yes", "no", "ok", "okay", "stop", "thanks", "hello", "hi"]
                .into_iter()
                .map(str::to_owned)
                .collect(),
            acknowledgement: "Test mode. I'm listening.".to_owned(),
            max_fragments: 64,
            capture_timeout_s: 60,
        }
    }
}

/// External action endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionConfig {
    /// Full URL of the action endpoint. `None` disables submission.
    pub endpoint_url: Option<String>,
    /// Bearer credential for the action endpoint.
    pub bearer_token: Option<String>,
    /// Query parameter carrying the captured text.
    pub param_name: String,
    /// Request timeout in milliseconds.
    pub timeout_ms: u64,
    /// Phrase spoken verbatim when the action fails.
    pub failure_phrase: String,
}

impl Default for ActionConfig {
    fn default() -> Self {
        Self {
            endpoint_url: None,
            bearer_token: None,
            param_name: "number".to_owned(),
            timeout_ms: 10_000,
            failure_phrase: "Sorry, I couldn't complete that action.".to_owned(),
        }
    }
}

/// Backend token-minting endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// Base URL of the backend API (`/realtime/token` is appended).
    pub base_url: Option<String>,
    /// Bearer credential for the backend API.
    pub bearer_token: Option<String>,
    /// Requested token lifetime in seconds (60–600).
    pub expires_in: Option<u32>,
    /// Request timeout in milliseconds.
    pub timeout_ms: u64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            bearer_token: None,
            expires_in: None,
            timeout_ms: 10_000,
        }
    }
}

impl GateConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| GateError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| GateError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `~/.config/realtime-gate/config.toml`.
    pub fn default_config_path() -> PathBuf {
        if let Some(config) = std::env::var_os("XDG_CONFIG_HOME") {
            PathBuf::from(config)
                .join("realtime-gate")
                .join("config.toml")
        } else if let Some(home) = std::env::var_os("HOME") {
            PathBuf::from(home)
                .join(".config")
                .join("realtime-gate")
                .join("config.toml")
        } else {
            PathBuf::from("/tmp/realtime-gate-config/config.toml")
        }
    }

    /// Fill credentials and the backend URL from the environment.
    ///
    /// Values present in the environment win over the file so secrets can
    /// stay out of `config.toml`.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(token) = non_empty(ENV_ACTION_TOKEN) {
            self.action.bearer_token = Some(token);
        }
        if let Some(token) = non_empty(ENV_BACKEND_TOKEN) {
            self.token.bearer_token = Some(token);
        }
        if let Some(url) = non_empty(ENV_API_BASE_URL) {
            self.token.base_url = Some(url);
        }
    }

    /// Check invariants that serde defaults cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::Config`] describing the first violation found.
    pub fn validate(&self) -> Result<()> {
        if self.capture.trigger_phrases.iter().all(|p| p.trim().is_empty()) {
            return Err(GateError::Config(
                "capture.trigger_phrases must contain at least one phrase".into(),
            ));
        }
        if self.capture.stop_phrases.iter().all(|p| p.trim().is_empty()) {
            return Err(GateError::Config(
                "capture.stop_phrases must contain at least one phrase".into(),
            ));
        }
        if self.capture.max_fragments == 0 {
            return Err(GateError::Config(
                "capture.max_fragments must be greater than zero".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.turn_detection.threshold) {
            return Err(GateError::Config(format!(
                "turn_detection.threshold must be within 0.0..=1.0, got {}",
                self.turn_detection.threshold
            )));
        }
        if let Some(expires_in) = self.token.expires_in
            && !(crate::token::MIN_EXPIRES_IN..=crate::token::MAX_EXPIRES_IN).contains(&expires_in)
        {
            return Err(GateError::Config(format!(
                "token.expires_in must be between 60 and 600 seconds, got {expires_in}"
            )));
        }
        Ok(())
    }
}
