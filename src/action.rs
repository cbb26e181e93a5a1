//! Action bridge: submits captured text to an external HTTP action.
//!
//! The action is a bearer-protected GET endpoint answering with JSON such as
//! `{"ok": true, "message": "you sent me 42"}`. The `message` is spoken back
//! to the user verbatim. Failures never propagate; they become `None`, a
//! `warn!` line, and the configured fallback phrase.

use std::time::Duration;

use serde::Deserialize;
use tracing::{info, warn};

use crate::config::ActionConfig;

/// Body returned by the action endpoint.
#[derive(Debug, Deserialize)]
struct ActionResponse {
    #[serde(default)]
    message: Option<String>,
}

/// Why a submission produced no reply.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ActionFailure {
    Timeout,
    Unreachable,
    Status(u16),
    BadBody(String),
    NoMessage,
    Transport(String),
}

impl std::fmt::Display for ActionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "request timed out"),
            Self::Unreachable => write!(f, "endpoint unreachable"),
            Self::Status(code) => write!(f, "HTTP {code}"),
            Self::BadBody(e) => write!(f, "unparseable response: {e}"),
            Self::NoMessage => write!(f, "response has no message"),
            Self::Transport(e) => write!(f, "transport error: {e}"),
        }
    }
}

/// Submits captured utterances to the configured action endpoint.
#[derive(Debug, Clone)]
pub struct ActionBridge {
    config: ActionConfig,
    client: reqwest::Client,
}

impl ActionBridge {
    #[must_use]
    pub fn new(config: &ActionConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .unwrap_or_default();
        Self {
            config: config.clone(),
            client,
        }
    }

    /// Whether both an endpoint and a credential are configured.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.endpoint().is_some() && self.credential().is_some()
    }

    /// Send `text` to the action and return its `message`.
    ///
    /// Returns `None` without touching the network when the endpoint or
    /// credential is missing.
    pub async fn submit(&self, text: &str) -> Option<String> {
        let (Some(endpoint), Some(token)) = (self.endpoint(), self.credential()) else {
            warn!("action endpoint or credential not configured, skipping submission");
            return None;
        };

        match self.request(endpoint, token, text).await {
            Ok(message) => {
                info!(chars = message.len(), "action returned a reply");
                Some(message)
            }
            Err(failure) => {
                warn!("action submission failed: {failure}");
                None
            }
        }
    }

    /// Text to speak for a submission result.
    #[must_use]
    pub fn spoken_reply(&self, result: Option<String>) -> String {
        result.unwrap_or_else(|| self.config.failure_phrase.clone())
    }

    async fn request(
        &self,
        endpoint: &str,
        token: &str,
        text: &str,
    ) -> std::result::Result<String, ActionFailure> {
        let resp = self
            .client
            .get(endpoint)
            .bearer_auth(token)
            .query(&[(self.config.param_name.as_str(), text)])
            .send()
            .await
            .map_err(|e| classify_reqwest_error(&e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ActionFailure::Status(status.as_u16()));
        }

        let body: ActionResponse = resp
            .json()
            .await
            .map_err(|e| ActionFailure::BadBody(e.to_string()))?;
        body.message
            .filter(|m| !m.trim().is_empty())
            .ok_or(ActionFailure::NoMessage)
    }

    fn endpoint(&self) -> Option<&str> {
        non_blank(self.config.endpoint_url.as_deref())
    }

    fn credential(&self) -> Option<&str> {
        non_blank(self.config.bearer_token.as_deref())
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn classify_reqwest_error(err: &reqwest::Error) -> ActionFailure {
    if err.is_timeout() {
        ActionFailure::Timeout
    } else if err.is_connect() {
        ActionFailure::Unreachable
    } else {
        ActionFailure::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn spoken_reply_prefers_message() {
        let bridge = ActionBridge::new(&ActionConfig::default());
        assert_eq!(bridge.spoken_reply(Some("you sent me 7".into())), "you sent me 7");
        assert_eq!(
            bridge.spoken_reply(None),
            "Sorry, I couldn't complete that action."
        );
    }

    #[test]
    fn blank_credential_is_not_configured() {
        let bridge = ActionBridge::new(&ActionConfig {
            endpoint_url: Some("http://127.0.0.1:1/ping".into()),
            bearer_token: Some("  ".into()),
            ..ActionConfig::default()
        });
        assert!(!bridge.is_configured());
    }

    #[tokio::test]
    async fn missing_endpoint_returns_none() {
        let bridge = ActionBridge::new(&ActionConfig {
            bearer_token: Some("secret".into()),
            ..ActionConfig::default()
        });
        assert_eq!(bridge.submit("42").await, None);
    }

    #[tokio::test]
    async fn unreachable_endpoint_returns_none() {
        let bridge = ActionBridge::new(&ActionConfig {
            endpoint_url: Some("http://127.0.0.1:9/ping".into()),
            bearer_token: Some("secret".into()),
            timeout_ms: 2_000,
            ..ActionConfig::default()
        });
        assert_eq!(bridge.submit("42").await, None);
    }

    #[test]
    fn failure_display() {
        assert_eq!(ActionFailure::Status(502).to_string(), "HTTP 502");
        assert_eq!(ActionFailure::NoMessage.to_string(), "response has no message");
    }
}
