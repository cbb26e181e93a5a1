//! Ephemeral realtime credential minting.
//!
//! The long-lived model API key stays on the backend. Clients call
//! `POST {base_url}/realtime/token` with their own bearer credential and get
//! back a short-lived client secret for the realtime WebSocket.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{GateConfig, TokenConfig};
use crate::error::{GateError, Result};

/// Shortest token lifetime the backend accepts, in seconds.
pub const MIN_EXPIRES_IN: u32 = 60;
/// Longest token lifetime the backend accepts, in seconds.
pub const MAX_EXPIRES_IN: u32 = 600;

/// Request body for the token endpoint. Only populated fields are sent.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TokenRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<TranscriptionRequest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscriptionRequest {
    pub model: String,
}

impl TokenRequest {
    /// Request matching the session settings in `config`.
    #[must_use]
    pub fn from_config(config: &GateConfig) -> Self {
        let non_empty = |s: &str| (!s.trim().is_empty()).then(|| s.to_owned());
        Self {
            model: non_empty(&config.realtime.model),
            instructions: non_empty(&config.realtime.instructions),
            voice: config.realtime.voice.clone(),
            expires_in: config.token.expires_in,
            input_audio_transcription: non_empty(&config.realtime.transcription_model)
                .map(|model| TranscriptionRequest { model }),
        }
    }
}

/// A minted realtime credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealtimeToken {
    /// Client secret used as the WebSocket bearer credential.
    pub value: String,
    /// Unix timestamp after which the secret is rejected, if reported.
    pub expires_at: Option<i64>,
    pub session_id: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenEnvelope {
    #[serde(default)]
    ok: bool,
    session: Option<MintedSession>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MintedSession {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    model: Option<String>,
    client_secret: Option<ClientSecret>,
}

#[derive(Debug, Deserialize)]
struct ClientSecret {
    value: String,
    #[serde(default)]
    expires_at: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
}

/// Client for the backend token endpoint.
#[derive(Debug, Clone)]
pub struct RealtimeTokenClient {
    base_url: String,
    bearer_token: String,
    client: reqwest::Client,
}

impl RealtimeTokenClient {
    /// Build a client from the `[token]` section.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::Config`] if the base URL or credential is missing.
    pub fn new(config: &TokenConfig) -> Result<Self> {
        let base_url = config
            .base_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| GateError::Config("token.base_url is not set".into()))?;
        let bearer_token = config
            .bearer_token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| GateError::Config("token.bearer_token is not set".into()))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| GateError::Token(format!("build http client: {e}")))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            bearer_token: bearer_token.to_owned(),
            client,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/realtime/token", self.base_url)
    }

    /// Mint a realtime credential.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::Token`] if `expires_in` is out of range, the
    /// request fails, the backend answers with a non-2xx status, or the
    /// response carries no client secret.
    pub async fn mint(&self, request: &TokenRequest) -> Result<RealtimeToken> {
        if let Some(expires_in) = request.expires_in {
            validate_expires_in(expires_in)?;
        }

        let resp = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.bearer_token)
            .json(request)
            .send()
            .await
            .map_err(|e| GateError::Token(format!("token request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<ErrorBody>(&body)
                .ok()
                .and_then(|b| b.message)
                .unwrap_or_else(|| body.chars().take(200).collect());
            return Err(GateError::Token(format!(
                "token endpoint returned {}: {detail}",
                status.as_u16()
            )));
        }

        let envelope: TokenEnvelope = resp
            .json()
            .await
            .map_err(|e| GateError::Token(format!("unparseable token response: {e}")))?;
        if !envelope.ok {
            return Err(GateError::Token(format!(
                "token endpoint reported failure: {}",
                envelope.message.unwrap_or_default()
            )));
        }
        let session = envelope
            .session
            .ok_or_else(|| GateError::Token("token response has no session".into()))?;
        let secret = session
            .client_secret
            .filter(|s| !s.value.is_empty())
            .ok_or_else(|| GateError::Token("token response has no client secret".into()))?;

        info!(
            session_id = session.id.as_deref().unwrap_or("-"),
            "realtime credential minted"
        );
        Ok(RealtimeToken {
            value: secret.value,
            expires_at: secret.expires_at,
            session_id: session.id,
            model: session.model,
        })
    }
}

/// Check a requested lifetime against the backend's accepted range.
///
/// # Errors
///
/// Returns [`GateError::Token`] when outside `60..=600` seconds.
pub fn validate_expires_in(expires_in: u32) -> Result<()> {
    if (MIN_EXPIRES_IN..=MAX_EXPIRES_IN).contains(&expires_in) {
        Ok(())
    } else {
        Err(GateError::Token(format!(
            "expires_in must be between {MIN_EXPIRES_IN} and {MAX_EXPIRES_IN} seconds, got {expires_in}"
        )))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn expires_in_bounds() {
        assert!(validate_expires_in(60).is_ok());
        assert!(validate_expires_in(600).is_ok());
        assert!(validate_expires_in(59).is_err());
        assert!(validate_expires_in(601).is_err());
    }

    #[test]
    fn request_from_config_skips_empty_fields() {
        let mut config = GateConfig::default();
        config.realtime.voice = Some("verse".into());
        config.token.expires_in = Some(120);

        let request = TokenRequest::from_config(&config);
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["model"], "gpt-4o-realtime-preview");
        assert_eq!(json["voice"], "verse");
        assert_eq!(json["expires_in"], 120);
        assert_eq!(json["input_audio_transcription"]["model"], "whisper-1");
        assert!(json.get("instructions").is_none());
    }

    #[test]
    fn client_requires_base_url_and_credential() {
        let err = RealtimeTokenClient::new(&TokenConfig::default()).unwrap_err();
        assert!(matches!(err, GateError::Config(_)));

        let err = RealtimeTokenClient::new(&TokenConfig {
            base_url: Some("https://backend.test".into()),
            ..TokenConfig::default()
        })
        .unwrap_err();
        assert!(err.to_string().contains("bearer_token"));
    }

    #[test]
    fn endpoint_trims_trailing_slash() {
        let client = RealtimeTokenClient::new(&TokenConfig {
            base_url: Some("https://backend.test/prod/".into()),
            bearer_token: Some("secret".into()),
            ..TokenConfig::default()
        })
        .unwrap();
        assert_eq!(client.endpoint(), "https://backend.test/prod/realtime/token");
    }
}
