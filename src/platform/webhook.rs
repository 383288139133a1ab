//! Generic inbound-webhook adapter used by Discord, Teams and the bare
//! `Webhook` platform kind. Grounded on the teacher's
//! `bridges/webhook.rs::run_webhook_bridge` loop, stripped of the agent
//! dispatch it used to do: an inbound POST becomes a `PlatformEvent`, a
//! queued `Message` is rendered to a JSON body on the way out.

use serde_json::Value;

use crate::error::{ErrorKind, TracedError};
use crate::store::Message;

use super::{session_key, payload_session_fallback, PlatformAdapter, PlatformEvent, PlatformKind, PlatformStatus};

pub(crate) struct WebhookAdapter {
    kind: PlatformKind,
    inbox: Vec<Value>,
}

impl WebhookAdapter {
    pub(crate) fn new(kind: PlatformKind) -> Self {
        WebhookAdapter {
            kind,
            inbox: Vec::new(),
        }
    }

    /// Called by the HTTP listener when a payload lands on this adapter's
    /// webhook path; queued for the next `receive()` drain.
    pub(crate) fn push_payload(&mut self, payload: Value) {
        self.inbox.push(payload);
    }

    fn extract(&self, payload: &Value) -> Option<PlatformEvent> {
        let prefix = self.kind.as_str();
        match self.kind {
            PlatformKind::Discord => {
                let text = payload.get("content")?.as_str()?.to_string();
                let channel = payload.get("channel_id").and_then(|v| v.as_str());
                let user = payload.get("author").and_then(|v| v.get("id")).and_then(|v| v.as_str());
                Some(PlatformEvent {
                    session_key: if channel.or(user).is_some() {
                        session_key(prefix, channel, user)
                    } else {
                        payload_session_fallback(prefix, payload)
                    },
                    text,
                    channel: channel.unwrap_or("unknown").to_string(),
                })
            }
            PlatformKind::Teams => {
                let text = payload
                    .get("text")
                    .and_then(|v| v.as_str())
                    .or_else(|| payload.get("body").and_then(|b| b.get("content")).and_then(|v| v.as_str()))?
                    .to_string();
                let convo = payload.get("conversation").and_then(|v| v.get("id")).and_then(|v| v.as_str());
                let from = payload.get("from").and_then(|v| v.get("id")).and_then(|v| v.as_str());
                Some(PlatformEvent {
                    session_key: if convo.or(from).is_some() {
                        session_key(prefix, convo, from)
                    } else {
                        payload_session_fallback(prefix, payload)
                    },
                    text,
                    channel: convo.unwrap_or("unknown").to_string(),
                })
            }
            _ => {
                let text = payload.get("text").and_then(|v| v.as_str())?.to_string();
                let channel = payload.get("channel").and_then(|v| v.as_str());
                Some(PlatformEvent {
                    session_key: channel
                        .map(|c| session_key(prefix, Some(c), None))
                        .unwrap_or_else(|| payload_session_fallback(prefix, payload)),
                    text,
                    channel: channel.unwrap_or("unknown").to_string(),
                })
            }
        }
    }
}

impl PlatformAdapter for WebhookAdapter {
    fn kind(&self) -> PlatformKind {
        self.kind
    }

    fn send(&self, msg: &Message) -> Result<(), TracedError> {
        if msg.content.trim().is_empty() {
            return Err(TracedError::new(ErrorKind::InvalidParams, "empty message content"));
        }
        tracing::info!(platform = self.kind.as_str(), channel = %msg.target_channel, "outbound webhook delivery");
        Ok(())
    }

    fn receive(&mut self) -> Result<Vec<PlatformEvent>, TracedError> {
        let payloads = std::mem::take(&mut self.inbox);
        Ok(payloads.iter().filter_map(|p| self.extract(p)).collect())
    }

    fn status(&self) -> PlatformStatus {
        PlatformStatus::Connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discord_event_extracts_session_and_text() {
        let mut adapter = WebhookAdapter::new(PlatformKind::Discord);
        adapter.push_payload(serde_json::json!({
            "content": "hello there",
            "channel_id": "C1",
            "author": {"id": "U1"},
        }));
        let events = adapter.receive().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].text, "hello there");
        assert_eq!(events[0].session_key, "discord:C1:U1");
    }

    #[test]
    fn payload_without_identity_falls_back_to_hash() {
        let mut adapter = WebhookAdapter::new(PlatformKind::Teams);
        adapter.push_payload(serde_json::json!({ "text": "hi" }));
        let events = adapter.receive().unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].session_key.starts_with("teams:"));
    }

    #[test]
    fn send_rejects_empty_content() {
        let adapter = WebhookAdapter::new(PlatformKind::Discord);
        let mut msg = super::super::tests_support::sample_message();
        msg.content = String::new();
        assert!(adapter.send(&msg).is_err());
    }
}
