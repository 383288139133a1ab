//! WhatsApp adapter, grounded on the teacher's thin `bridges/whatsapp.rs`
//! webhook wrapper (it delegated entirely to `run_webhook_bridge`; this
//! keeps that shape but drops the agent dispatch).

use serde_json::Value;

use crate::error::{ErrorKind, TracedError};
use crate::store::Message;

use super::{payload_session_fallback, session_key, PlatformAdapter, PlatformEvent, PlatformKind, PlatformStatus};

pub(crate) struct WhatsAppAdapter {
    inbox: Vec<Value>,
}

impl WhatsAppAdapter {
    pub(crate) fn new() -> Self {
        WhatsAppAdapter { inbox: Vec::new() }
    }

    pub(crate) fn push_payload(&mut self, payload: Value) {
        self.inbox.push(payload);
    }

    fn extract(&self, payload: &Value) -> Option<PlatformEvent> {
        let entry = payload.get("entry")?.get(0)?;
        let change = entry.get("changes")?.get(0)?.get("value")?;
        let message = change.get("messages")?.get(0)?;
        let text = message.get("text")?.get("body")?.as_str()?.to_string();
        let from = message.get("from").and_then(|v| v.as_str());
        Some(PlatformEvent {
            session_key: from
                .map(|f| session_key("whatsapp", None, Some(f)))
                .unwrap_or_else(|| payload_session_fallback("whatsapp", payload)),
            text,
            channel: from.unwrap_or("unknown").to_string(),
        })
    }
}

impl PlatformAdapter for WhatsAppAdapter {
    fn kind(&self) -> PlatformKind {
        PlatformKind::WhatsApp
    }

    fn send(&self, msg: &Message) -> Result<(), TracedError> {
        if msg.content.trim().is_empty() {
            return Err(TracedError::new(ErrorKind::InvalidParams, "empty message content"));
        }
        tracing::info!(to = %msg.target_channel, "outbound whatsapp delivery");
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

    fn sample_payload(from: &str, text: &str) -> Value {
        serde_json::json!({
            "entry": [{
                "changes": [{
                    "value": {
                        "messages": [{"from": from, "text": {"body": text}}]
                    }
                }]
            }]
        })
    }

    #[test]
    fn extracts_text_and_sender() {
        let mut adapter = WhatsAppAdapter::new();
        adapter.push_payload(sample_payload("15551234567", "hello"));
        let events = adapter.receive().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].text, "hello");
        assert_eq!(events[0].session_key, "whatsapp:15551234567");
    }

    #[test]
    fn malformed_payload_yields_no_events() {
        let mut adapter = WhatsAppAdapter::new();
        adapter.push_payload(serde_json::json!({"entry": []}));
        assert!(adapter.receive().unwrap().is_empty());
    }
}
