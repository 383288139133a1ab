//! C-platform: outbound send / inbound receive adapters for each messaging
//! destination (§4.10).
//!
//! Each adapter only has to do two things: turn an inbound webhook payload
//! into a `PlatformEvent` (session key + text), and accept a queued
//! `Message` for delivery. Everything past that — agent invocation, memory,
//! skill distillation — lived in the teacher's bridge layer and has no
//! counterpart here.

pub(crate) mod slack;
pub(crate) mod webhook;
pub(crate) mod whatsapp;
pub(crate) mod matrix;

use serde::{Deserialize, Serialize};

use crate::error::TracedError;
use crate::store::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum PlatformKind {
    Slack,
    Discord,
    Teams,
    WhatsApp,
    Matrix,
    Webhook,
}

impl PlatformKind {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            PlatformKind::Slack => "slack",
            PlatformKind::Discord => "discord",
            PlatformKind::Teams => "teams",
            PlatformKind::WhatsApp => "whatsapp",
            PlatformKind::Matrix => "matrix",
            PlatformKind::Webhook => "webhook",
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct PlatformEvent {
    pub(crate) session_key: String,
    pub(crate) text: String,
    pub(crate) channel: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PlatformStatus {
    Connected,
    Disconnected,
    Degraded,
}

pub(crate) trait PlatformAdapter: Send {
    fn kind(&self) -> PlatformKind;
    fn send(&self, msg: &Message) -> Result<(), TracedError>;
    fn receive(&mut self) -> Result<Vec<PlatformEvent>, TracedError>;
    fn status(&self) -> PlatformStatus;
}

/// Shared session-key derivation for webhook-style adapters: prefer a
/// stable channel/user pair, falling back to a content hash so that two
/// payloads lacking identifying fields don't collide on "unknown:unknown".
pub(crate) fn session_key(prefix: &str, channel: Option<&str>, user: Option<&str>) -> String {
    match (channel, user) {
        (Some(c), Some(u)) => format!("{prefix}:{c}:{u}"),
        (Some(c), None) => format!("{prefix}:{c}"),
        (None, Some(u)) => format!("{prefix}:{u}"),
        (None, None) => format!("{prefix}:unknown"),
    }
}

pub(crate) fn payload_session_fallback(prefix: &str, payload: &serde_json::Value) -> String {
    let bytes = serde_json::to_vec(payload).unwrap_or_default();
    format!("{prefix}:{}", crate::util::blake3_hex(&bytes))
}
