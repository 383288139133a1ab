//! Structured error type carried across every component boundary (§7).
//!
//! `TracedError` wraps an [`ErrorKind`] with the trace metadata the spec
//! requires: a code/category/severity, a trace id, a source location, input
//! and state snapshots, a short ring of recent log lines, and a repeat
//! counter for rate-limited notification of the same failure. The dispatcher
//! (`rpc::dispatch`) is the only place that maps a `TracedError` onto a
//! JSON-RPC error code.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;

use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum Severity {
    Warning,
    Error,
    Critical,
}

/// One variant per row of the error taxonomy table in spec §4.6, plus the
/// internal "transient store error" kind used for circuit-breaker
/// bookkeeping before it is classified into a JSON-RPC code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub(crate) enum ErrorKind {
    #[error("parse error")]
    ParseError,
    #[error("invalid request")]
    InvalidRequest,
    #[error("method not found")]
    MethodNotFound,
    #[error("invalid params")]
    InvalidParams,
    #[error("internal error")]
    InternalError,
    #[error("container running")]
    ContainerRunning,
    #[error("container stopped")]
    ContainerStopped,
    #[error("key not found")]
    KeyNotFound,
    #[error("pci acknowledgment required")]
    PciAcknowledgmentRequired,
    #[error("queue depth exceeded")]
    DepthExceeded,
    #[error("queue shut down")]
    QueueShutdown,
    #[error("circuit open")]
    CircuitOpen,
    #[error("not found or not inflight")]
    NotFoundOrNotInflight,
    #[error("max retries exceeded")]
    MaxRetriesExceeded,
    #[error("name collision")]
    NameCollision,
    #[error("start failed")]
    StartFailed,
    #[error("container not found")]
    ContainerNotFound,
    #[error("transient store error")]
    StoreTransient,
    #[error("not implemented")]
    NotImplemented,
}

impl ErrorKind {
    /// JSON-RPC error code from spec §4.6.
    pub(crate) fn rpc_code(self) -> i64 {
        match self {
            ErrorKind::ParseError => -32700,
            ErrorKind::InvalidRequest => -32600,
            ErrorKind::MethodNotFound => -32601,
            ErrorKind::InvalidParams => -32602,
            ErrorKind::InternalError
            | ErrorKind::StoreTransient
            | ErrorKind::NotImplemented
            | ErrorKind::DepthExceeded
            | ErrorKind::QueueShutdown
            | ErrorKind::CircuitOpen
            | ErrorKind::NotFoundOrNotInflight
            | ErrorKind::MaxRetriesExceeded
            | ErrorKind::NameCollision
            | ErrorKind::StartFailed
            | ErrorKind::ContainerNotFound => -32603,
            ErrorKind::ContainerRunning => -1,
            ErrorKind::ContainerStopped => -2,
            ErrorKind::KeyNotFound => -3,
            ErrorKind::PciAcknowledgmentRequired => -32099,
        }
    }

    fn category(self) -> &'static str {
        match self {
            ErrorKind::ParseError | ErrorKind::InvalidRequest | ErrorKind::InvalidParams => {
                "protocol"
            }
            ErrorKind::MethodNotFound | ErrorKind::NotImplemented => "routing",
            ErrorKind::ContainerRunning
            | ErrorKind::ContainerStopped
            | ErrorKind::NameCollision
            | ErrorKind::StartFailed
            | ErrorKind::ContainerNotFound => "orchestrator",
            ErrorKind::KeyNotFound | ErrorKind::PciAcknowledgmentRequired => "keystore",
            ErrorKind::DepthExceeded
            | ErrorKind::QueueShutdown
            | ErrorKind::CircuitOpen
            | ErrorKind::NotFoundOrNotInflight
            | ErrorKind::MaxRetriesExceeded
            | ErrorKind::StoreTransient => "queue",
            ErrorKind::InternalError => "internal",
        }
    }
}

/// Ring buffer of recent log lines for a single component, attached to a
/// `TracedError` at construction time as the "recent component-log entries"
/// field the spec requires.
#[derive(Debug, Default)]
pub(crate) struct LogRing {
    lines: Mutex<VecDeque<String>>,
}

impl LogRing {
    const CAPACITY: usize = 32;

    pub(crate) fn push(&self, line: impl Into<String>) {
        let mut lines = self.lines.lock().unwrap_or_else(|p| p.into_inner());
        if lines.len() >= Self::CAPACITY {
            lines.pop_front();
        }
        lines.push_back(line.into());
    }

    fn snapshot(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct TracedError {
    pub(crate) code: i64,
    pub(crate) category: &'static str,
    pub(crate) severity: Severity,
    pub(crate) trace_id: String,
    pub(crate) message: String,
    pub(crate) source_location: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) input_snapshot: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) state_snapshot: Option<Value>,
    pub(crate) recent_log: Vec<String>,
    pub(crate) repeat_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) cause: Option<Box<String>>,
}

impl TracedError {
    #[track_caller]
    pub(crate) fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let location = std::panic::Location::caller();
        TracedError {
            code: kind.rpc_code(),
            category: kind.category(),
            severity: default_severity(kind),
            trace_id: uuid::Uuid::new_v4().to_string(),
            message: message.into(),
            source_location: format!("{}:{}:{}", location.file(), location.line(), location.column()),
            input_snapshot: None,
            state_snapshot: None,
            recent_log: Vec::new(),
            repeat_count: 1,
            cause: None,
        }
    }

    pub(crate) fn with_log(mut self, ring: &LogRing) -> Self {
        self.recent_log = ring.snapshot();
        self
    }

    pub(crate) fn with_input(mut self, value: Value) -> Self {
        self.input_snapshot = Some(value);
        self
    }

    pub(crate) fn with_state(mut self, value: Value) -> Self {
        self.state_snapshot = Some(value);
        self
    }

    pub(crate) fn with_cause(mut self, cause: impl fmt::Display) -> Self {
        self.message = format!("{}: {}", self.message, cause);
        self.cause = Some(Box::new(cause.to_string()));
        self
    }

    pub(crate) fn kind_code(&self) -> i64 {
        self.code
    }
}

fn default_severity(kind: ErrorKind) -> Severity {
    match kind {
        ErrorKind::InternalError | ErrorKind::StartFailed | ErrorKind::StoreTransient => {
            Severity::Critical
        }
        ErrorKind::ParseError
        | ErrorKind::InvalidRequest
        | ErrorKind::InvalidParams
        | ErrorKind::MethodNotFound
        | ErrorKind::NotImplemented => Severity::Warning,
        _ => Severity::Error,
    }
}

impl fmt::Display for TracedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for TracedError {}

impl From<rusqlite::Error> for TracedError {
    #[track_caller]
    fn from(err: rusqlite::Error) -> Self {
        let kind = if is_transient(&err) {
            ErrorKind::StoreTransient
        } else {
            ErrorKind::InternalError
        };
        TracedError::new(kind, "durable store operation failed").with_cause(err)
    }
}

fn is_transient(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::DatabaseBusy
                || e.code == rusqlite::ErrorCode::DatabaseLocked
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_codes_match_taxonomy_table() {
        assert_eq!(ErrorKind::ParseError.rpc_code(), -32700);
        assert_eq!(ErrorKind::InvalidRequest.rpc_code(), -32600);
        assert_eq!(ErrorKind::MethodNotFound.rpc_code(), -32601);
        assert_eq!(ErrorKind::InvalidParams.rpc_code(), -32602);
        assert_eq!(ErrorKind::InternalError.rpc_code(), -32603);
        assert_eq!(ErrorKind::ContainerRunning.rpc_code(), -1);
        assert_eq!(ErrorKind::ContainerStopped.rpc_code(), -2);
        assert_eq!(ErrorKind::KeyNotFound.rpc_code(), -3);
        assert_eq!(ErrorKind::PciAcknowledgmentRequired.rpc_code(), -32099);
    }

    #[test]
    fn with_cause_appends_message() {
        let err = TracedError::new(ErrorKind::InternalError, "boom").with_cause("root cause");
        assert_eq!(err.message, "boom: root cause");
    }

    #[test]
    fn log_ring_caps_at_capacity() {
        let ring = LogRing::default();
        for i in 0..40 {
            ring.push(format!("line {i}"));
        }
        assert_eq!(ring.snapshot().len(), LogRing::CAPACITY);
        assert_eq!(ring.snapshot().first().unwrap(), "line 8");
    }
}
