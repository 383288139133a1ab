//! C2: three-state circuit breaker with a persisted snapshot (§4.2).
//!
//! The snapshot lives in `queue_meta` under key `circuit_breaker_state` and
//! is reloaded on startup, so a restart mid-"open" honours the remainder of
//! the cool-down. A single read/write lock guards the in-memory state,
//! matching the spec's "its own read/write lock; snapshot reads must not
//! block writes to the message store" requirement — the lock here is
//! disjoint from the store's connection mutex (see `store.rs`).

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, TracedError};
use crate::store::MessageStore;
use crate::util::now_ms;

const META_KEY: &str = "circuit_breaker_state";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct CircuitBreakerSnapshot {
    pub(crate) state: BreakerState,
    pub(crate) consecutive_errors: u32,
    pub(crate) open_until: i64,
    pub(crate) last_failure_time: i64,
    pub(crate) last_state_change: i64,
    pub(crate) half_open_attempts: u32,
}

impl Default for CircuitBreakerSnapshot {
    fn default() -> Self {
        CircuitBreakerSnapshot {
            state: BreakerState::Closed,
            consecutive_errors: 0,
            open_until: 0,
            last_failure_time: 0,
            last_state_change: now_ms(),
            half_open_attempts: 0,
        }
    }
}

pub(crate) struct CircuitBreaker {
    threshold: u32,
    timeout_ms: i64,
    half_open_success_required: u32,
    snapshot: RwLock<CircuitBreakerSnapshot>,
}

impl CircuitBreaker {
    /// Reload the persisted snapshot from `queue_meta`, defaulting to
    /// closed if absent or unparseable, per spec §4.2.
    pub(crate) fn load(
        store: &MessageStore,
        threshold: u32,
        timeout_ms: i64,
        half_open_success_required: u32,
    ) -> Self {
        let snapshot = store
            .config_get(META_KEY)
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default();
        CircuitBreaker {
            threshold,
            timeout_ms,
            half_open_success_required,
            snapshot: RwLock::new(snapshot),
        }
    }

    pub(crate) fn snapshot(&self) -> CircuitBreakerSnapshot {
        self.snapshot.read().clone()
    }

    fn persist(&self, store: &MessageStore, snap: &CircuitBreakerSnapshot) {
        if let Ok(bytes) = serde_json::to_vec(snap) {
            if let Err(e) = store.config_set(META_KEY, &bytes) {
                tracing::warn!(error = %e, "failed to persist circuit breaker snapshot");
            }
        }
    }

    /// Admit a request if the breaker is closed, or transition open→half_open
    /// and admit a single probe once `open_until` has passed.
    pub(crate) fn can_proceed(&self, store: &MessageStore) -> Result<(), TracedError> {
        let mut snap = self.snapshot.write();
        match snap.state {
            BreakerState::Closed => Ok(()),
            BreakerState::HalfOpen => Ok(()),
            BreakerState::Open => {
                let now = now_ms();
                if now >= snap.open_until {
                    snap.state = BreakerState::HalfOpen;
                    snap.half_open_attempts = 0;
                    snap.last_state_change = now;
                    self.persist(store, &snap);
                    Ok(())
                } else {
                    Err(TracedError::new(ErrorKind::CircuitOpen, "circuit breaker is open"))
                }
            }
        }
    }

    pub(crate) fn record_success(&self, store: &MessageStore) {
        let mut snap = self.snapshot.write();
        match snap.state {
            BreakerState::Closed => {
                snap.consecutive_errors = 0;
            }
            BreakerState::HalfOpen => {
                snap.half_open_attempts += 1;
                if snap.half_open_attempts >= self.half_open_success_required {
                    snap.state = BreakerState::Closed;
                    snap.consecutive_errors = 0;
                    snap.last_state_change = now_ms();
                }
            }
            BreakerState::Open => {}
        }
        self.persist(store, &snap);
    }

    pub(crate) fn record_failure(&self, store: &MessageStore) {
        let mut snap = self.snapshot.write();
        let now = now_ms();
        snap.last_failure_time = now;
        match snap.state {
            BreakerState::Closed => {
                snap.consecutive_errors += 1;
                if snap.consecutive_errors >= self.threshold {
                    snap.state = BreakerState::Open;
                    snap.open_until = now + self.timeout_ms;
                    snap.last_state_change = now;
                }
            }
            BreakerState::HalfOpen => {
                snap.state = BreakerState::Open;
                snap.open_until = now + self.timeout_ms;
                snap.last_state_change = now;
            }
            BreakerState::Open => {}
        }
        self.persist(store, &snap);
    }
}
