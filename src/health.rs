//! C10: health & observability. Wraps the queue's raw counts into the
//! three-state `healthy|degraded|unhealthy` string the dispatcher's
//! `health`/`status` results surface, and exposes the Prometheus-text
//! renderer for a `/metrics`-shaped scrape handler.

use serde::Serialize;

use crate::breaker::BreakerState;
use crate::queue::{Queue, QueueHealth};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct HealthSnapshot {
    pub(crate) state: HealthState,
    pub(crate) pending: u64,
    pub(crate) inflight: u64,
    pub(crate) failed: u64,
    pub(crate) breaker_state: &'static str,
    pub(crate) uptime_ms: i64,
}

/// `health` never panics: every input here is a plain count or enum, and
/// the classification below is total over its domain.
pub(crate) fn compute_health(raw: QueueHealth) -> HealthSnapshot {
    let state = if raw.breaker_state == BreakerState::Open {
        HealthState::Unhealthy
    } else if !raw.healthy {
        HealthState::Degraded
    } else {
        HealthState::Healthy
    };
    HealthSnapshot {
        state,
        pending: raw.pending,
        inflight: raw.inflight,
        failed: raw.failed,
        breaker_state: match raw.breaker_state {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        },
        uptime_ms: raw.uptime_ms,
    }
}

pub(crate) fn snapshot(queue: &Queue) -> HealthSnapshot {
    compute_health(queue.health())
}

pub(crate) fn metrics_text(queue: &Queue) -> String {
    queue.metrics_text()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(healthy: bool, breaker: BreakerState) -> QueueHealth {
        QueueHealth {
            healthy,
            pending: 1,
            inflight: 0,
            failed: 0,
            breaker_state: breaker,
            uptime_ms: 1000,
        }
    }

    #[test]
    fn open_breaker_is_unhealthy_even_if_counts_look_fine() {
        let snap = compute_health(raw(true, BreakerState::Open));
        assert_eq!(snap.state, HealthState::Unhealthy);
    }

    #[test]
    fn unhealthy_counts_without_open_breaker_are_degraded() {
        let snap = compute_health(raw(false, BreakerState::Closed));
        assert_eq!(snap.state, HealthState::Degraded);
    }

    #[test]
    fn closed_breaker_with_healthy_counts_is_healthy() {
        let snap = compute_health(raw(true, BreakerState::Closed));
        assert_eq!(snap.state, HealthState::Healthy);
    }
}
