//! C4: queue engine public operations (§4.3).
//!
//! Every operation pre-checks the shutdown guard and the circuit breaker,
//! then talks to the durable store (§4.1), recording a breaker
//! success/failure and a metric on the way out. None of these panic on
//! expected error kinds; all return a `TracedError`.

use std::sync::atomic::{AtomicBool, Ordering};

use rand::Rng;

use crate::breaker::CircuitBreaker;
use crate::error::{ErrorKind, TracedError};
use crate::metrics::Metrics;
use crate::store::{Message, MessageStatus, MessageStore, StatusCounts};
use crate::util::now_ms;

pub(crate) struct QueueConfig {
    pub(crate) default_priority: i32,
    pub(crate) default_max_attempts: u32,
    pub(crate) max_queue_depth: u64,
    pub(crate) batch_max_size: u32,
    pub(crate) retry_base_delay_ms: u64,
    pub(crate) retry_max_delay_ms: u64,
}

#[derive(Debug)]
pub(crate) struct EnqueueResult {
    pub(crate) id: String,
    pub(crate) queued_at: i64,
    pub(crate) position: u64,
    pub(crate) depth: u64,
}

pub(crate) struct DequeueResult {
    pub(crate) message: Option<Message>,
    pub(crate) found: bool,
    pub(crate) depth: u64,
}

#[derive(Debug, Clone)]
pub(crate) struct QueueHealth {
    pub(crate) healthy: bool,
    pub(crate) pending: u64,
    pub(crate) inflight: u64,
    pub(crate) failed: u64,
    pub(crate) breaker_state: crate::breaker::BreakerState,
    pub(crate) uptime_ms: i64,
}

pub(crate) struct Queue {
    store: MessageStore,
    breaker: CircuitBreaker,
    metrics: Metrics,
    config: QueueConfig,
    shutdown: AtomicBool,
    started_at: i64,
    inflight_capacity: u64,
}

impl Queue {
    pub(crate) fn new(
        store: MessageStore,
        breaker: CircuitBreaker,
        metrics: Metrics,
        config: QueueConfig,
        inflight_capacity: u64,
    ) -> Self {
        Queue {
            store,
            breaker,
            metrics,
            config,
            shutdown: AtomicBool::new(false),
            started_at: now_ms(),
            inflight_capacity,
        }
    }

    pub(crate) fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub(crate) fn breaker_snapshot(&self) -> crate::breaker::CircuitBreakerSnapshot {
        self.breaker.snapshot()
    }

    /// Stop accepting new Enqueue/Dequeue calls. In-flight transactions are
    /// left to complete on their own (they hold the store's mutex for the
    /// duration of their transaction, so there is nothing further to wait
    /// on here beyond the spec's 100ms grace period, applied by the caller
    /// in `main.rs`).
    pub(crate) fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    fn check_shutdown(&self) -> Result<(), TracedError> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(TracedError::new(ErrorKind::QueueShutdown, "queue is shut down"));
        }
        Ok(())
    }

    fn check_breaker(&self) -> Result<(), TracedError> {
        self.breaker.can_proceed(&self.store)
    }

    pub(crate) fn enqueue(&self, mut msg: Message) -> Result<EnqueueResult, TracedError> {
        self.check_shutdown()?;
        self.check_breaker()?;

        if msg.id.trim().is_empty() {
            return Err(TracedError::new(ErrorKind::InvalidParams, "message id must not be empty"));
        }
        if msg.created_at == 0 {
            msg.created_at = now_ms();
        }
        if msg.priority == 0 {
            msg.priority = self.config.default_priority;
        }
        if msg.max_attempts == 0 {
            msg.max_attempts = self.config.default_max_attempts;
        }
        msg.status = MessageStatus::Pending;

        let pending_before = match self.store.pending_count() {
            Ok(n) => n,
            Err(e) => {
                self.breaker.record_failure(&self.store);
                return Err(e);
            }
        };
        if pending_before >= self.config.max_queue_depth {
            return Err(TracedError::new(ErrorKind::DepthExceeded, "queue depth exceeded"));
        }

        match self.store.insert(&msg) {
            Ok(()) => {
                self.breaker.record_success(&self.store);
                self.metrics.record_enqueued(&msg.platform);
                Ok(EnqueueResult {
                    id: msg.id,
                    queued_at: msg.created_at,
                    position: pending_before,
                    depth: pending_before + 1,
                })
            }
            Err(e) => {
                self.breaker.record_failure(&self.store);
                Err(e)
            }
        }
    }

    pub(crate) fn dequeue(&self) -> Result<DequeueResult, TracedError> {
        self.check_shutdown()?;
        self.check_breaker()?;
        let now = now_ms();
        match self.store.dequeue_one(now) {
            Ok(Some(msg)) => {
                self.breaker.record_success(&self.store);
                self.metrics.record_dequeued(&msg.platform);
                self.metrics.observe_wait(wait_seconds(msg.created_at, now));
                let depth = self.store.pending_count().unwrap_or(0);
                Ok(DequeueResult {
                    message: Some(msg),
                    found: true,
                    depth,
                })
            }
            Ok(None) => {
                self.breaker.record_success(&self.store);
                Ok(DequeueResult {
                    message: None,
                    found: false,
                    depth: 0,
                })
            }
            Err(e) => {
                self.breaker.record_failure(&self.store);
                Err(e)
            }
        }
    }

    pub(crate) fn dequeue_batch(&self, n: i64) -> Result<Vec<Message>, TracedError> {
        self.check_shutdown()?;
        self.check_breaker()?;
        let limit = if n <= 0 {
            10
        } else {
            (n as u32).min(self.config.batch_max_size)
        };
        let now = now_ms();
        match self.store.dequeue_batch(now, limit) {
            Ok(batch) => {
                self.breaker.record_success(&self.store);
                self.metrics.record_batch_size(batch.len());
                for msg in &batch {
                    self.metrics.record_dequeued(&msg.platform);
                    self.metrics.observe_wait(wait_seconds(msg.created_at, now));
                }
                Ok(batch)
            }
            Err(e) => {
                self.breaker.record_failure(&self.store);
                Err(e)
            }
        }
    }

    pub(crate) fn ack(&self, id: &str) -> Result<(), TracedError> {
        self.check_shutdown()?;
        self.check_breaker()?;
        let platform = self.store.get(id).map(|m| m.platform);
        match self.store.ack(id) {
            Ok(true) => {
                self.breaker.record_success(&self.store);
                if let Some(platform) = platform {
                    self.metrics.record_acked(&platform);
                }
                Ok(())
            }
            Ok(false) => Err(TracedError::new(
                ErrorKind::NotFoundOrNotInflight,
                format!("message {id} not found or not inflight"),
            )),
            Err(e) => {
                self.breaker.record_failure(&self.store);
                Err(e)
            }
        }
    }

    pub(crate) fn nack(&self, id: &str, reason: &str) -> Result<(), TracedError> {
        self.check_shutdown()?;
        self.check_breaker()?;

        let msg = self.store.get(id).ok_or_else(|| {
            TracedError::new(ErrorKind::NotFoundOrNotInflight, format!("message {id} not found"))
        })?;
        if msg.status != MessageStatus::Inflight {
            return Err(TracedError::new(
                ErrorKind::NotFoundOrNotInflight,
                format!("message {id} is not inflight"),
            ));
        }

        let attempts = msg.attempts + 1;
        let result = if attempts >= msg.max_attempts {
            self.store.apply_nack(id, attempts, MessageStatus::Failed, None, reason)
        } else {
            let delay_ms = retry_delay_ms(
                attempts,
                self.config.retry_base_delay_ms,
                self.config.retry_max_delay_ms,
            );
            let next_retry = now_ms() + delay_ms as i64;
            self.store
                .apply_nack(id, attempts, MessageStatus::Pending, Some(next_retry), reason)
        };

        match result {
            Ok(true) => {
                self.breaker.record_success(&self.store);
                if attempts >= msg.max_attempts {
                    self.metrics.record_dlq(&msg.platform);
                    Err(TracedError::new(
                        ErrorKind::MaxRetriesExceeded,
                        format!("message {id} exceeded max attempts"),
                    ))
                } else {
                    self.metrics.record_retried(&msg.platform);
                    Ok(())
                }
            }
            Ok(false) => Err(TracedError::new(
                ErrorKind::NotFoundOrNotInflight,
                format!("message {id} not found or not inflight"),
            )),
            Err(e) => {
                self.breaker.record_failure(&self.store);
                Err(e)
            }
        }
    }

    /// Failed messages, oldest first — the read-only half of "messages
    /// remain queryable for operator review" (spec §4.1 edge cases).
    /// Library-only: per spec §6 the queue has no public RPC surface.
    pub(crate) fn list_dlq(&self) -> Result<Vec<Message>, TracedError> {
        let messages = self.store.list_failed()?;
        for msg in &messages {
            self.metrics.record_dlq_reviewed(&msg.platform);
        }
        Ok(messages)
    }

    /// Explicit DLQ revival (§4.1: "`failed` ... terminal until explicit
    /// DLQ revival"): moves a failed row back to pending with a clean
    /// attempt counter.
    pub(crate) fn retry_dlq(&self, id: &str) -> Result<(), TracedError> {
        self.check_shutdown()?;
        self.check_breaker()?;
        let msg = self
            .store
            .get(id)
            .ok_or_else(|| TracedError::new(ErrorKind::NotFoundOrNotInflight, format!("message {id} not found")))?;
        match self.store.revive_failed(id) {
            Ok(true) => {
                self.breaker.record_success(&self.store);
                self.metrics.record_dlq_retried(&msg.platform);
                Ok(())
            }
            Ok(false) => Err(TracedError::new(
                ErrorKind::NotFoundOrNotInflight,
                format!("message {id} is not in the dead-letter queue"),
            )),
            Err(e) => {
                self.breaker.record_failure(&self.store);
                Err(e)
            }
        }
    }

    /// Operator-confirmed permanent removal of a dead-lettered message.
    pub(crate) fn clear_dlq(&self, id: &str) -> Result<(), TracedError> {
        self.check_shutdown()?;
        self.check_breaker()?;
        let msg = self
            .store
            .get(id)
            .ok_or_else(|| TracedError::new(ErrorKind::NotFoundOrNotInflight, format!("message {id} not found")))?;
        match self.store.delete_failed(id) {
            Ok(true) => {
                self.breaker.record_success(&self.store);
                self.metrics.record_dlq_cleared(&msg.platform);
                Ok(())
            }
            Ok(false) => Err(TracedError::new(
                ErrorKind::NotFoundOrNotInflight,
                format!("message {id} is not in the dead-letter queue"),
            )),
            Err(e) => {
                self.breaker.record_failure(&self.store);
                Err(e)
            }
        }
    }

    pub(crate) fn process_retry_queue(&self) -> Result<u64, TracedError> {
        self.store.sweep_retry_ready(now_ms())
    }

    pub(crate) fn cleanup_expired(&self) -> Result<u64, TracedError> {
        self.store.delete_expired(now_ms())
    }

    pub(crate) fn stats(&self) -> Result<StatusCounts, TracedError> {
        self.store.count_by_status()
    }

    /// Composes pending/inflight/failed counts, breaker state, and uptime.
    /// "Healthy" means breaker != open, inflight < connection-pool size,
    /// and failed messages are under a floor-adjusted 10% threshold (spec
    /// §9 Open Question, resolved in `SPEC_FULL.md`).
    pub(crate) fn health(&self) -> QueueHealth {
        let counts = self.store.count_by_status().unwrap_or_default();
        let breaker = self.breaker.snapshot();
        let total = counts.pending + counts.inflight + counts.failed + counts.acked;
        let failed_floor = (total / 10).max(5);
        let healthy = breaker.state != crate::breaker::BreakerState::Open
            && counts.inflight < self.inflight_capacity
            && counts.failed < failed_floor;
        QueueHealth {
            healthy,
            pending: counts.pending,
            inflight: counts.inflight,
            failed: counts.failed,
            breaker_state: breaker.state,
            uptime_ms: now_ms() - self.started_at,
        }
    }

    pub(crate) fn metrics_text(&self) -> String {
        let counts = self.store.count_by_status().unwrap_or_default();
        self.metrics
            .render_prometheus_text(counts.pending, counts.inflight, counts.failed)
    }
}

/// Seconds a message sat pending before being dequeued, for the
/// `sdtw_queue_wait_duration_seconds` histogram. Clamped to zero since
/// clock skew or a same-millisecond dequeue must never go negative.
fn wait_seconds(created_at: i64, dequeued_at: i64) -> f64 {
    (dequeued_at - created_at).max(0) as f64 / 1000.0
}

/// Retry-delay formula from spec §4.3:
/// `raw = min(base * 2^(attempts-1), cap)`, jittered by uniform ±10%.
pub(crate) fn retry_delay_ms(attempts: u32, base_ms: u64, cap_ms: u64) -> u64 {
    let exp = attempts.saturating_sub(1).min(62);
    let raw = base_ms.saturating_mul(1u64 << exp).min(cap_ms);
    let jitter_range = (raw as f64) * 0.10;
    let jitter = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
    (raw as f64 + jitter).max(0.0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Attachment, MessageType};

    fn sample(id: &str, priority: i32) -> Message {
        Message {
            id: id.to_string(),
            platform: "slack".to_string(),
            target_room: "general".to_string(),
            target_channel: "C1".to_string(),
            kind: MessageType::Text,
            content: "hi".to_string(),
            attachments: Vec::<Attachment>::new(),
            reply_to: None,
            metadata: Default::default(),
            signature: "sig".to_string(),
            priority,
            attempts: 0,
            max_attempts: 3,
            created_at: 0,
            next_retry: None,
            last_attempt: None,
            error_message: None,
            status: MessageStatus::Pending,
            expires_at: None,
        }
    }

    fn make_queue(max_depth: u64) -> (tempfile::TempDir, Queue) {
        let dir = tempfile::tempdir().unwrap();
        let store = MessageStore::open_or_create(&dir.path().join("bridge.db")).unwrap();
        let breaker = CircuitBreaker::load(&store, 5, 60_000, 3);
        let config = QueueConfig {
            default_priority: 5,
            default_max_attempts: 3,
            max_queue_depth: max_depth,
            batch_max_size: 10,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 300_000,
        };
        (dir, Queue::new(store, breaker, Metrics::new(), config, 10))
    }

    #[test]
    fn retry_delay_is_within_jitter_bounds() {
        for attempt in 1..6 {
            let raw = 1_000u64.saturating_mul(1u64 << (attempt - 1)).min(300_000);
            for _ in 0..50 {
                let delay = retry_delay_ms(attempt, 1_000, 300_000);
                assert!(delay as f64 >= raw as f64 * 0.9 - 1.0);
                assert!(delay as f64 <= raw as f64 * 1.1 + 1.0);
            }
        }
    }

    #[test]
    fn depth_exceeded_rejects_nth_plus_one_enqueue() {
        let (_dir, q) = make_queue(2);
        q.enqueue(sample("a", 5)).unwrap();
        q.enqueue(sample("b", 5)).unwrap();
        let err = q.enqueue(sample("c", 5)).unwrap_err();
        assert_eq!(err.kind_code(), ErrorKind::DepthExceeded.rpc_code());
        assert_eq!(q.stats().unwrap().pending, 2);
    }

    #[test]
    fn empty_dequeue_reports_not_found() {
        let (_dir, q) = make_queue(10);
        let result = q.dequeue().unwrap();
        assert!(!result.found);
        assert_eq!(result.depth, 0);
    }

    #[test]
    fn nack_reschedules_then_fails_on_final_attempt() {
        let (_dir, q) = make_queue(10);
        q.enqueue(sample("m", 5)).unwrap();
        q.dequeue().unwrap();
        q.nack("m", "net").unwrap();
        let msg = q.stats().unwrap();
        assert_eq!(msg.pending, 1);

        q.dequeue().unwrap();
        q.nack("m", "net").unwrap();
        assert_eq!(q.stats().unwrap().pending, 1);

        q.dequeue().unwrap();
        let err = q.nack("m", "net").unwrap_err();
        assert_eq!(err.kind_code(), ErrorKind::MaxRetriesExceeded.rpc_code());
        assert_eq!(q.stats().unwrap().failed, 1);
    }

    #[test]
    fn shutdown_rejects_new_calls() {
        let (_dir, q) = make_queue(10);
        q.shutdown();
        let err = q.enqueue(sample("a", 5)).unwrap_err();
        assert_eq!(err.kind_code(), ErrorKind::QueueShutdown.rpc_code());
    }

    #[test]
    fn breaker_opens_after_threshold_and_blocks_enqueue() {
        let dir = tempfile::tempdir().unwrap();
        let store = MessageStore::open_or_create(&dir.path().join("bridge.db")).unwrap();
        let breaker = CircuitBreaker::load(&store, 3, 10_000, 3);
        // Simulate repeated failures directly against the breaker, as a
        // fault-injected store error would in production.
        breaker.record_failure(&store);
        breaker.record_failure(&store);
        breaker.record_failure(&store);
        let config = QueueConfig {
            default_priority: 5,
            default_max_attempts: 3,
            max_queue_depth: 10,
            batch_max_size: 10,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 300_000,
        };
        let q = Queue::new(store, breaker, Metrics::new(), config, 10);
        let err = q.enqueue(sample("a", 5)).unwrap_err();
        assert_eq!(err.kind_code(), ErrorKind::CircuitOpen.rpc_code());
    }

    #[test]
    fn single_producer_fifo_scenario() {
        let (_dir, q) = make_queue(10);
        q.enqueue(sample("a", 5)).unwrap();
        q.enqueue(sample("b", 5)).unwrap();
        q.enqueue(sample("c", 5)).unwrap();
        assert_eq!(q.dequeue().unwrap().message.unwrap().id, "a");
        assert_eq!(q.dequeue().unwrap().message.unwrap().id, "b");
        assert_eq!(q.dequeue().unwrap().message.unwrap().id, "c");
        q.ack("a").unwrap();
        q.ack("b").unwrap();
        q.ack("c").unwrap();
        let stats = q.stats().unwrap();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.inflight, 0);
        assert_eq!(stats.acked, 3);
    }

    #[test]
    fn priority_overrides_age_scenario() {
        let (_dir, q) = make_queue(10);
        q.enqueue(sample("low", 1)).unwrap();
        q.enqueue(sample("high", 9)).unwrap();
        assert_eq!(q.dequeue().unwrap().message.unwrap().id, "high");
        assert_eq!(q.dequeue().unwrap().message.unwrap().id, "low");
    }

    #[test]
    fn dequeue_observes_wait_histogram() {
        let (_dir, q) = make_queue(10);
        q.enqueue(sample("a", 5)).unwrap();
        q.dequeue().unwrap();
        let text = q.metrics_text();
        assert!(text.contains("sdtw_queue_wait_duration_seconds_count 1"));
    }

    #[test]
    fn dlq_review_retry_and_clear_round_trip() {
        let (_dir, q) = make_queue(10);
        q.enqueue(sample("m", 5)).unwrap();
        q.dequeue().unwrap();
        q.nack("m", "net").unwrap();
        q.dequeue().unwrap();
        q.nack("m", "net").unwrap();
        q.dequeue().unwrap();
        q.nack("m", "net").unwrap_err();
        assert_eq!(q.stats().unwrap().failed, 1);

        let dlq = q.list_dlq().unwrap();
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].id, "m");
        assert!(q.metrics_text().contains("sdtw_queue_dlq_reviewed_total{platform=\"slack\"} 1"));

        q.retry_dlq("m").unwrap();
        assert_eq!(q.stats().unwrap().pending, 1);
        assert_eq!(q.list_dlq().unwrap().len(), 0);
        assert!(q.metrics_text().contains("sdtw_queue_dlq_retried_total{platform=\"slack\"} 1"));

        q.dequeue().unwrap();
        q.nack("m", "net").unwrap();
        q.dequeue().unwrap();
        q.nack("m", "net").unwrap();
        q.dequeue().unwrap();
        q.nack("m", "net").unwrap_err();
        q.clear_dlq("m").unwrap();
        assert!(q.list_dlq().unwrap().is_empty());
        assert!(q.metrics_text().contains("sdtw_queue_dlq_cleared_total{platform=\"slack\"} 1"));

        let err = q.retry_dlq("nonexistent").unwrap_err();
        assert_eq!(err.kind_code(), ErrorKind::NotFoundOrNotInflight.rpc_code());
    }

    #[test]
    fn crash_leaves_message_inflight_and_requeue_recovers_it() {
        let (_dir, q) = make_queue(10);
        q.enqueue(sample("m", 5)).unwrap();
        q.dequeue().unwrap();
        let stats = q.stats().unwrap();
        assert_eq!(stats.inflight, 1);
        // simulate an operator-triggered requeue: nack without counting it
        // as a real attempt failure is out of scope here, but a normal nack
        // demonstrates the message is never lost.
        q.nack("m", "operator requeue").unwrap();
        assert_eq!(q.dequeue().unwrap().message.unwrap().id, "m");
    }
}
