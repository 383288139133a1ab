//! C1: enqueue/dequeue/ack/retry/DLQ counters and a Prometheus-text
//! exposition renderer.
//!
//! Grounded on the teacher's habit of keeping small, mutex-guarded counter
//! structs next to the thing they observe (e.g. `SlackRunState` in
//! `bridges/slack.rs`); here all the counters live in one place since the
//! queue engine is the sole producer of every count the spec names.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

#[derive(Debug, Default)]
struct PlatformCounters {
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    acked: AtomicU64,
    retried: AtomicU64,
    dlq: AtomicU64,
    dlq_reviewed: AtomicU64,
    dlq_retried: AtomicU64,
    dlq_cleared: AtomicU64,
}

/// Histogram bucket upper bounds (seconds) for `sdtw_queue_wait_duration_seconds`.
const WAIT_BUCKETS_SECONDS: [f64; 7] = [0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 10.0];

#[derive(Debug, Default)]
struct WaitHistogram {
    bucket_counts: [AtomicU64; WAIT_BUCKETS_SECONDS.len()],
    sum_millis: AtomicU64,
    count: AtomicU64,
}

impl WaitHistogram {
    /// Increments the single smallest bucket an observation falls into
    /// (or none of the finite buckets, for an observation past the last
    /// bound — it still counts toward `count`/`sum` and the implicit
    /// `+Inf` bucket at render time). `render_prometheus_text` turns these
    /// per-bucket counts into the cumulative counts Prometheus expects.
    fn observe(&self, seconds: f64) {
        for (i, bound) in WAIT_BUCKETS_SECONDS.iter().enumerate() {
            if seconds <= *bound {
                self.bucket_counts[i].fetch_add(1, Ordering::Relaxed);
                break;
            }
        }
        self.sum_millis
            .fetch_add((seconds * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Default)]
pub(crate) struct Metrics {
    by_platform: Mutex<HashMap<String, PlatformCounters>>,
    wait: WaitHistogram,
    batch_size_sum: AtomicU64,
    batch_size_count: AtomicU64,
}

impl Metrics {
    pub(crate) fn new() -> Self {
        Metrics::default()
    }

    fn with_platform<R>(&self, platform: &str, f: impl FnOnce(&PlatformCounters) -> R) -> R {
        let mut guard = self.by_platform.lock();
        let counters = guard.entry(platform.to_string()).or_default();
        f(counters)
    }

    pub(crate) fn record_enqueued(&self, platform: &str) {
        self.with_platform(platform, |c| c.enqueued.fetch_add(1, Ordering::Relaxed));
    }

    pub(crate) fn record_dequeued(&self, platform: &str) {
        self.with_platform(platform, |c| c.dequeued.fetch_add(1, Ordering::Relaxed));
    }

    pub(crate) fn record_acked(&self, platform: &str) {
        self.with_platform(platform, |c| c.acked.fetch_add(1, Ordering::Relaxed));
    }

    pub(crate) fn record_retried(&self, platform: &str) {
        self.with_platform(platform, |c| c.retried.fetch_add(1, Ordering::Relaxed));
    }

    pub(crate) fn record_dlq(&self, platform: &str) {
        self.with_platform(platform, |c| c.dlq.fetch_add(1, Ordering::Relaxed));
    }

    pub(crate) fn record_dlq_reviewed(&self, platform: &str) {
        self.with_platform(platform, |c| c.dlq_reviewed.fetch_add(1, Ordering::Relaxed));
    }

    pub(crate) fn record_dlq_retried(&self, platform: &str) {
        self.with_platform(platform, |c| c.dlq_retried.fetch_add(1, Ordering::Relaxed));
    }

    pub(crate) fn record_dlq_cleared(&self, platform: &str) {
        self.with_platform(platform, |c| c.dlq_cleared.fetch_add(1, Ordering::Relaxed));
    }

    pub(crate) fn record_batch_size(&self, size: usize) {
        self.batch_size_sum.fetch_add(size as u64, Ordering::Relaxed);
        self.batch_size_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn observe_wait(&self, seconds: f64) {
        self.wait.observe(seconds);
    }

    /// Render every counter in Prometheus text-exposition format, using the
    /// exact metric names in spec §6.
    pub(crate) fn render_prometheus_text(&self, pending: u64, inflight: u64, failed: u64) -> String {
        let mut out = String::new();
        let guard = self.by_platform.lock();
        for (platform, c) in guard.iter() {
            out.push_str(&format!(
                "sdtw_queue_enqueued_total{{platform=\"{platform}\"}} {}\n",
                c.enqueued.load(Ordering::Relaxed)
            ));
            out.push_str(&format!(
                "sdtw_queue_dequeued_total{{platform=\"{platform}\"}} {}\n",
                c.dequeued.load(Ordering::Relaxed)
            ));
            out.push_str(&format!(
                "sdtw_queue_acked_total{{platform=\"{platform}\"}} {}\n",
                c.acked.load(Ordering::Relaxed)
            ));
            out.push_str(&format!(
                "sdtw_queue_retried_total{{platform=\"{platform}\"}} {}\n",
                c.retried.load(Ordering::Relaxed)
            ));
            out.push_str(&format!(
                "sdtw_queue_retry_total{{platform=\"{platform}\"}} {}\n",
                c.retried.load(Ordering::Relaxed)
            ));
            out.push_str(&format!(
                "sdtw_queue_dlq_total{{platform=\"{platform}\"}} {}\n",
                c.dlq.load(Ordering::Relaxed)
            ));
            out.push_str(&format!(
                "sdtw_queue_dlq_reviewed_total{{platform=\"{platform}\"}} {}\n",
                c.dlq_reviewed.load(Ordering::Relaxed)
            ));
            out.push_str(&format!(
                "sdtw_queue_dlq_retried_total{{platform=\"{platform}\"}} {}\n",
                c.dlq_retried.load(Ordering::Relaxed)
            ));
            out.push_str(&format!(
                "sdtw_queue_dlq_cleared_total{{platform=\"{platform}\"}} {}\n",
                c.dlq_cleared.load(Ordering::Relaxed)
            ));
        }
        drop(guard);

        out.push_str(&format!("sdtw_queue_depth{{state=\"pending\"}} {pending}\n"));
        out.push_str(&format!("sdtw_queue_depth{{state=\"inflight\"}} {inflight}\n"));
        out.push_str(&format!("sdtw_queue_depth{{state=\"failed\"}} {failed}\n"));
        out.push_str(&format!("sdtw_queue_inflight {inflight}\n"));
        out.push_str(&format!("sdtw_queue_failed {failed}\n"));

        let batch_count = self.batch_size_count.load(Ordering::Relaxed);
        let batch_avg = if batch_count > 0 {
            self.batch_size_sum.load(Ordering::Relaxed) as f64 / batch_count as f64
        } else {
            0.0
        };
        out.push_str(&format!("sdtw_queue_batch_size {batch_avg}\n"));

        let mut cumulative = 0u64;
        for (i, bound) in WAIT_BUCKETS_SECONDS.iter().enumerate() {
            cumulative += self.wait.bucket_counts[i].load(Ordering::Relaxed);
            out.push_str(&format!(
                "sdtw_queue_wait_duration_seconds_bucket{{le=\"{bound}\"}} {cumulative}\n"
            ));
        }
        out.push_str(&format!(
            "sdtw_queue_wait_duration_seconds_bucket{{le=\"+Inf\"}} {}\n",
            self.wait.count.load(Ordering::Relaxed)
        ));
        out.push_str(&format!(
            "sdtw_queue_wait_duration_seconds_sum {}\n",
            self.wait.sum_millis.load(Ordering::Relaxed) as f64 / 1000.0
        ));
        out.push_str(&format!(
            "sdtw_queue_wait_duration_seconds_count {}\n",
            self.wait.count.load(Ordering::Relaxed)
        ));

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment_per_platform() {
        let m = Metrics::new();
        m.record_enqueued("slack");
        m.record_enqueued("slack");
        m.record_enqueued("discord");
        let text = m.render_prometheus_text(0, 0, 0);
        assert!(text.contains("sdtw_queue_enqueued_total{platform=\"slack\"} 2"));
        assert!(text.contains("sdtw_queue_enqueued_total{platform=\"discord\"} 1"));
    }

    #[test]
    fn wait_histogram_buckets_are_cumulative() {
        let m = Metrics::new();
        m.observe_wait(0.001);
        m.observe_wait(2.0);
        let text = m.render_prometheus_text(0, 0, 0);
        assert!(text.contains("sdtw_queue_wait_duration_seconds_bucket{le=\"0.005\"} 1"));
        assert!(text.contains("sdtw_queue_wait_duration_seconds_bucket{le=\"1\"} 1"));
        assert!(text.contains("sdtw_queue_wait_duration_seconds_bucket{le=\"10\"} 2"));
        assert!(text.contains("sdtw_queue_wait_duration_seconds_bucket{le=\"+Inf\"} 2"));
        assert!(text.contains("sdtw_queue_wait_duration_seconds_count 2"));
    }

    #[test]
    fn an_observation_past_the_last_bound_only_counts_in_plus_inf() {
        let m = Metrics::new();
        m.observe_wait(45.0);
        let text = m.render_prometheus_text(0, 0, 0);
        assert!(text.contains("sdtw_queue_wait_duration_seconds_bucket{le=\"0.005\"} 0"));
        assert!(text.contains("sdtw_queue_wait_duration_seconds_bucket{le=\"10\"} 0"));
        assert!(text.contains("sdtw_queue_wait_duration_seconds_bucket{le=\"+Inf\"} 1"));
    }

    #[test]
    fn depth_gauges_reflect_arguments() {
        let m = Metrics::new();
        let text = m.render_prometheus_text(3, 1, 0);
        assert!(text.contains("sdtw_queue_depth{state=\"pending\"} 3"));
        assert!(text.contains("sdtw_queue_inflight 1"));
    }
}
