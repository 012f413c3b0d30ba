//! Exchange metrics for monitoring and observability.
//!
//! Every registry owns one [`ExchangeMetrics`] collector shared by the
//! receivers and events created against it.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of the exchange counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    /// Events posted to a request receiver
    pub posted: u64,

    /// Events whose handler callback ran
    pub handled: u64,

    /// Answers sent back (automatically or manually)
    pub answers_delivered: u64,

    /// Answers consumed by an answer callback or a synchronous caller
    pub answers_received: u64,

    /// Calls to `cancel_request`
    pub cancel_requests: u64,

    /// Events terminated before their handler ran
    pub cancelled_before_handling: u64,

    /// Answer deliveries skipped because the event went synchronous or ended
    pub stale_answers_skipped: u64,

    /// Async events promoted to synchronous
    pub sync_promotions: u64,

    /// Waits that actually had to block
    pub blocking_waits: u64,
}

/// Metrics collector for exchange activity
#[derive(Debug, Default)]
pub struct ExchangeMetrics {
    posted: AtomicU64,
    handled: AtomicU64,
    answers_delivered: AtomicU64,
    answers_received: AtomicU64,
    cancel_requests: AtomicU64,
    cancelled_before_handling: AtomicU64,
    stale_answers_skipped: AtomicU64,
    sync_promotions: AtomicU64,
    blocking_waits: AtomicU64,
}

impl ExchangeMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_post(&self) {
        self.posted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_handled(&self) {
        self.handled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_answer_delivered(&self) {
        self.answers_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_answer_received(&self) {
        self.answers_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cancel_request(&self) {
        self.cancel_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cancelled_before_handling(&self) {
        self.cancelled_before_handling
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_stale_answer(&self) {
        self.stale_answers_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_sync_promotion(&self) {
        self.sync_promotions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_blocking_wait(&self) {
        self.blocking_waits.fetch_add(1, Ordering::Relaxed);
    }

    /// Get posted event count
    pub fn posted(&self) -> u64 {
        self.posted.load(Ordering::Relaxed)
    }

    /// Get handled event count
    pub fn handled(&self) -> u64 {
        self.handled.load(Ordering::Relaxed)
    }

    /// Get number of waits that blocked the calling thread
    pub fn blocking_waits(&self) -> u64 {
        self.blocking_waits.load(Ordering::Relaxed)
    }

    /// Get number of skipped stale answer deliveries
    pub fn stale_answers_skipped(&self) -> u64 {
        self.stale_answers_skipped.load(Ordering::Relaxed)
    }

    /// Take a snapshot of all counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            posted: self.posted(),
            handled: self.handled(),
            answers_delivered: self.answers_delivered.load(Ordering::Relaxed),
            answers_received: self.answers_received.load(Ordering::Relaxed),
            cancel_requests: self.cancel_requests.load(Ordering::Relaxed),
            cancelled_before_handling: self.cancelled_before_handling.load(Ordering::Relaxed),
            stale_answers_skipped: self.stale_answers_skipped(),
            sync_promotions: self.sync_promotions.load(Ordering::Relaxed),
            blocking_waits: self.blocking_waits(),
        }
    }

    /// Export Prometheus-format metrics
    pub fn to_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        let mut output = String::new();

        output.push_str("# HELP nexus_events_total Events by lifecycle stage\n");
        output.push_str("# TYPE nexus_events_total counter\n");
        for (stage, value) in [
            ("posted", snapshot.posted),
            ("handled", snapshot.handled),
            ("answer_delivered", snapshot.answers_delivered),
            ("answer_received", snapshot.answers_received),
            ("cancelled_before_handling", snapshot.cancelled_before_handling),
            ("stale_answer_skipped", snapshot.stale_answers_skipped),
        ] {
            output.push_str(&format!(
                "nexus_events_total{{stage=\"{}\"}} {}\n",
                stage, value
            ));
        }

        output.push_str("\n# HELP nexus_cancel_requests_total Cancellation requests\n");
        output.push_str("# TYPE nexus_cancel_requests_total counter\n");
        output.push_str(&format!(
            "nexus_cancel_requests_total {}\n",
            snapshot.cancel_requests
        ));

        output.push_str("\n# HELP nexus_sync_promotions_total Async events made synchronous\n");
        output.push_str("# TYPE nexus_sync_promotions_total counter\n");
        output.push_str(&format!(
            "nexus_sync_promotions_total {}\n",
            snapshot.sync_promotions
        ));

        output.push_str("\n# HELP nexus_blocking_waits_total Waits that blocked a thread\n");
        output.push_str("# TYPE nexus_blocking_waits_total counter\n");
        output.push_str(&format!(
            "nexus_blocking_waits_total {}\n",
            snapshot.blocking_waits
        ));

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_default() {
        let metrics = ExchangeMetrics::new();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_metrics_counters() {
        let metrics = ExchangeMetrics::new();
        metrics.record_post();
        metrics.record_post();
        metrics.record_handled();
        metrics.record_blocking_wait();
        metrics.record_stale_answer();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.posted, 2);
        assert_eq!(snapshot.handled, 1);
        assert_eq!(snapshot.blocking_waits, 1);
        assert_eq!(snapshot.stale_answers_skipped, 1);
        assert_eq!(snapshot.answers_received, 0);
    }

    #[test]
    fn test_snapshot_serialization() {
        let metrics = ExchangeMetrics::new();
        metrics.record_sync_promotion();
        let json = serde_json::to_string(&metrics.snapshot()).unwrap();
        assert!(json.contains("\"syncPromotions\":1"));
    }

    #[test]
    fn test_prometheus_output() {
        let metrics = ExchangeMetrics::new();
        metrics.record_post();
        metrics.record_cancel_request();

        let output = metrics.to_prometheus();
        assert!(output.contains("nexus_events_total{stage=\"posted\"} 1"));
        assert!(output.contains("nexus_cancel_requests_total 1"));
        assert!(output.contains("nexus_blocking_waits_total 0"));
    }
}
