//! Metrics for the rabbit-amazon bridge
//!
//! Recorded through the `metrics` facade; whichever recorder the host process
//! installs receives them.

use metrics::{counter, histogram};
use std::time::{Duration, Instant};

/// Metric names as constants for consistency
pub mod names {
    // Forward direction
    pub const FORWARDER_RECEIVED_TOTAL: &str = "bridge_forwarder_received_total";
    pub const FORWARDER_FORWARDED_TOTAL: &str = "bridge_forwarder_forwarded_total";
    pub const FORWARDER_RETRIED_TOTAL: &str = "bridge_forwarder_retried_total";
    pub const FORWARDER_DEAD_LETTERED_TOTAL: &str = "bridge_forwarder_dead_lettered_total";
    pub const FORWARDER_SETTLE_FAILED_TOTAL: &str = "bridge_forwarder_settle_failed_total";
    pub const FORWARDER_SEND_LATENCY: &str = "bridge_forwarder_send_latency_seconds";

    // Reverse direction
    pub const POLLER_RECEIVED_TOTAL: &str = "bridge_poller_received_total";
    pub const POLLER_FORWARDED_TOTAL: &str = "bridge_poller_forwarded_total";
    pub const POLLER_FAILED_TOTAL: &str = "bridge_poller_failed_total";
    pub const POLLER_RUN_DURATION: &str = "bridge_poller_run_duration_seconds";
}

/// Labels for metrics
pub mod labels {
    pub const LISTENER: &str = "listener";
    pub const QUEUE: &str = "queue";
    pub const DESTINATION: &str = "destination";
    pub const ERROR_TYPE: &str = "error_type";
}

/// Forward direction metrics
#[derive(Clone)]
pub struct ForwarderMetrics {
    listener: String,
}

impl ForwarderMetrics {
    pub fn new(listener: impl Into<String>) -> Self {
        Self {
            listener: listener.into(),
        }
    }

    /// Record a delivery taken from rabbit
    pub fn record_received(&self) {
        counter!(
            names::FORWARDER_RECEIVED_TOTAL,
            labels::LISTENER => self.listener.clone(),
        )
        .increment(1);
    }

    /// Record a message handed to SNS/SQS
    pub fn record_forwarded(&self, destination: &str) {
        counter!(
            names::FORWARDER_FORWARDED_TOTAL,
            labels::LISTENER => self.listener.clone(),
            labels::DESTINATION => destination.to_string(),
        )
        .increment(1);
    }

    /// Record a retry attempt
    pub fn record_retry(&self) {
        counter!(
            names::FORWARDER_RETRIED_TOTAL,
            labels::LISTENER => self.listener.clone(),
        )
        .increment(1);
    }

    /// Record a delivery routed to the dead-letter queue
    pub fn record_dead_lettered(&self, error_type: &str) {
        counter!(
            names::FORWARDER_DEAD_LETTERED_TOTAL,
            labels::LISTENER => self.listener.clone(),
            labels::ERROR_TYPE => error_type.to_string(),
        )
        .increment(1);
    }

    /// Record an ack or reject the broker refused
    pub fn record_settle_failed(&self, error_type: &str) {
        counter!(
            names::FORWARDER_SETTLE_FAILED_TOTAL,
            labels::LISTENER => self.listener.clone(),
            labels::ERROR_TYPE => error_type.to_string(),
        )
        .increment(1);
    }

    /// Record transform plus send latency
    pub fn record_send_latency(&self, duration: Duration) {
        histogram!(
            names::FORWARDER_SEND_LATENCY,
            labels::LISTENER => self.listener.clone(),
        )
        .record(duration.as_secs_f64());
    }
}

/// Reverse direction metrics
#[derive(Clone)]
pub struct PollerMetrics {
    queue: String,
}

impl PollerMetrics {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
        }
    }

    /// Record a received batch
    pub fn record_received(&self, count: usize) {
        counter!(
            names::POLLER_RECEIVED_TOTAL,
            labels::QUEUE => self.queue.clone(),
        )
        .increment(count as u64);
    }

    /// Record a message sent to rabbit and deleted
    pub fn record_forwarded(&self) {
        counter!(
            names::POLLER_FORWARDED_TOTAL,
            labels::QUEUE => self.queue.clone(),
        )
        .increment(1);
    }

    /// Record a message returned to the queue
    pub fn record_failed(&self, error_type: &str) {
        counter!(
            names::POLLER_FAILED_TOTAL,
            labels::QUEUE => self.queue.clone(),
            labels::ERROR_TYPE => error_type.to_string(),
        )
        .increment(1);
    }

    /// Record how long one run took
    pub fn record_run_duration(&self, duration: Duration) {
        histogram!(
            names::POLLER_RUN_DURATION,
            labels::QUEUE => self.queue.clone(),
        )
        .record(duration.as_secs_f64());
    }
}

/// Short error label used by `error_type`
pub fn error_type(error: &crate::error::BridgeError) -> &'static str {
    use crate::error::BridgeError;
    match error {
        BridgeError::ConfigParse { .. } => "config_parse",
        BridgeError::Configuration { .. } => "configuration",
        BridgeError::Spec { .. } => "spec",
        BridgeError::Transform { .. } => "transform",
        BridgeError::Amazon { .. } => "amazon",
        BridgeError::Messaging { .. } => "messaging",
        BridgeError::Rabbit { .. } => "rabbit",
        BridgeError::RejectAndDontRequeue(inner) => error_type(inner),
        BridgeError::Shutdown => "shutdown",
        BridgeError::Internal(_) => "internal",
    }
}

/// Timer guard for automatic latency recording
pub struct LatencyTimer<F>
where
    F: FnOnce(Duration),
{
    start: Instant,
    on_drop: Option<F>,
}

impl<F> LatencyTimer<F>
where
    F: FnOnce(Duration),
{
    /// Start a new timer
    pub fn start(on_drop: F) -> Self {
        Self {
            start: Instant::now(),
            on_drop: Some(on_drop),
        }
    }

    /// Stop timer and record
    pub fn stop(mut self) -> Duration {
        let elapsed = self.start.elapsed();
        if let Some(f) = self.on_drop.take() {
            f(elapsed);
        }
        elapsed
    }
}

impl<F> Drop for LatencyTimer<F>
where
    F: FnOnce(Duration),
{
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f(self.start.elapsed());
        }
    }
}
