//! Metrics for the consumption pipeline.
//!
//! Prometheus-compatible counters and histograms:
//!
//! - `nsq_messages_sent_count{topic}` - messages acknowledged by the broker
//! - `nsq_messages_retry_count{topic}` - recovery messages republished
//! - `nsq_received_messages{topic, channel, status, event}` - handler
//!   latency in milliseconds, labelled by invocation status

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::OnceLock;

use crate::error::WorkerError;

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metric names as constants for consistency
pub mod names {
    pub const MESSAGES_SENT: &str = "nsq_messages_sent_count";
    pub const MESSAGES_RETRY: &str = "nsq_messages_retry_count";
    pub const RECEIVED_MESSAGES: &str = "nsq_received_messages";
}

/// Terminal status of one handler invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerStatus {
    Ok,
    Failed,
    Resent,
}

impl HandlerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Failed => "FAILED",
            Self::Resent => "RESENT",
        }
    }
}

/// Install the Prometheus recorder without an HTTP listener.
///
/// Call once at startup; `handle.render()` yields the text exposition.
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .expect("Failed to install Prometheus recorder")
        })
        .clone()
}

/// Install the Prometheus recorder together with a scrape endpoint on
/// `addr`. Call once at startup, inside a Tokio runtime. Use either this or
/// [`init_metrics`], not both.
pub fn serve_metrics(addr: SocketAddr) -> Result<(), WorkerError> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| WorkerError::Config(format!("failed to start metrics listener: {e}")))
}

/// Record a broker-acknowledged publish.
pub fn record_message_sent(topic: &str) {
    counter!(names::MESSAGES_SENT, "topic" => topic.to_string()).increment(1);
}

/// Record a recovery-message republish.
pub fn record_message_retry(topic: &str) {
    counter!(names::MESSAGES_RETRY, "topic" => topic.to_string()).increment(1);
}

/// Record one handler invocation with its latency in milliseconds.
pub fn record_received(
    topic: &str,
    channel: &str,
    status: HandlerStatus,
    event: &str,
    elapsed_ms: f64,
) {
    histogram!(
        names::RECEIVED_MESSAGES,
        "topic" => topic.to_string(),
        "channel" => channel.to_string(),
        "status" => status.as_str().to_string(),
        "event" => event.to_string()
    )
    .record(elapsed_ms);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_status_as_str() {
        assert_eq!(HandlerStatus::Ok.as_str(), "OK");
        assert_eq!(HandlerStatus::Failed.as_str(), "FAILED");
        assert_eq!(HandlerStatus::Resent.as_str(), "RESENT");
    }

    #[test]
    fn test_record_without_recorder_is_noop() {
        // The metrics facade drops records when no recorder is installed
        record_message_sent("events");
        record_message_retry("events");
        record_received("events", "mailer", HandlerStatus::Ok, "ping", 1.5);
    }
}
