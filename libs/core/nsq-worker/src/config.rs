//! Worker configuration
//!
//! This module provides `WorkerConfig` for configuring the NSQ worker.

use std::time::Duration;

/// Configuration for one (topic, channel) subscription.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Topic to subscribe to
    pub topic: String,

    /// Channel to subscribe on
    pub channel: String,

    /// Service name, used in lock keys and startup logs
    pub service_name: String,

    /// Size of the handler pool
    pub concurrency: usize,

    /// Broker credits; never effectively above `concurrency`
    pub max_in_flight: usize,

    /// Per-message deadline (None = unbounded)
    pub timeout: Option<Duration>,

    /// nsqd TCP addresses to consume from directly
    pub nsqd_tcp_addresses: Vec<String>,

    /// lookupd HTTP addresses for producer discovery
    pub lookupd_http_addresses: Vec<String>,
}

impl WorkerConfig {
    pub fn new(topic: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            channel: channel.into(),
            service_name: "no_name".to_string(),
            concurrency: 1,
            max_in_flight: 1,
            timeout: None,
            nsqd_tcp_addresses: Vec::new(),
            lookupd_http_addresses: Vec::new(),
        }
    }

    /// Set the service name
    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    /// Set the handler pool size (minimum 1)
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Set the broker credit count
    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self
    }

    /// Set the per-message deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set nsqd TCP addresses
    pub fn with_nsqd_tcp_addresses(mut self, addresses: Vec<String>) -> Self {
        self.nsqd_tcp_addresses = addresses;
        self
    }

    /// Set lookupd HTTP addresses
    pub fn with_lookupd_http_addresses(mut self, addresses: Vec<String>) -> Self {
        self.lookupd_http_addresses = addresses;
        self
    }

    /// Broker credits actually requested: `max_in_flight` clamped to
    /// `concurrency` so the broker cannot deliver more messages than the
    /// pool can ever begin processing.
    pub fn effective_max_in_flight(&self) -> usize {
        self.max_in_flight.min(self.concurrency)
    }
}
