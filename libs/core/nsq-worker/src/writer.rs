//! Message publishing.
//!
//! A dedicated task owns the broker producer; callers hold a clonable
//! [`WriterHandle`] that enqueues publishes. Payloads over the size limit
//! are rejected before anything reaches the broker. A publish whose ack
//! fails is logged and rescheduled after one second.

use crate::error::WorkerError;
use crate::metrics;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_nsq::{NSQEvent, NSQProducer, NSQProducerConfig, NSQTopic};
use tracing::{debug, error, warn};

/// Default publish size limit.
pub const BYTES_MAX_SIZE: usize = 1024 * 1024;

const PUBLISH_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum WriteCommand {
    Publish {
        topic: String,
        payload: Vec<u8>,
        delay: Option<Duration>,
    },
    PublishMany {
        topic: String,
        payloads: Vec<Vec<u8>>,
    },
}

impl WriteCommand {
    fn topic(&self) -> &str {
        match self {
            Self::Publish { topic, .. } | Self::PublishMany { topic, .. } => topic,
        }
    }
}

/// Clonable publishing handle. Size and topic validation happen here,
/// synchronously; the broker round-trip happens on the writer task.
#[derive(Clone)]
pub struct WriterHandle {
    commands: Option<mpsc::UnboundedSender<WriteCommand>>,
    max_bytes: usize,
}

impl WriterHandle {
    /// A handle whose sends always fail. Used when no nsqd TCP address is
    /// configured.
    pub fn disabled() -> Self {
        Self {
            commands: None,
            max_bytes: BYTES_MAX_SIZE,
        }
    }

    pub(crate) fn attached(commands: mpsc::UnboundedSender<WriteCommand>, max_bytes: usize) -> Self {
        Self {
            commands: Some(commands),
            max_bytes,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.commands.is_some()
    }

    /// Publish `payload` on `topic`.
    pub fn send(&self, topic: &str, payload: impl Into<Vec<u8>>) -> Result<(), WorkerError> {
        self.dispatch_one(topic, payload.into(), None)
    }

    /// Publish `payload` on `topic` after `delay`.
    pub fn send_delayed(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        delay: Duration,
    ) -> Result<(), WorkerError> {
        self.dispatch_one(topic, payload.into(), Some(delay))
    }

    /// Multi-publish all `payloads` on `topic` in one broker operation.
    pub fn send_many(&self, topic: &str, payloads: Vec<Vec<u8>>) -> Result<(), WorkerError> {
        let commands = self.sink()?;
        Self::check_topic(topic)?;
        for payload in &payloads {
            self.check_size(payload)?;
        }
        let _ = commands.send(WriteCommand::PublishMany {
            topic: topic.to_string(),
            payloads,
        });
        Ok(())
    }

    fn dispatch_one(
        &self,
        topic: &str,
        payload: Vec<u8>,
        delay: Option<Duration>,
    ) -> Result<(), WorkerError> {
        let commands = self.sink()?;
        Self::check_topic(topic)?;
        self.check_size(&payload)?;
        let _ = commands.send(WriteCommand::Publish {
            topic: topic.to_string(),
            payload,
            delay,
        });
        Ok(())
    }

    fn sink(&self) -> Result<&mpsc::UnboundedSender<WriteCommand>, WorkerError> {
        self.commands.as_ref().ok_or(WorkerError::WriterDisabled)
    }

    fn check_size(&self, payload: &[u8]) -> Result<(), WorkerError> {
        if payload.len() > self.max_bytes {
            return Err(WorkerError::PayloadTooLarge {
                size: payload.len(),
                limit: self.max_bytes,
            });
        }
        Ok(())
    }

    fn check_topic(topic: &str) -> Result<(), WorkerError> {
        NSQTopic::new(topic.to_string())
            .map(|_| ())
            .ok_or_else(|| WorkerError::Broker(format!("invalid topic name '{topic}'")))
    }
}

/// Spawns the writer task.
pub struct NsqWriter;

impl NsqWriter {
    /// Spawn a writer against the first configured nsqd. Returns a disabled
    /// handle when no address is given.
    pub fn spawn(nsqd_tcp_addresses: &[String]) -> WriterHandle {
        Self::spawn_with_max_bytes(nsqd_tcp_addresses, BYTES_MAX_SIZE)
    }

    pub fn spawn_with_max_bytes(nsqd_tcp_addresses: &[String], max_bytes: usize) -> WriterHandle {
        let Some(address) = nsqd_tcp_addresses.first() else {
            warn!("writer functionality is DISABLED, provide nsqd TCP addresses to enable it");
            return WriterHandle::disabled();
        };

        let (commands, inbox) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(address.clone(), inbox, commands.clone()));
        WriterHandle::attached(commands, max_bytes)
    }
}

async fn run_writer(
    address: String,
    mut inbox: mpsc::UnboundedReceiver<WriteCommand>,
    retry: mpsc::UnboundedSender<WriteCommand>,
) {
    debug!(address = %address, "writer task started");
    let mut producer = NSQProducerConfig::new(address).build();

    while let Some(command) = inbox.recv().await {
        let published = match &command {
            WriteCommand::Publish {
                topic,
                payload,
                delay,
            } => publish_one(&mut producer, topic, payload.clone(), *delay).await,
            WriteCommand::PublishMany { topic, payloads } => {
                publish_many(&mut producer, topic, payloads.clone()).await
            }
        };

        match published {
            Ok(()) => {
                metrics::record_message_sent(command.topic());
                debug!(topic = %command.topic(), "sent message");
            }
            Err(e) => {
                error!(
                    topic = %command.topic(),
                    error = %e,
                    "message failed, waiting {}s before trying again",
                    PUBLISH_RETRY_DELAY.as_secs()
                );
                let retry = retry.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(PUBLISH_RETRY_DELAY).await;
                    let _ = retry.send(command);
                });
            }
        }
    }
}

async fn publish_one(
    producer: &mut NSQProducer,
    topic: &str,
    payload: Vec<u8>,
    delay: Option<Duration>,
) -> Result<(), WorkerError> {
    let topic = NSQTopic::new(topic.to_string())
        .ok_or_else(|| WorkerError::Broker(format!("invalid topic name '{topic}'")))?;

    let queued = match delay {
        Some(delay) => {
            producer
                .publish_deferred(&topic, payload, delay.as_millis() as u32)
                .await
        }
        None => producer.publish(&topic, payload).await,
    };
    if let Err(e) = queued {
        return Err(WorkerError::Broker(e.to_string()));
    }

    await_ack(producer).await
}

async fn publish_many(
    producer: &mut NSQProducer,
    topic: &str,
    payloads: Vec<Vec<u8>>,
) -> Result<(), WorkerError> {
    let topic = NSQTopic::new(topic.to_string())
        .ok_or_else(|| WorkerError::Broker(format!("invalid topic name '{topic}'")))?;

    if let Err(e) = producer.publish_multiple(&topic, payloads).await {
        return Err(WorkerError::Broker(e.to_string()));
    }

    await_ack(producer).await
}

/// Wait for the broker's ack of the last publish. Connection-status events
/// are drained along the way.
async fn await_ack(producer: &mut NSQProducer) -> Result<(), WorkerError> {
    loop {
        match producer.consume().await {
            Some(NSQEvent::Ok()) => return Ok(()),
            Some(NSQEvent::Unhealthy()) => {
                return Err(WorkerError::Broker("producer connection unhealthy".to_string()))
            }
            Some(_) => continue,
            None => return Err(WorkerError::Broker("producer event stream closed".to_string())),
        }
    }
}
