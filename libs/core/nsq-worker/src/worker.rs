//! Worker pool: broker subscription and bounded message dispatch.
//!
//! [`NsqWorker`] drains one (topic, channel) subscription and hands every
//! message to a [`MessageHandler`] on a pool of `concurrency` slots. Each
//! message is adopted into a [`Delivery`] whose driver task heartbeats the
//! broker; a supervision task enforces the per-message deadline and
//! guarantees the single terminal transition.
//!
//! Deadline expiry does not cancel the in-flight handler. The exception
//! handler is notified, the message is finished for flow control, and the
//! handler keeps its pool slot until it completes on its own; its result is
//! discarded.

use crate::config::WorkerConfig;
use crate::error::WorkerError;
use crate::handler::{log_exception_handler, ExceptionHandler};
use crate::message::Delivery;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_nsq::{
    NSQChannel, NSQConsumer, NSQConsumerConfig, NSQConsumerConfigSources, NSQConsumerLookupConfig,
    NSQMessage, NSQTopic,
};
use tracing::{debug, error, info};

/// Per-message entry point driven by the worker pool.
///
/// Implementations decide what a message means; the worker owns delivery,
/// heartbeats, deadlines, and acknowledgement.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one message. Errors are forwarded to the exception handler;
    /// acknowledgement happens either way.
    async fn handle(&self, delivery: Delivery) -> Result<(), WorkerError>;

    /// Identity used in logs and timeout reports.
    fn name(&self) -> &str {
        "message_handler"
    }
}

/// Subscribes to a (topic, channel) pair and runs the handler on a bounded
/// pool.
pub struct NsqWorker<H: MessageHandler + 'static> {
    config: WorkerConfig,
    handler: Arc<H>,
    exception_handler: ExceptionHandler,
    permits: Arc<Semaphore>,
}

impl<H: MessageHandler + 'static> NsqWorker<H> {
    pub fn new(handler: H, config: WorkerConfig) -> Self {
        Self::with_arc_handler(Arc::new(handler), config)
    }

    pub fn with_arc_handler(handler: Arc<H>, config: WorkerConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.concurrency));
        Self {
            config,
            handler,
            exception_handler: log_exception_handler(),
            permits,
        }
    }

    /// Replace the default logging exception handler.
    pub fn with_exception_handler(mut self, handler: ExceptionHandler) -> Self {
        self.exception_handler = handler;
        self
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Run the consume loop until the shutdown signal flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), WorkerError> {
        let mut consumer = self.subscribe()?;

        info!(
            service_name = %self.config.service_name,
            topic = %self.config.topic,
            channel = %self.config.channel,
            handler = %self.handler.name(),
            "added a handler for NSQD messages"
        );
        info!(
            concurrency = %self.config.concurrency,
            max_in_flight = %self.config.effective_max_in_flight(),
            timeout = ?self.config.timeout,
            "handling messages"
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("received shutdown signal, stopping worker");
                        break;
                    }
                }
                message = consumer.consume_filtered() => {
                    let Some(message) = message else { continue };
                    self.dispatch(message).await;
                }
            }
        }

        info!("NSQ worker stopped");
        Ok(())
    }

    fn subscribe(&self) -> Result<NSQConsumer, WorkerError> {
        let topic = NSQTopic::new(self.config.topic.clone())
            .ok_or_else(|| WorkerError::Config(format!("invalid topic name '{}'", self.config.topic)))?;
        let channel = NSQChannel::new(self.config.channel.clone()).ok_or_else(|| {
            WorkerError::Config(format!("invalid channel name '{}'", self.config.channel))
        })?;

        let sources = if !self.config.lookupd_http_addresses.is_empty() {
            let addresses: HashSet<String> =
                self.config.lookupd_http_addresses.iter().cloned().collect();
            NSQConsumerConfigSources::Lookup(NSQConsumerLookupConfig::new().set_addresses(addresses))
        } else if !self.config.nsqd_tcp_addresses.is_empty() {
            NSQConsumerConfigSources::Daemons(self.config.nsqd_tcp_addresses.clone())
        } else {
            return Err(WorkerError::Config(
                "set nsqd TCP addresses and/or lookupd HTTP addresses".to_string(),
            ));
        };

        Ok(NSQConsumerConfig::new(topic, channel)
            .set_sources(sources)
            .set_max_in_flight(self.config.effective_max_in_flight() as u32)
            .build())
    }

    /// Adopt the message, reserve a pool slot, and hand both to the
    /// supervision task. Waits when the pool is saturated, which also stops
    /// the consume loop from outpacing the handlers.
    async fn dispatch(&self, message: NSQMessage) {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .expect("Semaphore closed");

        let delivery = Delivery::adopt(message);
        debug!(
            message_id = %delivery.id(),
            attempt = %delivery.attempt(),
            "received message"
        );

        let handler = Arc::clone(&self.handler);
        let handler_delivery = delivery.clone();
        let work = tokio::spawn(async move {
            let _permit = permit;
            handler.handle(handler_delivery).await
        });

        tokio::spawn(supervise(
            work,
            delivery,
            self.config.timeout,
            Arc::clone(&self.exception_handler),
            self.handler.name().to_string(),
        ));
    }
}

/// Await the handler, enforcing the optional deadline, then perform the
/// terminal transition unless the handler already did.
async fn supervise(
    mut work: JoinHandle<Result<(), WorkerError>>,
    delivery: Delivery,
    timeout: Option<Duration>,
    exception_handler: ExceptionHandler,
    handler_name: String,
) {
    let completed = match timeout {
        Some(limit) => {
            tokio::select! {
                result = &mut work => Some(result),
                _ = tokio::time::sleep(limit) => None,
            }
        }
        None => Some(work.await),
    };

    match completed {
        None => {
            let error = WorkerError::HandlerTimeout {
                handler: handler_name,
                message_id: delivery.id().to_string(),
            };
            error!(
                message_id = %delivery.id(),
                body = %String::from_utf8_lossy(delivery.body()),
                "message handler exceeded its timeout"
            );
            exception_handler(&delivery, &error);
        }
        Some(Ok(Ok(()))) => {
            debug!(message_id = %delivery.id(), "finished handling message");
        }
        Some(Ok(Err(error))) => {
            debug!(message_id = %delivery.id(), "message handler raised an exception");
            exception_handler(&delivery, &error);
        }
        Some(Err(join_error)) => {
            let error = WorkerError::Handler(format!("message handler panicked: {join_error}"));
            exception_handler(&delivery, &error);
        }
    }

    if !delivery.has_responded() {
        delivery.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ControlOp;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    fn capture_exceptions() -> (ExceptionHandler, Arc<Mutex<Vec<String>>>) {
        let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let handler: ExceptionHandler = Arc::new(move |_delivery, error| {
            sink.lock().unwrap().push(error.to_string());
        });
        (handler, log)
    }

    #[tokio::test]
    async fn test_successful_handler_finishes_once() {
        let (exception_handler, exceptions) = capture_exceptions();
        let (delivery, mut ops) = Delivery::local("m-1", "{}");

        let work = tokio::spawn(async { Ok::<(), WorkerError>(()) });
        supervise(work, delivery, None, exception_handler, "h".to_string()).await;

        assert_eq!(ops.recv().await, Some(ControlOp::Finish));
        assert!(ops.try_recv().is_err());
        assert!(exceptions.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failing_handler_notifies_and_finishes() {
        let (exception_handler, exceptions) = capture_exceptions();
        let (delivery, mut ops) = Delivery::local("m-2", "{}");

        let work = tokio::spawn(async { Err::<(), _>(WorkerError::handler("boom")) });
        supervise(work, delivery, None, exception_handler, "h".to_string()).await;

        assert_eq!(ops.recv().await, Some(ControlOp::Finish));
        assert_eq!(exceptions.lock().unwrap().len(), 1);
        assert!(exceptions.lock().unwrap()[0].contains("boom"));
    }

    #[tokio::test]
    async fn test_panicking_handler_is_reported() {
        let (exception_handler, exceptions) = capture_exceptions();
        let (delivery, mut ops) = Delivery::local("m-3", "{}");

        let work: JoinHandle<Result<(), WorkerError>> =
            tokio::spawn(async { panic!("kaboom") });
        supervise(work, delivery, None, exception_handler, "h".to_string()).await;

        assert_eq!(ops.recv().await, Some(ControlOp::Finish));
        assert_eq!(exceptions.lock().unwrap().len(), 1);
        assert!(exceptions.lock().unwrap()[0].contains("panicked"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_notifies_and_finishes_while_handler_completes() {
        let (exception_handler, exceptions) = capture_exceptions();
        let (delivery, mut ops) = Delivery::local("m-4", "{}");
        let handler_completed = Arc::new(AtomicBool::new(false));

        let completed_flag = Arc::clone(&handler_completed);
        let work = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            completed_flag.store(true, Ordering::SeqCst);
            Ok::<(), WorkerError>(())
        });

        supervise(
            work,
            delivery,
            Some(Duration::from_secs(1)),
            exception_handler,
            "slow".to_string(),
        )
        .await;

        assert_eq!(exceptions.lock().unwrap().len(), 1);
        assert!(exceptions.lock().unwrap()[0].contains("exceeded its timeout"));
        assert_eq!(ops.recv().await, Some(ControlOp::Finish));
        assert!(!handler_completed.load(Ordering::SeqCst));

        // The in-flight handler completes later; its result is discarded
        // and no second terminal transition happens
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(handler_completed.load(Ordering::SeqCst));
        assert!(ops.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_handler_that_already_responded_is_left_alone() {
        let (exception_handler, exceptions) = capture_exceptions();
        let (delivery, mut ops) = Delivery::local("m-5", "{}");

        let handler_delivery = delivery.clone();
        let work = tokio::spawn(async move {
            handler_delivery.requeue(Some(Duration::from_secs(60)));
            Ok::<(), WorkerError>(())
        });
        supervise(work, delivery, None, exception_handler, "h".to_string()).await;

        assert_eq!(
            ops.recv().await,
            Some(ControlOp::Requeue(Some(Duration::from_secs(60))))
        );
        assert!(ops.try_recv().is_err());
        assert!(exceptions.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fast_handler_beats_its_deadline() {
        let (exception_handler, exceptions) = capture_exceptions();
        let (delivery, mut ops) = Delivery::local("m-6", "{}");

        let work = tokio::spawn(async { Ok::<(), WorkerError>(()) });
        supervise(
            work,
            delivery,
            Some(Duration::from_secs(30)),
            exception_handler,
            "fast".to_string(),
        )
        .await;

        assert_eq!(ops.recv().await, Some(ControlOp::Finish));
        assert!(exceptions.lock().unwrap().is_empty());
    }
}
