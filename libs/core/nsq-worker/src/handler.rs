//! Handler lifecycle.
//!
//! [`EventConsumer`] is the message handler the worker pool drives. For each
//! message it selects the matching routes and runs them strictly in
//! registration order, one at a time. Per route:
//!
//! 1. Persistence gating: a replay of a previously-failed message only
//!    re-invokes the handlers recorded under `recipients[channel]`.
//! 2. Lock wrap: routes with lock settings run under a distributed lock on
//!    `"<event>:<resource_id>"`; optional locks downgrade to an unlocked run
//!    on contention or service failure, mandatory locks fail the handler.
//! 3. Invocation, then outcome handling: an idempotent route with retries
//!    left gets a recovery message republished with linear backoff; any
//!    other failure is persisted and forwarded to the exception handler.

use crate::error::WorkerError;
use crate::event::Event;
use crate::lock::LockService;
use crate::message::Delivery;
use crate::metrics::{self, HandlerStatus};
use crate::persistence::MessagePersistor;
use crate::router::{Route, Router};
use crate::worker::MessageHandler;
use crate::writer::WriterHandle;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Republish attempts per (message, handler) before a failure is persisted.
pub const DEFAULT_RETRY_LIMIT: u32 = 3;

/// Base of the linear retry backoff.
pub const RETRY_DELAY_DURATION: Duration = Duration::from_millis(1000);

/// Callback for handler failures and deadline expiries.
pub type ExceptionHandler = Arc<dyn Fn(&Delivery, &WorkerError) + Send + Sync>;

/// The default exception handler: log and move on.
pub fn log_exception_handler() -> ExceptionHandler {
    Arc::new(|delivery, error| {
        error!(
            message_id = %delivery.id(),
            error = %error,
            body = %String::from_utf8_lossy(delivery.body()),
            "message raised an exception"
        );
    })
}

/// Routes messages of one (topic, channel) subscription to their handlers
/// and applies the retry and failure policy.
pub struct EventConsumer {
    topic: String,
    channel: String,
    label: String,
    router: Router,
    writer: WriterHandle,
    locker: Option<Arc<dyn LockService>>,
    persistor: MessagePersistor,
    retry_limit: u32,
    retry_delay: Duration,
    exception_handler: ExceptionHandler,
}

impl EventConsumer {
    pub fn builder(topic: impl Into<String>, channel: impl Into<String>) -> EventConsumerBuilder {
        EventConsumerBuilder::new(topic, channel)
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Run one route against the event, wrapped in its lock when one is
    /// configured.
    async fn run_route(&self, route: &Route, event: &Event) -> Result<(), WorkerError> {
        let Some(route_lock) = route.lock() else {
            return route.invoke(event.clone()).await;
        };

        let Some(locker) = &self.locker else {
            if route_lock.mandatory {
                return Err(WorkerError::LockService(
                    "no lock service configured".to_string(),
                ));
            }
            warn!(route = %route.name(), "no lock service configured, running unlocked");
            return route.invoke(event.clone()).await;
        };

        let Some(resource_id) = event.path_str(&route_lock.path_to_id) else {
            if route_lock.mandatory {
                return Err(WorkerError::MissingResourceId {
                    route: route.name().to_string(),
                    path: route_lock.path_to_id.clone(),
                });
            }
            debug!(
                route = %route.name(),
                path = %route_lock.path_to_id,
                "no resource id in payload, running unlocked"
            );
            return route.invoke(event.clone()).await;
        };

        let event_name = event.name().unwrap_or_else(|| route.name());
        let resource = format!("{event_name}:{resource_id}");

        match locker.acquire(&resource, &route_lock.options).await {
            Ok(Some(lock)) => {
                let result = route.invoke(event.clone()).await;
                if let Err(release_error) = locker.release(lock).await {
                    warn!(route = %route.name(), error = %release_error, "failed to release lock");
                }
                result
            }
            Ok(None) => {
                if route_lock.mandatory {
                    Err(WorkerError::LockNotAcquired(resource))
                } else {
                    warn!(
                        route = %route.name(),
                        resource = %resource,
                        "lock contended, running unlocked"
                    );
                    route.invoke(event.clone()).await
                }
            }
            Err(service_error) => {
                if route_lock.mandatory {
                    Err(service_error)
                } else {
                    warn!(
                        route = %route.name(),
                        error = %service_error,
                        "lock service unavailable, running unlocked"
                    );
                    route.invoke(event.clone()).await
                }
            }
        }
    }

    /// Decide between recovery republish and failure persistence.
    async fn handle_failure(
        &self,
        route: &Route,
        event: &Event,
        delivery: &Delivery,
        error: WorkerError,
    ) -> HandlerStatus {
        let prior = event.retry_count();

        if route.is_idempotent() && prior < self.retry_limit {
            match self.resend(route, event, prior) {
                Ok(()) => {
                    metrics::record_message_retry(&self.topic);
                    warn!(
                        route = %route.name(),
                        message_id = %delivery.id(),
                        retry_count = prior + 1,
                        error = %error,
                        "handler failed, recovery message scheduled"
                    );
                    return HandlerStatus::Resent;
                }
                Err(resend_error) => {
                    warn!(
                        route = %route.name(),
                        error = %resend_error,
                        "failed to schedule recovery message, recording failure"
                    );
                }
            }
        }

        if let Err(persist_error) = self
            .persistor
            .persist(
                &self.topic,
                &self.channel,
                route.name(),
                event.body(),
                &error.to_string(),
            )
            .await
        {
            error!(
                route = %route.name(),
                error = %persist_error,
                "failed to persist failed message"
            );
        }

        (self.exception_handler)(delivery, &error);
        HandlerStatus::Failed
    }

    /// Republish the payload targeting only the failing handler on this
    /// channel, delayed by `RETRY_DELAY_DURATION x new retry count`.
    ///
    /// The broker's own requeue is deliberately not used here: it would
    /// re-run every matching handler instead of just the failed one.
    fn resend(&self, route: &Route, event: &Event, prior: u32) -> Result<(), WorkerError> {
        let mut doc = event.decoded().cloned().ok_or_else(|| {
            WorkerError::handler("cannot build a recovery message for a non-JSON payload")
        })?;
        let Some(map) = doc.as_object_mut() else {
            return Err(WorkerError::handler(
                "cannot build a recovery message for a non-object payload",
            ));
        };

        let next = prior + 1;
        let mut recipients = Map::new();
        recipients.insert(self.channel.clone(), json!([route.name()]));
        map.insert("recipients".to_string(), Value::Object(recipients));
        map.insert("retry_count".to_string(), json!(next));

        self.writer
            .send_delayed(&self.topic, serde_json::to_vec(&doc)?, self.retry_delay * next)
    }
}

#[async_trait]
impl MessageHandler for EventConsumer {
    fn name(&self) -> &str {
        &self.label
    }

    async fn handle(&self, delivery: Delivery) -> Result<(), WorkerError> {
        let body = match delivery.body_str() {
            Ok(body) => body.to_string(),
            Err(e) => {
                error!(message_id = %delivery.id(), error = %e, "non-UTF-8 message body");
                return Ok(());
            }
        };

        let selected = self.router.select(&body);
        if selected.is_empty() {
            warn!(message_id = %delivery.id(), "no handlers found for message");
            return Ok(());
        }

        let event = Event::parse(body);
        for route in selected {
            if let Some(decoded) = event.decoded() {
                if !MessagePersistor::is_route_message(decoded, &self.channel, route.name()) {
                    debug!(
                        route = %route.name(),
                        message_id = %delivery.id(),
                        "replay not addressed to this handler, skipping"
                    );
                    continue;
                }
            }

            debug!(route = %route.name(), message_id = %delivery.id(), "routing message to handler");
            let started = Instant::now();
            let status = match self.run_route(route.as_ref(), &event).await {
                Ok(()) => HandlerStatus::Ok,
                Err(error) => {
                    self.handle_failure(route.as_ref(), &event, &delivery, error)
                        .await
                }
            };
            metrics::record_received(
                &self.topic,
                &self.channel,
                status,
                event.name().unwrap_or_else(|| route.name()),
                started.elapsed().as_secs_f64() * 1000.0,
            );
        }

        Ok(())
    }
}

/// Builder for [`EventConsumer`]. Routes registered here are frozen once
/// `build` is called.
pub struct EventConsumerBuilder {
    topic: String,
    channel: String,
    router: Router,
    writer: WriterHandle,
    locker: Option<Arc<dyn LockService>>,
    persistor: MessagePersistor,
    retry_limit: u32,
    retry_delay: Duration,
    exception_handler: ExceptionHandler,
}

impl EventConsumerBuilder {
    fn new(topic: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            channel: channel.into(),
            router: Router::new(),
            writer: WriterHandle::disabled(),
            locker: None,
            persistor: MessagePersistor::disabled(),
            retry_limit: DEFAULT_RETRY_LIMIT,
            retry_delay: RETRY_DELAY_DURATION,
            exception_handler: log_exception_handler(),
        }
    }

    /// Register a route. Registration order is invocation order.
    pub fn route(mut self, route: Route) -> Self {
        self.router.register(route);
        self
    }

    pub fn writer(mut self, writer: WriterHandle) -> Self {
        self.writer = writer;
        self
    }

    pub fn locker(mut self, locker: Arc<dyn LockService>) -> Self {
        self.locker = Some(locker);
        self
    }

    pub fn persistor(mut self, persistor: MessagePersistor) -> Self {
        self.persistor = persistor;
        self
    }

    pub fn retry_limit(mut self, limit: u32) -> Self {
        self.retry_limit = limit;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn exception_handler(mut self, handler: ExceptionHandler) -> Self {
        self.exception_handler = handler;
        self
    }

    pub fn build(self) -> EventConsumer {
        let label = format!("{}:{}", self.topic, self.channel);
        EventConsumer {
            topic: self.topic,
            channel: self.channel,
            label,
            router: self.router,
            writer: self.writer,
            locker: self.locker,
            persistor: self.persistor,
            retry_limit: self.retry_limit,
            retry_delay: self.retry_delay,
            exception_handler: self.exception_handler,
        }
    }
}
