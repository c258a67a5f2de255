//! NSQ Worker - Message-Consumption Framework
//!
//! A reusable library for building NSQ consumers with:
//! - Matcher-based routing of raw message bodies to registered handlers
//! - A bounded handler pool with per-message liveness heartbeats
//! - Per-message deadlines that notify without killing in-flight work
//! - Distributed locks for mutually-exclusive handlers (Redis)
//! - Retry of idempotent handlers through delayed recovery republish
//! - Persistence of permanently-failed messages for later inspection
//! - Prometheus-compatible metrics
//! - Graceful shutdown handling
//!
//! # Architecture
//!
//! ```text
//! NSQ (topic, channel)
//!   ↓ (max_in_flight credits)
//! NsqWorker
//!   ↓ (pool of `concurrency` slots, touch every 30s, deadline)
//! EventConsumer
//!   ↓ (Router selects matching routes, in registration order)
//! handler closures
//!   ↓ (on failure)
//! recovery republish (idempotent, retries left) / failed-message store
//! ```
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use nsq_worker::{
//!     handler_fn, json_matcher, EventConsumer, NsqWorker, NsqWriter, Route, WorkerConfig,
//! };
//!
//! let writer = NsqWriter::spawn(&nsqd_tcp_addresses);
//!
//! let consumer = EventConsumer::builder("events", "mailer")
//!     .writer(writer.clone())
//!     .route(Route::new(
//!         "send_email",
//!         json_matcher("name", "user.created"),
//!         handler_fn(move |event| {
//!             let writer = writer.clone();
//!             async move {
//!                 // handle the event, publish follow-ups through the writer
//!                 Ok(())
//!             }
//!         }),
//!     ))
//!     .build();
//!
//! let config = WorkerConfig::new("events", "mailer")
//!     .with_concurrency(4)
//!     .with_max_in_flight(4)
//!     .with_nsqd_tcp_addresses(nsqd_tcp_addresses);
//! NsqWorker::new(consumer, config).run(shutdown_rx).await?;
//! ```

pub mod admin;
mod config;
mod error;
mod event;
mod handler;
mod lock;
mod matchers;
mod message;
pub mod metrics;
mod persistence;
mod router;
mod worker;
mod writer;

pub use config::WorkerConfig;
pub use error::WorkerError;
pub use event::{lookup_path, Event};
pub use handler::{
    log_exception_handler, EventConsumer, EventConsumerBuilder, ExceptionHandler,
    DEFAULT_RETRY_LIMIT, RETRY_DELAY_DURATION,
};
pub use lock::{
    AcquiredLock, LockOptions, LockService, RedisLocker, RouteLock, DEFAULT_BLOCKING_TIMEOUT,
    DEFAULT_RETRIES, DEFAULT_TTL, ERR_RETRY_DURATION, LOCKED_RETRY_DURATION,
};
pub use matchers::{
    all_of, always, flag_matcher, json_matcher, path_matcher, regex_matcher, Matcher,
};
pub use message::{ControlOp, Delivery, TOUCH_INTERVAL};
pub use self::metrics::HandlerStatus;
pub use persistence::{FailedRecord, MessagePersistor, MESSAGE_STORE_KEY};
pub use router::{handler_fn, Handler, Route, Router};
pub use worker::{MessageHandler, NsqWorker};
pub use writer::{NsqWriter, WriterHandle, BYTES_MAX_SIZE};

/// Result type alias for worker operations.
pub type WorkerResult<T> = Result<T, WorkerError>;

/// Connect to Redis for the lock service and the failed-message store.
/// The connection manager reconnects on its own and is cheap to clone.
pub async fn connect_redis(url: &str) -> WorkerResult<redis::aio::ConnectionManager> {
    let client = redis::Client::open(url)?;
    let manager = client.get_connection_manager().await?;
    Ok(manager)
}
