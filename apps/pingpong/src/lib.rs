//! Ping-Pong Worker Service
//!
//! Small consumer that exercises the framework end to end: two JSON routes
//! bouncing messages back through the writer, an always-on audit route, and
//! a locked route serialised per resource id when Redis is configured.
//!
//! ## Architecture
//!
//! ```text
//! NSQ (ping-pong, demo)
//!   ↓
//! NsqWorker → EventConsumer
//!   ├─ ping  (name == "ping")  → publish {"name":"pong"}
//!   ├─ pong  (name == "pong")  → publish {"name":"ping"} (idempotent)
//!   └─ audit (always)          → log the event
//! ```

use core_config::nsq::NsqConfig;
use core_config::redis::RedisConfig;
use core_config::{env_list, env_parsed, Environment};
use eyre::{Result, WrapErr};
use nsq_worker::{
    admin, always, handler_fn, json_matcher, metrics, EventConsumer, LockOptions, MessagePersistor,
    NsqWorker, NsqWriter, RedisLocker, Route, RouteLock, WorkerConfig, WriterHandle,
    DEFAULT_RETRY_LIMIT,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

const TOPIC: &str = "ping-pong";
const CHANNEL: &str = "demo";
const SERVICE_NAME: &str = "pingpong";

fn ping_route(writer: WriterHandle) -> Route {
    Route::new(
        "ping",
        json_matcher("name", "ping"),
        handler_fn(move |_event| {
            let writer = writer.clone();
            async move {
                info!("Ping");
                writer.send(TOPIC, serde_json::json!({"name": "pong"}).to_string())?;
                Ok(())
            }
        }),
    )
}

fn pong_route(writer: WriterHandle) -> Route {
    Route::new(
        "pong",
        json_matcher("name", "pong"),
        handler_fn(move |_event| {
            let writer = writer.clone();
            async move {
                info!("Pong");
                writer.send(TOPIC, serde_json::json!({"name": "ping"}).to_string())?;
                Ok(())
            }
        }),
    )
    .idempotent()
}

fn audit_route() -> Route {
    Route::new(
        "audit",
        always(),
        handler_fn(|event| async move {
            info!(name = ?event.name(), "observed message");
            Ok(())
        }),
    )
    .with_lock(RouteLock::new("id").with_options(
        LockOptions::new().with_blocking_timeout(Duration::from_millis(50)),
    ))
}

/// Run the ping-pong worker
///
/// 1. Sets up structured logging (env-aware: JSON for prod, pretty for dev)
/// 2. Starts the Prometheus scrape endpoint
/// 3. Connects to Redis when configured, enabling locks and failure
///    persistence
/// 4. Starts the worker with graceful shutdown handling
pub async fn run() -> Result<()> {
    let environment = Environment::detect();
    core_config::tracing::init_tracing(&environment);

    let metrics_port: u16 = env_parsed("METRICS_PORT", 9090)?;
    let metrics_addr: SocketAddr = ([0, 0, 0, 0], metrics_port).into();
    metrics::serve_metrics(metrics_addr).wrap_err("failed to start metrics endpoint")?;
    info!(port = %metrics_port, "metrics endpoint listening");

    let nsq = NsqConfig::from_env().wrap_err("failed to load NSQ configuration")?;

    // Pre-create the topic when nsqd admin hosts are provided
    let nsqd_http_hosts = env_list("NSQD_HTTP_ADDRESSES");
    if !nsqd_http_hosts.is_empty() {
        admin::register_topics(&nsqd_http_hosts, &[TOPIC.to_string()]).await;
    }

    let max_bytes: usize = env_parsed("BYTES_MAX_SIZE", nsq_worker::BYTES_MAX_SIZE)?;
    let writer = NsqWriter::spawn_with_max_bytes(&nsq.nsqd_tcp_addresses, max_bytes);

    let retry_limit: u32 = env_parsed("RETRY_LIMIT", DEFAULT_RETRY_LIMIT)?;

    let mut consumer = EventConsumer::builder(TOPIC, CHANNEL)
        .writer(writer.clone())
        .retry_limit(retry_limit)
        .route(ping_route(writer.clone()))
        .route(pong_route(writer.clone()))
        .route(audit_route());

    // Locks and failure persistence need Redis; without it the consumer
    // runs with both disabled
    if let Some(redis_config) = RedisConfig::optional_from_env()? {
        info!(host = %redis_config.host, "connecting to redis");
        let redis = nsq_worker::connect_redis(&redis_config.url())
            .await
            .wrap_err("failed to connect to redis")?;
        consumer = consumer
            .locker(Arc::new(RedisLocker::new(redis.clone(), SERVICE_NAME)))
            .persistor(MessagePersistor::new(redis));
    }

    let config = WorkerConfig::new(TOPIC, CHANNEL)
        .with_service_name(SERVICE_NAME)
        .with_concurrency(nsq.concurrency)
        .with_max_in_flight(nsq.max_in_flight)
        .with_timeout(Duration::from_secs(env_parsed("NSQ_HANDLER_TIMEOUT_SECS", 30u64)?))
        .with_nsqd_tcp_addresses(nsq.nsqd_tcp_addresses.clone())
        .with_lookupd_http_addresses(nsq.lookupd_http_addresses.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            error!("error waiting for shutdown signal: {}", e);
        }
        let _ = shutdown_tx.send(true);
    });

    info!("starting ping-pong worker");
    NsqWorker::new(consumer.build(), config).run(shutdown_rx).await?;

    info!("ping-pong worker stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() -> Result<()> {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received Ctrl+C, initiating shutdown...");
        },
        _ = terminate => {
            info!("received SIGTERM, initiating shutdown...");
        },
    }

    Ok(())
}
